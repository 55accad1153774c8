//! Outcome records for single-file side operations
//!
//! Deletes, property changes and renames that follow a copy are run through
//! [`ActionReporter`], which retries transient failures and keeps one
//! [`ActionRecord`] per operation for the batch result.

use serde::Serialize;
use tracing::{info, warn};

use super::control::TransferControl;
use super::retry::{retry_transient, AttemptFuture, RetryConfig};
use crate::error::TransferError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Source removal after a move
    DeleteSource,
    Delete,
    ChangeProperties,
    CreateDirectory,
    /// Part file renamed onto its final name
    Rename,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "detail")]
pub enum ActionOutcome {
    Performed,
    Retried { attempts: u32 },
    Skipped(String),
    Failed(TransferError),
}

impl ActionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ActionOutcome::Performed | ActionOutcome::Retried { .. })
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, ActionOutcome::Failed(e) if e.is_fatal())
    }
}

#[derive(Debug, Serialize)]
pub struct ActionRecord {
    pub kind: ActionKind,
    pub path: String,
    pub outcome: ActionOutcome,
}

#[derive(Debug, Default)]
pub struct ActionReporter {
    retry: RetryConfig,
    records: Vec<ActionRecord>,
}

impl ActionReporter {
    pub fn new(retry: RetryConfig) -> Self {
        Self {
            retry,
            records: Vec::new(),
        }
    }

    /// Run `op` against `state`, retrying transient failures. The outcome is
    /// recorded either way; the final error is handed back to the caller.
    pub async fn run<S, F>(
        &mut self,
        kind: ActionKind,
        path: &str,
        control: &TransferControl,
        state: &mut S,
        op: F,
    ) -> Result<(), TransferError>
    where
        S: ?Sized,
        F: for<'a> FnMut(&'a mut S) -> AttemptFuture<'a, ()>,
    {
        let what = format!("{:?} {}", kind, path);
        let retried = retry_transient(&what, &self.retry, control, state, op).await;

        let (outcome, result) = match retried.result {
            Ok(()) if retried.attempts > 1 => (
                ActionOutcome::Retried {
                    attempts: retried.attempts,
                },
                Ok(()),
            ),
            Ok(()) => (ActionOutcome::Performed, Ok(())),
            Err(e) => {
                if e.is_fatal() {
                    warn!("{} failed fatally: {}", what, e);
                } else {
                    warn!("{} failed: {}", what, e);
                }
                (ActionOutcome::Failed(e.clone()), Err(e))
            }
        };

        self.records.push(ActionRecord {
            kind,
            path: path.to_string(),
            outcome,
        });
        result
    }

    pub fn skip(&mut self, kind: ActionKind, path: &str, reason: impl Into<String>) {
        let reason = reason.into();
        info!("{:?} {} skipped: {}", kind, path, reason);
        self.records.push(ActionRecord {
            kind,
            path: path.to_string(),
            outcome: ActionOutcome::Skipped(reason),
        });
    }

    /// A fatal failure was recorded; the batch must stop.
    pub fn is_halted(&self) -> bool {
        self.records.iter().any(|r| r.outcome.is_fatal())
    }

    pub fn records(&self) -> &[ActionRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<ActionRecord> {
        self.records
    }
}
