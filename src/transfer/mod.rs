//! Transfer engine
//!
//! Batch uploads/downloads over a [`crate::session::RemoteSession`]:
//! conflict resolution, resumable chunked copies, retries, progress
//! reporting and a journal of interrupted transfers.

pub mod action;
pub mod chunk;
pub mod conflict;
pub mod control;
pub mod copy_param;
pub mod journal;
pub mod orchestrator;
pub mod path_utils;
pub mod progress;
pub mod retry;

pub use action::{ActionKind, ActionOutcome, ActionRecord, ActionReporter};
pub use chunk::{AdaptiveChunkSizer, ChunkSettings};
pub use conflict::{
    ConflictPrompt, ConflictResolver, FileSnapshot, OverwriteFileParams, Resolution,
};
pub use control::TransferControl;
pub use copy_param::{
    CopyParam, DefaultResolution, FileNameCase, OverwritePolicy, ResumeSupport, TransferFlags,
};
pub use journal::{
    Direction, JournalEntry, JournalStatus, NullJournal, RedbJournal, TransferJournal,
};
pub use orchestrator::{
    BatchResult, TransferHandle, TransferOrchestrator, TransferRequest, TransferSettings,
};
pub use progress::{FileStatus, OperationProgress, ProgressEvent, ProgressHandle};
pub use retry::{calculate_backoff, retry_transient, RetryConfig};
