//! Batch progress tracking
//!
//! The orchestrator owns one [`OperationProgress`] per batch and is its only
//! writer. Observers either poll a [`ProgressHandle`] or drain the
//! [`ProgressEvent`] channel.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use super::control::TransferControl;

/// Final state of one file within a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum FileStatus {
    Succeeded,
    Skipped,
    Failed(String),
    Cancelled,
}

/// Event sent to the progress observer
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// Coalesced byte progress; `delta` sums to the total bytes moved
    Progress {
        delta: u64,
        file: String,
        done: u64,
        total: u64,
    },
    FileFinished {
        path: String,
        status: FileStatus,
    },
    BatchFinished {
        succeeded: usize,
        skipped: usize,
        failed: usize,
        cancelled: bool,
        bytes_transferred: u64,
    },
}

struct Counters {
    total_bytes: AtomicU64,
    bytes_done: AtomicU64,
    files_done: AtomicUsize,
    current_file: RwLock<Option<String>>,
    started: Instant,
}

/// Read-only view of a running batch
#[derive(Clone)]
pub struct ProgressHandle {
    counters: Arc<Counters>,
    control: Arc<TransferControl>,
}

impl ProgressHandle {
    pub fn bytes_done(&self) -> u64 {
        self.counters.bytes_done.load(Ordering::Relaxed)
    }

    /// Planned bytes; grows while directories are being expanded
    pub fn total_bytes(&self) -> u64 {
        self.counters
            .total_bytes
            .load(Ordering::Relaxed)
            .max(self.bytes_done())
    }

    pub fn files_done(&self) -> usize {
        self.counters.files_done.load(Ordering::Relaxed)
    }

    pub fn current_file(&self) -> Option<String> {
        self.counters.current_file.read().clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.control.is_cancelled()
    }

    pub fn elapsed(&self) -> Duration {
        self.counters.started.elapsed()
    }

    /// Average bytes per second since the batch started
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed().as_secs_f64();
        if secs > 0.0 {
            self.bytes_done() as f64 / secs
        } else {
            0.0
        }
    }

    /// Completion percentage (0-100)
    pub fn percent(&self) -> f64 {
        let total = self.total_bytes();
        if total == 0 {
            return 0.0;
        }
        (self.bytes_done() as f64 / total as f64) * 100.0
    }
}

/// Per-batch progress state, written only by the orchestrator
pub struct OperationProgress {
    counters: Arc<Counters>,
    control: Arc<TransferControl>,
    events: Option<mpsc::Sender<ProgressEvent>>,
    interval: Duration,
    last_emit: Instant,
    pending_delta: u64,
}

impl OperationProgress {
    pub fn new(
        control: Arc<TransferControl>,
        events: Option<mpsc::Sender<ProgressEvent>>,
        interval: Duration,
    ) -> Self {
        Self {
            counters: Arc::new(Counters {
                total_bytes: AtomicU64::new(0),
                bytes_done: AtomicU64::new(0),
                files_done: AtomicUsize::new(0),
                current_file: RwLock::new(None),
                started: Instant::now(),
            }),
            control,
            events,
            interval,
            last_emit: Instant::now(),
            pending_delta: 0,
        }
    }

    pub fn handle(&self) -> ProgressHandle {
        ProgressHandle {
            counters: self.counters.clone(),
            control: self.control.clone(),
        }
    }

    pub fn control(&self) -> &Arc<TransferControl> {
        &self.control
    }

    pub fn bytes_done(&self) -> u64 {
        self.counters.bytes_done.load(Ordering::Relaxed)
    }

    pub fn add_total(&self, bytes: u64) {
        self.counters.total_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn start_file(&self, path: &str) {
        *self.counters.current_file.write() = Some(path.to_string());
    }

    /// Account `bytes` moved for the current file.
    ///
    /// Events are coalesced to at most one per interval; a lagging observer
    /// gets a larger delta later rather than losing bytes.
    pub fn add_bytes(&mut self, bytes: u64) {
        self.counters.bytes_done.fetch_add(bytes, Ordering::Relaxed);
        self.pending_delta += bytes;
        if self.last_emit.elapsed() >= self.interval {
            self.flush();
        }
    }

    /// Send any coalesced delta now. A full channel keeps the delta for
    /// the next attempt.
    pub fn flush(&mut self) {
        if self.pending_delta == 0 {
            return;
        }
        if self.events.is_none() {
            self.pending_delta = 0;
            return;
        }
        let handle = self.handle();
        let event = ProgressEvent::Progress {
            delta: self.pending_delta,
            file: handle.current_file().unwrap_or_default(),
            done: handle.bytes_done(),
            total: handle.total_bytes(),
        };
        if self.emit(event) {
            self.pending_delta = 0;
            self.last_emit = Instant::now();
        }
    }

    pub fn finish_file(&mut self, path: &str, status: FileStatus) {
        self.flush();
        self.counters.files_done.fetch_add(1, Ordering::Relaxed);
        *self.counters.current_file.write() = None;
        self.emit(ProgressEvent::FileFinished {
            path: path.to_string(),
            status,
        });
    }

    pub fn finish_batch(
        &mut self,
        succeeded: usize,
        skipped: usize,
        failed: usize,
        cancelled: bool,
    ) {
        self.flush();
        let bytes_transferred = self.bytes_done();
        self.emit(ProgressEvent::BatchFinished {
            succeeded,
            skipped,
            failed,
            cancelled,
            bytes_transferred,
        });
    }

    /// Never waits on the observer: the batch holds the session while it
    /// runs, so a stalled receiver must not stall the transfer. Events that
    /// do not fit are dropped; the handle counters stay exact.
    fn emit(&mut self, event: ProgressEvent) -> bool {
        let Some(events) = &self.events else {
            return false;
        };
        match events.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                debug!("Progress observer lagging, dropped {:?}", event);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Progress observer went away");
                self.events = None;
                self.pending_delta = 0;
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_deltas_sum_to_bytes_done() {
        let (tx, mut rx) = mpsc::channel(64);
        let mut progress = OperationProgress::new(
            Arc::new(TransferControl::new()),
            Some(tx),
            Duration::from_secs(3600),
        );
        progress.add_total(30);
        progress.start_file("/a");
        progress.add_bytes(10);
        progress.add_bytes(20);
        progress.finish_file("/a", FileStatus::Succeeded);
        progress.finish_batch(1, 0, 0, false);
        drop(progress);

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }

        // Interval not elapsed: the two chunks arrive as one coalesced delta
        assert_eq!(
            events,
            vec![
                ProgressEvent::Progress {
                    delta: 30,
                    file: "/a".into(),
                    done: 30,
                    total: 30
                },
                ProgressEvent::FileFinished {
                    path: "/a".into(),
                    status: FileStatus::Succeeded
                },
                ProgressEvent::BatchFinished {
                    succeeded: 1,
                    skipped: 0,
                    failed: 0,
                    cancelled: false,
                    bytes_transferred: 30
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_handle_reads_counters() {
        let control = Arc::new(TransferControl::new());
        let mut progress = OperationProgress::new(control.clone(), None, Duration::ZERO);
        let handle = progress.handle();

        progress.add_total(200);
        progress.start_file("/big.iso");
        progress.add_bytes(50);

        assert_eq!(handle.bytes_done(), 50);
        assert_eq!(handle.total_bytes(), 200);
        assert_eq!(handle.percent(), 25.0);
        assert_eq!(handle.current_file().as_deref(), Some("/big.iso"));

        control.cancel();
        assert!(handle.is_cancelled());
    }

    #[tokio::test]
    async fn test_total_never_below_done() {
        let mut progress =
            OperationProgress::new(Arc::new(TransferControl::new()), None, Duration::ZERO);
        progress.add_total(10);
        progress.add_bytes(15);
        assert_eq!(progress.handle().total_bytes(), 15);
    }

    #[tokio::test]
    async fn test_full_channel_never_blocks() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut progress = OperationProgress::new(
            Arc::new(TransferControl::new()),
            Some(tx),
            Duration::from_secs(3600),
        );
        let handle = progress.handle();

        for i in 0..50 {
            let path = format!("/f{}", i);
            progress.start_file(&path);
            progress.add_bytes(2);
            progress.finish_file(&path, FileStatus::Succeeded);
        }
        progress.finish_batch(50, 0, 0, false);

        assert_eq!(handle.files_done(), 50);
        assert_eq!(handle.bytes_done(), 100);

        // Only the first event fit; the pending delta waits for room
        assert!(matches!(
            rx.try_recv(),
            Ok(ProgressEvent::Progress { delta: 2, .. })
        ));
        assert!(rx.try_recv().is_err());
        progress.flush();
        assert!(matches!(
            rx.try_recv(),
            Ok(ProgressEvent::Progress { delta: 98, done: 100, .. })
        ));
    }
}
