//! Batch transfer orchestration
//!
//! [`TransferOrchestrator`] walks an ordered list of sources, expands
//! directories depth-first, resolves every destination conflict, moves the
//! bytes through the session's stream primitives and folds the per-file
//! outcomes into a [`BatchResult`].
//!
//! # Per-file process
//! 1. Resolve the destination name (transform, conflict resolution)
//! 2. Write to `<name>.filepart` (or straight into the destination when
//!    resuming it), retrying transient failures from the bytes that landed
//! 3. Verify the size, rename the part file onto the final name
//! 4. Apply permissions / timestamps, then delete the source for a move

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::action::{ActionKind, ActionRecord, ActionReporter};
use super::chunk::{copy_chunks, remote_io_error, ChunkSettings};
use super::conflict::{
    ConflictPrompt, ConflictResolver, FileSnapshot, Resolution, ResolvedTarget,
};
use super::control::TransferControl;
use super::copy_param::{CopyParam, FileFilter, TransferFlags};
use super::journal::{
    Direction, JournalEntry, JournalStatus, NullJournal, RedbJournal, TransferJournal,
};
use super::path_utils::{
    is_part_file, join_local_path, join_remote_path, part_file_name, remote_file_name,
    remote_parent, set_aside_name,
};
use super::progress::{FileStatus, OperationProgress, ProgressEvent, ProgressHandle};
use super::retry::{calculate_backoff, AttemptFuture, RetryConfig};
use crate::backend::{
    Backend, Capabilities, Capability, DeleteFlags, FileKind, Rights, RemoteFile,
    RemoteProperties, WriteMode,
};
use crate::config::TransferConfig;
use crate::error::TransferError;
use crate::local::{LocalFile, LocalFileSystem};
use crate::session::RemoteSession;

/// Default minimum gap between two progress events
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

/// Buffered events between a spawned batch and its observer
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// One batch: what to copy, where, and how
#[derive(Debug, Clone)]
pub struct TransferRequest {
    /// Files and/or directories, processed in order
    pub sources: Vec<String>,
    pub target_directory: String,
    pub copy_param: CopyParam,
    pub flags: TransferFlags,
}

impl TransferRequest {
    pub fn new(sources: Vec<String>, target_directory: impl Into<String>) -> Self {
        Self {
            sources,
            target_directory: target_directory.into(),
            copy_param: CopyParam::default(),
            flags: TransferFlags::empty(),
        }
    }

    pub fn with_param(mut self, copy_param: CopyParam) -> Self {
        self.copy_param = copy_param;
        self
    }

    pub fn with_flags(mut self, flags: TransferFlags) -> Self {
        self.flags = flags;
        self
    }
}

/// Aggregate outcome of a batch. Keys are source paths.
#[derive(Debug, Default, Serialize)]
pub struct BatchResult {
    pub succeeded: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: BTreeMap<String, TransferError>,
    /// Side operations (deletes, renames, property changes)
    pub actions: Vec<ActionRecord>,
    pub cancelled: bool,
    pub bytes_transferred: u64,
}

impl BatchResult {
    /// Nothing failed and the batch ran to the end
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && !self.cancelled
    }
}

/// Engine tuning shared by every batch of one orchestrator
#[derive(Debug, Clone)]
pub struct TransferSettings {
    pub retry: RetryConfig,
    pub chunk: ChunkSettings,
    pub progress_interval: Duration,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            chunk: ChunkSettings::default(),
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }
}

impl From<&TransferConfig> for TransferSettings {
    fn from(config: &TransferConfig) -> Self {
        Self {
            retry: config.retry.clone(),
            chunk: config.chunk_settings(),
            progress_interval: config.progress_interval(),
        }
    }
}

/// A batch running on its own task
pub struct TransferHandle {
    id: String,
    control: Arc<TransferControl>,
    progress: ProgressHandle,
    events: Option<mpsc::Receiver<ProgressEvent>>,
    join: JoinHandle<Result<BatchResult, TransferError>>,
}

impl TransferHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn control(&self) -> &Arc<TransferControl> {
        &self.control
    }

    pub fn progress(&self) -> &ProgressHandle {
        &self.progress
    }

    /// Take the event stream. The worker never waits on it: events that
    /// do not fit a full channel are dropped, byte deltas are coalesced.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<ProgressEvent>> {
        self.events.take()
    }

    pub fn cancel(&self) {
        self.control.cancel();
    }

    pub fn pause(&self) {
        self.control.pause();
    }

    pub fn resume(&self) {
        self.control.resume();
    }

    /// Wait for the batch to finish. Events not yet taken are discarded.
    pub async fn wait(mut self) -> Result<BatchResult, TransferError> {
        drop(self.events.take());
        match self.join.await {
            Ok(result) => result,
            Err(e) => Err(TransferError::Protocol(format!("transfer task failed: {}", e))),
        }
    }
}

/// Drives uploads and downloads for any backend
pub struct TransferOrchestrator {
    local: Arc<dyn LocalFileSystem>,
    journal: Arc<dyn TransferJournal>,
    prompt: Option<Arc<dyn ConflictPrompt>>,
    settings: TransferSettings,
}

impl TransferOrchestrator {
    pub fn new(local: Arc<dyn LocalFileSystem>) -> Self {
        Self {
            local,
            journal: Arc::new(NullJournal),
            prompt: None,
            settings: TransferSettings::default(),
        }
    }

    /// Settings and journal from the configuration file
    pub fn from_config(
        config: &TransferConfig,
        local: Arc<dyn LocalFileSystem>,
    ) -> Result<Self, TransferError> {
        let mut orchestrator = Self::new(local).with_settings(TransferSettings::from(config));
        if config.journal.enabled {
            let path = match &config.journal.path {
                Some(path) => path.clone(),
                None => RedbJournal::default_path()?,
            };
            orchestrator = orchestrator.with_journal(Arc::new(RedbJournal::open(&path)?));
        }
        Ok(orchestrator)
    }

    pub fn with_journal(mut self, journal: Arc<dyn TransferJournal>) -> Self {
        self.journal = journal;
        self
    }

    pub fn with_prompt(mut self, prompt: Arc<dyn ConflictPrompt>) -> Self {
        self.prompt = Some(prompt);
        self
    }

    pub fn with_settings(mut self, settings: TransferSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn settings(&self) -> &TransferSettings {
        &self.settings
    }

    /// Copy local sources into a remote directory.
    pub async fn upload(
        &self,
        session: &mut RemoteSession,
        request: &TransferRequest,
        control: Arc<TransferControl>,
        events: Option<mpsc::Sender<ProgressEvent>>,
    ) -> Result<BatchResult, TransferError> {
        let progress = OperationProgress::new(control, events, self.settings.progress_interval);
        self.run_batch(Direction::Upload, session, request, progress)
            .await
    }

    /// Copy remote sources into a local directory.
    pub async fn download(
        &self,
        session: &mut RemoteSession,
        request: &TransferRequest,
        control: Arc<TransferControl>,
        events: Option<mpsc::Sender<ProgressEvent>>,
    ) -> Result<BatchResult, TransferError> {
        let progress = OperationProgress::new(control, events, self.settings.progress_interval);
        self.run_batch(Direction::Download, session, request, progress)
            .await
    }

    /// Run an upload on a dedicated task. The session stays locked until the
    /// batch ends.
    pub fn spawn_upload(
        self: &Arc<Self>,
        session: Arc<Mutex<RemoteSession>>,
        request: TransferRequest,
    ) -> TransferHandle {
        self.spawn(Direction::Upload, session, request)
    }

    /// Run a download on a dedicated task.
    pub fn spawn_download(
        self: &Arc<Self>,
        session: Arc<Mutex<RemoteSession>>,
        request: TransferRequest,
    ) -> TransferHandle {
        self.spawn(Direction::Download, session, request)
    }

    fn spawn(
        self: &Arc<Self>,
        direction: Direction,
        session: Arc<Mutex<RemoteSession>>,
        request: TransferRequest,
    ) -> TransferHandle {
        let id = uuid::Uuid::new_v4().to_string();
        let control = Arc::new(TransferControl::new());
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let progress =
            OperationProgress::new(control.clone(), Some(tx), self.settings.progress_interval);
        let handle = progress.handle();

        let this = self.clone();
        let task_id = id.clone();
        let join = tokio::spawn(async move {
            let mut session = session.lock().await;
            debug!("Transfer {} acquired session", task_id);
            this.run_batch(direction, &mut session, &request, progress)
                .await
        });

        TransferHandle {
            id,
            control,
            progress: handle,
            events: Some(rx),
            join,
        }
    }

    async fn run_batch(
        &self,
        direction: Direction,
        session: &mut RemoteSession,
        request: &TransferRequest,
        progress: OperationProgress,
    ) -> Result<BatchResult, TransferError> {
        let filter = request.copy_param.compile_filter()?;
        let target = match direction {
            Direction::Upload => session.absolute_path(&request.target_directory).await?,
            Direction::Download => request.target_directory.clone(),
        };

        info!(
            "{:?} of {} source(s) into {} starting",
            direction,
            request.sources.len(),
            target
        );

        let batch = Batch {
            request,
            settings: &self.settings,
            journal: self.journal.as_ref(),
            prompt: self.prompt.as_deref(),
            ends: Endpoints {
                session,
                local: self.local.clone(),
                direction,
            },
            filter,
            progress,
            reporter: ActionReporter::new(self.settings.retry.clone()),
            result: BatchResult::default(),
            halted: false,
        };
        let result = batch.run(&target).await;

        info!(
            "{:?} finished: {} succeeded, {} skipped, {} failed{}",
            direction,
            result.succeeded.len(),
            result.skipped.len(),
            result.failed.len(),
            if result.cancelled { " (cancelled)" } else { "" }
        );
        Ok(result)
    }
}

/// Source/destination entry, whichever side it lives on
#[derive(Debug, Clone)]
struct Entry {
    name: String,
    path: String,
    kind: FileKind,
    size: u64,
    modified: Option<DateTime<Utc>>,
    rights: Option<Rights>,
}

impl Entry {
    fn is_directory(&self) -> bool {
        self.kind == FileKind::Directory
    }

    fn snapshot(&self) -> FileSnapshot {
        FileSnapshot::new(self.name.clone(), self.size, self.modified)
    }
}

impl From<RemoteFile> for Entry {
    fn from(file: RemoteFile) -> Self {
        Self {
            name: file.name,
            path: file.path,
            kind: file.kind,
            size: file.size,
            modified: file.modified,
            rights: file.rights,
        }
    }
}

impl From<LocalFile> for Entry {
    fn from(file: LocalFile) -> Self {
        Self {
            name: file.name,
            path: file.path,
            kind: file.kind,
            size: file.size,
            modified: file.modified,
            rights: file.rights,
        }
    }
}

type SourceReader = Box<dyn AsyncRead + Send + Unpin>;
type DestWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Destination stat used by the conflict resolver; owns what it needs so
/// lookups do not borrow the session.
#[derive(Clone)]
enum DestinationStat {
    Remote(Arc<dyn Backend>),
    Local(Arc<dyn LocalFileSystem>),
}

impl DestinationStat {
    /// Stat failures count as "does not exist"
    async fn snapshot(&self, path: &str) -> Option<FileSnapshot> {
        let found = match self {
            DestinationStat::Remote(backend) => backend
                .read_file(path)
                .await
                .map(|f| FileSnapshot::new(f.name, f.size, f.modified)),
            DestinationStat::Local(local) => local
                .stat(path)
                .await
                .map(|f| FileSnapshot::new(f.name, f.size, f.modified)),
        };
        match found {
            Ok(snapshot) => Some(snapshot),
            Err(TransferError::NotFound(_)) => None,
            Err(e) => {
                debug!("Stat of {} failed, treating as absent: {}", path, e);
                None
            }
        }
    }
}

/// The two sides of a batch, oriented by direction
struct Endpoints<'a> {
    session: &'a mut RemoteSession,
    local: Arc<dyn LocalFileSystem>,
    direction: Direction,
}

impl Endpoints<'_> {
    fn dest_stat(&self) -> DestinationStat {
        match self.direction {
            Direction::Upload => DestinationStat::Remote(self.session.backend().clone()),
            Direction::Download => DestinationStat::Local(self.local.clone()),
        }
    }

    fn capabilities(&self) -> Capabilities {
        self.session.capabilities()
    }

    /// Part file left behind by an earlier transfer on the source side
    fn is_leftover(&self, name: &str) -> bool {
        match self.direction {
            Direction::Upload => is_part_file(name),
            Direction::Download => self.session.is_temporary_transfer_file(name),
        }
    }

    /// Symlinks on the remote side stand for their target
    async fn resolve_remote(&mut self, file: RemoteFile) -> Result<Entry, TransferError> {
        if !file.is_symlink() {
            return Ok(file.into());
        }
        let target = self.session.read_symlink(&file).await?;
        Ok(Entry {
            kind: target.kind,
            size: target.size,
            modified: target.modified,
            rights: target.rights,
            ..Entry::from(file)
        })
    }

    async fn stat_source(&mut self, path: &str) -> Result<Entry, TransferError> {
        match self.direction {
            Direction::Upload => self.local.stat(path).await.map(Entry::from),
            Direction::Download => {
                let file = self.session.read_file(path).await?;
                self.resolve_remote(file).await
            }
        }
    }

    async fn list_source(&mut self, dir: &str) -> Result<Vec<Entry>, TransferError> {
        match self.direction {
            Direction::Upload => Ok(self
                .local
                .list(dir)
                .await?
                .into_iter()
                .map(Entry::from)
                .collect()),
            Direction::Download => {
                let listing = self.session.read_directory(dir).await?;
                let mut entries = Vec::with_capacity(listing.len());
                for file in listing.iter().cloned() {
                    match self.resolve_remote(file.clone()).await {
                        Ok(entry) => entries.push(entry),
                        Err(e) => {
                            debug!("Dangling link {}: {}", file.path, e);
                            entries.push(Entry {
                                kind: FileKind::Special,
                                ..Entry::from(file)
                            });
                        }
                    }
                }
                Ok(entries)
            }
        }
    }

    fn dest_path(direction: Direction, dir: &str, name: &str) -> String {
        match direction {
            Direction::Upload => join_remote_path(dir, name),
            Direction::Download => join_local_path(dir, name),
        }
    }

    fn source_path(direction: Direction, dir: &str, name: &str) -> String {
        match direction {
            Direction::Upload => join_local_path(dir, name),
            Direction::Download => join_remote_path(dir, name),
        }
    }

    /// `Ok(false)` when the directory has to be created
    async fn dest_dir_exists(&mut self, path: &str) -> Result<bool, TransferError> {
        let found = match self.direction {
            Direction::Upload => self.session.read_file(path).await.map(|f| f.is_directory()),
            Direction::Download => self.local.stat(path).await.map(|f| f.is_directory()),
        };
        match found {
            Ok(true) => Ok(true),
            Ok(false) => Err(TransferError::NotAFile(path.to_string())),
            Err(TransferError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn create_dest_dir(&mut self, path: &str) -> Result<(), TransferError> {
        match self.direction {
            Direction::Upload => self.session.create_directory(path).await,
            Direction::Download => self.local.create_dir(path).await,
        }
    }

    async fn dest_size(&mut self, path: &str) -> Result<u64, TransferError> {
        match self.direction {
            Direction::Upload => self.session.read_file(path).await.map(|f| f.size),
            Direction::Download => self.local.stat(path).await.map(|f| f.size),
        }
    }

    async fn open_source(
        &mut self,
        path: &str,
        offset: u64,
    ) -> Result<SourceReader, TransferError> {
        match self.direction {
            Direction::Upload => self.local.open_read(path, offset).await,
            Direction::Download => self.session.open_read(path, offset).await,
        }
    }

    async fn open_dest(&mut self, path: &str, append: bool) -> Result<DestWriter, TransferError> {
        match self.direction {
            Direction::Upload => {
                let mode = if append {
                    WriteMode::Append
                } else {
                    WriteMode::Create
                };
                self.session.open_write(path, mode).await
            }
            Direction::Download => self.local.open_write(path, append).await,
        }
    }

    async fn delete_dest(&mut self, path: &str) -> Result<(), TransferError> {
        match self.direction {
            Direction::Upload => self.session.delete_file(path, DeleteFlags::NO_RECURSIVE).await,
            Direction::Download => self.local.remove_file(path).await,
        }
    }

    async fn rename_dest(&mut self, from: &str, to: &str) -> Result<(), TransferError> {
        match self.direction {
            Direction::Upload => self.session.rename_file(from, to).await,
            Direction::Download => self.local.rename(from, to).await,
        }
    }

    async fn set_dest_properties(
        &mut self,
        path: &str,
        properties: &RemoteProperties,
    ) -> Result<(), TransferError> {
        match self.direction {
            Direction::Upload => self.session.change_file_properties(path, properties).await,
            Direction::Download => {
                if let Some(rights) = properties.rights {
                    self.local.set_rights(path, rights).await?;
                }
                if let Some(modified) = properties.modified {
                    self.local.set_modified(path, modified).await?;
                }
                Ok(())
            }
        }
    }

    async fn delete_source_file(&mut self, path: &str) -> Result<(), TransferError> {
        match self.direction {
            Direction::Upload => self.local.remove_file(path).await,
            Direction::Download => self.session.delete_file(path, DeleteFlags::NO_RECURSIVE).await,
        }
    }

    async fn delete_source_dir(&mut self, path: &str, force: bool) -> Result<(), TransferError> {
        match self.direction {
            Direction::Upload => self.local.remove_dir(path, force).await,
            Direction::Download => {
                let flags = if force {
                    DeleteFlags::FORCE_DELETE
                } else {
                    DeleteFlags::NO_RECURSIVE
                };
                self.session.delete_file(path, flags).await
            }
        }
    }
}

/// Map a stream error, remote side or local side
fn stream_error(remote: bool, err: std::io::Error, path: &str) -> TransferError {
    if remote {
        remote_io_error(err, path)
    } else {
        TransferError::from_io(err, path)
    }
}

/// Directory being expanded
struct Frame {
    source: String,
    destination: String,
    entries: std::vec::IntoIter<Entry>,
    /// Every child landed (and was removed, for a move)
    clean: bool,
    /// The destination directory was created by this batch
    fresh: bool,
}

enum FileOutcome {
    /// Copied; `settled` when nothing of the source is left to do
    Copied { settled: bool },
    Skipped,
}

/// State of one running batch
struct Batch<'a> {
    request: &'a TransferRequest,
    settings: &'a TransferSettings,
    journal: &'a dyn TransferJournal,
    prompt: Option<&'a dyn ConflictPrompt>,
    ends: Endpoints<'a>,
    filter: FileFilter,
    progress: OperationProgress,
    reporter: ActionReporter,
    result: BatchResult,
    /// A fatal error was seen
    halted: bool,
}

impl<'a> Batch<'a> {
    fn flags(&self) -> TransferFlags {
        self.request.flags
    }

    fn control(&self) -> Arc<TransferControl> {
        self.progress.control().clone()
    }

    fn should_stop(&self) -> bool {
        self.progress.control().is_cancelled()
            || self.halted
            || self.reporter.is_halted()
            || (self.flags().contains(TransferFlags::STOP_ON_FIRST_ERROR)
                && !self.result.failed.is_empty())
    }

    /// Blocks while paused; false once the batch has to stop
    async fn proceed(&self) -> bool {
        if !self.progress.control().wait_while_paused().await {
            return false;
        }
        !self.should_stop()
    }

    async fn run(mut self, target: &str) -> BatchResult {
        let request = self.request;

        for source in &request.sources {
            if !self.proceed().await {
                break;
            }

            let entry = match self.ends.stat_source(source).await {
                Ok(entry) => entry,
                Err(e) => {
                    self.record_failure(source, e).await;
                    continue;
                }
            };

            if entry.is_directory() {
                if self.flags().contains(TransferFlags::NO_RECURSIVE) {
                    let error = TransferError::NotAFile(entry.path.clone());
                    self.record_failure(&entry.path, error).await;
                } else if !self.filter.accepts(&entry.name, true) {
                    self.record_skip(&entry.path).await;
                } else {
                    self.transfer_tree(entry, target).await;
                }
            } else if entry.kind != FileKind::File || !self.filter.accepts(&entry.name, false) {
                self.record_skip(&entry.path).await;
            } else {
                let fresh = self.flags().contains(TransferFlags::NEW_DIRECTORY);
                self.transfer_file(&entry, target, fresh).await;
            }
        }

        let cancelled = self.progress.control().is_cancelled();
        let succeeded = self.result.succeeded.len();
        let skipped = self.result.skipped.len();
        let failed = self.result.failed.len();
        self.progress
            .finish_batch(succeeded, skipped, failed, cancelled);

        let mut result = self.result;
        result.cancelled = cancelled;
        result.bytes_transferred = self.progress.bytes_done();
        result.actions = self.reporter.into_records();
        result
    }

    async fn record_skip(&mut self, path: &str) {
        debug!("Skipped {}", path);
        self.result.skipped.push(path.to_string());
        self.progress.finish_file(path, FileStatus::Skipped);
    }

    async fn record_failure(&mut self, path: &str, error: TransferError) {
        let status = if error.is_cancelled() {
            info!("Transfer of {} cancelled", path);
            FileStatus::Cancelled
        } else {
            warn!("Transfer of {} failed: {}", path, error);
            FileStatus::Failed(error.to_string())
        };
        if error.is_fatal() {
            self.halted = true;
        }
        self.progress.finish_file(path, status);
        self.result.failed.insert(path.to_string(), error);
    }

    /// Depth-first copy of a directory. Destination directories exist before
    /// their first child is written.
    async fn transfer_tree(&mut self, root: Entry, target: &str) {
        let direction = self.ends.direction;
        let move_sources = self.flags().contains(TransferFlags::MOVE);
        let force = self.flags().contains(TransferFlags::FORCE_DELETE);

        let mut stack: Vec<Frame> = Vec::new();
        match self.open_frame(&root, target).await {
            Some(frame) => stack.push(frame),
            None => return,
        }

        loop {
            let Some(frame) = stack.last_mut() else {
                break;
            };
            if self.should_stop() {
                return;
            }

            let Some(child) = frame.entries.next() else {
                // Every child handled; close the directory
                let Some(done) = stack.pop() else { break };
                let removed = if move_sources && (done.clean || force) {
                    self.remove_source_dir(&done.source, force).await
                } else {
                    false
                };
                let settled = done.clean && (removed || !move_sources);
                if !settled {
                    if let Some(parent) = stack.last_mut() {
                        parent.clean = false;
                    }
                }
                continue;
            };
            let destination = frame.destination.clone();
            let fresh = frame.fresh;

            if !self.proceed().await {
                return;
            }

            let leftover = !child.is_directory() && self.ends.is_leftover(&child.name);
            let settled = if leftover || !self.filter.accepts(&child.name, child.is_directory()) {
                self.record_skip(&child.path).await;
                false
            } else if child.is_directory() {
                match self.open_frame(&child, &destination).await {
                    Some(frame) => {
                        stack.push(frame);
                        continue;
                    }
                    None => false,
                }
            } else if child.kind == FileKind::File {
                self.transfer_file(&child, &destination, fresh).await
            } else {
                self.record_skip(&child.path).await;
                false
            };

            if !settled {
                if let Some(frame) = stack.last_mut() {
                    frame.clean = false;
                }
            }
        }

        debug!("{:?} tree {} done", direction, root.path);
    }

    /// Create the destination directory and list the source. `None` when
    /// either fails; the failure is recorded and the children are not visited.
    async fn open_frame(&mut self, dir: &Entry, parent_destination: &str) -> Option<Frame> {
        let direction = self.ends.direction;
        let name = self.request.copy_param.transform_name(&dir.name);
        let destination = Endpoints::dest_path(direction, parent_destination, &name);

        let fresh = match self.ends.dest_dir_exists(&destination).await {
            Ok(true) => false,
            Ok(false) => {
                let control = self.control();
                let created = self
                    .reporter
                    .run(
                        ActionKind::CreateDirectory,
                        &destination,
                        &control,
                        &mut self.ends,
                        |ends| {
                            let path = destination.clone();
                            Box::pin(async move { ends.create_dest_dir(&path).await })
                        },
                    )
                    .await;
                if let Err(e) = created {
                    self.record_failure(&dir.path, e).await;
                    return None;
                }
                true
            }
            Err(e) => {
                self.record_failure(&dir.path, e).await;
                return None;
            }
        };

        let mut entries = match self.ends.list_source(&dir.path).await {
            Ok(entries) => entries,
            Err(e) => {
                self.record_failure(&dir.path, e).await;
                return None;
            }
        };
        // Listings may carry other spellings of the path; rebuild from the parent
        for entry in entries.iter_mut() {
            entry.path = Endpoints::source_path(direction, &dir.path, &entry.name);
        }
        let total: u64 = entries
            .iter()
            .filter(|e| e.kind == FileKind::File)
            .map(|e| e.size)
            .sum();
        self.progress.add_total(total);

        Some(Frame {
            source: dir.path.clone(),
            destination,
            entries: entries.into_iter(),
            clean: true,
            fresh,
        })
    }

    async fn remove_source_dir(&mut self, path: &str, force: bool) -> bool {
        let control = self.control();
        let source = path.to_string();
        self.reporter
            .run(
                ActionKind::DeleteSource,
                path,
                &control,
                &mut self.ends,
                |ends| {
                    let path = source.clone();
                    Box::pin(async move { ends.delete_source_dir(&path, force).await })
                },
            )
            .await
            .is_ok()
    }

    /// Copy one file and record its outcome. Returns whether the source is
    /// fully handled (copied, and removed for a move).
    async fn transfer_file(&mut self, entry: &Entry, dest_dir: &str, fresh: bool) -> bool {
        self.progress.start_file(&entry.path);
        match self.copy_file(entry, dest_dir, fresh).await {
            Ok(FileOutcome::Copied { settled }) => {
                self.result.succeeded.push(entry.path.clone());
                self.progress
                    .finish_file(&entry.path, FileStatus::Succeeded);
                settled
            }
            Ok(FileOutcome::Skipped) => {
                self.record_skip(&entry.path).await;
                false
            }
            Err(e) => {
                self.record_failure(&entry.path, e).await;
                false
            }
        }
    }

    /// `fresh` means nothing in `dest_dir` can collide with this file.
    async fn copy_file(
        &mut self,
        entry: &Entry,
        dest_dir: &str,
        fresh: bool,
    ) -> Result<FileOutcome, TransferError> {
        let request = self.request;
        let param = &request.copy_param;
        let direction = self.ends.direction;
        let capabilities = self.ends.capabilities();
        let control = self.control();

        // 1. Where does it go
        let dest_stat = self.ends.dest_stat();
        let resolver = ConflictResolver::new(param, capabilities, request.flags, self.prompt);
        let source = entry.snapshot();
        let name = param.transform_name(&entry.name);
        // Rewritten names may collide with each other even in a new directory
        let fresh = fresh && param.keeps_names();
        let target = if fresh {
            ResolvedTarget {
                name,
                resolution: Resolution::Overwrite,
                destination: None,
            }
        } else {
            resolver
                .resolve(&source, &name, |candidate| {
                    let dest_stat = dest_stat.clone();
                    let path = Endpoints::dest_path(direction, dest_dir, &candidate);
                    async move { dest_stat.snapshot(&path).await }
                })
                .await?
        };

        let resume = match target.resolution {
            Resolution::Skip => {
                debug!("{} skipped by conflict resolution", entry.path);
                return Ok(FileOutcome::Skipped);
            }
            Resolution::Abort => {
                info!("Batch aborted at {}", entry.path);
                control.cancel();
                return Err(TransferError::Cancelled);
            }
            Resolution::Resume => true,
            Resolution::Overwrite | Resolution::Rename(_) => false,
        };

        let final_path = Endpoints::dest_path(direction, dest_dir, &target.name);
        let use_part = param.use_part_file && !resume;
        let resumable =
            param.resume_enabled_for(entry.size) && capabilities.supports(Capability::Resume);

        // 2. Where the bytes land and from which offset
        let (write_path, mut offset) = if resume {
            let landed = target.destination.as_ref().map(|d| d.size).unwrap_or(0);
            (final_path.clone(), landed)
        } else if use_part {
            let part = Endpoints::dest_path(direction, dest_dir, &part_file_name(&target.name));
            let leftover = if fresh { None } else { dest_stat.snapshot(&part).await };
            let offset = match leftover {
                Some(leftover) if resumable && leftover.size < entry.size => {
                    info!("Resuming {} from leftover part file at {} bytes", part, leftover.size);
                    leftover.size
                }
                _ => 0,
            };
            (part, offset)
        } else {
            (final_path.clone(), 0)
        };

        let previous = match self.journal.find(direction, &final_path).await {
            Ok(found) => found,
            Err(e) => {
                warn!("Journal lookup for {} failed: {}", final_path, e);
                None
            }
        };
        if offset > 0 {
            if let Some(previous) = &previous {
                if !previous.matches_source(entry.size, entry.modified) {
                    if resume && !param.resume_fallback_overwrite {
                        return Err(TransferError::UnresolvedConflict(format!(
                            "{}: source changed since the interrupted transfer",
                            entry.path
                        )));
                    }
                    warn!(
                        "Source {} changed since the interrupted transfer ({} -> {} bytes), restarting from scratch",
                        entry.path, previous.source_size, entry.size
                    );
                    offset = 0;
                }
            }
        }

        let mut record = match previous {
            Some(previous) if previous.matches_source(entry.size, entry.modified) => previous,
            _ => JournalEntry::new(direction, &entry.path, &final_path, entry.size, entry.modified),
        };
        record.status = JournalStatus::Active;
        record.transferred_bytes = offset;
        record.error = None;
        self.save_journal(&record).await;

        self.progress.add_total(entry.size.saturating_sub(offset));

        // 3. Move the bytes
        let copied = self
            .copy_with_retry(
                entry,
                &write_path,
                offset,
                use_part || param.resume_fallback_overwrite,
                &control,
            )
            .await;
        if let Err(e) = copied {
            self.abandon(&mut record, &write_path, use_part, e.clone()).await;
            return Err(e);
        }

        // 4. Confirm, then put it in place
        let landed = self.ends.dest_size(&write_path).await?;
        if landed != entry.size {
            let error = TransferError::Protocol(format!(
                "{} has {} bytes after transfer, expected {}",
                write_path, landed, entry.size
            ));
            self.abandon(&mut record, &write_path, use_part, error.clone()).await;
            return Err(error);
        }

        if use_part {
            let replaces = target.destination.is_some();
            if let Err(e) = self
                .put_in_place(&write_path, &final_path, replaces, &control)
                .await
            {
                record.mark_interrupted(landed, e.to_string());
                self.save_journal(&record).await;
                return Err(e);
            }
        }

        // 5. Properties follow the data
        self.apply_properties(entry, &final_path, capabilities, &control)
            .await;

        if let Err(e) = self.journal.remove(direction, &final_path).await {
            warn!("Failed to clear journal entry for {}: {}", final_path, e);
        }
        info!("Transferred {} -> {} ({} bytes)", entry.path, final_path, entry.size);

        // 6. A move removes the source only now that the copy is in place
        let settled = if request.flags.contains(TransferFlags::MOVE) {
            self.run_on_ends(ActionKind::DeleteSource, &entry.path, &control, |ends, path| {
                Box::pin(async move { ends.delete_source_file(&path).await })
            })
            .await
            .is_ok()
        } else {
            true
        };

        Ok(FileOutcome::Copied { settled })
    }

    /// Rename a finished part file onto `final_path`. A local rename replaces
    /// the target atomically; a remote one sets the old file aside first and
    /// puts it back when the swap fails.
    async fn put_in_place(
        &mut self,
        part: &str,
        final_path: &str,
        replaces: bool,
        control: &TransferControl,
    ) -> Result<(), TransferError> {
        let aside = (replaces && self.ends.direction == Direction::Upload).then(|| {
            let name = set_aside_name(&remote_file_name(final_path));
            join_remote_path(&remote_parent(final_path), &name)
        });

        if let Some(aside) = &aside {
            let to = aside.clone();
            self.run_on_ends(ActionKind::Rename, final_path, control, move |ends, path| {
                let to = to.clone();
                Box::pin(async move { ends.rename_dest(&path, &to).await })
            })
            .await?;
        }

        let from = part.to_string();
        let placed = self
            .run_on_ends(ActionKind::Rename, final_path, control, move |ends, path| {
                let from = from.clone();
                Box::pin(async move { ends.rename_dest(&from, &path).await })
            })
            .await;

        match (placed, aside) {
            (Ok(()), Some(aside)) => {
                // The new file is in place; a stale copy aside is only clutter
                let _ = self
                    .run_on_ends(ActionKind::Delete, &aside, control, |ends, path| {
                        Box::pin(async move { ends.delete_dest(&path).await })
                    })
                    .await;
                Ok(())
            }
            (Ok(()), None) => Ok(()),
            (Err(e), Some(aside)) => {
                if let Err(restore) = self.ends.rename_dest(&aside, final_path).await {
                    warn!(
                        "Could not restore {} from {}: {}",
                        final_path, aside, restore
                    );
                }
                Err(e)
            }
            (Err(e), None) => Err(e),
        }
    }

    /// Report an action on `path` that only needs the endpoints.
    async fn run_on_ends<F>(
        &mut self,
        kind: ActionKind,
        path: &str,
        control: &TransferControl,
        op: F,
    ) -> Result<(), TransferError>
    where
        F: for<'e> Fn(&'e mut Endpoints<'a>, String) -> AttemptFuture<'e, ()>,
    {
        let owned = path.to_string();
        self.reporter
            .run(kind, path, control, &mut self.ends, |ends| op(ends, owned.clone()))
            .await
    }

    /// Copy attempts for one file. After a transient failure the next attempt
    /// appends from whatever landed, when the backend can.
    async fn copy_with_retry(
        &mut self,
        entry: &Entry,
        write_path: &str,
        mut offset: u64,
        may_restart: bool,
        control: &TransferControl,
    ) -> Result<(), TransferError> {
        let retry = self.settings.retry.clone();
        let can_append = self.ends.capabilities().supports(Capability::Resume);
        let mut fell_back = false;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let counted_before = self.progress.bytes_done();
            let error = match self.copy_stream(entry, write_path, offset, control).await {
                Ok(_) => return Ok(()),
                Err(e) => e,
            };

            if error.is_cancelled() || error.is_fatal() {
                return Err(error);
            }

            if error.is_transient() && attempt <= retry.max_retries {
                let delay = calculate_backoff(attempt - 1, &retry);
                info!(
                    "Transfer of {} failed (attempt {}), retrying in {:?}: {}",
                    entry.path, attempt, delay, error
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = control.cancelled() => return Err(TransferError::Cancelled),
                }

                let next = if can_append {
                    self.ends
                        .dest_size(write_path)
                        .await
                        .unwrap_or(0)
                        .min(entry.size)
                } else {
                    0
                };
                // Bytes of the failed write landed but were never counted
                let counted = self.progress.bytes_done() - counted_before;
                let landed = next.saturating_sub(offset);
                if landed > counted {
                    self.progress.add_bytes(landed - counted);
                }
                let reached = offset + landed.max(counted);
                self.progress.add_total(reached.saturating_sub(next));
                offset = next;
                continue;
            }

            if offset > 0 && !fell_back && may_restart {
                warn!(
                    "Resume of {} failed, overwriting from scratch: {}",
                    entry.path, error
                );
                self.progress.add_total(offset);
                offset = 0;
                fell_back = true;
                continue;
            }

            return Err(error);
        }
    }

    async fn copy_stream(
        &mut self,
        entry: &Entry,
        write_path: &str,
        offset: u64,
        control: &TransferControl,
    ) -> Result<u64, TransferError> {
        let upload = self.ends.direction == Direction::Upload;
        let mut reader = self.ends.open_source(&entry.path, offset).await?;
        let mut writer = self.ends.open_dest(write_path, offset > 0).await?;
        debug!("Copying {} -> {} from offset {}", entry.path, write_path, offset);

        copy_chunks(
            &mut reader,
            &mut writer,
            &self.settings.chunk,
            control,
            &mut self.progress,
            |e| stream_error(!upload, e, &entry.path),
            |e| stream_error(upload, e, write_path),
        )
        .await
    }

    /// Leave a failed file in a resumable state (or clean up on cancel).
    async fn abandon(
        &mut self,
        record: &mut JournalEntry,
        write_path: &str,
        use_part: bool,
        error: TransferError,
    ) {
        let landed = self.ends.dest_size(write_path).await.unwrap_or(0);

        if error.is_cancelled() && use_part {
            // A cancelled part file is not worth keeping
            if let Err(e) = self.ends.delete_dest(write_path).await {
                warn!("Failed to remove part file {}: {}", write_path, e);
            }
            if let Err(e) = self.journal.remove(record.direction, &record.destination).await {
                warn!("Failed to clear journal entry for {}: {}", record.destination, e);
            }
            return;
        }

        if error.is_cancelled() {
            record.mark_cancelled(landed);
        } else {
            record.mark_interrupted(landed, error.to_string());
        }
        self.save_journal(record).await;
    }

    async fn save_journal(&self, record: &JournalEntry) {
        if let Err(e) = self.journal.save(record).await {
            warn!("Failed to journal {}: {}", record.destination, e);
        }
    }

    async fn apply_properties(
        &mut self,
        entry: &Entry,
        final_path: &str,
        capabilities: Capabilities,
        control: &TransferControl,
    ) {
        let param = &self.request.copy_param;
        let mut properties = RemoteProperties {
            rights: param.rights_for(entry.rights),
            modified: if param.preserve_time { entry.modified } else { None },
            ..Default::default()
        };

        // Local files can always take both
        if self.ends.direction == Direction::Upload {
            if properties.rights.is_some() && !capabilities.supports(Capability::ChangeMode) {
                self.reporter.skip(
                    ActionKind::ChangeProperties,
                    final_path,
                    "backend cannot change permissions",
                );
                properties.rights = None;
            }
            if properties.modified.is_some()
                && !capabilities.supports(Capability::PreserveTimestamp)
            {
                self.reporter.skip(
                    ActionKind::ChangeProperties,
                    final_path,
                    "backend cannot set modification times",
                );
                properties.modified = None;
            }
        }

        if properties.is_empty() {
            return;
        }

        // Failures are recorded; the file itself still landed
        let _ = self
            .reporter
            .run(
                ActionKind::ChangeProperties,
                final_path,
                control,
                &mut self.ends,
                |ends| {
                    let path = final_path.to_string();
                    let properties = properties.clone();
                    Box::pin(async move { ends.set_dest_properties(&path, &properties).await })
                },
            )
            .await;
    }
}
