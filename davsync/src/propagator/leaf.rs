//! The actions a leaf job performs, one file or directory operation each.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use filetime::FileTime;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::events::{LeafMessage, ProgressKind, ProgressReporter};
use super::item::{ChangeKind, Direction, Status, SyncItem};
use super::job::JobId;
use super::limits::Bandwidth;
use super::transport::{DownloadResult, TransferContext, Transport, TransportError};
use crate::config::PropagatorConfig;
use crate::journal::{DownloadInfo, Journal, JournalError, JournalRecord};
use crate::paths::{PathError, file_name, local_path_for, remote_path_for, staging_path_for};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeafAction {
    Upload,
    Download,
    Mkdir(Direction),
    Remove(Direction),
    Rename(Direction),
    Ignore,
    Error(String),
}

impl LeafAction {
    /// Action for a file record.
    pub fn for_item(item: &SyncItem) -> Self {
        if let Some(action) = Self::without_transfer(item) {
            return action;
        }
        match (item.kind, item.direction) {
            (ChangeKind::Deleted, direction) => LeafAction::Remove(direction),
            (ChangeKind::Renamed, direction) => LeafAction::Rename(direction),
            (_, Direction::Up) => LeafAction::Upload,
            _ => LeafAction::Download,
        }
    }

    /// The directory's own action; `None` when only its content changed.
    pub fn for_directory(item: &SyncItem) -> Option<Self> {
        if let Some(action) = Self::without_transfer(item) {
            return Some(action);
        }
        match item.kind {
            ChangeKind::New => Some(LeafAction::Mkdir(item.direction)),
            ChangeKind::Deleted => Some(LeafAction::Remove(item.direction)),
            ChangeKind::Renamed => Some(LeafAction::Rename(item.direction)),
            _ => None,
        }
    }

    fn without_transfer(item: &SyncItem) -> Option<Self> {
        match item.kind {
            ChangeKind::Error => Some(LeafAction::Error(
                item.error_message
                    .clone()
                    .unwrap_or_else(|| format!("reconciliation failed for {}", item.path)),
            )),
            ChangeKind::Ignored => Some(LeafAction::Ignore),
            _ if item.direction == Direction::None => Some(LeafAction::Error(format!(
                "no direction given for {}",
                item.path
            ))),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum LeafError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("journal error: {0}")]
    Journal(#[from] JournalError),
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The local side moved on since the change list was computed.
    #[error("{0}")]
    LostRace(String),
    #[error("{0} changed while it was being uploaded")]
    ChangedDuringUpload(String),
    #[error("cannot remove {0} from a shared folder")]
    SharedReadOnly(String),
    #[error("{0}")]
    Rejected(String),
    #[error("run aborted")]
    Aborted,
}

impl LeafError {
    pub fn status(&self) -> Status {
        match self {
            LeafError::Transport(err) => err.status(),
            LeafError::Journal(_) => Status::FatalError,
            LeafError::ChangedDuringUpload(_) | LeafError::SharedReadOnly(_) => Status::SoftError,
            LeafError::Aborted => Status::Aborted,
            LeafError::Path(_)
            | LeafError::Io { .. }
            | LeafError::LostRace(_)
            | LeafError::Rejected(_) => Status::NormalError,
        }
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> LeafError + '_ {
    move |source| LeafError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Serializes journal commits against abort.
///
/// Commits hold the read side; abort takes the write side once, after which
/// every commit is refused.
#[derive(Debug, Default)]
pub(crate) struct AbortGate {
    requested: AtomicBool,
    lock: RwLock<()>,
}

impl AbortGate {
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Returns true for the first request only. Waits for commits in flight.
    pub async fn request(&self) -> bool {
        let first = !self.requested.swap(true, Ordering::SeqCst);
        drop(self.lock.write().await);
        first
    }

    pub async fn commit<T, F>(&self, commit: F) -> Result<T, LeafError>
    where
        F: Future<Output = Result<T, LeafError>>,
    {
        let _guard = self.lock.read().await;
        if self.is_requested() {
            return Err(LeafError::Aborted);
        }
        commit.await
    }
}

/// What every leaf of one run shares.
pub(crate) struct LeafContext {
    pub config: Arc<PropagatorConfig>,
    pub journal: Arc<dyn Journal>,
    pub transport: Arc<dyn Transport>,
    pub upload: Arc<Bandwidth>,
    pub download: Arc<Bandwidth>,
    pub messages: UnboundedSender<LeafMessage>,
    pub gate: Arc<AbortGate>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LeafOutcome {
    pub status: Status,
    pub message: Option<String>,
}

impl LeafOutcome {
    fn from_result(path: &str, result: Result<Status, LeafError>) -> Self {
        match result {
            Ok(status) => Self {
                status,
                message: None,
            },
            Err(err) => {
                let status = err.status();
                if status == Status::Aborted {
                    debug!(path, "job aborted");
                } else {
                    warn!(path, ?status, error = %err, "job failed");
                }
                Self {
                    status,
                    message: Some(err.to_string()),
                }
            }
        }
    }
}

pub(crate) async fn run_leaf(
    ctx: &LeafContext,
    job: JobId,
    item: &SyncItem,
    action: &LeafAction,
    cancel: CancellationToken,
) -> LeafOutcome {
    if ctx.gate.is_requested() || cancel.is_cancelled() {
        return LeafOutcome::from_result(&item.path, Err(LeafError::Aborted));
    }
    debug!(path = %item.path, ?action, "job started");
    let result = match action {
        LeafAction::Upload => upload(ctx, job, item, cancel).await,
        LeafAction::Download => download(ctx, job, item, cancel).await,
        LeafAction::Mkdir(direction) => mkdir(ctx, item, *direction).await,
        LeafAction::Remove(direction) => remove(ctx, job, item, *direction, cancel).await,
        LeafAction::Rename(direction) => rename(ctx, item, *direction).await,
        LeafAction::Ignore => Ok(Status::FileIgnored),
        LeafAction::Error(message) => Err(LeafError::Rejected(message.clone())),
    };
    LeafOutcome::from_result(&item.path, result)
}

/// Records a directory once everything below it went through.
pub(crate) async fn finalize_directory(ctx: &LeafContext, item: &SyncItem) -> Status {
    let record = JournalRecord {
        path: item.destination().to_string(),
        is_dir: true,
        size: 0,
        modified: item.modified,
        etag: item.etag.clone(),
    };
    let result = ctx
        .gate
        .commit(async { ctx.journal.set(&record).await.map_err(LeafError::from) })
        .await
        .map(|()| Status::Success);
    LeafOutcome::from_result(&record.path, result).status
}

fn modified_seconds(meta: &std::fs::Metadata) -> i64 {
    FileTime::from_last_modification_time(meta).unix_seconds()
}

fn transfer_context(
    ctx: &LeafContext,
    job: JobId,
    kind: ProgressKind,
    cancel: CancellationToken,
) -> TransferContext {
    let bandwidth = match kind {
        ProgressKind::Upload => ctx.upload.clone(),
        ProgressKind::Download => ctx.download.clone(),
    };
    TransferContext {
        cancel,
        bandwidth,
        progress: Arc::new(ProgressReporter::new(
            job,
            kind,
            ctx.config.progress_interval,
            ctx.messages.clone(),
        )),
    }
}

async fn upload(
    ctx: &LeafContext,
    job: JobId,
    item: &SyncItem,
    cancel: CancellationToken,
) -> Result<Status, LeafError> {
    let source = local_path_for(&ctx.config.local_root, &item.path)?;
    let unchanged = |meta: &std::fs::Metadata| {
        meta.is_file() && meta.len() == item.size && modified_seconds(meta) == item.modified
    };

    let before = match tokio::fs::metadata(&source).await {
        Ok(meta) => meta,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(LeafError::LostRace(format!(
                "{} disappeared before upload",
                item.path
            )));
        }
        Err(err) => return Err(io_error(&source)(err)),
    };
    if !unchanged(&before) {
        return Err(LeafError::LostRace(format!(
            "{} changed since it was discovered",
            item.path
        )));
    }

    let remote = remote_path_for(&ctx.config.remote_root, &item.path);
    let transfer = transfer_context(ctx, job, ProgressKind::Upload, cancel);
    let uploaded = ctx
        .transport
        .upload(&remote, &source, item.modified, &transfer)
        .await?;

    let after = tokio::fs::metadata(&source)
        .await
        .map_err(io_error(&source))?;
    if !unchanged(&after) {
        return Err(LeafError::ChangedDuringUpload(item.path.clone()));
    }
    if uploaded.bytes != item.size {
        transfer
            .progress
            .size_changed(uploaded.bytes as i64 - item.size as i64);
    }

    let record = JournalRecord {
        path: item.path.clone(),
        is_dir: false,
        size: item.size,
        modified: item.modified,
        etag: uploaded.etag,
    };
    ctx.gate
        .commit(async { ctx.journal.set(&record).await.map_err(LeafError::from) })
        .await?;
    Ok(Status::Success)
}

/// A local file may only be replaced or removed when it still matches the
/// journal, i.e. nobody touched it since the last sync.
async fn ensure_local_untouched(
    ctx: &LeafContext,
    item: &SyncItem,
    local: &Path,
) -> Result<(), LeafError> {
    let meta = match tokio::fs::metadata(local).await {
        Ok(meta) => meta,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(io_error(local)(err)),
    };
    let known = ctx.journal.get(&item.path).await?;
    let matches = known.is_some_and(|record| {
        meta.is_file() && record.size == meta.len() && record.modified == modified_seconds(&meta)
    });
    if matches {
        Ok(())
    } else {
        Err(LeafError::LostRace(format!(
            "{} was modified locally since it was discovered",
            item.path
        )))
    }
}

async fn download(
    ctx: &LeafContext,
    job: JobId,
    item: &SyncItem,
    cancel: CancellationToken,
) -> Result<Status, LeafError> {
    let target = local_path_for(&ctx.config.local_root, &item.path)?;
    ensure_local_untouched(ctx, item, &target).await?;

    let (mut staging, offset) = staging_for(ctx, item, &target).await?;
    let remote = remote_path_for(&ctx.config.remote_root, &item.path);
    let transfer = transfer_context(ctx, job, ProgressKind::Download, cancel);
    let downloaded = if offset > 0 && offset == item.size {
        debug!(path = %item.path, bytes = offset, "staging file already complete");
        transfer.progress.report(offset, offset);
        DownloadResult {
            bytes: offset,
            total: offset,
            etag: item.etag.clone(),
            modified: None,
        }
    } else {
        match ctx
            .transport
            .download(&remote, &staging, offset, &transfer)
            .await
        {
            Err(TransportError::RangeNotSatisfiable(reason)) if offset > 0 => {
                debug!(path = %item.path, offset, %reason, "restarting download from scratch");
                discard_staging(&staging).await;
                staging = fresh_staging(ctx, item, &target).await?;
                ctx.transport.download(&remote, &staging, 0, &transfer).await?
            }
            result => result?,
        }
    };

    if downloaded.total != item.size {
        transfer
            .progress
            .size_changed(downloaded.total as i64 - item.size as i64);
    }
    let modified = downloaded.modified.unwrap_or(item.modified);
    filetime::set_file_mtime(&staging, FileTime::from_unix_time(modified, 0))
        .map_err(io_error(&staging))?;

    let record = JournalRecord {
        path: item.path.clone(),
        is_dir: false,
        size: downloaded.bytes,
        modified,
        etag: downloaded.etag.or_else(|| item.etag.clone()),
    };
    ctx.gate
        .commit(async {
            tokio::fs::rename(&staging, &target)
                .await
                .map_err(io_error(&target))?;
            ctx.journal.set(&record).await?;
            ctx.journal.remove_download_info(&item.path).await?;
            Ok::<(), LeafError>(())
        })
        .await?;
    Ok(Status::Success)
}

/// Picks the staging file, resuming an earlier partial download of the
/// same server version when one is on disk.
async fn staging_for(
    ctx: &LeafContext,
    item: &SyncItem,
    target: &Path,
) -> Result<(PathBuf, u64), LeafError> {
    if let Some(info) = ctx.journal.download_info(&item.path).await? {
        let previous = target.with_file_name(&info.tmpfile);
        if info.etag == item.etag
            && let Ok(meta) = tokio::fs::metadata(&previous).await
            && meta.len() <= item.size
        {
            debug!(path = %item.path, offset = meta.len(), "resuming download");
            return Ok((previous, meta.len()));
        }
        discard_staging(&previous).await;
    }
    Ok((fresh_staging(ctx, item, target).await?, 0))
}

/// Registers a new staging file name so an interrupted download can resume.
async fn fresh_staging(
    ctx: &LeafContext,
    item: &SyncItem,
    target: &Path,
) -> Result<PathBuf, LeafError> {
    let staging = staging_path_for(target, rand::random::<u32>());
    let info = DownloadInfo {
        tmpfile: file_name(&staging.to_string_lossy()).to_string(),
        etag: item.etag.clone(),
    };
    ctx.gate
        .commit(async {
            ctx.journal
                .set_download_info(&item.path, &info)
                .await
                .map_err(LeafError::from)
        })
        .await?;
    Ok(staging)
}

async fn discard_staging(staging: &Path) {
    if let Err(err) = tokio::fs::remove_file(staging).await
        && err.kind() != ErrorKind::NotFound
    {
        warn!(path = %staging.display(), error = %err, "failed to drop stale staging file");
    }
}

async fn mkdir(ctx: &LeafContext, item: &SyncItem, direction: Direction) -> Result<Status, LeafError> {
    match direction {
        Direction::Down => {
            let local = local_path_for(&ctx.config.local_root, &item.path)?;
            tokio::fs::create_dir_all(&local)
                .await
                .map_err(io_error(&local))?;
        }
        _ => {
            let remote = remote_path_for(&ctx.config.remote_root, &item.path);
            ctx.transport.mkdir(&remote).await?;
        }
    }
    Ok(Status::Success)
}

async fn remove(
    ctx: &LeafContext,
    job: JobId,
    item: &SyncItem,
    direction: Direction,
    cancel: CancellationToken,
) -> Result<Status, LeafError> {
    match direction {
        Direction::Down => {
            let local = local_path_for(&ctx.config.local_root, &item.path)?;
            let removed = if item.is_dir {
                tokio::fs::remove_dir_all(&local).await
            } else {
                ensure_local_untouched(ctx, item, &local).await?;
                tokio::fs::remove_file(&local).await
            };
            match removed {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(io_error(&local)(err)),
            }
        }
        _ => {
            let remote = remote_path_for(&ctx.config.remote_root, &item.path);
            match ctx.transport.remove(&remote).await {
                Ok(()) | Err(TransportError::NotFound(_)) => {}
                Err(TransportError::Forbidden(_))
                    if ctx.config.is_in_shared_directory(&item.path) =>
                {
                    restore(ctx, job, item, cancel).await?;
                    return Err(LeafError::SharedReadOnly(item.path.clone()));
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
    ctx.gate
        .commit(async { ctx.journal.remove_tree(&item.path).await.map_err(LeafError::from) })
        .await?;
    Ok(Status::Success)
}

/// Brings back a local item the server refused to delete, so both sides
/// agree again. Only aborts and fatal failures of the restore are reported.
async fn restore(
    ctx: &LeafContext,
    job: JobId,
    item: &SyncItem,
    cancel: CancellationToken,
) -> Result<(), LeafError> {
    let restored = if item.is_dir {
        let local = local_path_for(&ctx.config.local_root, &item.path)?;
        tokio::fs::create_dir_all(&local)
            .await
            .map_err(io_error(&local))
    } else {
        download(ctx, job, item, cancel).await.map(|_| ())
    };
    match restored {
        Ok(()) => {
            debug!(path = %item.path, "restored item the server refused to delete");
            Ok(())
        }
        Err(err) if matches!(err.status(), Status::Aborted | Status::FatalError) => Err(err),
        Err(err) => {
            warn!(path = %item.path, error = %err, "failed to restore item");
            Ok(())
        }
    }
}

async fn rename(ctx: &LeafContext, item: &SyncItem, direction: Direction) -> Result<Status, LeafError> {
    let target = item.destination();
    match direction {
        Direction::Down => {
            let from = local_path_for(&ctx.config.local_root, &item.path)?;
            let to = local_path_for(&ctx.config.local_root, target)?;
            if tokio::fs::try_exists(&to).await.map_err(io_error(&to))? {
                return Err(LeafError::LostRace(format!("{target} already exists locally")));
            }
            tokio::fs::rename(&from, &to)
                .await
                .map_err(io_error(&from))?;
        }
        _ => {
            let from = remote_path_for(&ctx.config.remote_root, &item.path);
            let to = remote_path_for(&ctx.config.remote_root, target);
            ctx.transport.rename(&from, &to).await?;
        }
    }
    ctx.gate
        .commit(async {
            ctx.journal
                .rename_tree(&item.path, target)
                .await
                .map_err(LeafError::from)
        })
        .await?;
    Ok(Status::Success)
}
