use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::AtomicUsize;
use std::time::Duration;

use async_trait::async_trait;
use filetime::FileTime;
use tempfile::TempDir;
use tokio::sync::Notify;

use super::*;
use crate::journal::{DownloadInfo, JournalError, JournalRecord, SqliteJournal};
use crate::propagator::events::ProgressKind;
use crate::propagator::item::{ChangeKind, Direction};
use crate::propagator::transport::{DownloadResult, TransferContext, TransportError, UploadResult};

const MTIME: i64 = 1_700_000_000;

#[derive(Debug, Clone, Copy)]
enum Failure {
    Fatal,
    Soft,
    Normal,
    Forbidden,
}

impl Failure {
    fn error(self, path: &str) -> TransportError {
        match self {
            Failure::Fatal => TransportError::ConnectionLost(path.to_string()),
            Failure::Soft => TransportError::Temporary(path.to_string()),
            Failure::Normal => TransportError::Rejected(path.to_string()),
            Failure::Forbidden => TransportError::Forbidden(path.to_string()),
        }
    }
}

/// Lets a test hold a task at a known point and decide when it goes on.
#[derive(Default)]
struct Checkpoint {
    reached: Notify,
    release: Notify,
}

impl Checkpoint {
    async fn pass(&self) {
        self.reached.notify_one();
        self.release.notified().await;
    }
}

#[derive(Default)]
struct FakeTransport {
    calls: Mutex<Vec<String>>,
    failures: HashMap<String, Failure>,
    remote: HashMap<String, Vec<u8>>,
    active: AtomicUsize,
    peak: AtomicUsize,
    delay: Duration,
    hold_transfers: bool,
    without_etags: bool,
    /// Held once a download has written all of its bytes.
    after_download: Option<Arc<Checkpoint>>,
}

impl FakeTransport {
    /// Fails every call on `target`, or a single call such as "remove /dav/x".
    fn fail(mut self, target: &str, failure: Failure) -> Self {
        self.failures.insert(target.to_string(), failure);
        self
    }

    fn with_remote(mut self, remote_path: &str, content: &[u8]) -> Self {
        self.remote.insert(remote_path.to_string(), content.to_vec());
        self
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    async fn perform(
        &self,
        call: String,
        remote_path: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<(), TransportError> {
        let failure = self
            .failures
            .get(&call)
            .or_else(|| self.failures.get(remote_path))
            .copied();
        self.calls.lock().unwrap().push(call);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let waited = match cancel {
            Some(cancel) if self.hold_transfers => {
                cancel.cancelled().await;
                Err(TransportError::Cancelled)
            }
            Some(cancel) => tokio::select! {
                _ = cancel.cancelled() => Err(TransportError::Cancelled),
                _ = tokio::time::sleep(self.delay) => Ok(()),
            },
            None => {
                tokio::time::sleep(self.delay).await;
                Ok(())
            }
        };
        self.active.fetch_sub(1, Ordering::SeqCst);
        waited?;
        match failure {
            Some(failure) => Err(failure.error(remote_path)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn upload(
        &self,
        remote_path: &str,
        source: &Path,
        _modified: i64,
        ctx: &TransferContext,
    ) -> Result<UploadResult, TransportError> {
        self.perform(format!("upload {remote_path}"), remote_path, Some(&ctx.cancel))
            .await?;
        let bytes = tokio::fs::metadata(source).await?.len();
        ctx.progress.report(bytes, bytes);
        Ok(UploadResult {
            bytes,
            etag: (!self.without_etags).then(|| format!("etag-{remote_path}")),
        })
    }

    async fn download(
        &self,
        remote_path: &str,
        target: &Path,
        offset: u64,
        ctx: &TransferContext,
    ) -> Result<DownloadResult, TransportError> {
        self.perform(format!("download {remote_path}"), remote_path, Some(&ctx.cancel))
            .await?;
        let content = self
            .remote
            .get(remote_path)
            .cloned()
            .unwrap_or_else(|| b"remote".to_vec());
        let mut staged = if offset > 0 {
            tokio::fs::read(target).await?
        } else {
            Vec::new()
        };
        staged.extend_from_slice(&content[offset as usize..]);
        tokio::fs::write(target, &staged).await?;
        let total = content.len() as u64;
        ctx.progress.report(total, total);
        if let Some(checkpoint) = &self.after_download {
            checkpoint.pass().await;
        }
        Ok(DownloadResult {
            bytes: total,
            total,
            etag: Some("v1".to_string()),
            modified: None,
        })
    }

    async fn mkdir(&self, remote_path: &str) -> Result<(), TransportError> {
        self.perform(format!("mkdir {remote_path}"), remote_path, None)
            .await
    }

    async fn remove(&self, remote_path: &str) -> Result<(), TransportError> {
        self.perform(format!("remove {remote_path}"), remote_path, None)
            .await
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), TransportError> {
        self.perform(format!("rename {from} {to}"), from, None).await
    }
}

/// Journal over SQLite that logs writes and can stall or panic on cue.
struct ScriptedJournal {
    inner: SqliteJournal,
    writes: Mutex<Vec<String>>,
    stall_download_info: Option<Arc<Checkpoint>>,
    panic_on_directory_record: bool,
}

impl ScriptedJournal {
    async fn new() -> Self {
        Self {
            inner: SqliteJournal::in_memory().await.unwrap(),
            writes: Mutex::new(Vec::new()),
            stall_download_info: None,
            panic_on_directory_record: false,
        }
    }

    fn log(&self, write: String) {
        self.writes.lock().unwrap().push(write);
    }

    fn writes(&self) -> Vec<String> {
        self.writes.lock().unwrap().clone()
    }
}

#[async_trait]
impl Journal for ScriptedJournal {
    async fn get(&self, path: &str) -> Result<Option<JournalRecord>, JournalError> {
        self.inner.get(path).await
    }

    async fn set(&self, record: &JournalRecord) -> Result<(), JournalError> {
        if record.is_dir && self.panic_on_directory_record {
            panic!("journal cannot store {}", record.path);
        }
        self.log(format!("set {}", record.path));
        self.inner.set(record).await
    }

    async fn remove(&self, path: &str) -> Result<(), JournalError> {
        self.log(format!("remove {path}"));
        self.inner.remove(path).await
    }

    async fn remove_tree(&self, path: &str) -> Result<(), JournalError> {
        self.log(format!("remove_tree {path}"));
        self.inner.remove_tree(path).await
    }

    async fn rename_tree(&self, from: &str, to: &str) -> Result<(), JournalError> {
        self.log(format!("rename_tree {from} {to}"));
        self.inner.rename_tree(from, to).await
    }

    async fn download_info(&self, path: &str) -> Result<Option<DownloadInfo>, JournalError> {
        if let Some(checkpoint) = &self.stall_download_info {
            checkpoint.pass().await;
        }
        self.inner.download_info(path).await
    }

    async fn set_download_info(&self, path: &str, info: &DownloadInfo) -> Result<(), JournalError> {
        self.log(format!("set_download_info {path}"));
        self.inner.set_download_info(path, info).await
    }

    async fn remove_download_info(&self, path: &str) -> Result<(), JournalError> {
        self.log(format!("remove_download_info {path}"));
        self.inner.remove_download_info(path).await
    }
}

fn propagator_over(dir: &TempDir, journal: Arc<ScriptedJournal>, transport: Arc<FakeTransport>) -> Propagator {
    let config = PropagatorConfig::new(dir.path(), "/dav").with_progress_interval(Duration::ZERO);
    Propagator::new(config, journal, transport)
}

struct Harness {
    dir: TempDir,
    journal: Arc<SqliteJournal>,
    transport: Arc<FakeTransport>,
    propagator: Propagator,
}

impl Harness {
    async fn new(transport: FakeTransport, max_parallel: usize) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let journal = Arc::new(SqliteJournal::in_memory().await.unwrap());
        let transport = Arc::new(transport);
        let propagator = Self::propagator_for(&dir, &journal, &transport, max_parallel);
        Self {
            dir,
            journal,
            transport,
            propagator,
        }
    }

    fn propagator_for(
        dir: &TempDir,
        journal: &Arc<SqliteJournal>,
        transport: &Arc<FakeTransport>,
        max_parallel: usize,
    ) -> Propagator {
        let config = PropagatorConfig::new(dir.path(), "/dav")
            .with_max_parallel(max_parallel)
            .with_progress_interval(Duration::ZERO);
        Propagator::new(config, journal.clone(), transport.clone())
    }

    /// A fresh engine over the same local tree, journal and server.
    fn next_run(&self) -> Propagator {
        Self::propagator_for(&self.dir, &self.journal, &self.transport, 3)
    }

    fn local(&self, path: &str) -> std::path::PathBuf {
        self.dir.path().join(path)
    }

    fn write_local(&self, path: &str, content: &[u8]) -> SyncItem {
        let full = self.local(path);
        std::fs::create_dir_all(full.parent().unwrap()).unwrap();
        std::fs::write(&full, content).unwrap();
        filetime::set_file_mtime(&full, FileTime::from_unix_time(MTIME, 0)).unwrap();
        SyncItem::new(path, ChangeKind::New, Direction::Up).with_size(content.len() as u64, MTIME)
    }

    async fn record_local(&self, path: &str) {
        let meta = std::fs::metadata(self.local(path)).unwrap();
        self.journal
            .set(&JournalRecord {
                path: path.to_string(),
                is_dir: false,
                size: meta.len(),
                modified: MTIME,
                etag: None,
            })
            .await
            .unwrap();
    }
}

async fn run(propagator: &Propagator, items: Vec<SyncItem>) -> (RunSummary, Vec<PropagatorEvent>) {
    let PropagatorRun { events, task } = propagator.start(items).unwrap();
    let summary = task.await.unwrap();
    (summary, collect(events).await)
}

async fn collect(mut events: UnboundedReceiver<PropagatorEvent>) -> Vec<PropagatorEvent> {
    let mut out = Vec::new();
    while let Some(event) = events.recv().await {
        out.push(event);
    }
    out
}

fn status_of(summary: &RunSummary, path: &str) -> Status {
    let matching: Vec<_> = summary.outcomes.iter().filter(|o| o.path == path).collect();
    assert_eq!(matching.len(), 1, "outcomes for {path}: {matching:?}");
    matching[0].status
}

fn finished_events(events: &[PropagatorEvent]) -> Vec<Status> {
    events
        .iter()
        .filter_map(|event| match event {
            PropagatorEvent::Finished(status) => Some(*status),
            _ => None,
        })
        .collect()
}

async fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn empty_change_list_finishes_immediately() {
    let harness = Harness::new(FakeTransport::default(), 3).await;
    let (summary, events) = run(&harness.propagator, Vec::new()).await;

    assert_eq!(summary.status, Status::Success);
    assert!(summary.outcomes.is_empty());
    assert_eq!(events, vec![PropagatorEvent::Finished(Status::Success)]);
    assert!(!harness.propagator.is_running());
}

#[tokio::test]
async fn directory_and_its_files_with_one_slot() {
    let harness = Harness::new(FakeTransport::default(), 1).await;
    let items = vec![
        SyncItem::directory("a", ChangeKind::New, Direction::Up).with_size(0, MTIME),
        harness.write_local("a/f1", b"one"),
        harness.write_local("a/f2", b"two!"),
    ];

    let (summary, events) = run(&harness.propagator, items).await;

    assert_eq!(summary.status, Status::Success);
    assert_eq!(
        harness.transport.calls(),
        vec!["mkdir /dav/a", "upload /dav/a/f1", "upload /dav/a/f2"]
    );
    assert_eq!(harness.transport.peak.load(Ordering::SeqCst), 1);
    let dir = harness.journal.get("a").await.unwrap().unwrap();
    assert!(dir.is_dir);
    let f2 = harness.journal.get("a/f2").await.unwrap().unwrap();
    assert_eq!(f2.size, 4);
    assert_eq!(f2.etag.as_deref(), Some("etag-/dav/a/f2"));
    assert!(harness.journal.get("a/f1").await.unwrap().is_some());

    assert_eq!(finished_events(&events), vec![Status::Success]);
    assert_eq!(events.last(), Some(&PropagatorEvent::Finished(Status::Success)));
    assert!(events.iter().any(|event| matches!(
        event,
        PropagatorEvent::Progress { kind: ProgressKind::Upload, path, bytes: 3, .. } if path == "a/f1"
    )));
}

#[tokio::test]
async fn every_record_gets_exactly_one_outcome() {
    let harness = Harness::new(FakeTransport::default(), 2).await;
    let items = vec![
        SyncItem::directory("d", ChangeKind::New, Direction::Up),
        harness.write_local("d/x", b"x"),
        SyncItem::directory("d/e", ChangeKind::New, Direction::Down),
        SyncItem::new("d/e/y", ChangeKind::New, Direction::Down).with_size(6, MTIME),
        harness.write_local("z", b"zz"),
        SyncItem::new("skip", ChangeKind::Ignored, Direction::None),
    ];

    let (summary, events) = run(&harness.propagator, items).await;

    assert_eq!(summary.status, Status::Success);
    let paths: HashSet<_> = summary.outcomes.iter().map(|o| o.path.as_str()).collect();
    assert_eq!(summary.outcomes.len(), 6);
    assert_eq!(paths.len(), 6);
    let completed = events
        .iter()
        .filter(|event| matches!(event, PropagatorEvent::ItemCompleted(_)))
        .count();
    assert_eq!(completed, 6);
    assert_eq!(status_of(&summary, "skip"), Status::FileIgnored);
    assert_eq!(std::fs::read(harness.local("d/e/y")).unwrap(), b"remote");
}

#[tokio::test]
async fn upload_loses_race_against_local_edit() {
    let harness = Harness::new(FakeTransport::default(), 3).await;
    let mut item = harness.write_local("doc.txt", b"edited after discovery");
    item.size = 3;

    let (summary, _) = run(&harness.propagator, vec![item]).await;

    assert_eq!(summary.status, Status::NormalError);
    assert!(harness.transport.calls().is_empty());
    assert!(harness.journal.get("doc.txt").await.unwrap().is_none());
}

#[tokio::test]
async fn download_is_staged_then_moved_into_place() {
    let transport = FakeTransport::default().with_remote("/dav/d.txt", b"hello");
    let harness = Harness::new(transport, 3).await;
    let item = SyncItem::new("d.txt", ChangeKind::New, Direction::Down)
        .with_size(5, MTIME)
        .with_etag("v1");

    let (summary, _) = run(&harness.propagator, vec![item]).await;

    assert_eq!(summary.status, Status::Success);
    assert_eq!(std::fs::read(harness.local("d.txt")).unwrap(), b"hello");
    let meta = std::fs::metadata(harness.local("d.txt")).unwrap();
    assert_eq!(FileTime::from_last_modification_time(&meta).unix_seconds(), MTIME);
    let record = harness.journal.get("d.txt").await.unwrap().unwrap();
    assert_eq!(record.size, 5);
    assert!(harness.journal.download_info("d.txt").await.unwrap().is_none());
    let entries: Vec<_> = std::fs::read_dir(harness.dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(entries, vec!["d.txt"]);
}

#[tokio::test]
async fn download_resumes_earlier_staging_file() {
    let transport = FakeTransport::default().with_remote("/dav/d.txt", b"hello");
    let harness = Harness::new(transport, 3).await;
    std::fs::write(harness.local(".d.txt.~0000abcd"), b"hel").unwrap();
    harness
        .journal
        .set_download_info(
            "d.txt",
            &DownloadInfo {
                tmpfile: ".d.txt.~0000abcd".into(),
                etag: Some("v1".into()),
            },
        )
        .await
        .unwrap();
    let item = SyncItem::new("d.txt", ChangeKind::Updated, Direction::Down)
        .with_size(5, MTIME)
        .with_etag("v1");

    let (summary, _) = run(&harness.propagator, vec![item]).await;

    assert_eq!(summary.status, Status::Success);
    assert_eq!(std::fs::read(harness.local("d.txt")).unwrap(), b"hello");
    assert!(!harness.local(".d.txt.~0000abcd").exists());
}

#[tokio::test]
async fn download_reports_size_difference() {
    let transport = FakeTransport::default().with_remote("/dav/big", b"12345");
    let harness = Harness::new(transport, 3).await;
    let item = SyncItem::new("big", ChangeKind::New, Direction::Down).with_size(3, MTIME);

    let (_, events) = run(&harness.propagator, vec![item]).await;

    assert!(events.contains(&PropagatorEvent::TransmissionSizeChanged(2)));
}

#[tokio::test]
async fn download_refuses_to_clobber_unknown_local_file() {
    let harness = Harness::new(FakeTransport::default(), 3).await;
    std::fs::write(harness.local("mine.txt"), b"local work").unwrap();
    let item = SyncItem::new("mine.txt", ChangeKind::New, Direction::Down).with_size(6, MTIME);

    let (summary, _) = run(&harness.propagator, vec![item]).await;

    assert_eq!(summary.status, Status::NormalError);
    assert_eq!(std::fs::read(harness.local("mine.txt")).unwrap(), b"local work");
    assert!(harness.transport.calls().is_empty());
}

#[tokio::test]
async fn concurrency_stays_within_the_cap() {
    let transport = FakeTransport {
        delay: Duration::from_millis(20),
        ..FakeTransport::default()
    };
    let harness = Harness::new(transport, 3).await;
    let items = (0..12)
        .map(|i| harness.write_local(&format!("f{i}"), b"data"))
        .collect();

    let (summary, _) = run(&harness.propagator, items).await;

    assert_eq!(summary.status, Status::Success);
    assert_eq!(summary.outcomes.len(), 12);
    let peak = harness.transport.peak.load(Ordering::SeqCst);
    assert!(peak <= 3, "peak concurrency {peak}");
    assert_eq!(harness.journal.count_records().await.unwrap(), 12);
}

#[tokio::test]
async fn worst_status_wins_and_siblings_continue() {
    let transport = FakeTransport::default()
        .fail("/dav/x", Failure::Soft)
        .fail("/dav/y", Failure::Normal);
    let harness = Harness::new(transport, 1).await;
    let items = vec![
        harness.write_local("x", b"1"),
        harness.write_local("y", b"2"),
        harness.write_local("z", b"3"),
    ];

    let (summary, events) = run(&harness.propagator, items).await;

    assert_eq!(status_of(&summary, "x"), Status::SoftError);
    assert_eq!(status_of(&summary, "y"), Status::NormalError);
    assert_eq!(status_of(&summary, "z"), Status::Success);
    assert_eq!(summary.status, Status::NormalError);
    assert_eq!(finished_events(&events), vec![Status::NormalError]);
}

#[tokio::test]
async fn failed_directory_creation_skips_its_content() {
    let transport = FakeTransport::default().fail("/dav/a", Failure::Normal);
    let harness = Harness::new(transport, 3).await;
    let items = vec![
        SyncItem::directory("a", ChangeKind::New, Direction::Up),
        harness.write_local("a/f", b"x"),
        harness.write_local("b", b"y"),
    ];

    let (summary, _) = run(&harness.propagator, items).await;

    assert_eq!(status_of(&summary, "a"), Status::NormalError);
    assert_eq!(status_of(&summary, "a/f"), Status::Aborted);
    assert_eq!(status_of(&summary, "b"), Status::Success);
    assert!(!harness.transport.calls().contains(&"upload /dav/a/f".to_string()));
    assert!(harness.journal.get("a").await.unwrap().is_none());
}

#[tokio::test]
async fn fatal_error_stops_the_run() {
    let transport = FakeTransport::default().fail("/dav/f0", Failure::Fatal);
    let harness = Harness::new(transport, 1).await;
    let items = (0..5)
        .map(|i| harness.write_local(&format!("f{i}"), b"data"))
        .collect();

    let (summary, events) = run(&harness.propagator, items).await;

    assert_eq!(summary.status, Status::FatalError);
    assert_eq!(status_of(&summary, "f0"), Status::FatalError);
    for i in 1..5 {
        assert_eq!(status_of(&summary, &format!("f{i}")), Status::Aborted);
    }
    assert_eq!(harness.transport.calls(), vec!["upload /dav/f0"]);
    assert_eq!(finished_events(&events), vec![Status::FatalError]);
    assert_eq!(events.last(), Some(&PropagatorEvent::Finished(Status::FatalError)));
    assert_eq!(harness.journal.count_records().await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn abort_stops_a_large_run_without_further_writes() {
    let transport = FakeTransport {
        hold_transfers: true,
        ..FakeTransport::default()
    };
    let harness = Harness::new(transport, 3).await;
    let items = (0..1000)
        .map(|i| SyncItem::new(format!("f{i}"), ChangeKind::New, Direction::Down).with_size(6, MTIME))
        .collect();

    let PropagatorRun { events, task } = harness.propagator.start(items).unwrap();
    wait_until(|| harness.propagator.active_jobs() == 3).await;
    harness.propagator.abort().await;
    let records_at_abort = harness.journal.count_records().await.unwrap();
    let summary = task.await.unwrap();
    let events = collect(events).await;

    assert_eq!(summary.status, Status::Aborted);
    assert_eq!(summary.outcomes.len(), 1000);
    assert!(summary.outcomes.iter().all(|o| o.status == Status::Aborted));
    let paths: HashSet<_> = summary.outcomes.iter().map(|o| o.path.as_str()).collect();
    assert_eq!(paths.len(), 1000);
    assert_eq!(harness.journal.count_records().await.unwrap(), records_at_abort);
    assert_eq!(records_at_abort, 0);
    assert_eq!(harness.transport.peak.load(Ordering::SeqCst), 3);
    assert_eq!(finished_events(&events), vec![Status::Aborted]);
    assert_eq!(events.last(), Some(&PropagatorEvent::Finished(Status::Aborted)));
    assert!(!harness.propagator.is_running());

    // Staged downloads never become visible.
    for i in 0..1000 {
        assert!(!harness.local(&format!("f{i}")).exists());
    }
}

#[tokio::test]
async fn abort_is_idempotent_and_blocks_new_runs() {
    let harness = Harness::new(FakeTransport::default(), 3).await;
    harness.propagator.abort().await;
    harness.propagator.abort().await;

    assert!(matches!(
        harness.propagator.start(Vec::new()),
        Err(PropagatorError::Aborted)
    ));
}

#[tokio::test]
async fn a_propagator_runs_once() {
    let harness = Harness::new(FakeTransport::default(), 3).await;
    let first = harness.propagator.start(Vec::new()).unwrap();
    assert!(matches!(
        harness.propagator.start(Vec::new()),
        Err(PropagatorError::AlreadyStarted)
    ));
    assert_eq!(first.wait().await.unwrap().status, Status::Success);
}

#[tokio::test]
async fn local_removal_is_idempotent() {
    let harness = Harness::new(FakeTransport::default(), 3).await;
    harness.write_local("gone.txt", b"bye");
    harness.record_local("gone.txt").await;
    let item = SyncItem::new("gone.txt", ChangeKind::Deleted, Direction::Down);

    let (first, _) = run(&harness.propagator, vec![item.clone()]).await;
    let (second, _) = run(&harness.next_run(), vec![item]).await;

    assert_eq!(first.status, Status::Success);
    assert_eq!(second.status, Status::Success);
    assert!(!harness.local("gone.txt").exists());
    assert!(harness.journal.get("gone.txt").await.unwrap().is_none());
}

#[tokio::test]
async fn local_removal_keeps_modified_file() {
    let harness = Harness::new(FakeTransport::default(), 3).await;
    harness.write_local("keep.txt", b"old");
    harness.record_local("keep.txt").await;
    harness.write_local("keep.txt", b"newer content");
    let item = SyncItem::new("keep.txt", ChangeKind::Deleted, Direction::Down);

    let (summary, _) = run(&harness.propagator, vec![item]).await;

    assert_eq!(summary.status, Status::NormalError);
    assert!(harness.local("keep.txt").exists());
    assert!(harness.journal.get("keep.txt").await.unwrap().is_some());
}

#[tokio::test]
async fn removed_directories_run_after_everything_else() {
    let harness = Harness::new(FakeTransport::default(), 1).await;
    let items = vec![
        SyncItem::directory("old", ChangeKind::Deleted, Direction::Up),
        SyncItem::new("old/a", ChangeKind::Deleted, Direction::Up),
        harness.write_local("new", b"n"),
    ];

    let (summary, _) = run(&harness.propagator, items).await;

    assert_eq!(summary.status, Status::Success);
    assert_eq!(harness.transport.calls(), vec!["upload /dav/new", "remove /dav/old"]);
    assert_eq!(status_of(&summary, "old/a"), Status::Success);
}

#[tokio::test]
async fn forbidden_removal_in_shared_folder_is_soft() {
    let transport = FakeTransport::default()
        .fail("remove /dav/Shared/doc.txt", Failure::Forbidden)
        .fail("/dav/Private/doc.txt", Failure::Forbidden);
    let harness = Harness::new(transport, 3).await;
    let items = vec![
        SyncItem::new("Shared/doc.txt", ChangeKind::Deleted, Direction::Up),
        SyncItem::new("Private/doc.txt", ChangeKind::Deleted, Direction::Up),
    ];

    let (summary, _) = run(&harness.propagator, items).await;

    assert_eq!(status_of(&summary, "Shared/doc.txt"), Status::SoftError);
    assert_eq!(status_of(&summary, "Private/doc.txt"), Status::NormalError);
    assert!(harness.propagator.is_in_shared_directory("Shared/doc.txt"));
}

#[tokio::test]
async fn local_rename_moves_file_and_journal_entry() {
    let harness = Harness::new(FakeTransport::default(), 3).await;
    harness.write_local("old.txt", b"content");
    harness.record_local("old.txt").await;
    let item = SyncItem::new("old.txt", ChangeKind::Renamed, Direction::Down)
        .with_rename_target("new.txt");

    let (summary, _) = run(&harness.propagator, vec![item]).await;

    assert_eq!(summary.status, Status::Success);
    assert!(!harness.local("old.txt").exists());
    assert_eq!(std::fs::read(harness.local("new.txt")).unwrap(), b"content");
    assert!(harness.journal.get("new.txt").await.unwrap().is_some());
    assert!(harness.journal.get("old.txt").await.unwrap().is_none());
}

#[tokio::test]
async fn duplicate_records_are_reported_as_errors() {
    let harness = Harness::new(FakeTransport::default(), 3).await;
    let item = harness.write_local("twice", b"t");

    let (summary, _) = run(&harness.propagator, vec![item.clone(), item]).await;

    assert_eq!(summary.outcomes.len(), 2);
    assert_eq!(summary.status, Status::NormalError);
    assert_eq!(harness.transport.calls(), vec!["upload /dav/twice"]);
}

#[tokio::test]
async fn runtime_limits_are_adjustable() {
    let harness = Harness::new(FakeTransport::default(), 3).await;
    harness.propagator.set_max_parallel(0);
    assert_eq!(harness.propagator.max_parallel(), 1);
    harness.propagator.set_max_parallel(6);
    assert_eq!(harness.propagator.max_parallel(), 6);

    harness.propagator.set_upload_limit(1024);
    harness.propagator.set_download_limit(2048);
    assert_eq!(harness.propagator.upload_limit(), 1024);
    assert_eq!(harness.propagator.download_limit(), 2048);
}

#[tokio::test]
async fn forbidden_removal_in_shared_folder_restores_the_file() {
    let transport = FakeTransport::default()
        .with_remote("/dav/Shared/doc.txt", b"shared")
        .fail("remove /dav/Shared/doc.txt", Failure::Forbidden);
    let harness = Harness::new(transport, 3).await;
    std::fs::create_dir_all(harness.local("Shared")).unwrap();
    let item = SyncItem::new("Shared/doc.txt", ChangeKind::Deleted, Direction::Up)
        .with_size(6, MTIME)
        .with_etag("v1");

    let (summary, _) = run(&harness.propagator, vec![item]).await;

    assert_eq!(summary.status, Status::SoftError);
    assert_eq!(
        harness.transport.calls(),
        vec!["remove /dav/Shared/doc.txt", "download /dav/Shared/doc.txt"]
    );
    assert_eq!(std::fs::read(harness.local("Shared/doc.txt")).unwrap(), b"shared");
    let record = harness.journal.get("Shared/doc.txt").await.unwrap().unwrap();
    assert_eq!(record.size, 6);
}

#[tokio::test]
async fn upload_without_server_etag_drops_the_old_one() {
    let transport = FakeTransport {
        without_etags: true,
        ..FakeTransport::default()
    };
    let harness = Harness::new(transport, 3).await;
    let item = harness.write_local("doc.txt", b"new").with_etag("before-upload");

    let (summary, _) = run(&harness.propagator, vec![item]).await;

    assert_eq!(summary.status, Status::Success);
    let record = harness.journal.get("doc.txt").await.unwrap().unwrap();
    assert_eq!(record.etag, None);
}

#[tokio::test]
async fn complete_staging_file_is_committed_without_transfer() {
    let transport = FakeTransport::default().with_remote("/dav/d.txt", b"hello");
    let harness = Harness::new(transport, 3).await;
    std::fs::write(harness.local(".d.txt.~0000abcd"), b"hello").unwrap();
    harness
        .journal
        .set_download_info(
            "d.txt",
            &DownloadInfo {
                tmpfile: ".d.txt.~0000abcd".into(),
                etag: Some("v1".into()),
            },
        )
        .await
        .unwrap();
    let item = SyncItem::new("d.txt", ChangeKind::New, Direction::Down)
        .with_size(5, MTIME)
        .with_etag("v1");

    let (summary, _) = run(&harness.propagator, vec![item]).await;

    assert_eq!(summary.status, Status::Success);
    assert!(harness.transport.calls().is_empty());
    assert_eq!(std::fs::read(harness.local("d.txt")).unwrap(), b"hello");
    assert!(!harness.local(".d.txt.~0000abcd").exists());
    assert!(harness.journal.download_info("d.txt").await.unwrap().is_none());
    assert_eq!(harness.journal.get("d.txt").await.unwrap().unwrap().etag.as_deref(), Some("v1"));
}

#[tokio::test]
async fn oversized_staging_file_is_downloaded_again() {
    let transport = FakeTransport::default().with_remote("/dav/d.txt", b"hello");
    let harness = Harness::new(transport, 3).await;
    std::fs::write(harness.local(".d.txt.~0000abcd"), b"hello, and more").unwrap();
    harness
        .journal
        .set_download_info(
            "d.txt",
            &DownloadInfo {
                tmpfile: ".d.txt.~0000abcd".into(),
                etag: Some("v1".into()),
            },
        )
        .await
        .unwrap();
    let item = SyncItem::new("d.txt", ChangeKind::New, Direction::Down)
        .with_size(5, MTIME)
        .with_etag("v1");

    let (summary, _) = run(&harness.propagator, vec![item]).await;

    assert_eq!(summary.status, Status::Success);
    assert_eq!(harness.transport.calls(), vec!["download /dav/d.txt"]);
    assert_eq!(std::fs::read(harness.local("d.txt")).unwrap(), b"hello");
    assert!(!harness.local(".d.txt.~0000abcd").exists());
}

#[tokio::test]
async fn abort_between_transfer_and_commit_leaves_a_resumable_download() {
    let checkpoint = Arc::new(Checkpoint::default());
    let transport = FakeTransport {
        after_download: Some(checkpoint.clone()),
        ..FakeTransport::default()
    }
    .with_remote("/dav/d.txt", b"hello");
    let harness = Harness::new(transport, 3).await;
    let item = SyncItem::new("d.txt", ChangeKind::New, Direction::Down)
        .with_size(5, MTIME)
        .with_etag("v1");

    let PropagatorRun { events, task } = harness.propagator.start(vec![item.clone()]).unwrap();
    checkpoint.reached.notified().await;
    harness.propagator.abort().await;
    checkpoint.release.notify_one();
    let summary = task.await.unwrap();
    let events = collect(events).await;

    assert_eq!(summary.status, Status::Aborted);
    assert_eq!(status_of(&summary, "d.txt"), Status::Aborted);
    assert_eq!(finished_events(&events), vec![Status::Aborted]);
    assert!(!harness.local("d.txt").exists());
    assert!(harness.journal.get("d.txt").await.unwrap().is_none());
    assert!(harness.journal.download_info("d.txt").await.unwrap().is_some());

    let (retry, _) = run(&harness.next_run(), vec![item]).await;

    assert_eq!(retry.status, Status::Success);
    assert_eq!(harness.transport.calls(), vec!["download /dav/d.txt"]);
    assert_eq!(std::fs::read(harness.local("d.txt")).unwrap(), b"hello");
    assert!(harness.journal.download_info("d.txt").await.unwrap().is_none());
    assert_eq!(harness.journal.count_records().await.unwrap(), 1);
}

#[tokio::test]
async fn no_journal_write_once_abort_returns() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint = Arc::new(Checkpoint::default());
    let journal = Arc::new(ScriptedJournal {
        stall_download_info: Some(checkpoint.clone()),
        ..ScriptedJournal::new().await
    });
    let transport = Arc::new(FakeTransport::default().with_remote("/dav/d.txt", b"hello"));
    let propagator = propagator_over(&dir, journal.clone(), transport.clone());
    let item = SyncItem::new("d.txt", ChangeKind::New, Direction::Down)
        .with_size(5, MTIME)
        .with_etag("v1");

    let PropagatorRun { events, task } = propagator.start(vec![item]).unwrap();
    checkpoint.reached.notified().await;
    propagator.abort().await;
    let writes_at_abort = journal.writes();
    checkpoint.release.notify_one();
    let summary = task.await.unwrap();
    drop(events);

    assert_eq!(summary.status, Status::Aborted);
    assert_eq!(journal.writes(), writes_at_abort);
    assert!(writes_at_abort.is_empty());
    assert!(transport.calls().is_empty());
    assert!(journal.inner.download_info("d.txt").await.unwrap().is_none());
}

#[tokio::test]
async fn panicking_directory_commit_fails_the_run_instead_of_hanging() {
    let dir = tempfile::tempdir().unwrap();
    let journal = Arc::new(ScriptedJournal {
        panic_on_directory_record: true,
        ..ScriptedJournal::new().await
    });
    let transport = Arc::new(FakeTransport::default());
    let propagator = propagator_over(&dir, journal.clone(), transport.clone());
    std::fs::create_dir_all(dir.path().join("a")).unwrap();
    let file = dir.path().join("a/f");
    std::fs::write(&file, b"x").unwrap();
    filetime::set_file_mtime(&file, FileTime::from_unix_time(MTIME, 0)).unwrap();
    let items = vec![
        SyncItem::directory("a", ChangeKind::New, Direction::Up),
        SyncItem::new("a/f", ChangeKind::New, Direction::Up).with_size(1, MTIME),
    ];

    let PropagatorRun { events, task } = propagator.start(items).unwrap();
    let summary = tokio::time::timeout(Duration::from_secs(10), task)
        .await
        .expect("run must finish")
        .unwrap();
    let events = collect(events).await;

    assert_eq!(summary.status, Status::FatalError);
    assert_eq!(summary.outcomes.len(), 2);
    assert_eq!(finished_events(&events), vec![Status::FatalError]);
    assert_eq!(journal.writes(), vec!["set a/f"]);
    assert!(!propagator.is_running());
}
