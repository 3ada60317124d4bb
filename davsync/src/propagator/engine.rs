use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use futures_util::FutureExt;
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::{self, JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::events::{LeafMessage, PropagatorEvent};
use super::item::{ItemOutcome, Status, SyncItem};
use super::job::{Effect, JobId, JobTree};
use super::leaf::{AbortGate, LeafContext, LeafOutcome, finalize_directory, run_leaf};
use super::limits::Bandwidth;
use super::transport::Transport;
use crate::config::PropagatorConfig;
use crate::journal::Journal;

#[derive(Debug, Error)]
pub enum PropagatorError {
    #[error("propagation was already started")]
    AlreadyStarted,
    #[error("propagation was aborted")]
    Aborted,
    #[error("control task failed: {0}")]
    Join(#[from] JoinError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub status: Status,
    /// One entry per change record, in completion order.
    pub outcomes: Vec<ItemOutcome>,
}

/// A started run. Events stop after [`PropagatorEvent::Finished`].
pub struct PropagatorRun {
    pub events: UnboundedReceiver<PropagatorEvent>,
    pub task: JoinHandle<RunSummary>,
}

impl PropagatorRun {
    pub async fn wait(self) -> Result<RunSummary, PropagatorError> {
        Ok(self.task.await?)
    }
}

#[derive(Debug)]
enum Control {
    Abort,
    Reschedule,
}

enum TaskResult {
    Leaf(JobId, LeafOutcome),
    Finalized(JobId, Status),
}

#[derive(Default)]
struct EventSink {
    tx: Option<UnboundedSender<PropagatorEvent>>,
    finished: Option<Status>,
}

struct Shared {
    config: Arc<PropagatorConfig>,
    journal: Arc<dyn Journal>,
    transport: Arc<dyn Transport>,
    upload: Arc<Bandwidth>,
    download: Arc<Bandwidth>,
    max_parallel: AtomicUsize,
    active_jobs: AtomicUsize,
    started: AtomicBool,
    running: AtomicBool,
    gate: Arc<AbortGate>,
    cancel: CancellationToken,
    control: OnceLock<UnboundedSender<Control>>,
    sink: Mutex<EventSink>,
}

impl Shared {
    fn emit(&self, event: PropagatorEvent) {
        if let Ok(sink) = self.sink.lock()
            && let Some(tx) = &sink.tx
        {
            let _ = tx.send(event);
        }
    }

    /// Sends `Finished` the first time only; returns the status that was sent.
    fn finish(&self, status: Status) -> Status {
        let Ok(mut sink) = self.sink.lock() else {
            return status;
        };
        if let Some(sent) = sink.finished {
            return sent;
        }
        sink.finished = Some(status);
        if let Some(tx) = sink.tx.take() {
            let _ = tx.send(PropagatorEvent::Finished(status));
        }
        status
    }

    async fn stop(&self, status: Status) {
        let first = self.gate.request().await;
        self.cancel.cancel();
        self.control(Control::Abort);
        if first {
            info!(?status, "propagation stopping");
        }
        self.finish(status);
    }

    fn control(&self, message: Control) {
        if let Some(control) = self.control.get() {
            let _ = control.send(message);
        }
    }
}

/// Executes a reconciled change list against the local tree and the server.
#[derive(Clone)]
pub struct Propagator {
    shared: Arc<Shared>,
}

impl Propagator {
    pub fn new(
        config: PropagatorConfig,
        journal: Arc<dyn Journal>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let max_parallel = config.max_parallel.max(1);
        let upload = Arc::new(Bandwidth::new(config.upload_limit));
        let download = Arc::new(Bandwidth::new(config.download_limit));
        Self {
            shared: Arc::new(Shared {
                config: Arc::new(config),
                journal,
                transport,
                upload,
                download,
                max_parallel: AtomicUsize::new(max_parallel),
                active_jobs: AtomicUsize::new(0),
                started: AtomicBool::new(false),
                running: AtomicBool::new(false),
                gate: Arc::new(AbortGate::default()),
                cancel: CancellationToken::new(),
                control: OnceLock::new(),
                sink: Mutex::new(EventSink::default()),
            }),
        }
    }

    /// Starts executing `items`, which must list parents before their content.
    pub fn start(&self, items: Vec<SyncItem>) -> Result<PropagatorRun, PropagatorError> {
        if self.shared.gate.is_requested() {
            return Err(PropagatorError::Aborted);
        }
        if self.shared.started.swap(true, Ordering::SeqCst) {
            return Err(PropagatorError::AlreadyStarted);
        }

        let (event_tx, events) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (leaf_tx, leaf_rx) = mpsc::unbounded_channel();
        if let Ok(mut sink) = self.shared.sink.lock() {
            sink.tx = Some(event_tx);
        }
        let _ = self.shared.control.set(control_tx);

        let records = items.len();
        let tree = JobTree::build(items, &self.shared.cancel, self.max_parallel());
        info!(records, jobs = tree.len(), max_parallel = self.max_parallel(), "propagation started");

        let ctx = Arc::new(LeafContext {
            config: self.shared.config.clone(),
            journal: self.shared.journal.clone(),
            transport: self.shared.transport.clone(),
            upload: self.shared.upload.clone(),
            download: self.shared.download.clone(),
            messages: leaf_tx,
            gate: self.shared.gate.clone(),
        });
        self.shared.running.store(true, Ordering::SeqCst);
        let task = tokio::spawn(control_loop(
            self.shared.clone(),
            ctx,
            tree,
            control_rx,
            leaf_rx,
        ));
        Ok(PropagatorRun { events, task })
    }

    /// Stops the run. Returns once no further journal write can happen.
    pub async fn abort(&self) {
        self.shared.stop(Status::Aborted).await;
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn active_jobs(&self) -> usize {
        self.shared.active_jobs.load(Ordering::SeqCst)
    }

    pub fn max_parallel(&self) -> usize {
        self.shared.max_parallel.load(Ordering::SeqCst)
    }

    /// Takes effect as jobs finish; running jobs are never interrupted.
    pub fn set_max_parallel(&self, max_parallel: usize) {
        self.shared
            .max_parallel
            .store(max_parallel.max(1), Ordering::SeqCst);
        self.shared.control(Control::Reschedule);
    }

    pub fn set_upload_limit(&self, bytes_per_sec: u64) {
        self.shared.upload.set_limit(bytes_per_sec);
    }

    pub fn set_download_limit(&self, bytes_per_sec: u64) {
        self.shared.download.set_limit(bytes_per_sec);
    }

    pub fn upload_limit(&self) -> u64 {
        self.shared.upload.limit()
    }

    pub fn download_limit(&self) -> u64 {
        self.shared.download.limit()
    }

    pub fn is_in_shared_directory(&self, path: &str) -> bool {
        self.shared.config.is_in_shared_directory(path)
    }
}

async fn control_loop(
    shared: Arc<Shared>,
    ctx: Arc<LeafContext>,
    mut tree: JobTree,
    mut control_rx: UnboundedReceiver<Control>,
    mut leaf_rx: UnboundedReceiver<LeafMessage>,
) -> RunSummary {
    let mut tasks: JoinSet<TaskResult> = JoinSet::new();
    let mut task_jobs: HashMap<task::Id, JobId> = HashMap::new();
    let mut outcomes = Vec::new();
    let mut root_status = None;

    tree.start();
    loop {
        if shared.gate.is_requested() {
            tree.abort_all();
        }
        tree.set_cap(shared.max_parallel.load(Ordering::SeqCst));

        loop {
            let effects = tree.take_effects();
            if effects.is_empty() {
                break;
            }
            for effect in effects {
                match effect {
                    Effect::Launch(id) => {
                        if let Some(handle) = spawn_leaf(&mut tasks, &tree, &ctx, id) {
                            task_jobs.insert(handle.id(), id);
                        }
                    }
                    Effect::Finalize(id) => {
                        let Some(item) = tree.directory_item(id).cloned() else {
                            tree.on_finalized(id, Status::Success);
                            continue;
                        };
                        let ctx = ctx.clone();
                        let handle = tasks.spawn(async move {
                            let status = AssertUnwindSafe(finalize_directory(&ctx, &item))
                                .catch_unwind()
                                .await
                                .unwrap_or_else(|_| {
                                    warn!(path = %item.path, "directory finalize panicked");
                                    Status::FatalError
                                });
                            TaskResult::Finalized(id, status)
                        });
                        task_jobs.insert(handle.id(), id);
                    }
                    Effect::Completed(outcome) => {
                        shared.emit(PropagatorEvent::ItemCompleted(outcome.clone()));
                        outcomes.push(outcome);
                    }
                    Effect::RootFinished(status) => root_status = Some(status),
                }
            }
        }
        shared
            .active_jobs
            .store(tree.active_leaves(), Ordering::SeqCst);

        if root_status.is_some() && tasks.is_empty() {
            break;
        }

        // Progress sent by a leaf is forwarded before its completion.
        tokio::select! {
            biased;
            Some(message) = leaf_rx.recv() => match message {
                LeafMessage::Progress { job, kind, bytes, total } => {
                    if let Some(leaf) = tree.leaf(job) {
                        shared.emit(PropagatorEvent::Progress {
                            kind,
                            path: leaf.item.path.clone(),
                            bytes,
                            total,
                        });
                    }
                }
                LeafMessage::SizeChanged(delta) => {
                    shared.emit(PropagatorEvent::TransmissionSizeChanged(delta));
                }
            },
            Some(joined) = tasks.join_next_with_id(), if !tasks.is_empty() => {
                let (id, status, message) = match joined {
                    Ok((task_id, result)) => {
                        task_jobs.remove(&task_id);
                        match result {
                            TaskResult::Leaf(id, outcome) => (id, outcome.status, outcome.message),
                            TaskResult::Finalized(id, status) => (id, status, None),
                        }
                    }
                    Err(err) => {
                        let Some(id) = task_jobs.remove(&err.id()) else {
                            warn!(error = %err, "unknown job task failed to join");
                            continue;
                        };
                        warn!(job = id, error = %err, "job task failed to join");
                        (id, Status::FatalError, Some(err.to_string()))
                    }
                };
                if status == Status::FatalError {
                    warn!(job = id, error = ?message, "fatal error, stopping propagation");
                    shared.stop(Status::FatalError).await;
                    tree.abort_all();
                }
                if tree.leaf(id).is_some() {
                    tree.on_leaf_finished(id, status, message);
                } else {
                    tree.on_finalized(id, status);
                }
            }
            Some(control) = control_rx.recv() => {
                debug!(?control, "control message");
            }
        }
    }

    let status = shared.finish(root_status.unwrap_or(Status::Success));
    shared.active_jobs.store(0, Ordering::SeqCst);
    shared.running.store(false, Ordering::SeqCst);
    info!(?status, items = outcomes.len(), "propagation finished");
    RunSummary { status, outcomes }
}

fn spawn_leaf(
    tasks: &mut JoinSet<TaskResult>,
    tree: &JobTree,
    ctx: &Arc<LeafContext>,
    id: JobId,
) -> Option<task::AbortHandle> {
    let leaf = tree.leaf(id)?;
    let item = leaf.item.clone();
    let action = leaf.action.clone();
    let cancel = leaf.cancel.clone();
    let ctx = ctx.clone();
    Some(tasks.spawn(async move {
        let outcome = AssertUnwindSafe(run_leaf(&ctx, id, &item, &action, cancel))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| LeafOutcome {
                status: Status::FatalError,
                message: Some(format!("job for {} panicked", item.path)),
            });
        TaskResult::Leaf(id, outcome)
    }))
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
