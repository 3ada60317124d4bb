use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

use super::item::{ItemOutcome, Status};
use super::job::JobId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressKind {
    Upload,
    Download,
}

/// What the caller observes while a run is going on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropagatorEvent {
    ItemCompleted(ItemOutcome),
    Progress {
        kind: ProgressKind,
        path: String,
        bytes: u64,
        total: u64,
    },
    /// The amount of data to transfer differs from what the change list announced.
    TransmissionSizeChanged(i64),
    Finished(Status),
}

/// Messages leaf tasks send back to the control task.
#[derive(Debug)]
pub(crate) enum LeafMessage {
    Progress {
        job: JobId,
        kind: ProgressKind,
        bytes: u64,
        total: u64,
    },
    SizeChanged(i64),
}

/// Throttles byte progress of one transfer and keeps it monotonic.
pub struct ProgressReporter {
    job: JobId,
    kind: ProgressKind,
    interval: Duration,
    tx: UnboundedSender<LeafMessage>,
    state: Mutex<ReporterState>,
}

struct ReporterState {
    last_sent: Option<Instant>,
    bytes: u64,
}

impl ProgressReporter {
    pub(crate) fn new(
        job: JobId,
        kind: ProgressKind,
        interval: Duration,
        tx: UnboundedSender<LeafMessage>,
    ) -> Self {
        Self {
            job,
            kind,
            interval,
            tx,
            state: Mutex::new(ReporterState {
                last_sent: None,
                bytes: 0,
            }),
        }
    }

    pub fn report(&self, bytes: u64, total: u64) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if bytes < state.bytes {
            return;
        }
        state.bytes = bytes;
        let now = Instant::now();
        let due = state
            .last_sent
            .is_none_or(|last| now.duration_since(last) >= self.interval);
        if !due && bytes < total {
            return;
        }
        state.last_sent = Some(now);
        let _ = self.tx.send(LeafMessage::Progress {
            job: self.job,
            kind: self.kind,
            bytes,
            total,
        });
    }

    pub fn size_changed(&self, delta: i64) {
        if delta != 0 {
            let _ = self.tx.send(LeafMessage::SizeChanged(delta));
        }
    }
}
