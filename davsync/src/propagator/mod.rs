//! Executes a reconciled change list: a tree of jobs, one directory job per
//! directory and one leaf job per file action, run under a concurrency cap.

pub mod engine;
pub mod events;
pub mod item;
pub(crate) mod job;
pub mod leaf;
pub mod limits;
pub mod transport;

pub use engine::{Propagator, PropagatorError, PropagatorRun, RunSummary};
pub use events::{ProgressKind, PropagatorEvent};
pub use item::{ChangeKind, Direction, ItemOutcome, Status, SyncItem};
pub use transport::{DownloadResult, TransferContext, Transport, TransportError, UploadResult};
