use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    New,
    Updated,
    Deleted,
    Renamed,
    Ignored,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Local change to be applied on the server.
    Up,
    /// Server change to be applied locally.
    Down,
    #[default]
    None,
}

/// One path's required action, as decided by reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncItem {
    pub path: String,
    pub kind: ChangeKind,
    #[serde(default)]
    pub direction: Direction,
    #[serde(default)]
    pub is_dir: bool,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub modified: i64,
    #[serde(default)]
    pub rename_target: Option<String>,
    #[serde(default)]
    pub etag: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl SyncItem {
    pub fn new(path: impl Into<String>, kind: ChangeKind, direction: Direction) -> Self {
        Self {
            path: path.into(),
            kind,
            direction,
            is_dir: false,
            size: 0,
            modified: 0,
            rename_target: None,
            etag: None,
            error_message: None,
        }
    }

    pub fn directory(path: impl Into<String>, kind: ChangeKind, direction: Direction) -> Self {
        Self {
            is_dir: true,
            ..Self::new(path, kind, direction)
        }
    }

    pub fn with_size(mut self, size: u64, modified: i64) -> Self {
        self.size = size;
        self.modified = modified;
        self
    }

    pub fn with_rename_target(mut self, target: impl Into<String>) -> Self {
        self.rename_target = Some(target.into());
        self
    }

    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }

    /// Where the item lives once the action is done.
    pub fn destination(&self) -> &str {
        match (&self.kind, &self.rename_target) {
            (ChangeKind::Renamed, Some(target)) => target,
            _ => &self.path,
        }
    }
}

/// Outcome of a job, ordered by severity: aggregation keeps the maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    NoStatus,
    Success,
    FileIgnored,
    /// Cancelled, or never started because the run was aborted.
    Aborted,
    /// Recoverable; the next run retries the item.
    SoftError,
    /// This item failed; siblings continue.
    NormalError,
    /// The whole run stops.
    FatalError,
}

impl Status {
    /// Whether a directory may go on with its content after its own action.
    pub fn allows_children(self) -> bool {
        matches!(self, Status::Success | Status::FileIgnored)
    }

    pub fn merge(self, other: Status) -> Status {
        self.max(other)
    }
}

/// Final result for one change record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemOutcome {
    pub path: String,
    pub kind: ChangeKind,
    pub direction: Direction,
    pub status: Status,
    pub message: Option<String>,
}

impl ItemOutcome {
    pub fn new(item: &SyncItem, status: Status, message: Option<String>) -> Self {
        Self {
            path: item.path.clone(),
            kind: item.kind,
            direction: item.direction,
            status,
            message,
        }
    }
}
