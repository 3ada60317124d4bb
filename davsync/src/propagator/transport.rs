use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::events::ProgressReporter;
use super::item::Status;
use super::limits::Bandwidth;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transfer cancelled")]
    Cancelled,
    #[error("connection to the server lost: {0}")]
    ConnectionLost(String),
    #[error("authentication rejected: {0}")]
    Unauthorized(String),
    #[error("temporary server failure: {0}")]
    Temporary(String),
    #[error("server storage quota exceeded")]
    QuotaExceeded,
    #[error("remote resource not found: {0}")]
    NotFound(String),
    #[error("permission denied: {0}")]
    Forbidden(String),
    /// The server cannot resume at the requested offset.
    #[error("resume offset refused: {0}")]
    RangeNotSatisfiable(String),
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    pub fn status(&self) -> Status {
        match self {
            TransportError::Cancelled => Status::Aborted,
            TransportError::ConnectionLost(_) | TransportError::Unauthorized(_) => {
                Status::FatalError
            }
            TransportError::Temporary(_) | TransportError::QuotaExceeded => Status::SoftError,
            TransportError::NotFound(_)
            | TransportError::Forbidden(_)
            | TransportError::RangeNotSatisfiable(_)
            | TransportError::Rejected(_)
            | TransportError::Io(_) => Status::NormalError,
        }
    }
}

/// Per-transfer plumbing handed to the transport.
pub struct TransferContext {
    pub cancel: CancellationToken,
    pub bandwidth: Arc<Bandwidth>,
    pub progress: Arc<ProgressReporter>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadResult {
    pub bytes: u64,
    pub etag: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadResult {
    /// Bytes now present in the target file, offset included.
    pub bytes: u64,
    pub total: u64,
    pub etag: Option<String>,
    pub modified: Option<i64>,
}

/// One network call per file operation. Paths are full server-side paths.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn upload(
        &self,
        remote_path: &str,
        source: &Path,
        modified: i64,
        ctx: &TransferContext,
    ) -> Result<UploadResult, TransportError>;

    /// Appends to `target` starting at `offset`; the transport truncates and
    /// restarts when the server does not honour the offset.
    async fn download(
        &self,
        remote_path: &str,
        target: &Path,
        offset: u64,
        ctx: &TransferContext,
    ) -> Result<DownloadResult, TransportError>;

    async fn mkdir(&self, remote_path: &str) -> Result<(), TransportError>;

    async fn remove(&self, remote_path: &str) -> Result<(), TransportError>;

    async fn rename(&self, from: &str, to: &str) -> Result<(), TransportError>;
}
