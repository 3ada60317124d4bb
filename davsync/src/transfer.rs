use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use davsync_core::{ApiErrorClass, DavClient, DavError};
use futures_util::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::propagator::events::ProgressReporter;
use crate::propagator::limits::Bandwidth;
use crate::propagator::transport::{
    DownloadResult, TransferContext, Transport, TransportError, UploadResult,
};

/// [`Transport`] backed by a WebDAV server.
#[derive(Clone)]
pub struct DavTransport {
    client: DavClient,
}

impl DavTransport {
    pub fn new(client: DavClient) -> Self {
        Self { client }
    }
}

impl From<DavError> for TransportError {
    fn from(err: DavError) -> Self {
        if err.is_connection_failure() {
            return TransportError::ConnectionLost(err.to_string());
        }
        if err.is_not_found() {
            return TransportError::NotFound(err.to_string());
        }
        if err.is_range_not_satisfiable() {
            return TransportError::RangeNotSatisfiable(err.to_string());
        }
        match err.classification() {
            Some(ApiErrorClass::Auth) => TransportError::Unauthorized(err.to_string()),
            Some(ApiErrorClass::Forbidden) => TransportError::Forbidden(err.to_string()),
            Some(ApiErrorClass::QuotaExceeded) => TransportError::QuotaExceeded,
            _ if err.is_retryable() => TransportError::Temporary(err.to_string()),
            // Body errors halfway through a transfer are worth another try.
            None if matches!(err, DavError::Request(_)) => {
                TransportError::Temporary(err.to_string())
            }
            _ => TransportError::Rejected(err.to_string()),
        }
    }
}

struct UploadBody {
    file: tokio::fs::File,
    sent: u64,
    total: u64,
    bandwidth: Arc<Bandwidth>,
    progress: Arc<ProgressReporter>,
    done: bool,
}

fn upload_body(state: UploadBody) -> reqwest::Body {
    let stream = futures_util::stream::unfold(state, |mut state| async move {
        if state.done {
            return None;
        }
        let mut buf = vec![0u8; state.bandwidth.chunk_size()];
        match state.file.read(&mut buf).await {
            Ok(0) => None,
            Ok(read) => {
                buf.truncate(read);
                state.bandwidth.acquire(read as u64).await;
                state.sent += read as u64;
                state.progress.report(state.sent, state.total);
                Some((Ok::<_, io::Error>(buf), state))
            }
            Err(err) => {
                state.done = true;
                Some((Err(err), state))
            }
        }
    });
    reqwest::Body::wrap_stream(stream)
}

#[async_trait]
impl Transport for DavTransport {
    async fn upload(
        &self,
        remote_path: &str,
        source: &Path,
        modified: i64,
        ctx: &TransferContext,
    ) -> Result<UploadResult, TransportError> {
        let file = tokio::fs::File::open(source).await?;
        let total = file.metadata().await?.len();
        let body = upload_body(UploadBody {
            file,
            sent: 0,
            total,
            bandwidth: ctx.bandwidth.clone(),
            progress: ctx.progress.clone(),
            done: false,
        });

        let meta = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(TransportError::Cancelled),
            result = self.client.put_stream(remote_path, body, total, Some(modified)) => result?,
        };
        debug!(remote_path, bytes = total, etag = ?meta.etag, "upload finished");
        Ok(UploadResult {
            bytes: total,
            etag: meta.etag,
        })
    }

    async fn download(
        &self,
        remote_path: &str,
        target: &Path,
        offset: u64,
        ctx: &TransferContext,
    ) -> Result<DownloadResult, TransportError> {
        let download = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(TransportError::Cancelled),
            result = self.client.get_range(remote_path, offset) => result?,
        };

        let (mut file, start) = if download.resumed {
            let file = tokio::fs::OpenOptions::new()
                .append(true)
                .create(true)
                .open(target)
                .await?;
            (file, offset)
        } else {
            (tokio::fs::File::create(target).await?, 0)
        };
        let announced = download.meta.content_length.map(|len| start + len);
        let mut written = start;
        let mut stream = download.response.bytes_stream();

        loop {
            let next = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => {
                    file.flush().await?;
                    return Err(TransportError::Cancelled);
                }
                next = stream.next() => next,
            };
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk.map_err(DavError::from)?;
            ctx.bandwidth.acquire(chunk.len() as u64).await;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            ctx.progress
                .report(written, announced.unwrap_or(written).max(written));
        }

        file.flush().await?;
        file.sync_all().await?;
        debug!(remote_path, bytes = written, resumed = download.resumed, "download finished");
        Ok(DownloadResult {
            bytes: written,
            total: announced.unwrap_or(written),
            etag: download.meta.etag,
            modified: download.meta.modified,
        })
    }

    async fn mkdir(&self, remote_path: &str) -> Result<(), TransportError> {
        let outcome = self.client.mkcol(remote_path).await?;
        debug!(remote_path, ?outcome, "collection ensured");
        Ok(())
    }

    async fn remove(&self, remote_path: &str) -> Result<(), TransportError> {
        self.client.delete(remote_path).await?;
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), TransportError> {
        self.client.move_to(from, to, false).await?;
        Ok(())
    }
}
