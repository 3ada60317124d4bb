use std::time::UNIX_EPOCH;

use reqwest::header::{self, HeaderMap};
use reqwest::{Body, Client, Method, RequestBuilder, Response, StatusCode};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum DavError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("base url cannot carry a path: {0}")]
    CannotBeABase(String),
    #[error("invalid method: {0}")]
    InvalidMethod(&'static str),
    #[error("server returned {status}: {body}")]
    Api { status: StatusCode, body: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    Forbidden,
    NotFound,
    RateLimit,
    Transient,
    QuotaExceeded,
    Permanent,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Credentials {
    None,
    Bearer(String),
    Basic { user: String, password: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MkcolOutcome {
    Created,
    AlreadyExists,
}

/// Metadata the server reports in response headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceMeta {
    pub etag: Option<String>,
    pub content_length: Option<u64>,
    pub modified: Option<i64>,
}

/// An open GET response body.
#[derive(Debug)]
pub struct Download {
    pub meta: ResourceMeta,
    /// True when the server honoured the requested byte offset.
    pub resumed: bool,
    pub response: Response,
}

#[derive(Clone)]
pub struct DavClient {
    http: Client,
    base_url: Url,
    credentials: Credentials,
}

impl DavClient {
    pub fn new(base_url: &str, credentials: Credentials) -> Result<Self, DavError> {
        Self::with_http(Client::new(), base_url, credentials)
    }

    pub fn with_http(
        http: Client,
        base_url: &str,
        credentials: Credentials,
    ) -> Result<Self, DavError> {
        let base_url = Url::parse(base_url)?;
        if base_url.cannot_be_a_base() {
            return Err(DavError::CannotBeABase(base_url.to_string()));
        }
        Ok(Self {
            http,
            base_url,
            credentials,
        })
    }

    /// Maps a server-side path ("/remote.php/webdav/Docs/a b.txt") to an
    /// absolute url, percent-encoding every segment.
    pub fn resource_url(&self, remote_path: &str) -> Result<Url, DavError> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| DavError::CannotBeABase(self.base_url.to_string()))?;
            segments.pop_if_empty();
            for part in remote_path.split('/').filter(|part| !part.is_empty()) {
                segments.push(part);
            }
        }
        Ok(url)
    }

    pub async fn put_stream(
        &self,
        remote_path: &str,
        body: Body,
        content_length: u64,
        modified: Option<i64>,
    ) -> Result<ResourceMeta, DavError> {
        let url = self.resource_url(remote_path)?;
        let mut request = self
            .request(Method::PUT, url)
            .header(header::CONTENT_LENGTH, content_length)
            .body(body);
        if let Some(modified) = modified {
            request = request.header("X-OC-Mtime", modified.to_string());
        }
        let response = Self::check(request.send().await?).await?;
        Ok(ResourceMeta::from_headers(response.headers()))
    }

    pub async fn get_range(&self, remote_path: &str, offset: u64) -> Result<Download, DavError> {
        let url = self.resource_url(remote_path)?;
        let mut request = self.request(Method::GET, url);
        if offset > 0 {
            request = request.header(header::RANGE, format!("bytes={offset}-"));
        }
        let response = Self::check(request.send().await?).await?;
        let resumed = offset > 0 && response.status() == StatusCode::PARTIAL_CONTENT;
        Ok(Download {
            meta: ResourceMeta::from_headers(response.headers()),
            resumed,
            response,
        })
    }

    pub async fn mkcol(&self, remote_path: &str) -> Result<MkcolOutcome, DavError> {
        let url = self.resource_url(remote_path)?;
        let response = self
            .request(dav_method("MKCOL")?, url)
            .send()
            .await?;
        // RFC 4918: MKCOL on an existing collection answers 405.
        if response.status() == StatusCode::METHOD_NOT_ALLOWED {
            return Ok(MkcolOutcome::AlreadyExists);
        }
        Self::check(response).await?;
        Ok(MkcolOutcome::Created)
    }

    pub async fn delete(&self, remote_path: &str) -> Result<(), DavError> {
        let url = self.resource_url(remote_path)?;
        let response = self.request(Method::DELETE, url).send().await?;
        Self::check(response).await?;
        Ok(())
    }

    pub async fn move_to(&self, from: &str, to: &str, overwrite: bool) -> Result<(), DavError> {
        let source = self.resource_url(from)?;
        let destination = self.resource_url(to)?;
        let response = self
            .request(dav_method("MOVE")?, source)
            .header("Destination", destination.as_str())
            .header("Overwrite", if overwrite { "T" } else { "F" })
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let request = self.http.request(method, url);
        match &self.credentials {
            Credentials::None => request,
            Credentials::Bearer(token) => request.bearer_auth(token),
            Credentials::Basic { user, password } => request.basic_auth(user, Some(password)),
        }
    }

    async fn check(response: Response) -> Result<Response, DavError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(DavError::Api { status, body })
        }
    }
}

impl DavError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            DavError::Api { status, .. } => Some(classify_api_status(*status)),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            Some(
                ApiErrorClass::RateLimit
                    | ApiErrorClass::Transient
                    | ApiErrorClass::QuotaExceeded
            )
        )
    }

    /// The session to the server is gone: nothing else will succeed either.
    pub fn is_connection_failure(&self) -> bool {
        match self {
            DavError::Request(err) => err.is_connect() || err.is_timeout(),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.classification() == Some(ApiErrorClass::NotFound)
    }

    /// The requested resume offset lies at or past the end of the resource.
    pub fn is_range_not_satisfiable(&self) -> bool {
        matches!(
            self,
            DavError::Api { status, .. } if *status == StatusCode::RANGE_NOT_SATISFIABLE
        )
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if status == StatusCode::UNAUTHORIZED {
        ApiErrorClass::Auth
    } else if status == StatusCode::FORBIDDEN {
        ApiErrorClass::Forbidden
    } else if matches!(status, StatusCode::NOT_FOUND | StatusCode::GONE) {
        ApiErrorClass::NotFound
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status == StatusCode::INSUFFICIENT_STORAGE {
        ApiErrorClass::QuotaExceeded
    } else if status.is_server_error()
        || matches!(
            status,
            StatusCode::REQUEST_TIMEOUT | StatusCode::CONFLICT | StatusCode::TOO_EARLY
        )
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

fn dav_method(name: &'static str) -> Result<Method, DavError> {
    Method::from_bytes(name.as_bytes()).map_err(|_| DavError::InvalidMethod(name))
}

impl ResourceMeta {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let etag = headers
            .get("OC-ETag")
            .or_else(|| headers.get(header::ETAG))
            .and_then(|value| value.to_str().ok())
            .map(normalize_etag)
            .filter(|etag| !etag.is_empty());
        let content_length = headers
            .get(header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok());
        let modified = headers
            .get(header::LAST_MODIFIED)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| httpdate::parse_http_date(value).ok())
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
            .map(|duration| duration.as_secs() as i64);
        Self {
            etag,
            content_length,
            modified,
        }
    }
}

fn normalize_etag(raw: &str) -> String {
    raw.trim()
        .trim_start_matches("W/")
        .trim_matches('"')
        .trim_end_matches("-gzip")
        .to_string()
}
