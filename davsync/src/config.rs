use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use davsync_core::Credentials;

use crate::paths::{is_same_or_below, with_trailing_slash};

const DEFAULT_SYNC_DIR_NAME: &str = "DavSync";
const DEFAULT_REMOTE_ROOT: &str = "/remote.php/webdav/";
const DEFAULT_MAX_PARALLEL: u64 = 3;
const DEFAULT_PROGRESS_INTERVAL_MS: u64 = 100;
const SHARED_FOLDER: &str = "Shared";

/// Settings one propagation run works with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PropagatorConfig {
    pub local_root: PathBuf,
    /// Server path of the sync root, always ending with '/'.
    pub remote_root: String,
    /// Folder on the server this sync connection is mapped to.
    pub remote_folder: String,
    pub max_parallel: usize,
    /// Bytes per second, 0 for no limit.
    pub upload_limit: u64,
    pub download_limit: u64,
    pub progress_interval: Duration,
}

impl PropagatorConfig {
    pub fn new(local_root: impl Into<PathBuf>, remote_root: &str) -> Self {
        Self {
            local_root: local_root.into(),
            remote_root: with_trailing_slash(remote_root),
            remote_folder: String::new(),
            max_parallel: DEFAULT_MAX_PARALLEL as usize,
            upload_limit: 0,
            download_limit: 0,
            progress_interval: Duration::from_millis(DEFAULT_PROGRESS_INTERVAL_MS),
        }
    }

    pub fn with_remote_folder(mut self, folder: impl Into<String>) -> Self {
        self.remote_folder = folder.into();
        self
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    pub fn with_upload_limit(mut self, bytes_per_sec: u64) -> Self {
        self.upload_limit = bytes_per_sec;
        self
    }

    pub fn with_download_limit(mut self, bytes_per_sec: u64) -> Self {
        self.download_limit = bytes_per_sec;
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    /// Items in a folder shared with us may be read-only on the server.
    pub fn is_in_shared_directory(&self, path: &str) -> bool {
        is_same_or_below(self.remote_folder.trim_matches('/'), SHARED_FOLDER)
            || is_same_or_below(path, SHARED_FOLDER)
    }
}

/// Everything the command line tool needs, read from the environment.
#[derive(Clone, Debug)]
pub struct RunConfig {
    pub server_url: String,
    pub credentials: Credentials,
    pub journal_path: Option<PathBuf>,
    pub propagator: PropagatorConfig,
}

impl RunConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        Self::from_vars(|name| std::env::var(name).ok(), &home)
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>, home: &Path) -> anyhow::Result<Self> {
        let server_url = var("DAVSYNC_SERVER_URL").context("DAVSYNC_SERVER_URL is not set")?;
        let credentials = match (
            var("DAVSYNC_TOKEN"),
            var("DAVSYNC_USER"),
            var("DAVSYNC_PASSWORD"),
        ) {
            (Some(token), _, _) => Credentials::Bearer(token),
            (None, Some(user), Some(password)) => Credentials::Basic { user, password },
            (None, Some(_), None) => anyhow::bail!("DAVSYNC_USER is set without DAVSYNC_PASSWORD"),
            _ => Credentials::None,
        };

        let local_root = var("DAVSYNC_LOCAL_DIR")
            .map(|value| expand_with_home(&value, home))
            .unwrap_or_else(|| home.join(DEFAULT_SYNC_DIR_NAME));
        let remote_root =
            var("DAVSYNC_REMOTE_ROOT").unwrap_or_else(|| DEFAULT_REMOTE_ROOT.to_string());
        let journal_path = var("DAVSYNC_JOURNAL").map(|value| expand_with_home(&value, home));

        let propagator = PropagatorConfig::new(local_root, &remote_root)
            .with_remote_folder(var("DAVSYNC_REMOTE_FOLDER").unwrap_or_default())
            .with_max_parallel(read_u64(&var, "DAVSYNC_MAX_PARALLEL", DEFAULT_MAX_PARALLEL) as usize)
            .with_upload_limit(read_u64(&var, "DAVSYNC_UPLOAD_LIMIT", 0))
            .with_download_limit(read_u64(&var, "DAVSYNC_DOWNLOAD_LIMIT", 0))
            .with_progress_interval(Duration::from_millis(read_u64(
                &var,
                "DAVSYNC_PROGRESS_INTERVAL_MS",
                DEFAULT_PROGRESS_INTERVAL_MS,
            )));

        Ok(Self {
            server_url,
            credentials,
            journal_path,
            propagator,
        })
    }
}

fn read_u64(var: &impl Fn(&str) -> Option<String>, name: &str, default: u64) -> u64 {
    var(name)
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}
