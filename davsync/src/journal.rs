use std::path::{Path, PathBuf};
use std::str::FromStr;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool, migrate::Migrator};
use thiserror::Error;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("XDG data directory is unavailable")]
    MissingDataDir,
}

/// Last state both sides agreed on for one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalRecord {
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
    pub modified: i64,
    pub etag: Option<String>,
}

/// A download that was interrupted and may be resumed from `tmpfile`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadInfo {
    pub tmpfile: String,
    pub etag: Option<String>,
}

/// Durable per-path sync state, read before and written after every leaf action.
#[async_trait]
pub trait Journal: Send + Sync {
    async fn get(&self, path: &str) -> Result<Option<JournalRecord>, JournalError>;
    async fn set(&self, record: &JournalRecord) -> Result<(), JournalError>;
    async fn remove(&self, path: &str) -> Result<(), JournalError>;
    /// Removes `path` and every record below it.
    async fn remove_tree(&self, path: &str) -> Result<(), JournalError>;
    /// Moves `from` and every record below it to `to`.
    async fn rename_tree(&self, from: &str, to: &str) -> Result<(), JournalError>;
    async fn download_info(&self, path: &str) -> Result<Option<DownloadInfo>, JournalError>;
    async fn set_download_info(&self, path: &str, info: &DownloadInfo)
    -> Result<(), JournalError>;
    async fn remove_download_info(&self, path: &str) -> Result<(), JournalError>;
}

pub struct SqliteJournal {
    pool: SqlitePool,
}

impl SqliteJournal {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn open(path: &Path) -> Result<Self, JournalError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePool::connect_with(options).await?;
        let journal = Self { pool };
        journal.init().await?;
        Ok(journal)
    }

    pub async fn open_default() -> Result<Self, JournalError> {
        Self::open(&default_journal_path()?).await
    }

    /// Single-connection in-memory journal; nothing survives the pool.
    pub async fn in_memory() -> Result<Self, JournalError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let journal = Self { pool };
        journal.init().await?;
        Ok(journal)
    }

    pub async fn init(&self) -> Result<(), JournalError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub async fn count_records(&self) -> Result<u64, JournalError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM files")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}

#[async_trait]
impl Journal for SqliteJournal {
    async fn get(&self, path: &str) -> Result<Option<JournalRecord>, JournalError> {
        let row = sqlx::query("SELECT path, is_dir, size, modified, etag FROM files WHERE path = ?1")
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let is_dir: i64 = row.try_get("is_dir")?;
        let size: i64 = row.try_get("size")?;
        Ok(Some(JournalRecord {
            path: row.try_get("path")?,
            is_dir: is_dir != 0,
            size: size.max(0) as u64,
            modified: row.try_get("modified")?,
            etag: row.try_get("etag")?,
        }))
    }

    async fn set(&self, record: &JournalRecord) -> Result<(), JournalError> {
        sqlx::query(
            "INSERT INTO files (path, is_dir, size, modified, etag)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(path) DO UPDATE SET
                is_dir = excluded.is_dir,
                size = excluded.size,
                modified = excluded.modified,
                etag = excluded.etag",
        )
        .bind(&record.path)
        .bind(if record.is_dir { 1 } else { 0 })
        .bind(record.size as i64)
        .bind(record.modified)
        .bind(&record.etag)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<(), JournalError> {
        sqlx::query("DELETE FROM files WHERE path = ?1")
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn remove_tree(&self, path: &str) -> Result<(), JournalError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM files WHERE path = ?1 OR path LIKE ?2 ESCAPE '\\'")
            .bind(path)
            .bind(descendant_pattern(path))
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM downloads WHERE path = ?1 OR path LIKE ?2 ESCAPE '\\'")
            .bind(path)
            .bind(descendant_pattern(path))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn rename_tree(&self, from: &str, to: &str) -> Result<(), JournalError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM files WHERE path = ?1 OR path LIKE ?2 ESCAPE '\\'")
            .bind(to)
            .bind(descendant_pattern(to))
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "UPDATE files SET path = ?2 || substr(path, length(?1) + 1)
             WHERE path = ?1 OR path LIKE ?3 ESCAPE '\\'",
        )
        .bind(from)
        .bind(to)
        .bind(descendant_pattern(from))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn download_info(&self, path: &str) -> Result<Option<DownloadInfo>, JournalError> {
        let row = sqlx::query("SELECT tmpfile, etag FROM downloads WHERE path = ?1")
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(DownloadInfo {
            tmpfile: row.try_get("tmpfile")?,
            etag: row.try_get("etag")?,
        }))
    }

    async fn set_download_info(
        &self,
        path: &str,
        info: &DownloadInfo,
    ) -> Result<(), JournalError> {
        sqlx::query(
            "INSERT INTO downloads (path, tmpfile, etag) VALUES (?1, ?2, ?3)
             ON CONFLICT(path) DO UPDATE SET tmpfile = excluded.tmpfile, etag = excluded.etag",
        )
        .bind(path)
        .bind(&info.tmpfile)
        .bind(&info.etag)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_download_info(&self, path: &str) -> Result<(), JournalError> {
        sqlx::query("DELETE FROM downloads WHERE path = ?1")
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn default_journal_path() -> Result<PathBuf, JournalError> {
    let base = dirs::data_dir().ok_or(JournalError::MissingDataDir)?;
    Ok(base.join("davsync").join("journal.db"))
}

fn descendant_pattern(path: &str) -> String {
    let mut escaped = String::with_capacity(path.len() + 2);
    for ch in path.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped.push_str("/%");
    escaped
}
