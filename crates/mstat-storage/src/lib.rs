//! Append-only SQLite snapshot store + HTTP fetch utilities for mstat.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use mstat_core::{Clock, InstanceRecord, InstanceSnapshot, SystemClock};
use reqwest::StatusCode;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "mstat-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("creating database directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("opening snapshot database {path}: {source}")]
    Open { path: PathBuf, source: sqlx::Error },
    #[error("initializing snapshot schema: {0}")]
    Schema(#[source] sqlx::Error),
    #[error("writing snapshot batch: {0}")]
    Write(#[source] sqlx::Error),
    #[error("reading snapshots: {0}")]
    Read(#[source] sqlx::Error),
}

const CREATE_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS instance_snapshots (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        instance    TEXT    NOT NULL,
        score       INTEGER NOT NULL DEFAULT 0,
        users       INTEGER NOT NULL DEFAULT 0,
        statuses    INTEGER NOT NULL DEFAULT 0,
        connections INTEGER NOT NULL DEFAULT 0,
        uptime      TEXT    NOT NULL DEFAULT '',
        created_at  INTEGER NOT NULL
    )
"#;

const CREATE_INSTANCE_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_instance_snapshots_instance ON instance_snapshots(instance)";

const CREATE_CREATED_AT_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_instance_snapshots_created_at ON instance_snapshots(created_at)";

const SELECT_COLUMNS: &str =
    "SELECT id, instance, score, users, statuses, connections, uptime, created_at FROM instance_snapshots";

/// Handle to the snapshot log. Cloning shares the underlying pool and write lock.
#[derive(Clone)]
pub struct SnapshotStore {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    write_lock: Arc<Mutex<()>>,
}

impl std::fmt::Debug for SnapshotStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotStore").finish_non_exhaustive()
    }
}

impl SnapshotStore {
    /// Open (creating if needed) the database file and make sure the schema exists.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| StorageError::CreateDir {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|source| StorageError::Open {
                path: path.to_path_buf(),
                source,
            })?;

        let store = Self::from_pool(pool);
        store.initialize().await?;
        info!(path = %path.display(), "snapshot store opened");
        Ok(store)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            clock: Arc::new(SystemClock),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Idempotent: safe to call on every start.
    pub async fn initialize(&self) -> Result<(), StorageError> {
        for statement in [CREATE_TABLE, CREATE_INSTANCE_INDEX, CREATE_CREATED_AT_INDEX] {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(StorageError::Schema)?;
        }
        Ok(())
    }

    /// Append one batch. Every row in the batch shares a single `created_at`
    /// captured from the store's clock.
    pub async fn append(&self, records: &[InstanceRecord]) -> Result<(), StorageError> {
        if records.is_empty() {
            return Ok(());
        }

        let _writer = self.write_lock.lock().await;
        let created_at = self.clock.now_millis();

        let mut tx = self.pool.begin().await.map_err(StorageError::Write)?;
        for record in records {
            sqlx::query(
                r#"
                INSERT INTO instance_snapshots
                    (instance, score, users, statuses, connections, uptime, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&record.instance)
            .bind(record.score)
            .bind(record.users)
            .bind(record.statuses)
            .bind(record.connections)
            .bind(&record.uptime)
            .bind(created_at)
            .execute(&mut *tx)
            .await
            .map_err(StorageError::Write)?;
        }
        tx.commit().await.map_err(StorageError::Write)?;

        debug!(rows = records.len(), created_at, "appended snapshot batch");
        Ok(())
    }

    /// Rows with `created_at > since` (epoch millis).
    pub async fn query_window(&self, since: i64) -> Result<Vec<InstanceSnapshot>, StorageError> {
        let sql = format!("{SELECT_COLUMNS} WHERE created_at > ? ORDER BY id");
        let rows = sqlx::query(&sql)
            .bind(since)
            .fetch_all(&self.pool)
            .await
            .map_err(StorageError::Read)?;
        rows.iter().map(row_to_snapshot).collect()
    }

    pub async fn query_all(&self) -> Result<Vec<InstanceSnapshot>, StorageError> {
        let sql = format!("{SELECT_COLUMNS} ORDER BY id");
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(StorageError::Read)?;
        rows.iter().map(row_to_snapshot).collect()
    }

    pub async fn count(&self) -> Result<i64, StorageError> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM instance_snapshots")
            .fetch_one(&self.pool)
            .await
            .map_err(StorageError::Read)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn row_to_snapshot(row: &SqliteRow) -> Result<InstanceSnapshot, StorageError> {
    Ok(InstanceSnapshot {
        id: row.try_get("id").map_err(StorageError::Read)?,
        instance: row.try_get("instance").map_err(StorageError::Read)?,
        score: row.try_get("score").map_err(StorageError::Read)?,
        users: row.try_get("users").map_err(StorageError::Read)?,
        statuses: row.try_get("statuses").map_err(StorageError::Read)?,
        connections: row.try_get("connections").map_err(StorageError::Read)?,
        uptime: row.try_get("uptime").map_err(StorageError::Read)?,
        created_at: row.try_get("created_at").map_err(StorageError::Read)?,
    })
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Thin reqwest wrapper. Every request is bounded by the configured timeout;
/// there is no retry, the next scheduled run is the retry.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn fetch_bytes(&self, run_id: Uuid, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, url);
        async {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }
            let body = resp.bytes().await?.to_vec();
            debug!(bytes = body.len(), "fetched");
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }

    pub async fn post_json<T: serde::Serialize + ?Sized>(&self, url: &str, body: &T) -> Result<(), FetchError> {
        let resp = self.client.post(url).json(body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }
        Ok(())
    }
}
