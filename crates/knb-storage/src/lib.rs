//! SQLite notice storage + HTTP fetch utilities for KNB.

use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use knb_core::{Notice, DEFAULT_RECENT_LIMIT, DEFAULT_USER_AGENT};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::{Row, Sqlite, Transaction};
use thiserror::Error;
use tracing::{debug, info, info_span, Instrument};

pub const CRATE_NAME: &str = "knb-storage";

pub const NOTICES_TABLE: &str = "kangnam_notices";

const CREATE_NOTICES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS kangnam_notices (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    title TEXT NOT NULL UNIQUE,
    link TEXT NOT NULL,
    created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
)
"#;

const CREATE_NOTICES_TITLE_INDEX: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS ix_kangnam_notices_title
    ON kangnam_notices (title)
"#;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("limit must be a positive integer")]
    InvalidLimit,
}

/// Result of staging one notice inside a unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(Notice),
    /// The title is already present, either committed or staged earlier in this unit of work.
    Conflict,
}

/// File-backed notice store. Cloning shares the underlying pool.
#[derive(Debug, Clone)]
pub struct NoticeStore {
    pool: SqlitePool,
}

impl NoticeStore {
    /// Open (creating if missing) the SQLite database at `database_url`.
    ///
    /// WAL journaling keeps readers on their own snapshot, so the read API never
    /// observes rows staged by an in-progress ingest run.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(10));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await?;

        info!(database_url, "connected notice store");
        Ok(Self { pool })
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(CREATE_NOTICES_TABLE)
            .execute(&self.pool)
            .await?;
        sqlx::query(CREATE_NOTICES_TITLE_INDEX)
            .execute(&self.pool)
            .await?;
        debug!(table = NOTICES_TABLE, "notice schema ensured");
        Ok(())
    }

    /// Open a unit of work. Dropping it without `commit` rolls everything back.
    ///
    /// The write lock is taken up front, so the title pre-check and the insert that
    /// follows it see the same database state. Other writers wait on the busy timeout.
    pub async fn begin(&self) -> Result<UnitOfWork, StoreError> {
        let tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;
        Ok(UnitOfWork { tx })
    }

    /// Up to `limit` committed notices, newest (highest id) first.
    pub async fn most_recent(&self, limit: u32) -> Result<Vec<Notice>, StoreError> {
        if limit == 0 {
            return Err(StoreError::InvalidLimit);
        }
        let rows = sqlx::query(
            r#"
            SELECT id, title, link, created_at
              FROM kangnam_notices
             ORDER BY id DESC
             LIMIT ?1
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(notice_from_row).collect()
    }

    pub async fn count(&self) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM kangnam_notices")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// One transaction spanning a whole ingest run.
pub struct UnitOfWork {
    tx: Transaction<'static, Sqlite>,
}

impl UnitOfWork {
    /// Sees rows staged earlier in this same unit of work.
    pub async fn exists_by_title(&mut self, title: &str) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 FROM kangnam_notices WHERE title = ?1 LIMIT 1")
            .bind(title)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(row.is_some())
    }

    /// Stage a new notice. A unique-title violation aborts only this statement;
    /// notices staged before it stay in the transaction.
    pub async fn insert(&mut self, title: &str, link: &str) -> Result<InsertOutcome, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO kangnam_notices (title, link, created_at)
            VALUES (?1, ?2, ?3)
            RETURNING id, title, link, created_at
            "#,
        )
        .bind(title)
        .bind(link)
        .bind(Utc::now())
        .fetch_one(&mut *self.tx)
        .await;

        match result {
            Ok(row) => Ok(InsertOutcome::Inserted(notice_from_row(&row)?)),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Ok(InsertOutcome::Conflict)
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    pub async fn rollback(self) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

fn notice_from_row(row: &SqliteRow) -> Result<Notice, StoreError> {
    let created_at: DateTime<Utc> = row.try_get("created_at")?;
    Ok(Notice {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        link: row.try_get("link")?,
        created_at,
    })
}

/// Read-only view used by the HTTP layer.
#[derive(Debug, Clone)]
pub struct NoticeQuery {
    store: NoticeStore,
    limit: u32,
}

impl NoticeQuery {
    pub fn new(store: NoticeStore) -> Self {
        Self {
            store,
            limit: DEFAULT_RECENT_LIMIT,
        }
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub async fn list_recent(&self) -> Result<Vec<Notice>, StoreError> {
        self.store.most_recent(self.limit).await
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: Some(DEFAULT_USER_AGENT.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Single-shot GET client. Retrying is left to the next scheduled run.
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

    pub async fn fetch_text(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
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

            let body = resp.text().await?;
            debug!(%status, bytes = body.len(), "fetched page");
            Ok(FetchedResponse {
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}
