//! Ingest pipeline orchestration and single-flight scheduling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use knb_adapters::{BoardAdapter, KangnamBoardAdapter};
use knb_core::{
    CandidateEntry, Notice, DEFAULT_BASE_ORIGIN, DEFAULT_BOARD_URL, DEFAULT_RECENT_LIMIT,
    DEFAULT_USER_AGENT,
};
use knb_storage::{HttpClientConfig, HttpFetcher, InsertOutcome, NoticeStore, StoreError, UnitOfWork};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "knb-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub board_url: String,
    pub base_origin: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub sync_interval_mins: u64,
    pub recent_limit: u32,
    pub web_port: u16,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            database_url: lookup("DATABASE_URL")
                .unwrap_or_else(|| "sqlite://notices.db".to_string()),
            board_url: lookup("KNB_BOARD_URL").unwrap_or_else(|| DEFAULT_BOARD_URL.to_string()),
            base_origin: lookup("KNB_BASE_ORIGIN")
                .unwrap_or_else(|| DEFAULT_BASE_ORIGIN.to_string()),
            user_agent: lookup("KNB_USER_AGENT").unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            http_timeout_secs: lookup("KNB_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(10u64)
                .max(1),
            sync_interval_mins: lookup("KNB_SYNC_INTERVAL_MINS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(60u64)
                .max(1),
            recent_limit: lookup("KNB_RECENT_LIMIT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_RECENT_LIMIT)
                .max(1),
            web_port: lookup("KNB_WEB_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
        }
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_mins.saturating_mul(60))
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Committed,
    FetchFailed { reason: String },
    StoreFailed { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestSummary {
    pub run_id: Uuid,
    pub board_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub candidates: usize,
    pub new_notices: usize,
    pub skipped: usize,
    pub failed: usize,
    pub outcome: RunOutcome,
}

impl IngestSummary {
    pub fn is_committed(&self) -> bool {
        self.outcome == RunOutcome::Committed
    }
}

/// What happened to a single candidate inside the run's unit of work.
#[derive(Debug)]
pub enum CandidateOutcome {
    Inserted(Notice),
    AlreadyKnown,
    Conflict,
    Failed(StoreError),
}

#[derive(Debug, Default)]
struct Tally {
    candidates: usize,
    new_notices: usize,
    skipped: usize,
    failed: usize,
}

/// Fetch -> extract -> check-then-insert, all candidates in one unit of work.
pub struct IngestPipeline {
    adapter: Box<dyn BoardAdapter>,
    store: NoticeStore,
}

impl IngestPipeline {
    pub fn new(adapter: Box<dyn BoardAdapter>, store: NoticeStore) -> Self {
        Self { adapter, store }
    }

    /// Never returns an error: every failure is folded into the summary's outcome.
    pub async fn run(&self) -> IngestSummary {
        let run_id = Uuid::new_v4();
        let span = info_span!("ingest_run", %run_id, board_id = self.adapter.board_id());
        self.run_inner(run_id).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid) -> IngestSummary {
        let started_at = Utc::now();
        let mut tally = Tally::default();
        info!("ingest run started");

        let outcome = match self.adapter.fetch_listing().await {
            Err(err) => {
                error!(error = %err, "board fetch failed; store left untouched");
                RunOutcome::FetchFailed {
                    reason: err.to_string(),
                }
            }
            Ok(page) => {
                let candidates = self.adapter.parse_listing(&page);
                tally.candidates = candidates.len();
                if candidates.is_empty() {
                    info!(url = %page.url, "board yielded no candidates");
                    RunOutcome::Committed
                } else {
                    self.ingest(&candidates, &mut tally).await
                }
            }
        };

        let summary = IngestSummary {
            run_id,
            board_id: self.adapter.board_id().to_string(),
            started_at,
            finished_at: Utc::now(),
            candidates: tally.candidates,
            new_notices: tally.new_notices,
            skipped: tally.skipped,
            failed: tally.failed,
            outcome,
        };
        info!(
            candidates = summary.candidates,
            new_notices = summary.new_notices,
            skipped = summary.skipped,
            failed = summary.failed,
            committed = summary.is_committed(),
            "ingest run finished"
        );
        summary
    }

    async fn ingest(&self, candidates: &[CandidateEntry], tally: &mut Tally) -> RunOutcome {
        let mut uow = match self.store.begin().await {
            Ok(uow) => uow,
            Err(err) => {
                error!(error = %err, "could not open unit of work");
                return RunOutcome::StoreFailed {
                    reason: err.to_string(),
                };
            }
        };

        for candidate in candidates {
            match Self::ingest_candidate(&mut uow, candidate).await {
                CandidateOutcome::Inserted(notice) => {
                    tally.new_notices += 1;
                    debug!(id = notice.id, title = %notice.title, "staged new notice");
                }
                CandidateOutcome::AlreadyKnown => tally.skipped += 1,
                CandidateOutcome::Conflict => {
                    tally.skipped += 1;
                    warn!(title = %candidate.title, "duplicate title conflict; skipping candidate");
                }
                CandidateOutcome::Failed(err) => {
                    tally.failed += 1;
                    tally.new_notices = 0;
                    error!(title = %candidate.title, error = %err, "store error; rolling back run");
                    if let Err(rollback_err) = uow.rollback().await {
                        error!(error = %rollback_err, "rollback failed");
                    }
                    return RunOutcome::StoreFailed {
                        reason: err.to_string(),
                    };
                }
            }
        }

        match uow.commit().await {
            Ok(()) => RunOutcome::Committed,
            Err(err) => {
                tally.new_notices = 0;
                error!(error = %err, "commit failed; run rolled back");
                RunOutcome::StoreFailed {
                    reason: err.to_string(),
                }
            }
        }
    }

    pub async fn ingest_candidate(uow: &mut UnitOfWork, candidate: &CandidateEntry) -> CandidateOutcome {
        match uow.exists_by_title(&candidate.title).await {
            Ok(true) => return CandidateOutcome::AlreadyKnown,
            Ok(false) => {}
            Err(err) => return CandidateOutcome::Failed(err),
        }
        match uow.insert(&candidate.title, &candidate.link).await {
            Ok(InsertOutcome::Inserted(notice)) => CandidateOutcome::Inserted(notice),
            Ok(InsertOutcome::Conflict) => CandidateOutcome::Conflict,
            Err(err) => CandidateOutcome::Failed(err),
        }
    }
}

/// At most one holder at a time; the permit releases on drop.
#[derive(Debug, Default)]
pub struct SingleFlight {
    running: AtomicBool,
}

impl SingleFlight {
    pub fn try_acquire(&self) -> Option<RunPermit<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunPermit { flight: self })
    }
}

#[derive(Debug)]
pub struct RunPermit<'a> {
    flight: &'a SingleFlight,
}

impl Drop for RunPermit<'_> {
    fn drop(&mut self) {
        self.flight.running.store(false, Ordering::Release);
    }
}

#[derive(Debug)]
pub enum TickOutcome {
    Ran(IngestSummary),
    /// A previous run still held the single-flight permit.
    Skipped,
}

#[derive(Clone)]
pub struct IngestScheduler {
    pipeline: Arc<IngestPipeline>,
    flight: Arc<SingleFlight>,
    interval: Duration,
}

impl IngestScheduler {
    pub fn new(pipeline: Arc<IngestPipeline>, interval: Duration) -> Self {
        Self {
            pipeline,
            flight: Arc::new(SingleFlight::default()),
            interval,
        }
    }

    /// Run the pipeline unless a run is already in flight. Overlapping calls are
    /// dropped, not queued.
    pub async fn run_now(&self) -> TickOutcome {
        let Some(_permit) = self.flight.try_acquire() else {
            warn!("previous ingest run still in progress; skipping tick");
            return TickOutcome::Skipped;
        };
        TickOutcome::Ran(self.pipeline.run().await)
    }

    /// Register the repeating ingest job and start ticking. Keep the returned
    /// handle alive; call `shutdown` on it to stop further ticks.
    pub async fn start(&self) -> Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let this = self.clone();
        let job = Job::new_repeated_async(self.interval, move |_uuid, _l| {
            let this = this.clone();
            Box::pin(async move {
                debug!("scheduler tick");
                this.run_now().await;
            })
        })
        .context("creating ingest job")?;
        sched.add(job).await.context("adding ingest job")?;
        sched.start().await.context("starting scheduler")?;
        info!(interval_secs = self.interval.as_secs(), "ingest scheduler started");
        Ok(sched)
    }
}

pub fn pipeline_from_config(config: &SyncConfig, store: NoticeStore) -> Result<IngestPipeline> {
    let http = HttpFetcher::new(config.http_client_config())?;
    let adapter = KangnamBoardAdapter::new(http, config.board_url.clone(), &config.base_origin)
        .context("building kangnam board adapter")?;
    Ok(IngestPipeline::new(Box::new(adapter), store))
}

pub async fn open_store(config: &SyncConfig) -> Result<NoticeStore> {
    let store = NoticeStore::connect(&config.database_url)
        .await
        .with_context(|| format!("opening notice store {}", config.database_url))?;
    store.ensure_schema().await.context("ensuring notice schema")?;
    Ok(store)
}
