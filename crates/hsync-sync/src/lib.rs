//! Sync orchestration: single-flight runs over (date x data type), per-attempt audit, cron trigger.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use hsync_core::{
    AttemptStatus, DataType, RunStatus, SyncAttempt, TriggerKind, UpsertOutcome,
};
use hsync_ingest::{
    AuditRecorder, HttpClientConfig, IngestionClient, IngestionSink, RetryDisposition, SinkError,
};
use hsync_source::{DataSource, FixtureDataSource, ProviderCredentials, SourceError};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "hsync-sync";

pub const DEFAULT_USER_ID: &str = "00000000-0000-0000-0000-000000000001";
pub const SERVICE_NAME: &str = "garmin-scheduler";

#[derive(Debug)]
pub struct SyncConfig {
    pub garmin_email: String,
    pub garmin_password: SecretString,
    pub default_user_id: String,
    pub ingestion_service_url: String,
    pub ingest_secret: Option<SecretString>,
    pub sync_cron_hour: String,
    pub sync_cron_minute: String,
    pub timezone: Tz,
    pub scheduler_enabled: bool,
    pub http_timeout_secs: u64,
    pub shutdown_grace_secs: u64,
    pub fixtures_dir: PathBuf,
    pub web_port: u16,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let required = |key: &str| var(key).with_context(|| format!("{key} must be set"));

        let sync_cron_hour = var("SYNC_CRON_HOUR").map_or_else(|| "*".to_string(), |v| v.trim().to_string());
        let sync_cron_minute = var("SYNC_CRON_MINUTE").map_or_else(|| "0".to_string(), |v| v.trim().to_string());
        validate_cron_field("SYNC_CRON_HOUR", &sync_cron_hour, 23)?;
        validate_cron_field("SYNC_CRON_MINUTE", &sync_cron_minute, 59)?;

        let timezone = match var("SYNC_TIMEZONE") {
            Some(name) => name
                .parse::<Tz>()
                .map_err(|e| anyhow::anyhow!("invalid SYNC_TIMEZONE {name:?}: {e}"))?,
            None => Tz::UTC,
        };

        Ok(Self {
            garmin_email: required("GARMIN_EMAIL")?,
            garmin_password: SecretString::new(required("GARMIN_PASSWORD")?.into_boxed_str()),
            default_user_id: var("DEFAULT_USER_ID").unwrap_or_else(|| DEFAULT_USER_ID.to_string()),
            ingestion_service_url: var("INGESTION_SERVICE_URL")
                .unwrap_or_else(|| "http://ingestion-service:8083".to_string()),
            ingest_secret: var("INGEST_SECRET").map(|v| SecretString::new(v.into_boxed_str())),
            sync_cron_hour,
            sync_cron_minute,
            timezone,
            scheduler_enabled: var("SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(true),
            http_timeout_secs: parse_or(var("HTTP_TIMEOUT_SECS"), "HTTP_TIMEOUT_SECS", 30)?,
            shutdown_grace_secs: parse_or(var("SHUTDOWN_GRACE_SECS"), "SHUTDOWN_GRACE_SECS", 30)?,
            fixtures_dir: var("FIXTURES_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./fixtures")),
            web_port: parse_or(var("SCHEDULER_PORT"), "SCHEDULER_PORT", 8000)?,
        })
    }

    /// Six-field cron expression (seconds first) firing at the configured hour/minute.
    pub fn cron_expression(&self) -> String {
        format!("0 {} {} * * *", self.sync_cron_minute, self.sync_cron_hour)
    }

    pub fn schedule_label(&self) -> String {
        format!("{}:{}", self.sync_cron_hour, self.sync_cron_minute)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn credentials(&self) -> ProviderCredentials {
        ProviderCredentials::new(
            self.garmin_email.clone(),
            self.garmin_password.expose_secret(),
        )
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            ingest_secret: self
                .ingest_secret
                .as_ref()
                .map(|secret| SecretString::new(secret.expose_secret().into())),
            ..Default::default()
        }
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            user_id: self.default_user_id.clone(),
            timezone: self.timezone,
        }
    }
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match value {
        Some(v) => v
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {key} {v:?}: {e}")),
        None => Ok(default),
    }
}

/// A cron hour/minute field is either `*` or one explicit value in `0..=max`.
pub fn validate_cron_field(key: &str, value: &str, max: u32) -> Result<()> {
    let value = value.trim();
    if value == "*" {
        return Ok(());
    }
    match value.parse::<u32>() {
        Ok(v) if v <= max => Ok(()),
        _ => bail!("{key} must be '*' or an integer in 0..={max}, got {value:?}"),
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub user_id: String,
    /// Zone whose calendar decides what "today" means for a run.
    pub timezone: Tz,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            user_id: DEFAULT_USER_ID.to_string(),
            timezone: Tz::UTC,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PreconditionFailure {
    #[error("ingestion service is not healthy")]
    SinkUnhealthy,
    #[error("upstream authentication failed: {0}")]
    Authentication(String),
}

#[derive(Debug, Error)]
enum AttemptError {
    #[error(transparent)]
    Fetch(#[from] SourceError),
    #[error(transparent)]
    Upsert(#[from] SinkError),
    #[error("data source returned {returned} payload for a {requested} request")]
    PayloadMismatch {
        requested: DataType,
        returned: DataType,
    },
}

impl AttemptError {
    /// Reported only; a failed attempt waits for the next run.
    fn is_transient(&self) -> bool {
        match self {
            AttemptError::Fetch(err) => err.is_transient(),
            AttemptError::Upsert(err) => err.disposition() == RetryDisposition::Retryable,
            AttemptError::PayloadMismatch { .. } => false,
        }
    }
}

/// Transient record of one SyncRun, reported to callers and logs only.
#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub trigger: TriggerKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub target_dates: Vec<NaiveDate>,
    pub attempts: usize,
    pub failed_attempts: usize,
    pub records_fetched: u64,
    pub records_inserted: u64,
    pub records_updated: u64,
    pub status: RunStatus,
}

#[derive(Debug, Clone)]
pub enum RunOutcome {
    /// Another run held the gate; nothing was done.
    Skipped,
    Aborted(PreconditionFailure),
    Completed(SyncRunSummary),
}

impl RunOutcome {
    pub fn status(&self) -> Option<RunStatus> {
        match self {
            RunOutcome::Skipped => None,
            RunOutcome::Aborted(_) => Some(RunStatus::AbortedPreconditionFailed),
            RunOutcome::Completed(summary) => Some(summary.status),
        }
    }

    pub fn summary(&self) -> Option<&SyncRunSummary> {
        match self {
            RunOutcome::Completed(summary) => Some(summary),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct AttemptTally {
    records_fetched: u32,
    records_inserted: u32,
    records_updated: u32,
    earliest: Option<DateTime<Utc>>,
    latest: Option<DateTime<Utc>>,
}

impl AttemptTally {
    fn observe(&mut self, outcome: UpsertOutcome, observed_at: Option<DateTime<Utc>>) {
        match outcome {
            UpsertOutcome::Inserted => self.records_inserted += 1,
            UpsertOutcome::Updated => self.records_updated += 1,
        }
        if let Some(ts) = observed_at {
            self.earliest = Some(self.earliest.map_or(ts, |cur| cur.min(ts)));
            self.latest = Some(self.latest.map_or(ts, |cur| cur.max(ts)));
        }
    }
}

#[derive(Debug, Default)]
struct RunTally {
    attempts: usize,
    failed_attempts: usize,
    records_fetched: u64,
    records_inserted: u64,
    records_updated: u64,
}

impl RunTally {
    fn absorb(&mut self, attempt: &SyncAttempt) {
        self.attempts += 1;
        if attempt.is_failed() {
            self.failed_attempts += 1;
        }
        self.records_fetched += u64::from(attempt.records_fetched);
        self.records_inserted += u64::from(attempt.records_inserted);
        self.records_updated += u64::from(attempt.records_updated);
    }
}

pub struct SyncOrchestrator {
    source: Arc<dyn DataSource>,
    sink: Arc<dyn IngestionSink>,
    recorder: Arc<dyn AuditRecorder>,
    settings: OrchestratorSettings,
    clock: Arc<dyn Clock>,
    gate: Mutex<()>,
    closed: AtomicBool,
}

impl SyncOrchestrator {
    pub fn new(
        source: Arc<dyn DataSource>,
        sink: Arc<dyn IngestionSink>,
        recorder: Arc<dyn AuditRecorder>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            source,
            sink,
            recorder,
            settings,
            clock: Arc::new(SystemClock),
            gate: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn user_id(&self) -> &str {
        &self.settings.user_id
    }

    pub fn is_running(&self) -> bool {
        self.gate.try_lock().is_err()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop accepting manual triggers. An in-flight run is left to finish.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Resolves once no run holds the gate.
    pub async fn wait_idle(&self) {
        let _guard = self.gate.lock().await;
    }

    /// `[yesterday, today]` on the configured zone's calendar.
    pub fn target_dates(&self, now: DateTime<Utc>) -> [NaiveDate; 2] {
        let today = now.with_timezone(&self.settings.timezone).date_naive();
        let yesterday = today.pred_opt().unwrap_or(today);
        [yesterday, today]
    }

    pub async fn trigger_manual(&self) -> Result<RunOutcome> {
        if self.is_closed() {
            bail!("sync scheduler is shutting down; manual trigger rejected");
        }
        info!("manual sync triggered");
        Ok(self.run_sync(TriggerKind::Manual).await)
    }

    pub async fn run_sync(&self, trigger: TriggerKind) -> RunOutcome {
        let Ok(_guard) = self.gate.try_lock() else {
            warn!(%trigger, "sync already in progress, skipping this run");
            return RunOutcome::Skipped;
        };
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, %trigger);
        self.run_gated(run_id, trigger).instrument(span).await
    }

    async fn run_gated(&self, run_id: Uuid, trigger: TriggerKind) -> RunOutcome {
        let started_at = self.clock.now();
        info!("starting data sync");

        if !self.sink.check_health().await {
            error!("ingestion service is not healthy, aborting sync");
            return RunOutcome::Aborted(PreconditionFailure::SinkUnhealthy);
        }

        if let Err(err) = self.source.connect().await {
            error!(provider = self.source.provider_id(), error = %err, "upstream authentication failed, aborting sync");
            return RunOutcome::Aborted(PreconditionFailure::Authentication(err.to_string()));
        }

        let target_dates = self.target_dates(started_at);
        let mut tally = RunTally::default();
        for date in target_dates {
            info!(%date, "syncing data for date");
            for data_type in DataType::ALL {
                let attempt = self.sync_one(data_type, date).await;
                tally.absorb(&attempt);
            }
        }

        let status = if tally.failed_attempts == 0 {
            RunStatus::Completed
        } else {
            RunStatus::CompletedWithErrors
        };
        let summary = SyncRunSummary {
            run_id,
            trigger,
            started_at,
            finished_at: self.clock.now(),
            target_dates: target_dates.to_vec(),
            attempts: tally.attempts,
            failed_attempts: tally.failed_attempts,
            records_fetched: tally.records_fetched,
            records_inserted: tally.records_inserted,
            records_updated: tally.records_updated,
            status,
        };
        if status == RunStatus::Completed {
            info!(attempts = summary.attempts, fetched = summary.records_fetched, "data sync completed");
        } else {
            warn!(
                attempts = summary.attempts,
                failed = summary.failed_attempts,
                "data sync completed with errors"
            );
        }
        RunOutcome::Completed(summary)
    }

    /// Syncs one (data type, date) pair and hands the resulting audit record to the recorder.
    ///
    /// Never fails: fetch and upsert errors are folded into the returned attempt, keeping any
    /// counts accumulated before the error.
    pub async fn sync_one(&self, data_type: DataType, date: NaiveDate) -> SyncAttempt {
        let span = info_span!("sync_attempt", %data_type, %date);
        async {
            let sync_started_at = self.clock.now();
            let mut tally = AttemptTally::default();
            let result = self.fetch_and_upsert(data_type, date, &mut tally).await;
            let sync_completed_at = self.clock.now();

            let (status, error_message) = match result {
                Ok(()) => {
                    if tally.records_fetched > 0 {
                        info!(
                            fetched = tally.records_fetched,
                            inserted = tally.records_inserted,
                            updated = tally.records_updated,
                            "{data_type} sync finished"
                        );
                    }
                    (AttemptStatus::Success, None)
                }
                Err(err) => {
                    error!(error = %err, transient = err.is_transient(), "error syncing {data_type} data");
                    (AttemptStatus::Failed, Some(err.to_string()))
                }
            };

            let attempt = SyncAttempt {
                user_id: self.settings.user_id.clone(),
                data_type,
                target_date: date,
                sync_started_at,
                sync_completed_at,
                sync_duration_seconds: (sync_completed_at - sync_started_at).num_seconds().max(0),
                records_fetched: tally.records_fetched,
                records_inserted: tally.records_inserted,
                records_updated: tally.records_updated,
                earliest_timestamp: tally.earliest,
                latest_timestamp: tally.latest,
                status,
                error_message,
            };

            if let Err(err) = self.recorder.record(&attempt).await {
                warn!(error = %err, "failed to record sync audit");
            }
            attempt
        }
        .instrument(span)
        .await
    }

    async fn fetch_and_upsert(
        &self,
        data_type: DataType,
        date: NaiveDate,
        tally: &mut AttemptTally,
    ) -> Result<(), AttemptError> {
        let Some(payload) = self.source.fetch(data_type, date).await? else {
            return Ok(());
        };
        if payload.data_type() != data_type {
            return Err(AttemptError::PayloadMismatch {
                requested: data_type,
                returned: payload.data_type(),
            });
        }

        let records = payload.into_records();
        tally.records_fetched = u32::try_from(records.len()).unwrap_or(u32::MAX);
        for record in &records {
            let outcome = self
                .sink
                .upsert(&self.settings.user_id, date, record)
                .await?;
            tally.observe(outcome, record.observed_at());
        }
        Ok(())
    }
}

/// Waits up to `grace` for an in-flight run; returns whether the orchestrator went idle.
pub async fn drain(orchestrator: &SyncOrchestrator, grace: Duration) -> bool {
    match tokio::time::timeout(grace, orchestrator.wait_idle()).await {
        Ok(()) => true,
        Err(_) => {
            warn!(grace_secs = grace.as_secs(), "in-flight sync did not finish before shutdown grace period");
            false
        }
    }
}

pub struct SyncScheduler {
    scheduler: JobScheduler,
    orchestrator: Arc<SyncOrchestrator>,
    grace: Duration,
}

impl SyncScheduler {
    pub async fn start(
        orchestrator: Arc<SyncOrchestrator>,
        cron: &str,
        grace: Duration,
    ) -> Result<Self> {
        let scheduler = JobScheduler::new().await.context("creating scheduler")?;
        let job_orchestrator = orchestrator.clone();
        let job = Job::new_async(cron, move |_uuid, _l| {
            let orchestrator = job_orchestrator.clone();
            Box::pin(async move {
                if orchestrator.is_closed() {
                    return;
                }
                orchestrator.run_sync(TriggerKind::Scheduled).await;
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        scheduler.add(job).await.context("adding scheduler job")?;
        scheduler.start().await.context("starting scheduler")?;
        info!(cron, "scheduler started");

        Ok(Self {
            scheduler,
            orchestrator,
            grace,
        })
    }

    pub fn orchestrator(&self) -> &Arc<SyncOrchestrator> {
        &self.orchestrator
    }

    /// Stops new triggers, then lets an in-flight run drain for at most the grace period.
    pub async fn shutdown(mut self) -> Result<bool> {
        info!("stopping scheduler");
        self.orchestrator.close();
        self.scheduler.shutdown().await.context("stopping scheduler")?;
        let drained = drain(&self.orchestrator, self.grace).await;
        info!(drained, "scheduler stopped");
        Ok(drained)
    }
}

/// Wires the fixture-backed provider and the HTTP ingestion client into one orchestrator.
pub fn build_orchestrator(config: &SyncConfig) -> Result<Arc<SyncOrchestrator>> {
    let source = Arc::new(FixtureDataSource::new(
        config.fixtures_dir.clone(),
        config.credentials(),
    ));
    let client = Arc::new(
        IngestionClient::new(config.ingestion_service_url.clone(), config.http_client_config())
            .context("building ingestion client")?,
    );
    Ok(Arc::new(SyncOrchestrator::new(
        source,
        client.clone(),
        client,
        config.orchestrator_settings(),
    )))
}

pub async fn run_sync_once_from_env() -> Result<RunOutcome> {
    let config = SyncConfig::from_env()?;
    let orchestrator = build_orchestrator(&config)?;
    orchestrator.trigger_manual().await
}
