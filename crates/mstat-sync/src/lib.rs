//! Ingestion pipeline orchestration and scheduling.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, FixedOffset, Offset, Utc};
use mstat_adapters::{fetch_instances, source_client_for, AdapterContext, SourceClient, SourceError, SourceFormat};
use mstat_core::{Clock, InstanceRecord, SystemClock, MIN_USERS_EXCLUSIVE};
use mstat_storage::{HttpClientConfig, HttpFetcher, SnapshotStore, StorageError};
use serde::Serialize;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "mstat-sync";

pub const DEFAULT_SYNC_CRON: &str = "0 0 0,6,12,18 * * *";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_path: PathBuf,
    pub source_format: SourceFormat,
    pub source_url: String,
    pub source_file: Option<PathBuf>,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub timezone: FixedOffset,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub chat_channel: String,
    pub chat_trigger: String,
    pub error_recipient: Option<String>,
    pub chat_webhook_url: Option<String>,
    pub web_port: u16,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let source_format = match var("MSTAT_SOURCE_FORMAT") {
            Some(v) => v.parse::<SourceFormat>().context("parsing MSTAT_SOURCE_FORMAT")?,
            None => SourceFormat::Json,
        };
        let timezone = match var("MSTAT_TIMEZONE_OFFSET") {
            Some(v) => parse_utc_offset(&v).context("parsing MSTAT_TIMEZONE_OFFSET")?,
            None => default_timezone(),
        };
        let http_timeout_secs = match var("MSTAT_HTTP_TIMEOUT_SECS") {
            Some(v) => v.parse().context("parsing MSTAT_HTTP_TIMEOUT_SECS")?,
            None => 20,
        };
        if http_timeout_secs == 0 {
            bail!("MSTAT_HTTP_TIMEOUT_SECS must be greater than zero");
        }
        let web_port = match var("MSTAT_WEB_PORT") {
            Some(v) => v.parse().context("parsing MSTAT_WEB_PORT")?,
            None => 8000,
        };

        Ok(Self {
            database_path: var("MSTAT_DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./mstdn-stats.sqlite3")),
            source_format,
            source_url: var("MSTAT_SOURCE_URL").unwrap_or_else(|| source_format.default_url().to_string()),
            source_file: var("MSTAT_SOURCE_FILE").map(PathBuf::from),
            scheduler_enabled: var("MSTAT_SCHEDULER_ENABLED")
                .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(true),
            sync_cron: var("MSTAT_SYNC_CRON").unwrap_or_else(|| DEFAULT_SYNC_CRON.to_string()),
            timezone,
            user_agent: var("MSTAT_USER_AGENT")
                .unwrap_or_else(|| format!("mstdn-stats/{}", env!("CARGO_PKG_VERSION"))),
            http_timeout_secs,
            chat_channel: var("MSTAT_CHAT_CHANNEL").unwrap_or_else(|| "general".to_string()),
            chat_trigger: var("MSTAT_CHAT_TRIGGER").unwrap_or_else(|| "mstdn-stats".to_string()),
            error_recipient: var("MSTAT_ERROR_RECIPIENT"),
            chat_webhook_url: var("MSTAT_CHAT_WEBHOOK_URL"),
            web_port,
        })
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }
}

/// Asia/Tokyo. It has no DST so a fixed offset is exact.
pub fn default_timezone() -> FixedOffset {
    FixedOffset::east_opt(9 * 3600).unwrap_or(Utc.fix())
}

/// Accepts `+09:00`, `-0530`, `+9`, `Z`/`UTC`.
pub fn parse_utc_offset(text: &str) -> Result<FixedOffset> {
    let text = text.trim();
    if text.eq_ignore_ascii_case("z") || text.eq_ignore_ascii_case("utc") {
        return Ok(Utc.fix());
    }
    let (sign, rest) = match text.chars().next() {
        Some('+') => (1, &text[1..]),
        Some('-') => (-1, &text[1..]),
        _ => bail!("offset `{text}` must start with + or -"),
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) || digits.len() > 4 {
        bail!("offset `{text}` is not of the form +HH:MM");
    }
    let (hours, minutes) = if digits.len() <= 2 {
        (digits.parse::<i32>()?, 0)
    } else {
        let split = digits.len() - 2;
        (digits[..split].parse::<i32>()?, digits[split..].parse::<i32>()?)
    };
    if minutes >= 60 {
        bail!("offset `{text}` has more than 59 minutes");
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(|| anyhow!("offset `{text}` is out of range"))
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub fetched_count: usize,
    pub stored_count: usize,
}

/// Outcome of a run as seen by callers that must never fail.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IngestReport {
    Stored { run_id: Uuid, stored_count: usize },
    Failed { run_id: Uuid, error: String },
}

impl IngestReport {
    pub fn stored_count(&self) -> usize {
        match self {
            IngestReport::Stored { stored_count, .. } => *stored_count,
            IngestReport::Failed { .. } => 0,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, IngestReport::Failed { .. })
    }
}

/// Keep only large instances, largest first.
pub fn select_large_instances(mut records: Vec<InstanceRecord>) -> Vec<InstanceRecord> {
    records.sort_by(|a, b| b.users.cmp(&a.users));
    records.retain(|r| r.users > MIN_USERS_EXCLUSIVE);
    records
}

pub struct Ingestor {
    source: Box<dyn SourceClient>,
    store: SnapshotStore,
    clock: Arc<dyn Clock>,
}

impl Ingestor {
    pub fn new(source: Box<dyn SourceClient>, store: SnapshotStore) -> Self {
        Self {
            source,
            store,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn from_config(config: &SyncConfig, store: SnapshotStore, http: Arc<HttpFetcher>) -> Self {
        let source = source_client_for(
            config.source_format,
            &config.source_url,
            config.source_file.clone(),
            http,
        );
        Self::new(source, store)
    }

    /// fetch → normalize → sort → filter → persist.
    pub async fn try_run(&self) -> Result<IngestSummary, IngestError> {
        let run_id = Uuid::new_v4();
        self.try_run_with_id(run_id).await
    }

    async fn try_run_with_id(&self, run_id: Uuid) -> Result<IngestSummary, IngestError> {
        let span = info_span!("ingest", %run_id, source = %self.source.describe());
        async {
            let started_at = self.clock.now();
            let ctx = AdapterContext { run_id };
            let records = fetch_instances(self.source.as_ref(), &ctx).await?;
            let fetched_count = records.len();

            let large = select_large_instances(records);
            self.store.append(&large).await?;

            let finished_at = self.clock.now();
            info!(fetched_count, stored_count = large.len(), "ingestion run stored snapshots");
            Ok(IngestSummary {
                run_id,
                started_at,
                finished_at,
                fetched_count,
                stored_count: large.len(),
            })
        }
        .instrument(span)
        .await
    }

    /// Like `try_run` but every failure is logged and folded into the report.
    pub async fn run(&self) -> IngestReport {
        let run_id = Uuid::new_v4();
        match self.try_run_with_id(run_id).await {
            Ok(summary) => IngestReport::Stored {
                run_id,
                stored_count: summary.stored_count,
            },
            Err(err) => {
                error!(%run_id, error = %err, "ingestion run failed");
                IngestReport::Failed {
                    run_id,
                    error: err.to_string(),
                }
            }
        }
    }
}

/// Posts failure notices to an outgoing chat webhook.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    http: Arc<HttpFetcher>,
    url: String,
    channel: String,
    recipient: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub channel: String,
    pub text: String,
}

impl WebhookNotifier {
    pub fn new(http: Arc<HttpFetcher>, url: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
            channel: channel.into(),
            recipient: None,
        }
    }

    pub fn with_recipient(mut self, recipient: Option<String>) -> Self {
        self.recipient = recipient;
        self
    }

    pub fn from_config(config: &SyncConfig, http: Arc<HttpFetcher>) -> Option<Self> {
        let url = config.chat_webhook_url.as_ref()?;
        Some(Self::new(http, url.clone(), config.chat_channel.clone()).with_recipient(config.error_recipient.clone()))
    }

    pub fn failure_message(&self, run_id: Uuid, error: &str) -> ChatMessage {
        let mention = self
            .recipient
            .as_deref()
            .map(|r| format!("@{} ", r.trim_start_matches('@')))
            .unwrap_or_default();
        ChatMessage {
            channel: self.channel.clone(),
            text: format!("{mention}instance stats fetch failed (run {run_id}): {error}"),
        }
    }

    /// Delivery problems are logged and otherwise ignored.
    pub async fn notify_failure(&self, run_id: Uuid, error: &str) {
        let message = self.failure_message(run_id, error);
        if let Err(err) = self.http.post_json(&self.url, &message).await {
            warn!(%run_id, error = %err, "failed to deliver failure notice");
        }
    }
}

/// One scheduled tick: run, and tell someone if it failed.
pub async fn run_scheduled_ingest(ingestor: &Ingestor, notifier: Option<&WebhookNotifier>) -> IngestReport {
    let report = ingestor.run().await;
    if let (IngestReport::Failed { run_id, error }, Some(notifier)) = (&report, notifier) {
        notifier.notify_failure(*run_id, error).await;
    }
    report
}

pub async fn build_scheduler(
    config: &SyncConfig,
    ingestor: Arc<Ingestor>,
    notifier: Option<Arc<WebhookNotifier>>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.sync_cron.clone();
    let job = Job::new_async_tz(&cron, config.timezone, move |_uuid, _l| {
        let ingestor = Arc::clone(&ingestor);
        let notifier = notifier.clone();
        Box::pin(async move {
            let report = run_scheduled_ingest(&ingestor, notifier.as_deref()).await;
            info!(stored = report.stored_count(), failed = report.is_failure(), "scheduled ingestion finished");
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    info!(cron = %config.sync_cron, timezone = %config.timezone, "ingestion scheduled");
    Ok(Some(sched))
}

pub async fn open_store(config: &SyncConfig) -> Result<SnapshotStore> {
    SnapshotStore::open(&config.database_path)
        .await
        .with_context(|| format!("opening {}", config.database_path.display()))
}

pub async fn run_ingest_once_from_env() -> Result<IngestSummary> {
    let config = SyncConfig::from_env()?;
    let store = open_store(&config).await?;
    let http = Arc::new(HttpFetcher::new(config.http_client_config())?);
    let ingestor = Ingestor::from_config(&config, store.clone(), http);
    let summary = ingestor.try_run().await;
    store.close().await;
    Ok(summary?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::Path;

    use async_trait::async_trait;
    use mstat_adapters::{FileSource, RawInstance};
    use mstat_core::ManualClock;
    use tempfile::tempdir;

    struct StaticSource(Vec<RawInstance>);

    #[async_trait]
    impl SourceClient for StaticSource {
        fn describe(&self) -> String {
            "static".to_string()
        }

        async fn fetch_raw(&self, _ctx: &AdapterContext) -> Result<Vec<RawInstance>, SourceError> {
            Ok(self.0.clone())
        }
    }

    fn fixture_path(name: &str) -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../fixtures/mastodon-xyz/sample")
            .join(name)
    }

    fn raw(name: &str, users: i64) -> RawInstance {
        RawInstance {
            name: name.to_string(),
            users: Some(users),
            statuses: Some(users * 3),
            ..Default::default()
        }
    }

    async fn temp_store(dir: &Path) -> SnapshotStore {
        SnapshotStore::open(dir.join("stats.sqlite3")).await.expect("open")
    }

    #[tokio::test]
    async fn ingest_fixture_keeps_only_large_instances_sorted_by_users() {
        let dir = tempdir().expect("tempdir");
        let store = temp_store(dir.path()).await;
        let ingestor = Ingestor::new(
            Box::new(FileSource::new(fixture_path("instances.json"), SourceFormat::Json)),
            store.clone(),
        );

        let summary = ingestor.try_run().await.expect("run");
        assert_eq!(summary.fetched_count, 5);
        assert_eq!(summary.stored_count, 3);

        let rows = store.query_all().await.expect("rows");
        let names = rows.iter().map(|r| r.instance.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["mastodon.social", "pawoo.net", "mstdn.jp"]);
        assert!(rows.iter().all(|r| r.users > MIN_USERS_EXCLUSIVE));
    }

    #[tokio::test]
    async fn threshold_is_exclusive() {
        let dir = tempdir().expect("tempdir");
        let store = temp_store(dir.path()).await;
        let ingestor = Ingestor::new(
            Box::new(StaticSource(vec![raw("edge.example", 5000), raw("over.example", 5001)])),
            store.clone(),
        );
        assert_eq!(ingestor.run().await.stored_count(), 1);
        let rows = store.query_all().await.expect("rows");
        assert_eq!(rows[0].instance, "over.example");
    }

    #[tokio::test]
    async fn created_at_comes_from_the_ingestion_clock() {
        let dir = tempdir().expect("tempdir");
        let clock = Arc::new(ManualClock::at_millis(1_760_000_000_000));
        let store = temp_store(dir.path()).await.with_clock(clock.clone());
        let ingestor = Ingestor::new(Box::new(StaticSource(vec![raw("a.example", 9000)])), store.clone())
            .with_clock(clock.clone());

        let summary = ingestor.try_run().await.expect("run");
        assert_eq!(summary.started_at.timestamp_millis(), 1_760_000_000_000);
        let rows = store.query_all().await.expect("rows");
        assert_eq!(rows[0].created_at, 1_760_000_000_000);
    }

    #[tokio::test]
    async fn empty_source_is_reported_not_raised() {
        let dir = tempdir().expect("tempdir");
        let store = temp_store(dir.path()).await;
        let ingestor = Ingestor::new(Box::new(StaticSource(Vec::new())), store.clone());

        let report = ingestor.run().await;
        assert!(report.is_failure());
        assert_eq!(report.stored_count(), 0);
        assert_eq!(store.count().await.expect("count"), 0);

        let err = ingestor.try_run().await.unwrap_err();
        assert!(matches!(err, IngestError::Source(SourceError::Empty)));
    }

    #[tokio::test]
    async fn only_small_instances_is_a_successful_empty_run() {
        let dir = tempdir().expect("tempdir");
        let store = temp_store(dir.path()).await;
        let ingestor = Ingestor::new(Box::new(StaticSource(vec![raw("small.example", 10)])), store.clone());
        let report = ingestor.run().await;
        assert!(!report.is_failure());
        assert_eq!(report.stored_count(), 0);
        assert_eq!(store.count().await.expect("count"), 0);
    }

    #[tokio::test]
    async fn storage_failure_is_reported_not_raised() {
        let dir = tempdir().expect("tempdir");
        let store = temp_store(dir.path()).await;
        store.close().await;
        let ingestor = Ingestor::new(Box::new(StaticSource(vec![raw("a.example", 9000)])), store);

        match ingestor.run().await {
            IngestReport::Failed { error, .. } => assert!(error.contains("writing snapshot batch")),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn select_large_instances_sorts_descending() {
        let records = normalize_for_test(vec![raw("b", 6000), raw("a", 9000), raw("c", 4000)]);
        let selected = select_large_instances(records);
        let users = selected.iter().map(|r| r.users).collect::<Vec<_>>();
        assert_eq!(users, vec![9000, 6000]);
    }

    fn normalize_for_test(raw: Vec<RawInstance>) -> Vec<InstanceRecord> {
        mstat_adapters::normalize(raw).expect("normalize")
    }

    #[test]
    fn config_defaults() {
        let config = SyncConfig::from_vars(|_| None).unwrap();
        assert_eq!(config.source_format, SourceFormat::Json);
        assert_eq!(config.source_url, mstat_adapters::DEFAULT_JSON_URL);
        assert_eq!(config.sync_cron, DEFAULT_SYNC_CRON);
        assert_eq!(config.timezone.local_minus_utc(), 9 * 3600);
        assert_eq!(config.http_timeout_secs, 20);
        assert!(config.scheduler_enabled);
        assert!(config.source_file.is_none());
        assert_eq!(config.chat_trigger, "mstdn-stats");
    }

    #[test]
    fn config_overrides_and_validation() {
        let vars = HashMap::from([
            ("MSTAT_SOURCE_FORMAT", "html"),
            ("MSTAT_TIMEZONE_OFFSET", "-05:30"),
            ("MSTAT_SCHEDULER_ENABLED", "false"),
            ("MSTAT_ERROR_RECIPIENT", "ops"),
            ("MSTAT_SOURCE_FILE", "  "),
        ]);
        let config = SyncConfig::from_vars(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.source_format, SourceFormat::Html);
        assert_eq!(config.source_url, mstat_adapters::DEFAULT_HTML_URL);
        assert_eq!(config.timezone.local_minus_utc(), -(5 * 3600 + 30 * 60));
        assert!(!config.scheduler_enabled);
        assert_eq!(config.error_recipient.as_deref(), Some("ops"));
        assert!(config.source_file.is_none());

        let bad = HashMap::from([("MSTAT_HTTP_TIMEOUT_SECS", "0")]);
        assert!(SyncConfig::from_vars(|k| bad.get(k).map(|v| v.to_string())).is_err());
        let bad = HashMap::from([("MSTAT_SOURCE_FORMAT", "xml")]);
        assert!(SyncConfig::from_vars(|k| bad.get(k).map(|v| v.to_string())).is_err());
    }

    #[test]
    fn utc_offsets_parse() {
        assert_eq!(parse_utc_offset("+09:00").unwrap().local_minus_utc(), 32400);
        assert_eq!(parse_utc_offset("+0900").unwrap().local_minus_utc(), 32400);
        assert_eq!(parse_utc_offset("+9").unwrap().local_minus_utc(), 32400);
        assert_eq!(parse_utc_offset("UTC").unwrap().local_minus_utc(), 0);
        assert!(parse_utc_offset("09:00").is_err());
        assert!(parse_utc_offset("+09:75").is_err());
        assert!(parse_utc_offset("+30:00").is_err());
    }

    #[test]
    fn failure_message_mentions_recipient() {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
        let run_id = Uuid::nil();
        let notifier = WebhookNotifier::new(http.clone(), "http://127.0.0.1:9/hook", "ops-room")
            .with_recipient(Some("@alice".to_string()));
        let message = notifier.failure_message(run_id, "source returned no usable instance records");
        assert_eq!(message.channel, "ops-room");
        assert!(message.text.starts_with("@alice instance stats fetch failed"));

        let quiet = WebhookNotifier::new(http, "http://127.0.0.1:9/hook", "ops-room");
        assert!(quiet.failure_message(run_id, "x").text.starts_with("instance stats"));
    }

    #[tokio::test]
    async fn scheduler_is_skipped_when_disabled() {
        let dir = tempdir().expect("tempdir");
        let store = temp_store(dir.path()).await;
        let mut config = SyncConfig::from_vars(|_| None).unwrap();
        config.scheduler_enabled = false;
        let ingestor = Arc::new(Ingestor::new(Box::new(StaticSource(Vec::new())), store));
        assert!(build_scheduler(&config, ingestor, None).await.unwrap().is_none());
    }
}
