//! Chat command surface for mstat, served as an axum webhook.

use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::FixedOffset;
use mstat_core::{Clock, SystemClock, HOUR_MILLIS};
use mstat_report::{CsvExporter, DeltaReporter};
use mstat_storage::SnapshotStore;
use mstat_sync::{IngestReport, Ingestor, SyncConfig};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "mstat-web";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatCommand {
    Stats,
    ExportCsv,
    Fetch,
    Help,
}

impl ChatCommand {
    /// `None` when the message is not addressed to us.
    pub fn parse(text: &str, trigger: &str) -> Option<Self> {
        let mut words = text.split_whitespace();
        let first = words.next()?;
        if !first.eq_ignore_ascii_case(trigger) {
            return None;
        }
        let command = match words.next().map(str::to_ascii_lowercase).as_deref() {
            None | Some("stats") => ChatCommand::Stats,
            Some("csv") | Some("export") => ChatCommand::ExportCsv,
            Some("fetch") => ChatCommand::Fetch,
            Some(_) => ChatCommand::Help,
        };
        Some(command)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatReply {
    pub channel: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub text: String,
    #[serde(default)]
    pub channel: Option<String>,
}

pub struct AppState {
    pub ingestor: Arc<Ingestor>,
    pub reporter: DeltaReporter,
    pub exporter: CsvExporter,
    pub channel: String,
    pub trigger: String,
    pub timezone: FixedOffset,
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    pub fn new(config: &SyncConfig, store: SnapshotStore, ingestor: Arc<Ingestor>) -> Self {
        Self {
            ingestor,
            reporter: DeltaReporter::new(store.clone()),
            exporter: CsvExporter::new(store, config.timezone),
            channel: config.chat_channel.clone(),
            trigger: config.chat_trigger.clone(),
            timezone: config.timezone,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.reporter = self.reporter.clone().with_clock(clock.clone());
        self.clock = clock;
        self
    }

    fn export_filename(&self) -> String {
        let local = self.clock.now().with_timezone(&self.timezone);
        format!("mastodon-instances-{}.csv", local.format("%Y%m%d%H%M"))
    }

    fn help_text(&self) -> String {
        let t = &self.trigger;
        format!("usage: `{t}` current stats, `{t} csv` export history, `{t} fetch` fetch now")
    }

    /// Every failure becomes reply text; nothing escapes to the chat layer.
    pub async fn handle(&self, command: ChatCommand) -> ChatReply {
        let (text, attachment) = match command {
            ChatCommand::Stats => match self.reporter.report().await {
                Ok(report) if report.is_empty() => (
                    format!(
                        "no instance snapshots in the last {} hours",
                        self.reporter.window_millis() / HOUR_MILLIS
                    ),
                    None,
                ),
                Ok(report) => (format!("```\n{}```", report.render()), None),
                Err(err) => (format!("error: {err}"), None),
            },
            ChatCommand::ExportCsv => match self.exporter.render_csv().await {
                Ok(csv) => {
                    let rows = csv.lines().count().saturating_sub(1);
                    (
                        format!("exported {rows} snapshots"),
                        Some(Attachment {
                            filename: self.export_filename(),
                            content_type: "text/csv".to_string(),
                            content: csv,
                        }),
                    )
                }
                Err(err) => (format!("error: {err}"), None),
            },
            // `run` logs the failure with its run id, same as a scheduled tick.
            ChatCommand::Fetch => match self.ingestor.run().await {
                IngestReport::Stored { stored_count, .. } => (format!("stored {stored_count} instance snapshots"), None),
                IngestReport::Failed { run_id, error } => (format!("error: {error} (run {run_id})"), None),
            },
            ChatCommand::Help => (self.help_text(), None),
        };
        ChatReply {
            channel: self.channel.clone(),
            text,
            attachment,
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/command", post(command_handler))
        .route("/stats", get(stats_handler))
        .route("/export.csv", get(export_handler))
        .route("/fetch", post(fetch_handler))
        .with_state(Arc::new(state))
}

/// Serve until `shutdown` resolves.
pub async fn serve<F>(state: AppState, port: u16, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "command webhook listening");
    axum::serve(listener, app(state)).with_graceful_shutdown(shutdown).await?;
    Ok(())
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn command_handler(State(state): State<Arc<AppState>>, Json(req): Json<ChatRequest>) -> Response {
    match ChatCommand::parse(&req.text, &state.trigger) {
        Some(command) => {
            let mut reply = state.handle(command).await;
            if let Some(channel) = req.channel {
                reply.channel = channel;
            }
            Json(reply).into_response()
        }
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.reporter.render().await {
        Ok(table) => ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], table).into_response(),
        Err(err) => server_error(err),
    }
}

async fn export_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.exporter.render_csv().await {
        Ok(csv) => (
            [
                (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{}\"", state.export_filename()),
                ),
            ],
            csv,
        )
            .into_response(),
        Err(err) => server_error(err),
    }
}

#[derive(Debug, Serialize)]
struct FetchResponse {
    stored_count: usize,
}

async fn fetch_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.ingestor.run().await {
        IngestReport::Stored { stored_count, .. } => Json(FetchResponse { stored_count }).into_response(),
        IngestReport::Failed { run_id, error } => (
            StatusCode::BAD_GATEWAY,
            Json(serde_json::json!({ "run_id": run_id, "error": error })),
        )
            .into_response(),
    }
}

fn server_error(err: impl std::fmt::Display) -> Response {
    warn!(error = %err, "request failed");
    (StatusCode::INTERNAL_SERVER_ERROR, format!("Server error: {err}")).into_response()
}
