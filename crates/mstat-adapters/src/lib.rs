//! Instance-list source contracts, HTML/JSON/file sources and the normalizer.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use mstat_core::InstanceRecord;
use mstat_storage::{FetchError, HttpFetcher};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "mstat-adapters";

pub const DEFAULT_JSON_URL: &str = "https://instances.mastodon.xyz/instances.json";
pub const DEFAULT_HTML_URL: &str = "https://instances.mastodon.xyz/list";

const HTML_ROW_SELECTOR: &str = "body > div > table > tbody > tr";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    Html,
    Json,
}

impl SourceFormat {
    pub fn default_url(self) -> &'static str {
        match self {
            SourceFormat::Html => DEFAULT_HTML_URL,
            SourceFormat::Json => DEFAULT_JSON_URL,
        }
    }

    pub fn parse_body(self, body: &str) -> Result<Vec<RawInstance>, SourceError> {
        match self {
            SourceFormat::Html => parse_html_table(body),
            SourceFormat::Json => parse_json_list(body),
        }
    }
}

impl FromStr for SourceFormat {
    type Err = SourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "html" => Ok(SourceFormat::Html),
            "json" => Ok(SourceFormat::Json),
            other => Err(SourceError::Parse(format!("unknown source format `{other}`"))),
        }
    }
}

/// One row as the remote catalog exposes it, before trimming and defaulting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawInstance {
    pub name: String,
    pub users: Option<i64>,
    pub statuses: Option<i64>,
    pub connections: Option<i64>,
    pub uptime: Option<String>,
    pub https_score: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source returned no usable instance records")]
    Empty,
    #[error("fetching instance list: {0}")]
    Fetch(#[from] FetchError),
    #[error("parsing instance list: {0}")]
    Parse(String),
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[async_trait]
pub trait SourceClient: Send + Sync {
    fn describe(&self) -> String;

    async fn fetch_raw(&self, ctx: &AdapterContext) -> Result<Vec<RawInstance>, SourceError>;
}

/// Fetch from a client and normalize in one step.
pub async fn fetch_instances(
    client: &dyn SourceClient,
    ctx: &AdapterContext,
) -> Result<Vec<InstanceRecord>, SourceError> {
    let raw = client.fetch_raw(ctx).await?;
    debug!(run_id = %ctx.run_id, source = %client.describe(), rows = raw.len(), "fetched raw instances");
    normalize(raw)
}

/// Trim strings, default missing numbers to 0 and drop rows without a name.
/// An empty result is a fetch failure, the catalog is never legitimately empty.
pub fn normalize(raw: Vec<RawInstance>) -> Result<Vec<InstanceRecord>, SourceError> {
    if raw.is_empty() {
        return Err(SourceError::Empty);
    }

    let mut out = Vec::with_capacity(raw.len());
    for row in raw {
        let instance = row.name.trim().to_string();
        if instance.is_empty() {
            warn!(?row, "dropping instance row without a name");
            continue;
        }
        out.push(InstanceRecord {
            instance,
            score: row.https_score.unwrap_or(0),
            users: row.users.unwrap_or(0).max(0),
            statuses: row.statuses.unwrap_or(0).max(0),
            connections: row.connections.unwrap_or(0).max(0),
            uptime: row.uptime.as_deref().map(str::trim).unwrap_or_default().to_string(),
        });
    }

    if out.is_empty() {
        return Err(SourceError::Empty);
    }
    Ok(out)
}

fn text_of(cell: Option<ElementRef<'_>>) -> Option<String> {
    cell.map(|n| n.text().collect::<String>().trim().to_string())
}

/// Parse numbers the way the catalog prints them: `12,345`, ` 42 `, `0.97`.
fn parse_count(text: &str) -> Option<i64> {
    let cleaned: String = text.trim().chars().filter(|c| *c != ',' && *c != '_').collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned
        .parse::<i64>()
        .ok()
        .or_else(|| cleaned.parse::<f64>().ok().filter(|v| v.is_finite()).map(|v| v as i64))
}

pub fn parse_html_table(body: &str) -> Result<Vec<RawInstance>, SourceError> {
    let document = Html::parse_document(body);
    let rows = Selector::parse(HTML_ROW_SELECTOR).map_err(|e| SourceError::Parse(e.to_string()))?;
    let cells = Selector::parse("td").map_err(|e| SourceError::Parse(e.to_string()))?;

    Ok(document
        .select(&rows)
        .map(|tr| {
            let tds = tr.select(&cells).collect::<Vec<_>>();
            let cell = |n: usize| text_of(tds.get(n - 1).copied());
            RawInstance {
                https_score: cell(2).as_deref().and_then(parse_count),
                name: cell(3).unwrap_or_default(),
                users: cell(4).as_deref().and_then(parse_count),
                statuses: cell(5).as_deref().and_then(parse_count),
                connections: cell(6).as_deref().and_then(parse_count),
                uptime: cell(8),
            }
        })
        .collect())
}

fn json_count(value: &JsonValue, key: &str) -> Option<i64> {
    match value.get(key)? {
        JsonValue::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|v| v.is_finite()).map(|v| v as i64)),
        JsonValue::String(s) => parse_count(s),
        _ => None,
    }
}

fn json_text(value: &JsonValue, key: &str) -> Option<String> {
    match value.get(key)? {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

pub fn parse_json_list(body: &str) -> Result<Vec<RawInstance>, SourceError> {
    let value: JsonValue =
        serde_json::from_str(body).map_err(|e| SourceError::Parse(format!("invalid JSON: {e}")))?;
    let items = match &value {
        JsonValue::Array(items) => items,
        JsonValue::Object(obj) => obj
            .get("instances")
            .and_then(JsonValue::as_array)
            .ok_or_else(|| SourceError::Parse("expected a JSON array of instances".to_string()))?,
        _ => return Err(SourceError::Parse("expected a JSON array of instances".to_string())),
    };

    Ok(items
        .iter()
        .filter(|item| item.is_object())
        .map(|item| RawInstance {
            name: json_text(item, "name").unwrap_or_default(),
            users: json_count(item, "users"),
            statuses: json_count(item, "statuses"),
            connections: json_count(item, "connections"),
            uptime: json_text(item, "uptime"),
            https_score: json_count(item, "https_score"),
        })
        .collect())
}

/// Legacy catalog: scrape the HTML list page.
#[derive(Debug, Clone)]
pub struct HtmlTableSource {
    http: Arc<HttpFetcher>,
    url: String,
}

impl HtmlTableSource {
    pub fn new(http: Arc<HttpFetcher>, url: impl Into<String>) -> Self {
        Self { http, url: url.into() }
    }
}

#[async_trait]
impl SourceClient for HtmlTableSource {
    fn describe(&self) -> String {
        format!("html:{}", self.url)
    }

    async fn fetch_raw(&self, ctx: &AdapterContext) -> Result<Vec<RawInstance>, SourceError> {
        let resp = self.http.fetch_bytes(ctx.run_id, &self.url).await?;
        parse_html_table(&String::from_utf8_lossy(&resp.body))
    }
}

/// Current catalog: a JSON array of instance objects.
#[derive(Debug, Clone)]
pub struct JsonListSource {
    http: Arc<HttpFetcher>,
    url: String,
}

impl JsonListSource {
    pub fn new(http: Arc<HttpFetcher>, url: impl Into<String>) -> Self {
        Self { http, url: url.into() }
    }
}

#[async_trait]
impl SourceClient for JsonListSource {
    fn describe(&self) -> String {
        format!("json:{}", self.url)
    }

    async fn fetch_raw(&self, ctx: &AdapterContext) -> Result<Vec<RawInstance>, SourceError> {
        let resp = self.http.fetch_bytes(ctx.run_id, &self.url).await?;
        parse_json_list(&String::from_utf8_lossy(&resp.body))
    }
}

/// Reads a previously captured catalog from disk.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
    format: SourceFormat,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>, format: SourceFormat) -> Self {
        Self {
            path: path.into(),
            format,
        }
    }
}

#[async_trait]
impl SourceClient for FileSource {
    fn describe(&self) -> String {
        format!("file:{}", self.path.display())
    }

    async fn fetch_raw(&self, _ctx: &AdapterContext) -> Result<Vec<RawInstance>, SourceError> {
        let body = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| SourceError::Io {
                path: self.path.clone(),
                source,
            })?;
        self.format.parse_body(&body)
    }
}

pub fn source_client_for(
    format: SourceFormat,
    url: &str,
    file: Option<PathBuf>,
    http: Arc<HttpFetcher>,
) -> Box<dyn SourceClient> {
    match (file, format) {
        (Some(path), format) => Box::new(FileSource::new(path, format)),
        (None, SourceFormat::Html) => Box::new(HtmlTableSource::new(http, url)),
        (None, SourceFormat::Json) => Box::new(JsonListSource::new(http, url)),
    }
}
