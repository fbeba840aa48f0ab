//! Day-over-day delta table and CSV history export.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use chrono::{FixedOffset, TimeZone};
use mstat_core::{
    Clock, InstanceSnapshot, SystemClock, BASELINE_TOLERANCE_MILLIS, DAY_MILLIS, REPORT_WINDOW_MILLIS,
};
use mstat_storage::{SnapshotStore, StorageError};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "mstat-report";

pub const CSV_HEADER: &str = "instance,score,users,statuses,connections,uptime,created_at";

const CSV_TIMESTAMP_FORMAT: &str = "%Y/%m/%d %H:%M:%S";

#[derive(Debug, Error)]
pub enum RenderError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("snapshot {id} has an out-of-range created_at {created_at}")]
    Timestamp { id: i64, created_at: i64 },
}

/// A metric value, with the change since the baseline when one was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricCell {
    pub latest: i64,
    pub delta: Option<i64>,
}

impl std::fmt::Display for MetricCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.delta {
            Some(delta) => write!(f, "{} ({:+})", self.latest, delta),
            None => write!(f, "{}", self.latest),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeltaRow {
    pub instance: String,
    pub users: MetricCell,
    pub statuses: MetricCell,
    pub latest_at: i64,
    pub baseline_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
pub struct DeltaReport {
    pub rows: Vec<DeltaRow>,
}

impl DeltaReport {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Monospace table: instance left-aligned, numbers right-aligned.
    pub fn render(&self) -> String {
        let header = ["instance", "users", "statuses"];
        let cells = self
            .rows
            .iter()
            .map(|r| [r.instance.clone(), r.users.to_string(), r.statuses.to_string()])
            .collect::<Vec<_>>();

        let mut widths = header.map(|h| h.chars().count());
        for row in &cells {
            for (width, cell) in widths.iter_mut().zip(row.iter()) {
                *width = (*width).max(cell.chars().count());
            }
        }

        let mut out = String::new();
        push_line(&mut out, &header.map(String::from), &widths);
        let rule = widths.iter().map(|w| "-".repeat(*w)).collect::<Vec<_>>().join("-+-");
        out.push_str(&rule);
        out.push('\n');
        for row in &cells {
            push_line(&mut out, row, &widths);
        }
        out
    }
}

fn push_line(out: &mut String, cells: &[String; 3], widths: &[usize; 3]) {
    let pad = |s: &str, w: usize| w.saturating_sub(s.chars().count());
    let _ = write!(out, "{}{}", cells[0], " ".repeat(pad(&cells[0], widths[0])));
    for (cell, width) in cells.iter().zip(widths.iter()).skip(1) {
        let _ = write!(out, " | {}{}", " ".repeat(pad(cell, *width)), cell);
    }
    out.push('\n');
}

/// Pick the row closest to exactly one day before `latest`, within tolerance.
/// Ties go to the lowest id.
pub fn find_baseline<'a>(
    latest: &InstanceSnapshot,
    candidates: impl IntoIterator<Item = &'a InstanceSnapshot>,
) -> Option<&'a InstanceSnapshot> {
    let target = latest.created_at.saturating_sub(DAY_MILLIS);
    candidates
        .into_iter()
        .filter(|c| c.id != latest.id)
        .map(|c| (c.created_at.abs_diff(target), c))
        .filter(|(distance, _)| *distance <= BASELINE_TOLERANCE_MILLIS.unsigned_abs())
        .min_by_key(|(distance, c)| (*distance, c.id))
        .map(|(_, c)| c)
}

/// Group by instance, pair each latest row with its baseline and order by
/// latest users descending, then instance name.
pub fn build_report(snapshots: &[InstanceSnapshot]) -> DeltaReport {
    let mut groups: HashMap<&str, Vec<&InstanceSnapshot>> = HashMap::new();
    for snapshot in snapshots {
        groups.entry(snapshot.instance.as_str()).or_default().push(snapshot);
    }

    let mut rows = groups
        .into_values()
        .filter_map(|group| {
            let latest = *group.iter().max_by_key(|s| (s.created_at, s.id))?;
            let baseline = find_baseline(latest, group.iter().copied());
            Some(DeltaRow {
                instance: latest.instance.clone(),
                users: MetricCell {
                    latest: latest.users,
                    delta: baseline.map(|b| latest.users.saturating_sub(b.users)),
                },
                statuses: MetricCell {
                    latest: latest.statuses,
                    delta: baseline.map(|b| latest.statuses.saturating_sub(b.statuses)),
                },
                latest_at: latest.created_at,
                baseline_at: baseline.map(|b| b.created_at),
            })
        })
        .collect::<Vec<_>>();

    rows.sort_by(|a, b| {
        b.users
            .latest
            .cmp(&a.users.latest)
            .then_with(|| a.instance.cmp(&b.instance))
    });
    DeltaReport { rows }
}

#[derive(Clone)]
pub struct DeltaReporter {
    store: SnapshotStore,
    clock: Arc<dyn Clock>,
    window_millis: i64,
}

impl DeltaReporter {
    pub fn new(store: SnapshotStore) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            window_millis: REPORT_WINDOW_MILLIS,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn window_millis(&self) -> i64 {
        self.window_millis
    }

    pub async fn report(&self) -> Result<DeltaReport, RenderError> {
        let since = self.clock.now_millis().saturating_sub(self.window_millis);
        let snapshots = self.store.query_window(since).await?;
        debug!(rows = snapshots.len(), since, "building delta report");
        Ok(build_report(&snapshots))
    }

    pub async fn render(&self) -> Result<String, RenderError> {
        Ok(self.report().await?.render())
    }
}

/// Quote a field when it contains a separator, quote or line break.
pub fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

pub fn format_timestamp(snapshot: &InstanceSnapshot, timezone: &FixedOffset) -> Result<String, RenderError> {
    timezone
        .timestamp_millis_opt(snapshot.created_at)
        .single()
        .map(|t| t.format(CSV_TIMESTAMP_FORMAT).to_string())
        .ok_or(RenderError::Timestamp {
            id: snapshot.id,
            created_at: snapshot.created_at,
        })
}

pub fn render_csv_rows(snapshots: &[InstanceSnapshot], timezone: &FixedOffset) -> Result<String, RenderError> {
    let mut out = String::with_capacity(64 * (snapshots.len() + 1));
    out.push_str(CSV_HEADER);
    out.push('\n');
    for s in snapshots {
        let _ = writeln!(
            out,
            "{},{},{},{},{},{},{}",
            csv_field(s.instance.trim()),
            s.score,
            s.users,
            s.statuses,
            s.connections,
            csv_field(s.uptime.trim()),
            format_timestamp(s, timezone)?,
        );
    }
    Ok(out)
}

#[derive(Clone)]
pub struct CsvExporter {
    store: SnapshotStore,
    timezone: FixedOffset,
}

impl CsvExporter {
    pub fn new(store: SnapshotStore, timezone: FixedOffset) -> Self {
        Self { store, timezone }
    }

    pub async fn render_csv(&self) -> Result<String, RenderError> {
        let snapshots = self.store.query_all().await?;
        render_csv_rows(&snapshots, &self.timezone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mstat_core::{InstanceRecord, ManualClock, HOUR_MILLIS};
    use tempfile::tempdir;

    const T: i64 = 1_760_000_000_000;
    const MINUTE: i64 = 60 * 1000;

    fn snap(id: i64, instance: &str, users: i64, statuses: i64, created_at: i64) -> InstanceSnapshot {
        InstanceSnapshot {
            id,
            instance: instance.to_string(),
            score: 100,
            users,
            statuses,
            connections: 10,
            uptime: "99%".to_string(),
            created_at,
        }
    }

    fn record(instance: &str, users: i64, statuses: i64) -> InstanceRecord {
        InstanceRecord {
            instance: instance.to_string(),
            score: 90,
            users,
            statuses,
            connections: 2000,
            uptime: " 99.9% ".to_string(),
        }
    }

    fn tokyo() -> FixedOffset {
        FixedOffset::east_opt(9 * 3600).unwrap()
    }

    #[test]
    fn renders_signed_delta_against_previous_day() {
        let report = build_report(&[
            snap(1, "example.test", 100, 1000, T),
            snap(2, "example.test", 150, 990, T + DAY_MILLIS),
        ]);
        assert_eq!(report.rows.len(), 1);
        let row = &report.rows[0];
        assert_eq!(row.instance, "example.test");
        assert_eq!(row.users.to_string(), "150 (+50)");
        assert_eq!(row.statuses.to_string(), "990 (-10)");
        assert_eq!(row.baseline_at, Some(T));
    }

    #[test]
    fn zero_delta_is_rendered_with_plus_sign() {
        let report = build_report(&[snap(1, "flat.test", 7000, 10, T), snap(2, "flat.test", 7000, 10, T + DAY_MILLIS)]);
        assert_eq!(report.rows[0].users.to_string(), "7000 (+0)");
    }

    #[test]
    fn single_snapshot_renders_raw_value() {
        let report = build_report(&[snap(1, "lonely.test", 8000, 12, T)]);
        assert_eq!(report.rows[0].users.to_string(), "8000");
        assert_eq!(report.rows[0].statuses.to_string(), "12");
        assert_eq!(report.rows[0].baseline_at, None);
    }

    #[test]
    fn baseline_tolerance_is_one_hour() {
        let latest = snap(10, "a.test", 200, 0, T + DAY_MILLIS);
        let inside = snap(1, "a.test", 100, 0, T - 59 * MINUTE);
        let outside = snap(2, "a.test", 100, 0, T - 61 * MINUTE);
        assert_eq!(find_baseline(&latest, [&inside]).map(|b| b.id), Some(1));
        assert_eq!(find_baseline(&latest, [&outside]), None);

        let late_inside = snap(3, "a.test", 100, 0, T + 59 * MINUTE);
        assert_eq!(find_baseline(&latest, [&late_inside]).map(|b| b.id), Some(3));
        let edge = snap(4, "a.test", 100, 0, T - HOUR_MILLIS);
        assert_eq!(find_baseline(&latest, [&edge]).map(|b| b.id), Some(4));
    }

    #[test]
    fn extreme_timestamps_do_not_overflow() {
        let report = build_report(&[snap(1, "edge.test", 10, 1, i64::MIN), snap(2, "edge.test", 20, 2, i64::MAX)]);
        assert_eq!(report.rows.len(), 1);
        assert_eq!(report.rows[0].users, MetricCell { latest: 20, delta: None });

        let latest = snap(3, "edge.test", 30, 3, i64::MIN + 5);
        assert_eq!(find_baseline(&latest, [&snap(4, "edge.test", 1, 1, i64::MIN)]).map(|b| b.id), Some(4));
    }

    #[test]
    fn closest_baseline_wins_and_six_hourly_runs_are_ignored() {
        let rows = vec![
            snap(1, "a.test", 100, 0, T - 40 * MINUTE),
            snap(2, "a.test", 110, 0, T + 10 * MINUTE),
            snap(3, "a.test", 120, 0, T + 6 * HOUR_MILLIS),
            snap(4, "a.test", 130, 0, T + 12 * HOUR_MILLIS),
            snap(5, "a.test", 160, 0, T + DAY_MILLIS),
        ];
        let report = build_report(&rows);
        assert_eq!(report.rows[0].users, MetricCell { latest: 160, delta: Some(50) });
    }

    #[test]
    fn rows_are_ordered_by_users_then_name() {
        let report = build_report(&[
            snap(1, "b.test", 6000, 0, T),
            snap(2, "big.test", 90000, 0, T),
            snap(3, "a.test", 6000, 0, T),
        ]);
        let names = report.rows.iter().map(|r| r.instance.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["big.test", "a.test", "b.test"]);
    }

    #[test]
    fn table_render_aligns_columns() {
        let report = build_report(&[
            snap(1, "example.test", 100, 1000, T),
            snap(2, "example.test", 150, 1000, T + DAY_MILLIS),
            snap(3, "x.test", 9, 5, T + DAY_MILLIS),
        ]);
        let text = report.render();
        let lines = text.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "instance     |     users |  statuses");
        assert_eq!(lines[2], "example.test | 150 (+50) | 1000 (+0)");
        assert_eq!(lines[3], "x.test       |         9 |         5");
        assert_eq!(lines[1], "-------------+-----------+----------");
    }

    #[test]
    fn csv_fields_are_escaped() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn csv_timestamps_use_reporting_timezone() {
        // 2025-10-19T15:30:05Z
        let snapshot = snap(1, "a.test", 1, 1, 1_760_887_805_000);
        assert_eq!(format_timestamp(&snapshot, &tokyo()).unwrap(), "2025/10/20 00:30:05");
        let bad = snap(2, "a.test", 1, 1, i64::MAX);
        assert!(matches!(format_timestamp(&bad, &tokyo()), Err(RenderError::Timestamp { id: 2, .. })));
    }

    #[tokio::test]
    async fn reporter_reads_window_from_store_and_is_idempotent() {
        let dir = tempdir().expect("tempdir");
        let clock = Arc::new(ManualClock::at_millis(T));
        let store = SnapshotStore::open(dir.path().join("stats.sqlite3"))
            .await
            .expect("open")
            .with_clock(clock.clone());

        store.append(&[record("example.test", 100, 10)]).await.expect("day one");
        clock.advance_millis(DAY_MILLIS);
        store.append(&[record("example.test", 150, 25)]).await.expect("day two");

        let reporter = DeltaReporter::new(store.clone()).with_clock(clock.clone());
        let first = reporter.render().await.expect("render");
        let second = reporter.render().await.expect("render again");
        assert_eq!(first, second);
        assert!(first.contains("example.test | 150 (+50) | 25 (+15)"));

        clock.advance_millis(2 * DAY_MILLIS);
        assert!(reporter.report().await.expect("report").is_empty());
    }

    #[tokio::test]
    async fn exporter_emits_every_row_and_is_stable() {
        let dir = tempdir().expect("tempdir");
        let clock = Arc::new(ManualClock::at_millis(1_760_887_805_000));
        let store = SnapshotStore::open(dir.path().join("stats.sqlite3"))
            .await
            .expect("open")
            .with_clock(clock.clone());
        store
            .append(&[record("a.test", 9000, 1), record("comma,name.test", 8000, 2)])
            .await
            .expect("append");
        clock.advance_millis(6 * HOUR_MILLIS);
        store.append(&[record("a.test", 9100, 3)]).await.expect("append");

        let exporter = CsvExporter::new(store.clone(), tokyo());
        let csv = exporter.render_csv().await.expect("csv");
        let lines = csv.lines().collect::<Vec<_>>();
        assert_eq!(lines[0], CSV_HEADER);
        assert_eq!(lines.len() as i64 - 1, store.count().await.expect("count"));
        assert_eq!(lines[1], "a.test,90,9000,1,2000,99.9%,2025/10/20 00:30:05");
        assert_eq!(lines[2], "\"comma,name.test\",90,8000,2,2000,99.9%,2025/10/20 00:30:05");
        assert_eq!(lines[3], "a.test,90,9100,3,2000,99.9%,2025/10/20 06:30:05");
        assert_eq!(exporter.render_csv().await.expect("csv again"), csv);
    }

    #[tokio::test]
    async fn exporter_on_empty_store_is_header_only() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::open(dir.path().join("stats.sqlite3")).await.expect("open");
        let csv = CsvExporter::new(store, tokyo()).render_csv().await.expect("csv");
        assert_eq!(csv, format!("{CSV_HEADER}\n"));
    }
}
