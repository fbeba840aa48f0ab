//! Core domain model, pipeline constants and clock abstraction for mstat.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "mstat-core";

/// Instances at or below this user count are never persisted.
pub const MIN_USERS_EXCLUSIVE: i64 = 5000;

pub const HOUR_MILLIS: i64 = 60 * 60 * 1000;
pub const DAY_MILLIS: i64 = 24 * HOUR_MILLIS;

/// How far back the delta report reads. Wider than a day so the prior day's
/// run is still inside the window when the scheduler fires late.
pub const REPORT_WINDOW_MILLIS: i64 = 30 * HOUR_MILLIS;

/// Allowed distance (inclusive) between a baseline candidate and `latest - 24h`.
pub const BASELINE_TOLERANCE_MILLIS: i64 = HOUR_MILLIS;

/// Normalized instance metrics as produced by a source, before persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub instance: String,
    pub score: i64,
    pub users: i64,
    pub statuses: i64,
    pub connections: i64,
    pub uptime: String,
}

/// One persisted row of the snapshot log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub id: i64,
    pub instance: String,
    pub score: i64,
    pub users: i64,
    pub statuses: i64,
    pub connections: i64,
    pub uptime: String,
    /// Ingestion time in epoch milliseconds.
    pub created_at: i64,
}

impl InstanceSnapshot {
    pub fn created_at_utc(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.created_at).single()
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn now_millis(&self) -> i64 {
        self.now().timestamp_millis()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to. Used to make window and baseline
/// matching deterministic.
#[derive(Debug)]
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    pub fn at_millis(millis: i64) -> Self {
        Self {
            millis: AtomicI64::new(millis),
        }
    }

    pub fn at(time: DateTime<Utc>) -> Self {
        Self::at_millis(time.timestamp_millis())
    }

    pub fn set_millis(&self, millis: i64) {
        self.millis.store(millis, Ordering::SeqCst);
    }

    pub fn advance_millis(&self, delta: i64) {
        self.millis.fetch_add(delta, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.now_millis())
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    fn now_millis(&self) -> i64 {
        self.millis.load(Ordering::SeqCst)
    }
}
