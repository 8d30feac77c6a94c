//! Persisted model types.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// One persisted channel of a monitor.
///
/// `name` is derived at creation from the sensor's channel name suffixed
/// with the channel's position within the monitor; fetched rows are aligned
/// back to the monitor's value order through it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonValue {
    pub name: String,
    pub sensor: String,
    pub channel_idx: usize,
}

/// Tick counters of a monitor.
///
/// `done` counts completed ticks; `err` additionally counts ticks that
/// produced any missing value, so `err <= done` always holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    pub done: u64,
    pub err: u64,
}

/// A persistent sampling job.
#[derive(Debug, Clone)]
pub struct Monitor {
    /// Store-assigned row id; 0 before the first save.
    pub id: i64,
    pub uuid: Uuid,
    pub exp_id: i64,
    pub setup_id: i64,
    /// Sampling period, seconds.
    pub step: u64,
    /// Target number of ticks; 0 means unbounded.
    pub amount: u64,
    /// Informational lifetime in seconds; termination uses `stop_at`.
    pub duration: u64,
    pub created: DateTime<Utc>,
    /// Deadline; `None` means no deadline.
    pub stop_at: Option<DateTime<Utc>>,
    pub active: bool,
    pub values: Vec<MonValue>,
    pub counters: Counters,
}

impl Monitor {
    /// Whether any terminator fires at the given instant.
    pub fn terminated(&self, at: DateTime<Utc>) -> bool {
        if let Some(stop_at) = self.stop_at {
            if at >= stop_at {
                return true;
            }
        }
        self.amount > 0 && self.counters.done >= self.amount
    }
}

/// One fetched detection row.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionRow {
    pub time: DateTime<Utc>,
    pub sensor: String,
    pub channel_idx: usize,
    /// `None` when the read failed; `error` is `"NaN"` in that case.
    pub value: Option<f64>,
    pub error: Option<String>,
}
