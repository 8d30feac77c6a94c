//! Monitor engine: long-lived persistent sampling jobs.
//!
//! A monitor survives daemon restarts: its definition, channel list and
//! counters live in the store, detections are appended tick by tick, and
//! recovery at startup resumes every job whose terminators have not fired.

mod data;
mod engine;

pub use engine::MonitorEngine;

use crate::db::{Counters, MonValue, StoreError};
use crate::reading::{rfc3339_nanos, rfc3339_nanos_opt};
use crate::sensors::{ChannelRef, SensorError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("monitor stop time is in the past")]
    StopInPast,
    #[error("step must be greater than zero")]
    ZeroStep,
    #[error("no sensors selected")]
    NoChannels,
    #[error("empty strobe parameters")]
    EmptyStrobe,
    #[error("unknown monitor {0}")]
    UnknownMonitor(Uuid),
    #[error(transparent)]
    Sensor(#[from] SensorError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Lifecycle state of a monitor's sampling loop.
///
/// Removal is not a state: a removed monitor simply leaves the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonState {
    /// No sampling loop scheduled.
    Inactive,
    /// Producer loop running.
    Running,
    /// Stop signalled, loop has not yet observed it.
    Terminating,
}

/// Creation parameters for `StartMonitor` (and synthesized strobes).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MonitorOpts {
    pub exp_id: i64,
    pub setup_id: i64,
    /// Sampling period, seconds.
    pub step: u64,
    /// Target tick count; 0 means unbounded.
    pub count: u64,
    /// Informational lifetime, seconds.
    pub duration: u64,
    #[serde(with = "rfc3339_nanos_opt")]
    pub stop_at: Option<DateTime<Utc>>,
    pub channels: Vec<ChannelRef>,
}

impl Default for MonitorOpts {
    fn default() -> Self {
        Self {
            exp_id: 0,
            setup_id: 0,
            step: 1,
            count: 0,
            duration: 0,
            stop_at: None,
            channels: Vec::new(),
        }
    }
}

/// Strobe parameters: reference a stored monitor or synthesize a transient
/// one from `opts`, validating channel availability iff `strict`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StrobeOpts {
    pub uuid: Option<Uuid>,
    pub opts: Option<MonitorOpts>,
    pub strict: bool,
}

/// One monitor as reported by `ListMonitors`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorSummary {
    pub active: bool,
    pub uuid: Uuid,
    #[serde(with = "rfc3339_nanos")]
    pub created: DateTime<Utc>,
    #[serde(with = "rfc3339_nanos_opt")]
    pub stop_at: Option<DateTime<Utc>>,
    pub values: Vec<MonValue>,
}

/// Stored size of one archive. A monitor keeps a single archive at its
/// natural step; the list shape is part of the API.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveInfo {
    pub step: u64,
    pub len: u64,
}

/// Per-channel detection count.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonValueInfo {
    pub name: String,
    pub sensor: String,
    pub channel_idx: usize,
    pub len: u64,
}

/// Full monitor status as reported by `GetMonInfo`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorInfo {
    pub active: bool,
    #[serde(with = "rfc3339_nanos")]
    pub created: DateTime<Utc>,
    #[serde(with = "rfc3339_nanos_opt")]
    pub stop_at: Option<DateTime<Utc>>,
    /// Time of the most recent detection.
    #[serde(with = "rfc3339_nanos_opt")]
    pub last: Option<DateTime<Utc>>,
    pub amount: u64,
    pub duration: u64,
    pub counters: Counters,
    pub archives: Vec<ArchiveInfo>,
    pub values: Vec<MonValueInfo>,
}
