//! RPC operation set: wire types and method dispatch.
//!
//! Requests are JSON objects `{method, params, id}`; `params` is either the
//! bare argument or a one-element array wrapping it. Errors travel in the
//! response's error slot as strings.

use crate::monitor::{MonitorEngine, MonitorOpts, StrobeOpts};
use crate::reading::{rfc3339_nanos, rfc3339_nanos_opt, wire_float, Reading};
use crate::sensors::{ChannelRef, SensorRegistry, ValueInfo};
use crate::series::SeriesEngine;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Process-wide service object behind all listeners.
pub struct Lab {
    pub registry: Arc<dyn SensorRegistry>,
    pub series: Arc<SeriesEngine>,
    pub monitors: Arc<MonitorEngine>,
}

/// One sensor as reported by `ListSensors`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiSensor {
    pub values: Vec<ValueInfo>,
}

/// Result of `GetData`: one immediate reading of one channel.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Data {
    #[serde(with = "rfc3339_nanos")]
    pub time: DateTime<Utc>,
    #[serde(with = "wire_float")]
    pub reading: f64,
}

/// Parameters of `StartSeries`. `period` is in milliseconds.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SeriesOpts {
    pub channels: Vec<ChannelRef>,
    pub period: u64,
    pub count: u64,
}

/// Parameters of `GetMonData`. `step` is accepted for API compatibility;
/// data always comes back at its natural sampling step.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MonFetchOpts {
    pub uuid: Option<Uuid>,
    #[serde(with = "rfc3339_nanos_opt")]
    pub start: Option<DateTime<Utc>>,
    #[serde(with = "rfc3339_nanos_opt")]
    pub end: Option<DateTime<Utc>>,
    pub step: u64,
}

/// Parameters of `RemoveMonitor`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MonRemoveOpts {
    pub uuid: Option<Uuid>,
    pub with_data: bool,
}

impl Default for MonRemoveOpts {
    fn default() -> Self {
        Self {
            uuid: None,
            with_data: false,
        }
    }
}

/// Unwrap the single positional parameter and decode it.
fn param<T: DeserializeOwned>(params: Value) -> Result<T, String> {
    let value = match params {
        Value::Array(mut items) => {
            if items.is_empty() {
                Value::Null
            } else {
                items.swap_remove(0)
            }
        }
        other => other,
    };
    serde_json::from_value(value).map_err(|e| format!("invalid parameters: {e}"))
}

fn encode<T: Serialize>(value: T) -> Result<Value, String> {
    serde_json::to_value(value).map_err(|e| format!("encoding response: {e}"))
}

fn need_uuid(uuid: Option<Uuid>) -> Result<Uuid, String> {
    uuid.ok_or_else(|| "missing uuid".to_string())
}

/// Dispatch one call to the engines. The method name may carry a service
/// prefix (`Lab.StartSeries`), which is ignored.
pub async fn dispatch(lab: &Arc<Lab>, method: &str, params: Value) -> Result<Value, String> {
    let method = method.rsplit('.').next().unwrap_or(method);
    match method {
        "GetData" => {
            let c: ChannelRef = param(params)?;
            let registry = lab.registry.clone();
            let reading = tokio::task::spawn_blocking(move || {
                registry.read(&c.sensor, c.channel_idx)
            })
            .await
            .map_err(|e| format!("read task failed: {e}"))?
            .map_err(|e| e.to_string())?;
            encode(Data {
                time: Utc::now(),
                reading,
            })
        }
        "ListSensors" => {
            let rescan: Option<bool> = param(params)?;
            if rescan.unwrap_or(false) {
                lab.registry.rescan().map_err(|e| e.to_string())?;
            }
            let sensors: BTreeMap<String, ApiSensor> = lab
                .registry
                .list()
                .into_iter()
                .map(|(id, values)| (id, ApiSensor { values }))
                .collect();
            encode(sensors)
        }
        "StartSeries" => {
            let opts: SeriesOpts = param(params)?;
            let uuid = lab
                .series
                .start(opts.channels, Duration::from_millis(opts.period), opts.count)
                .map_err(|e| e.to_string())?;
            encode(uuid)
        }
        "StopSeries" => {
            let uuid: Uuid = param(params)?;
            lab.series.stop(&uuid).map_err(|e| e.to_string())?;
            encode(true)
        }
        "GetSeries" => {
            let uuid: Uuid = param(params)?;
            let readings = lab.series.get(&uuid).map_err(|e| e.to_string())?;
            encode(readings)
        }
        "ListSeries" => encode(lab.series.list()),
        "RemoveSeries" => {
            let uuid: Uuid = param(params)?;
            lab.series.remove(&uuid).map_err(|e| e.to_string())?;
            encode(true)
        }
        "CleanSeries" => {
            lab.series.clean();
            encode(true)
        }
        "StartMonitor" => {
            let opts: MonitorOpts = param(params)?;
            let uuid = lab.monitors.start(opts).map_err(|e| e.to_string())?;
            tracing::info!("StartMonitor: started {}", uuid);
            encode(uuid)
        }
        "StopMonitor" => {
            let uuid: Uuid = param(params)?;
            lab.monitors.stop(&uuid).map_err(|e| e.to_string())?;
            encode(true)
        }
        "ListMonitors" => encode(lab.monitors.list()),
        "GetMonInfo" => {
            let uuid: Uuid = param(params)?;
            let info = lab.monitors.info(&uuid).map_err(|e| e.to_string())?;
            encode(info)
        }
        "RemoveMonitor" => {
            let opts: MonRemoveOpts = param(params)?;
            let uuid = need_uuid(opts.uuid)?;
            lab.monitors
                .remove(&uuid, opts.with_data)
                .map_err(|e| e.to_string())?;
            encode(true)
        }
        "StrobeMonitor" => {
            let opts: StrobeOpts = param(params)?;
            lab.monitors.strobe(opts).map_err(|e| e.to_string())?;
            encode(true)
        }
        "GetMonData" => {
            let opts: MonFetchOpts = param(params)?;
            let uuid = need_uuid(opts.uuid)?;
            let readings: Vec<Reading> = lab
                .monitors
                .fetch_data(&uuid, opts.start, opts.end)
                .map_err(|e| e.to_string())?;
            encode(readings)
        }
        other => Err(format!("unknown method '{other}'")),
    }
}
