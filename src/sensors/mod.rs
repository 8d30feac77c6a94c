//! Sensor registry: definitions, discovery and readback.
//!
//! The rest of the daemon only talks to [`SensorRegistry`]; the sysfs-backed
//! implementation lives here, tests substitute an in-memory fake.

pub mod defs;
mod readback;
mod scan;

#[cfg(test)]
pub mod fake;

pub use defs::{load_sensor_defs, DataRange, SensorDef};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;

/// Identifies one readable channel on an attached sensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelRef {
    pub sensor: String,
    pub channel_idx: usize,
}

#[derive(Error, Debug)]
pub enum SensorError {
    #[error("no sensor '{0}' connected")]
    NoSensor(String),
    #[error("no value {idx} for sensor '{sensor}' available")]
    NoChannel { sensor: String, idx: usize },
    #[error("read failed: {0}")]
    Read(String),
}

/// Channel description reported by `ListSensors`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueInfo {
    pub name: String,
    pub range: DataRange,
    /// Minimum sampling interval, milliseconds.
    pub resolution: u64,
}

/// Attached-sensor catalogue and value readback.
///
/// `read` is blocking; async callers go through `spawn_blocking`.
pub trait SensorRegistry: Send + Sync {
    /// Re-run hardware discovery.
    fn rescan(&self) -> Result<(), SensorError>;

    /// All attached sensors with their channel descriptions.
    fn list(&self) -> BTreeMap<String, Vec<ValueInfo>>;

    /// Number of channels of an attached sensor, `None` when not attached.
    fn channel_count(&self, sensor: &str) -> Option<usize>;

    /// Declared channel name, used to derive persisted value names.
    fn value_name(&self, sensor: &str, idx: usize) -> Result<String, SensorError>;

    /// Minimum sampling interval of a channel.
    fn resolution(&self, sensor: &str, idx: usize) -> Result<Duration, SensorError>;

    /// Read one channel value.
    fn read(&self, sensor: &str, idx: usize) -> Result<f64, SensorError>;

    /// Check that a channel exists, with the precise failure kind.
    fn available(&self, sensor: &str, idx: usize) -> Result<(), SensorError> {
        match self.channel_count(sensor) {
            None => Err(SensorError::NoSensor(sensor.to_string())),
            Some(n) if idx >= n => Err(SensorError::NoChannel {
                sensor: sensor.to_string(),
                idx,
            }),
            Some(_) => Ok(()),
        }
    }
}

/// One detected sensor instance: the definition plus its bus address.
#[derive(Debug, Clone)]
pub struct PluggedSensor {
    pub address: u64,
    pub def: Arc<SensorDef>,
}

/// Sysfs-backed registry over 1-Wire and I²C buses.
pub struct SysfsRegistry {
    defs: Vec<Arc<SensorDef>>,
    i2c_buses: Vec<u32>,
    plugged: RwLock<std::collections::HashMap<String, PluggedSensor>>,
}

impl SysfsRegistry {
    pub fn new(defs: Vec<SensorDef>, i2c_buses: Vec<u32>) -> Self {
        Self {
            defs: defs.into_iter().map(Arc::new).collect(),
            i2c_buses,
            plugged: RwLock::new(std::collections::HashMap::new()),
        }
    }

    fn plugged_sensor(&self, sensor: &str) -> Option<PluggedSensor> {
        self.plugged.read().unwrap().get(sensor).cloned()
    }

    /// Fetch a sensor once and validate the channel index against it.
    fn checked(&self, sensor: &str, idx: usize) -> Result<PluggedSensor, SensorError> {
        let s = self
            .plugged_sensor(sensor)
            .ok_or_else(|| SensorError::NoSensor(sensor.to_string()))?;
        if idx >= s.def.values.len() {
            return Err(SensorError::NoChannel {
                sensor: sensor.to_string(),
                idx,
            });
        }
        Ok(s)
    }
}

impl SensorRegistry for SysfsRegistry {
    fn rescan(&self) -> Result<(), SensorError> {
        tracing::info!("searching for sensors...");
        let found = scan::scan(&self.defs, &self.i2c_buses);
        tracing::info!("found {} sensors", found.len());
        *self.plugged.write().unwrap() = found;
        Ok(())
    }

    fn list(&self) -> BTreeMap<String, Vec<ValueInfo>> {
        self.plugged
            .read()
            .unwrap()
            .iter()
            .map(|(id, sensor)| {
                let values = sensor
                    .def
                    .values
                    .iter()
                    .map(|v| ValueInfo {
                        name: v.name.clone(),
                        range: v.range,
                        resolution: v.resolution.as_millis() as u64,
                    })
                    .collect();
                (id.clone(), values)
            })
            .collect()
    }

    fn channel_count(&self, sensor: &str) -> Option<usize> {
        self.plugged_sensor(sensor).map(|s| s.def.values.len())
    }

    fn value_name(&self, sensor: &str, idx: usize) -> Result<String, SensorError> {
        let s = self.checked(sensor, idx)?;
        Ok(s.def.values[idx].name.clone())
    }

    fn resolution(&self, sensor: &str, idx: usize) -> Result<Duration, SensorError> {
        let s = self.checked(sensor, idx)?;
        Ok(s.def.values[idx].resolution)
    }

    fn read(&self, sensor: &str, idx: usize) -> Result<f64, SensorError> {
        let s = self.checked(sensor, idx)?;
        readback::read_value(&s, idx)
    }
}
