//! In-memory sensor registry for engine tests.

use super::{DataRange, SensorError, SensorRegistry, ValueInfo};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Scripted behavior of one fake channel.
pub enum Behavior {
    /// Always return this value.
    Value(f64),
    /// Return the value on even calls, an error on odd calls.
    FailEveryOther(f64),
    /// Every read fails.
    AlwaysFail,
}

pub struct FakeValue {
    name: String,
    resolution: Duration,
    behavior: Behavior,
    calls: AtomicU64,
}

impl FakeValue {
    pub fn new(name: &str, resolution: Duration, behavior: Behavior) -> Self {
        Self {
            name: name.to_string(),
            resolution,
            behavior,
            calls: AtomicU64::new(0),
        }
    }
}

/// A registry whose sensors and readings are fixed at construction.
#[derive(Default)]
pub struct FakeRegistry {
    sensors: HashMap<String, Vec<FakeValue>>,
}

impl FakeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sensor(mut self, id: &str, values: Vec<FakeValue>) -> Self {
        self.sensors.insert(id.to_string(), values);
        self
    }

    /// Shorthand for a single-channel sensor with a constant reading.
    pub fn with_constant(self, id: &str, name: &str, value: f64) -> Self {
        self.with_sensor(
            id,
            vec![FakeValue::new(name, Duration::from_millis(1), Behavior::Value(value))],
        )
    }
}

impl SensorRegistry for FakeRegistry {
    fn rescan(&self) -> Result<(), SensorError> {
        Ok(())
    }

    fn list(&self) -> BTreeMap<String, Vec<ValueInfo>> {
        self.sensors
            .iter()
            .map(|(id, values)| {
                let infos = values
                    .iter()
                    .map(|v| ValueInfo {
                        name: v.name.clone(),
                        range: DataRange::default(),
                        resolution: v.resolution.as_millis() as u64,
                    })
                    .collect();
                (id.clone(), infos)
            })
            .collect()
    }

    fn channel_count(&self, sensor: &str) -> Option<usize> {
        self.sensors.get(sensor).map(|v| v.len())
    }

    fn value_name(&self, sensor: &str, idx: usize) -> Result<String, SensorError> {
        self.available(sensor, idx)?;
        Ok(self.sensors[sensor][idx].name.clone())
    }

    fn resolution(&self, sensor: &str, idx: usize) -> Result<Duration, SensorError> {
        self.available(sensor, idx)?;
        Ok(self.sensors[sensor][idx].resolution)
    }

    fn read(&self, sensor: &str, idx: usize) -> Result<f64, SensorError> {
        self.available(sensor, idx)?;
        let value = &self.sensors[sensor][idx];
        let call = value.calls.fetch_add(1, Ordering::SeqCst);
        match value.behavior {
            Behavior::Value(v) => Ok(v),
            Behavior::FailEveryOther(v) => {
                if call % 2 == 0 {
                    Ok(v)
                } else {
                    Err(SensorError::Read("scripted failure".to_string()))
                }
            }
            Behavior::AlwaysFail => Err(SensorError::Read("scripted failure".to_string())),
        }
    }
}
