//! Concurrent channel sampling.
//!
//! Each tick fans out one blocking read per channel and collects the results
//! positionally, so tick latency equals the slowest individual read, not the
//! sum. Failed reads become NaN; the caller decides what an error means.

use crate::reading::Reading;
use crate::sensors::{ChannelRef, SensorRegistry};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Take one reading across the given channels.
///
/// Never fails: unknown sensors, out-of-range channels, read errors and
/// panicking reads all yield NaN in the corresponding slot.
pub async fn sample(registry: &Arc<dyn SensorRegistry>, channels: &[ChannelRef]) -> Reading {
    let time = Utc::now();

    let mut slots = Vec::with_capacity(channels.len());
    for channel in channels {
        let registry = registry.clone();
        let sensor = channel.sensor.clone();
        let idx = channel.channel_idx;
        let (tx, rx) = oneshot::channel();
        tokio::task::spawn_blocking(move || {
            let _ = tx.send(read_or_nan(registry.as_ref(), &sensor, idx));
        });
        slots.push(rx);
    }

    let mut values = Vec::with_capacity(channels.len());
    for slot in slots {
        // a dropped sender means the read panicked
        values.push(slot.await.unwrap_or(f64::NAN));
    }

    Reading { time, values }
}

fn read_or_nan(registry: &dyn SensorRegistry, sensor: &str, idx: usize) -> f64 {
    match registry.read(sensor, idx) {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!("read {}[{}]: {}", sensor, idx, err);
            f64::NAN
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensors::fake::{Behavior, FakeRegistry, FakeValue};
    use std::time::Duration;

    fn channel(sensor: &str, idx: usize) -> ChannelRef {
        ChannelRef {
            sensor: sensor.to_string(),
            channel_idx: idx,
        }
    }

    #[tokio::test]
    async fn collects_values_positionally() {
        let registry: Arc<dyn SensorRegistry> = Arc::new(
            FakeRegistry::new()
                .with_constant("a", "t", 1.0)
                .with_constant("b", "h", 2.0),
        );
        let reading = sample(&registry, &[channel("b", 0), channel("a", 0)]).await;
        assert_eq!(reading.values, vec![2.0, 1.0]);
    }

    #[tokio::test]
    async fn failures_become_nan() {
        let registry: Arc<dyn SensorRegistry> = Arc::new(
            FakeRegistry::new()
                .with_constant("good", "t", 3.5)
                .with_sensor(
                    "bad",
                    vec![FakeValue::new(
                        "t",
                        Duration::from_millis(1),
                        Behavior::AlwaysFail,
                    )],
                ),
        );
        let reading = sample(
            &registry,
            &[channel("good", 0), channel("bad", 0), channel("missing", 0)],
        )
        .await;
        assert_eq!(reading.values[0], 3.5);
        assert!(reading.values[1].is_nan());
        assert!(reading.values[2].is_nan());
    }

    #[tokio::test]
    async fn empty_channel_list_yields_empty_reading() {
        let registry: Arc<dyn SensorRegistry> = Arc::new(FakeRegistry::new());
        let reading = sample(&registry, &[]).await;
        assert!(reading.values.is_empty());
    }
}
