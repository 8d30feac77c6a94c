//! Detection fetch: rows regrouped into readings.

use super::{MonitorEngine, MonitorError};
use crate::reading::Reading;
use chrono::{DateTime, Utc};
use uuid::Uuid;

impl MonitorEngine {
    /// Fetch a monitor's detections and regroup contiguous rows of equal
    /// timestamp into readings aligned to the monitor's declared value
    /// order. Slots with no row or a failed read are NaN.
    ///
    /// Rows come back ordered by `(time, sensor, channel)`, so one pass
    /// suffices; the data keeps its natural sampling step.
    pub fn fetch_data(
        &self,
        uuid: &Uuid,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<Reading>, MonitorError> {
        let mon = self.snapshot(uuid)?;
        let rows = self.store().fetch_detections(mon.id, start, end)?;

        let names: Vec<&str> = mon.values.iter().map(|v| v.name.as_str()).collect();
        let mut readings: Vec<Reading> = Vec::new();

        for row in rows {
            if readings.last().map_or(true, |r| r.time != row.time) {
                readings.push(Reading {
                    time: row.time,
                    values: vec![f64::NAN; names.len()],
                });
            }
            let reading = readings.last_mut().expect("group exists");

            // rows are keyed by channel; the declared name links them to
            // their slot in the reading
            let declared = mon
                .values
                .iter()
                .find(|v| v.sensor == row.sensor && v.channel_idx == row.channel_idx);
            if let Some(declared) = declared {
                if let Some(slot) = names.iter().position(|n| *n == declared.name) {
                    reading.values[slot] = row.value.unwrap_or(f64::NAN);
                }
            }
        }

        Ok(readings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Store;
    use crate::monitor::MonitorOpts;
    use crate::sensors::fake::FakeRegistry;
    use crate::sensors::{ChannelRef, SensorRegistry};
    use std::sync::Arc;

    fn engine_with_two_channels() -> MonitorEngine {
        let registry: Arc<dyn SensorRegistry> = Arc::new(
            FakeRegistry::new()
                .with_constant("ch1", "temperature", 21.5)
                .with_constant("ch2", "humidity", 40.0),
        );
        MonitorEngine::new(Store::open_in_memory().unwrap(), registry)
    }

    #[tokio::test]
    async fn groups_rows_by_timestamp_in_value_order() {
        let engine = engine_with_two_channels();
        let uuid = engine
            .start(MonitorOpts {
                step: 60,
                channels: vec![
                    ChannelRef {
                        sensor: "ch1".to_string(),
                        channel_idx: 0,
                    },
                    ChannelRef {
                        sensor: "ch2".to_string(),
                        channel_idx: 0,
                    },
                ],
                ..Default::default()
            })
            .unwrap();
        engine.stop(&uuid).unwrap();

        let mon = engine.snapshot(&uuid).unwrap();
        let t0 = mon.created;
        let t1 = t0 + chrono::Duration::seconds(60);
        engine
            .store()
            .append_detections(&mon, t0, &[21.5, 40.0])
            .unwrap();
        engine
            .store()
            .append_detections(&mon, t1, &[22.0, f64::NAN])
            .unwrap();

        let readings = engine.fetch_data(&uuid, None, None).unwrap();
        assert_eq!(readings.len(), 2);

        assert_eq!(readings[0].time, t0);
        // value order follows the declared channel order, not row order
        assert_eq!(readings[0].values, vec![21.5, 40.0]);

        assert_eq!(readings[1].time, t1);
        assert_eq!(readings[1].values[0], 22.0);
        assert!(readings[1].values[1].is_nan());
    }

    #[tokio::test]
    async fn respects_bounds_and_unknown_monitor() {
        let engine = engine_with_two_channels();
        let uuid = engine
            .start(MonitorOpts {
                step: 60,
                channels: vec![ChannelRef {
                    sensor: "ch1".to_string(),
                    channel_idx: 0,
                }],
                ..Default::default()
            })
            .unwrap();
        engine.stop(&uuid).unwrap();

        let mon = engine.snapshot(&uuid).unwrap();
        let t0 = mon.created;
        for i in 0..3 {
            engine
                .store()
                .append_detections(&mon, t0 + chrono::Duration::seconds(i), &[i as f64])
                .unwrap();
        }

        let all = engine.fetch_data(&uuid, None, None).unwrap();
        assert_eq!(all.len(), 3);

        let tail = engine
            .fetch_data(&uuid, Some(t0 + chrono::Duration::seconds(1)), None)
            .unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].values, vec![1.0]);

        assert!(matches!(
            engine.fetch_data(&Uuid::new_v4(), None, None),
            Err(MonitorError::UnknownMonitor(_))
        ));
    }
}
