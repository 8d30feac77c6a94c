//! Monitor lifecycle: creation, sampling loops, stop, removal, recovery.

use super::{
    ArchiveInfo, MonState, MonValueInfo, MonitorError, MonitorInfo, MonitorOpts, MonitorSummary,
    StrobeOpts,
};
use crate::db::{Counters, MonValue, Monitor, Store};
use crate::sampler::sample;
use crate::sensors::{ChannelRef, SensorRegistry};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

struct CellInner {
    mon: Monitor,
    state: MonState,
}

/// One registered monitor: shared persisted state plus the stop conduit.
///
/// The stop slot holds at most one signal; posting to a full or closed slot
/// is a no-op, which makes stop requests idempotent.
struct MonitorCell {
    inner: Mutex<CellInner>,
    stop_tx: mpsc::Sender<()>,
}

impl MonitorCell {
    fn new(mon: Monitor, state: MonState) -> (Arc<Self>, mpsc::Receiver<()>) {
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let cell = Arc::new(Self {
            inner: Mutex::new(CellInner { mon, state }),
            stop_tx,
        });
        (cell, stop_rx)
    }

    fn snapshot(&self) -> Monitor {
        self.inner.lock().unwrap().mon.clone()
    }
}

/// Table of registered monitors, keyed by uuid.
pub struct MonitorEngine {
    store: Store,
    registry: Arc<dyn SensorRegistry>,
    cells: RwLock<HashMap<Uuid, Arc<MonitorCell>>>,
}

impl MonitorEngine {
    pub fn new(store: Store, registry: Arc<dyn SensorRegistry>) -> Self {
        Self {
            store,
            registry,
            cells: RwLock::new(HashMap::new()),
        }
    }

    /// Create a monitor, persist it and start its sampling loop.
    pub fn start(&self, opts: MonitorOpts) -> Result<Uuid, MonitorError> {
        if opts.step == 0 {
            return Err(MonitorError::ZeroStep);
        }
        if let Some(stop_at) = opts.stop_at {
            if stop_at <= Utc::now() {
                return Err(MonitorError::StopInPast);
            }
        }

        let mut values = Vec::with_capacity(opts.channels.len());
        for (i, c) in opts.channels.iter().enumerate() {
            self.registry.available(&c.sensor, c.channel_idx)?;
            let name = self.registry.value_name(&c.sensor, c.channel_idx)?;
            values.push(MonValue {
                name: format!("{}{}", name, i),
                sensor: c.sensor.clone(),
                channel_idx: c.channel_idx,
            });
        }

        let mut mon = Monitor {
            id: 0,
            uuid: Uuid::new_v4(),
            exp_id: opts.exp_id,
            setup_id: opts.setup_id,
            step: opts.step,
            amount: opts.count,
            duration: opts.duration,
            created: Utc::now(),
            stop_at: opts.stop_at,
            active: true,
            values,
            counters: Counters::default(),
        };
        self.store.insert_monitor(&mut mon)?;

        let uuid = mon.uuid;
        self.run(mon);
        tracing::info!("monitor {} started", uuid);
        Ok(uuid)
    }

    /// Register a cell in Running state and spawn its producer loop.
    fn run(&self, mon: Monitor) {
        let uuid = mon.uuid;
        let (cell, stop_rx) = MonitorCell::new(mon, MonState::Running);
        self.cells.write().unwrap().insert(uuid, cell.clone());
        tokio::spawn(run_monitor_loop(
            self.store.clone(),
            self.registry.clone(),
            cell,
            stop_rx,
        ));
    }

    /// Request a stop and persist the inactive flag. Stopping an already
    /// inactive monitor succeeds without effect.
    pub fn stop(&self, uuid: &Uuid) -> Result<(), MonitorError> {
        let cell = self.lookup(uuid)?;
        let mon = {
            let mut inner = cell.inner.lock().unwrap();
            if inner.state == MonState::Inactive {
                return Ok(());
            }
            inner.state = MonState::Terminating;
            inner.mon.active = false;
            inner.mon.clone()
        };
        let _ = cell.stop_tx.try_send(());
        self.store.update_monitor(&mon)?;
        tracing::info!("monitor {} stop: ok", uuid);
        Ok(())
    }

    pub fn list(&self) -> Vec<MonitorSummary> {
        self.cells
            .read()
            .unwrap()
            .values()
            .map(|cell| {
                let inner = cell.inner.lock().unwrap();
                MonitorSummary {
                    active: inner.mon.active,
                    uuid: inner.mon.uuid,
                    created: inner.mon.created,
                    stop_at: inner.mon.stop_at,
                    values: inner.mon.values.clone(),
                }
            })
            .collect()
    }

    /// Assemble the full status of a monitor from store-backed counts.
    pub fn info(&self, uuid: &Uuid) -> Result<MonitorInfo, MonitorError> {
        let mon = self.snapshot(uuid)?;

        // counters as persisted, which may trail the in-flight tick
        let counters = self.store.load_counters(&mon.uuid)?;
        let archive_len = self.store.count_distinct_times(mon.id)?;
        let last = self.store.last_detection_time(mon.id)?;

        let mut values = Vec::with_capacity(mon.values.len());
        for v in &mon.values {
            let len = self
                .store
                .count_by_channel(mon.id, &v.sensor, v.channel_idx)?;
            values.push(MonValueInfo {
                name: v.name.clone(),
                sensor: v.sensor.clone(),
                channel_idx: v.channel_idx,
                len,
            });
        }

        Ok(MonitorInfo {
            active: mon.active,
            created: mon.created,
            stop_at: mon.stop_at,
            last,
            amount: mon.amount,
            duration: mon.duration,
            counters,
            archives: vec![ArchiveInfo {
                step: mon.step,
                len: archive_len,
            }],
            values,
        })
    }

    /// Stop a monitor if running, unregister it and delete its persisted
    /// state, conditionally with its detections.
    pub fn remove(&self, uuid: &Uuid, with_data: bool) -> Result<(), MonitorError> {
        let cell = self.lookup(uuid)?;
        if let Err(err) = self.stop(uuid) {
            tracing::warn!("error stopping monitor being removed: {}", err);
        }
        let mon = cell.snapshot();
        self.cells.write().unwrap().remove(uuid);
        self.store.delete_monitor(mon.id, &mon.uuid, with_data)?;
        tracing::info!("monitor {} removed", uuid);
        Ok(())
    }

    /// One-shot off-tick sample appended to the store without touching
    /// counters. Empty samples are silently ignored.
    pub fn strobe(&self, opts: StrobeOpts) -> Result<(), MonitorError> {
        let (exp_id, mon_id, values) = if let Some(uuid) = opts.uuid {
            let mon = self.snapshot(&uuid)?;
            (mon.exp_id, mon.id, mon.values)
        } else {
            let o = opts.opts.ok_or(MonitorError::EmptyStrobe)?;
            if opts.strict {
                if o.channels.is_empty() {
                    return Err(MonitorError::NoChannels);
                }
                for c in &o.channels {
                    self.registry.available(&c.sensor, c.channel_idx)?;
                }
            }
            let values = o
                .channels
                .iter()
                .map(|c| MonValue {
                    name: String::new(),
                    sensor: c.sensor.clone(),
                    channel_idx: c.channel_idx,
                })
                .collect();
            (o.exp_id, 0, values)
        };

        let store = self.store.clone();
        let registry = self.registry.clone();
        tokio::spawn(async move {
            let channels = channel_refs(&values);
            let reading = sample(&registry, &channels).await;
            if reading.values.is_empty() {
                return;
            }
            if let Err(err) =
                store.append_strobe(exp_id, mon_id, &values, reading.time, &reading.values)
            {
                tracing::error!("strobe: {}", err);
            }
        });
        Ok(())
    }

    /// Hydrate persisted monitors and resume every active one whose
    /// terminators have not fired; the rest are persisted inactive.
    pub fn load_run_monitors(&self) -> Result<(), MonitorError> {
        tracing::info!("loading monitors...");
        let ids = self.store.load_monitor_ids()?;

        let mut uuids = Vec::new();
        for id in ids {
            let mut mon = match self.store.load_monitor(id) {
                Ok(mon) => mon,
                Err(err) => {
                    tracing::error!("monitor {}: {}", id, err);
                    continue;
                }
            };
            uuids.push(mon.uuid.to_string());

            if mon.active && !mon.terminated(Utc::now()) {
                self.run(mon);
                continue;
            }

            if mon.active {
                // a terminator fired while the daemon was down
                mon.active = false;
                if let Err(err) = self.store.update_monitor(&mon) {
                    tracing::error!("monitor {}: {}", mon.uuid, err);
                }
            }
            let uuid = mon.uuid;
            let (cell, _stop_rx) = MonitorCell::new(mon, MonState::Inactive);
            self.cells.write().unwrap().insert(uuid, cell);
        }

        tracing::info!("found {} monitors: [{}]", uuids.len(), uuids.join(", "));
        Ok(())
    }

    fn lookup(&self, uuid: &Uuid) -> Result<Arc<MonitorCell>, MonitorError> {
        self.cells
            .read()
            .unwrap()
            .get(uuid)
            .cloned()
            .ok_or(MonitorError::UnknownMonitor(*uuid))
    }

    /// Copy of the current in-memory state of a monitor.
    pub(super) fn snapshot(&self, uuid: &Uuid) -> Result<Monitor, MonitorError> {
        Ok(self.lookup(uuid)?.snapshot())
    }

    pub(super) fn store(&self) -> &Store {
        &self.store
    }
}

fn channel_refs(values: &[MonValue]) -> Vec<ChannelRef> {
    values
        .iter()
        .map(|v| ChannelRef {
            sensor: v.sensor.clone(),
            channel_idx: v.channel_idx,
        })
        .collect()
}

/// Producer loop of one monitor.
///
/// Terminators are evaluated at each tick before sampling; a pending stop is
/// honored before sampling as well, so at most the tick already in flight is
/// persisted after a stop request. Detections carry the tick timestamp, so a
/// deadline-stopped monitor never has detections past its deadline.
async fn run_monitor_loop(
    store: Store,
    registry: Arc<dyn SensorRegistry>,
    cell: Arc<MonitorCell>,
    mut stop_rx: mpsc::Receiver<()>,
) {
    let (period, channels) = {
        let inner = cell.inner.lock().unwrap();
        (
            Duration::from_secs(inner.mon.step),
            channel_refs(&inner.mon.values),
        )
    };

    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop_rx.recv() => {
                // the stop requester already persisted the inactive flag
                set_inactive(&cell);
                return;
            }
            _ = ticker.tick() => {
                let tick_time = Utc::now();
                let fired = cell.inner.lock().unwrap().mon.terminated(tick_time);
                if fired {
                    finish(&store, &cell);
                    return;
                }
                if stop_rx.try_recv().is_ok() {
                    set_inactive(&cell);
                    return;
                }

                let reading = sample(&registry, &channels).await;
                let snapshot = cell.snapshot();
                match store.append_detections(&snapshot, tick_time, &reading.values) {
                    Ok(is_err) => {
                        let mut inner = cell.inner.lock().unwrap();
                        inner.mon.counters.done += 1;
                        if is_err {
                            inner.mon.counters.err += 1;
                        }
                    }
                    // tick aborted, counters not advanced
                    Err(err) => tracing::error!("monitor {}: {}", snapshot.uuid, err),
                }
            }
        }
    }
}

/// Self-termination: transition to Inactive and persist the flag.
fn finish(store: &Store, cell: &MonitorCell) {
    let mon = {
        let mut inner = cell.inner.lock().unwrap();
        inner.state = MonState::Inactive;
        inner.mon.active = false;
        inner.mon.clone()
    };
    if let Err(err) = store.update_monitor(&mon) {
        tracing::error!("monitor {}: {}", mon.uuid, err);
    }
    tracing::info!("monitor {} inactive", mon.uuid);
}

/// Observed an external stop; the persisted flag was written by `stop`.
/// Repeated signals coalesce into this one transition.
fn set_inactive(cell: &MonitorCell) {
    let mut inner = cell.inner.lock().unwrap();
    inner.state = MonState::Inactive;
    inner.mon.active = false;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensors::fake::{Behavior, FakeRegistry, FakeValue};
    use crate::sensors::SensorError;
    use crate::db::StoreError;

    fn fake_registry() -> Arc<dyn SensorRegistry> {
        Arc::new(
            FakeRegistry::new()
                .with_constant("ch1", "temperature", 21.5)
                .with_sensor(
                    "flaky",
                    vec![FakeValue::new(
                        "voltage",
                        Duration::from_millis(1),
                        Behavior::FailEveryOther(3.3),
                    )],
                ),
        )
    }

    fn engine() -> MonitorEngine {
        MonitorEngine::new(Store::open_in_memory().unwrap(), fake_registry())
    }

    fn channels(sensor: &str) -> Vec<ChannelRef> {
        vec![ChannelRef {
            sensor: sensor.to_string(),
            channel_idx: 0,
        }]
    }

    #[tokio::test]
    async fn start_persists_and_derives_value_names() {
        let engine = engine();
        let uuid = engine
            .start(MonitorOpts {
                exp_id: 5,
                step: 60,
                channels: channels("ch1"),
                ..Default::default()
            })
            .unwrap();

        let mon = engine.snapshot(&uuid).unwrap();
        assert!(mon.id > 0);
        assert!(mon.active);
        assert_eq!(mon.values.len(), 1);
        assert_eq!(mon.values[0].name, "temperature0");

        let persisted = engine.store.load_monitor(mon.id).unwrap();
        assert_eq!(persisted.uuid, uuid);
        assert!(persisted.active);

        engine.stop(&uuid).unwrap();
    }

    #[tokio::test]
    async fn start_rejects_past_deadline_and_bad_channels() {
        let engine = engine();
        assert!(matches!(
            engine.start(MonitorOpts {
                stop_at: Some(Utc::now() - chrono::Duration::seconds(1)),
                channels: channels("ch1"),
                ..Default::default()
            }),
            Err(MonitorError::StopInPast)
        ));
        assert!(matches!(
            engine.start(MonitorOpts {
                channels: channels("missing"),
                ..Default::default()
            }),
            Err(MonitorError::Sensor(SensorError::NoSensor(_)))
        ));
        assert!(matches!(
            engine.start(MonitorOpts {
                step: 0,
                channels: channels("ch1"),
                ..Default::default()
            }),
            Err(MonitorError::ZeroStep)
        ));
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_persists_inactive() {
        let engine = engine();
        let uuid = engine
            .start(MonitorOpts {
                step: 60,
                channels: channels("ch1"),
                ..Default::default()
            })
            .unwrap();

        engine.stop(&uuid).unwrap();
        engine.stop(&uuid).unwrap();
        engine.stop(&uuid).unwrap();

        let mon = engine.snapshot(&uuid).unwrap();
        assert!(!mon.active);
        assert!(!engine.store.load_monitor(mon.id).unwrap().active);

        assert!(matches!(
            engine.stop(&Uuid::new_v4()),
            Err(MonitorError::UnknownMonitor(_))
        ));
    }

    #[tokio::test]
    async fn ticks_append_detections_and_count_errors() {
        let engine = engine();
        let uuid = engine
            .start(MonitorOpts {
                step: 1,
                count: 4,
                channels: channels("flaky"),
                ..Default::default()
            })
            .unwrap();

        // flaky alternates ok/err per read: 4 ticks -> done=4, err=2
        tokio::time::sleep(Duration::from_millis(7000)).await;

        let info = engine.info(&uuid).unwrap();
        assert!(!info.active);
        assert_eq!(info.counters.done, 4);
        assert_eq!(info.counters.err, 2);
        assert_eq!(info.archives.len(), 1);
        assert_eq!(info.archives[0].len, 4);
        assert_eq!(info.values[0].len, 4);
        assert!(info.last.is_some());

        let mon = engine.snapshot(&uuid).unwrap();
        let rows = engine.store.fetch_detections(mon.id, None, None).unwrap();
        assert_eq!(rows.len(), 4);
        let failed: Vec<_> = rows.iter().filter(|r| r.value.is_none()).collect();
        assert_eq!(failed.len(), 2);
        assert!(failed.iter().all(|r| r.error.as_deref() == Some("NaN")));
    }

    #[tokio::test]
    async fn deadline_terminates_loop() {
        let engine = engine();
        let uuid = engine
            .start(MonitorOpts {
                step: 1,
                stop_at: Some(Utc::now() + chrono::Duration::seconds(2)),
                channels: channels("ch1"),
                ..Default::default()
            })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(3500)).await;

        let info = engine.info(&uuid).unwrap();
        assert!(!info.active);
        assert!(info.counters.done <= 2);
        let mon = engine.snapshot(&uuid).unwrap();
        if let Some(last) = engine.store.last_detection_time(mon.id).unwrap() {
            assert!(last <= mon.stop_at.unwrap());
        }
    }

    #[tokio::test]
    async fn recovery_resumes_live_monitors_and_retires_expired_ones() {
        let store = Store::open_in_memory().unwrap();
        let registry = fake_registry();

        // seed the store as a previous daemon run would have left it
        let first = MonitorEngine::new(store.clone(), registry.clone());
        let live = first
            .start(MonitorOpts {
                step: 1,
                count: 50,
                channels: channels("ch1"),
                ..Default::default()
            })
            .unwrap();
        let done = first
            .start(MonitorOpts {
                step: 60,
                count: 2,
                channels: channels("ch1"),
                ..Default::default()
            })
            .unwrap();
        // simulate completed ticks beyond the amount
        {
            let mon = first.snapshot(&done).unwrap();
            store.append_detections(&mon, Utc::now(), &[1.0]).unwrap();
            store.append_detections(&mon, Utc::now(), &[1.0]).unwrap();
        }
        first.stop(&live).unwrap();
        // let the stopped loop drain before rewriting its row
        tokio::time::sleep(Duration::from_millis(200)).await;

        // reset the live flag to simulate a crash mid-run
        {
            let live_id = first.snapshot(&live).unwrap().id;
            let mut mon = store.load_monitor(live_id).unwrap();
            mon.active = true;
            store.update_monitor(&mon).unwrap();
        }

        let second = MonitorEngine::new(store.clone(), registry);
        second.load_run_monitors().unwrap();

        let summaries = second.list();
        assert_eq!(summaries.len(), 2);
        let live_entry = summaries.iter().find(|m| m.uuid == live).unwrap();
        let done_entry = summaries.iter().find(|m| m.uuid == done).unwrap();
        assert!(live_entry.active);
        // its amount was reached offline, so it never re-enters Running
        assert!(!done_entry.active);
        let done_mon = second.snapshot(&done).unwrap();
        assert!(!store.load_monitor(done_mon.id).unwrap().active);

        // identity survived the restart
        let live_mon = second.snapshot(&live).unwrap();
        assert_eq!(live_mon.step, 1);
        assert_eq!(live_mon.amount, 50);
        assert_eq!(live_mon.values[0].name, "temperature0");

        second.stop(&live).unwrap();
    }

    #[tokio::test]
    async fn remove_then_info_fails() {
        let engine = engine();
        let uuid = engine
            .start(MonitorOpts {
                step: 60,
                channels: channels("ch1"),
                ..Default::default()
            })
            .unwrap();
        let mon_id = engine.snapshot(&uuid).unwrap().id;

        engine.remove(&uuid, true).unwrap();
        assert!(matches!(
            engine.info(&uuid),
            Err(MonitorError::UnknownMonitor(_))
        ));
        assert!(matches!(
            engine.store.load_monitor(mon_id),
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn strobe_without_monitor_appends_rows_only() {
        let engine = engine();
        engine
            .strobe(StrobeOpts {
                uuid: None,
                opts: Some(MonitorOpts {
                    exp_id: 42,
                    channels: channels("ch1"),
                    ..Default::default()
                }),
                strict: false,
            })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;

        let rows = engine.store.fetch_detections(0, None, None).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, Some(21.5));

        // strict mode validates availability
        assert!(matches!(
            engine.strobe(StrobeOpts {
                uuid: None,
                opts: Some(MonitorOpts {
                    channels: channels("missing"),
                    ..Default::default()
                }),
                strict: true,
            }),
            Err(MonitorError::Sensor(SensorError::NoSensor(_)))
        ));
        assert!(matches!(
            engine.strobe(StrobeOpts::default()),
            Err(MonitorError::EmptyStrobe)
        ));
    }
}
