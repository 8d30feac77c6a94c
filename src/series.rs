//! Series engine: transient, finite-count sampling jobs.
//!
//! A series owns one producer task ticking at a fixed period and writing
//! into a bounded in-memory buffer. The producer never blocks on the buffer:
//! when it is full the oldest reading is dropped, so an unconsumed series
//! loses data rather than stalling the sampling loop. Readings are handed to
//! exactly one consumer, which drains whatever is buffered at call time.

use crate::config::SeriesConf;
use crate::reading::Reading;
use crate::sampler::sample;
use crate::sensors::{ChannelRef, SensorError, SensorRegistry};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum SeriesError {
    #[error("series pool is busy")]
    PoolBusy,
    #[error("no sensors selected")]
    NoChannels,
    #[error("period must be greater than zero")]
    ZeroPeriod,
    #[error("count must be greater than zero")]
    ZeroCount,
    #[error("cannot read values so quickly")]
    TooFast,
    #[error(transparent)]
    Sensor(#[from] SensorError),
    #[error("unknown series {0}")]
    UnknownSeries(Uuid),
}

/// Series status as reported by `ListSeries`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesStatus {
    pub uuid: Uuid,
    pub stopped: bool,
    pub finished: bool,
    pub buffer_len: usize,
}

/// A running or completed series.
struct SeriesRecord {
    buf: Mutex<VecDeque<Reading>>,
    cap: usize,
    stop_tx: mpsc::Sender<()>,
    /// Set by an explicit stop; natural completion sets `finished` instead.
    stopped: AtomicBool,
    finished: AtomicBool,
}

impl SeriesRecord {
    /// Enqueue one reading, dropping the oldest buffered one when full.
    fn push(&self, reading: Reading) {
        let mut buf = self.buf.lock().unwrap();
        if buf.len() == self.cap {
            buf.pop_front();
        }
        buf.push_back(reading);
    }
}

/// Pool of transient sampling series.
pub struct SeriesEngine {
    registry: Arc<dyn SensorRegistry>,
    conf: SeriesConf,
    records: RwLock<HashMap<Uuid, Arc<SeriesRecord>>>,
}

impl SeriesEngine {
    pub fn new(registry: Arc<dyn SensorRegistry>, conf: SeriesConf) -> Self {
        Self {
            registry,
            conf,
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Start a new series of `count` readings taken once per `period`.
    ///
    /// Finished series stay in the pool until removed, so a full pool
    /// refuses new series rather than garbage-collecting old ones.
    pub fn start(
        &self,
        channels: Vec<ChannelRef>,
        period: Duration,
        count: u64,
    ) -> Result<Uuid, SeriesError> {
        if self.records.read().unwrap().len() >= self.conf.pool {
            return Err(SeriesError::PoolBusy);
        }

        if channels.is_empty() {
            return Err(SeriesError::NoChannels);
        }
        if period.is_zero() {
            return Err(SeriesError::ZeroPeriod);
        }
        if count == 0 {
            return Err(SeriesError::ZeroCount);
        }
        for c in &channels {
            self.registry.available(&c.sensor, c.channel_idx)?;
            if self.registry.resolution(&c.sensor, c.channel_idx)? > period {
                return Err(SeriesError::TooFast);
            }
        }

        let (stop_tx, stop_rx) = mpsc::channel(1);
        let record = Arc::new(SeriesRecord {
            buf: Mutex::new(VecDeque::with_capacity(self.conf.buffer)),
            cap: self.conf.buffer,
            stop_tx,
            stopped: AtomicBool::new(false),
            finished: AtomicBool::new(false),
        });

        let uuid = Uuid::new_v4();
        self.records.write().unwrap().insert(uuid, record.clone());

        let registry = self.registry.clone();
        tokio::spawn(run_series_loop(registry, channels, period, count, record, stop_rx));

        Ok(uuid)
    }

    /// Cancel a series. Stopping an already stopped or finished series is a
    /// successful no-op.
    pub fn stop(&self, uuid: &Uuid) -> Result<(), SeriesError> {
        let record = self.lookup(uuid)?;
        // the slot may already be full or the producer gone; both are fine
        let _ = record.stop_tx.try_send(());
        record.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Drain the currently buffered readings. Does not wait for more;
    /// callers may poll repeatedly.
    pub fn get(&self, uuid: &Uuid) -> Result<Vec<Reading>, SeriesError> {
        let record = self.lookup(uuid)?;
        let mut buf = record.buf.lock().unwrap();
        Ok(buf.drain(..).collect())
    }

    pub fn list(&self) -> Vec<SeriesStatus> {
        self.records
            .read()
            .unwrap()
            .iter()
            .map(|(uuid, record)| SeriesStatus {
                uuid: *uuid,
                stopped: record.stopped.load(Ordering::SeqCst),
                finished: record.finished.load(Ordering::SeqCst),
                buffer_len: record.buf.lock().unwrap().len(),
            })
            .collect()
    }

    /// Stop a series if running, then drop it from the pool.
    pub fn remove(&self, uuid: &Uuid) -> Result<(), SeriesError> {
        self.stop(uuid)?;
        self.records.write().unwrap().remove(uuid);
        Ok(())
    }

    /// Stop and remove every series.
    pub fn clean(&self) {
        let mut records = self.records.write().unwrap();
        for record in records.values() {
            let _ = record.stop_tx.try_send(());
            record.stopped.store(true, Ordering::SeqCst);
        }
        records.clear();
        tracing::info!("all series removed");
    }

    fn lookup(&self, uuid: &Uuid) -> Result<Arc<SeriesRecord>, SeriesError> {
        self.records
            .read()
            .unwrap()
            .get(uuid)
            .cloned()
            .ok_or(SeriesError::UnknownSeries(*uuid))
    }
}

async fn run_series_loop(
    registry: Arc<dyn SensorRegistry>,
    channels: Vec<ChannelRef>,
    period: Duration,
    count: u64,
    record: Arc<SeriesRecord>,
    mut stop_rx: mpsc::Receiver<()>,
) {
    // first reading lands one full period after start
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut remaining = count;
    loop {
        tokio::select! {
            _ = stop_rx.recv() => {
                record.stopped.store(true, Ordering::SeqCst);
                return;
            }
            _ = ticker.tick() => {
                let reading = sample(&registry, &channels).await;
                record.push(reading);

                // a stop posted while sampling wins over the countdown
                if stop_rx.try_recv().is_ok() {
                    record.stopped.store(true, Ordering::SeqCst);
                    return;
                }
                remaining -= 1;
                if remaining == 0 {
                    record.finished.store(true, Ordering::SeqCst);
                    return;
                }
            }
        }
    }
}
