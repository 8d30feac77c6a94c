//! SQLite detection store implementation.
//!
//! Every public operation is one transaction: on any error the transaction
//! is rolled back and the original error surfaces, so the store is never
//! left partially updated. Static statements go through the connection's
//! prepared-statement cache and live until the store is dropped; only the
//! batched per-tick inserts are built per call.

use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, types::Value as SqlValue, Connection, OptionalExtension};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use super::models::*;
use crate::config::DatabaseConf;
use crate::reading::rfc3339_nanos;

/// Store error types.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("unknown database type '{0}'")]
    Unsupported(String),
    #[error("monitor not found")]
    NotFound,
    #[error("bad stored time '{0}'")]
    BadTime(String),
    #[error("bad stored uuid '{0}'")]
    BadUuid(String),
    #[error("error removing monitor {mon_id}: {details}")]
    Remove { mon_id: i64, details: String },
}

/// Thread-safe detection store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open the configured backend, create the schema and apply the
    /// connection prelude.
    pub fn open(cfg: &DatabaseConf) -> Result<Self, StoreError> {
        if cfg.backend != "sqlite" {
            return Err(StoreError::Unsupported(cfg.backend.clone()));
        }
        let conn = Connection::open(&cfg.dsn)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// In-memory store for tests.
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))?;

        // Connection prelude. Unknown pragmas are ignored by SQLite itself;
        // real failures abort startup.
        conn.busy_timeout(Duration::from_secs(50))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "cache_size", 32768)?;
        conn.pragma_update(None, "foreign_keys", "OFF")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "temp_store", "MEMORY")?;
        Ok(())
    }

    // --- Monitors ---

    /// Ids of all persisted monitors, in creation order.
    pub fn load_monitor_ids(&self) -> Result<Vec<i64>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached("SELECT id FROM monitors ORDER BY id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(ids)
    }

    /// Load one monitor with its values and counters.
    pub fn load_monitor(&self, id: i64) -> Result<Monitor, StoreError> {
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;

        let row = {
            let mut stmt = tx.prepare_cached(
                "SELECT uuid, exp_id, setup_id, interval, amount, duration, created, stopat, active
                 FROM monitors WHERE id = ?1",
            )?;
            stmt.query_row(params![id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, u64>(3)?,
                    row.get::<_, u64>(4)?,
                    row.get::<_, u64>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, Option<String>>(7)?,
                    row.get::<_, bool>(8)?,
                ))
            })
            .optional()?
        };
        let Some((uuid, exp_id, setup_id, step, amount, duration, created, stopat, active)) = row
        else {
            return Err(StoreError::NotFound);
        };

        let uuid = Uuid::parse_str(&uuid).map_err(|_| StoreError::BadUuid(uuid.clone()))?;
        let created = parse_time(&created)?;
        let stop_at = match stopat.as_deref() {
            None | Some("") => None,
            Some(s) => Some(parse_time(s)?),
        };

        let values = {
            let mut stmt = tx.prepare_cached(
                "SELECT name, sensor, channelidx FROM monitors_values WHERE uuid = ?1 ORDER BY rowid",
            )?;
            let result = stmt
                .query_map(params![uuid.to_string()], |row| {
                    Ok(MonValue {
                        name: row.get(0)?,
                        sensor: row.get(1)?,
                        channel_idx: row.get::<_, i64>(2)? as usize,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            result
        };

        let counters = query_counters(&tx, &uuid.to_string())?;

        tx.commit()?;

        Ok(Monitor {
            id,
            uuid,
            exp_id,
            setup_id,
            step,
            amount,
            duration,
            created,
            stop_at,
            active,
            values,
            counters,
        })
    }

    /// Current persisted counters of a monitor.
    pub fn load_counters(&self, uuid: &Uuid) -> Result<Counters, StoreError> {
        let conn = self.conn.lock().unwrap();
        query_counters(&conn, &uuid.to_string())
    }

    /// Insert a new monitor with its values and a zeroed counter row;
    /// assigns and returns the new id.
    pub fn insert_monitor(&self, mon: &mut Monitor) -> Result<i64, StoreError> {
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;

        let id = {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO monitors (uuid, exp_id, setup_id, interval, amount, duration, created, stopat, active)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            stmt.execute(params![
                mon.uuid.to_string(),
                mon.exp_id,
                mon.setup_id,
                mon.step,
                mon.amount,
                mon.duration,
                format_time(&mon.created),
                mon.stop_at.as_ref().map(format_time),
                mon.active,
            ])?;
            tx.last_insert_rowid()
        };

        if !mon.values.is_empty() {
            let mut sql =
                String::from("INSERT INTO monitors_values (uuid, name, sensor, channelidx) VALUES ");
            let mut args: Vec<SqlValue> = Vec::with_capacity(mon.values.len() * 4);
            for (i, v) in mon.values.iter().enumerate() {
                if i > 0 {
                    sql.push(',');
                }
                sql.push_str("(?, ?, ?, ?)");
                args.push(SqlValue::Text(mon.uuid.to_string()));
                args.push(SqlValue::Text(v.name.clone()));
                args.push(SqlValue::Text(v.sensor.clone()));
                args.push(SqlValue::Integer(v.channel_idx as i64));
            }
            tx.execute(&sql, params_from_iter(args))?;
        }

        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO monitors_counters (uuid, done, err) VALUES (?1, 0, 0)",
            )?;
            stmt.execute(params![mon.uuid.to_string()])?;
        }

        tx.commit()?;
        mon.id = id;
        Ok(id)
    }

    /// Full upsert of a monitor row by id. The values list is fixed at
    /// creation and not touched here.
    pub fn update_monitor(&self, mon: &Monitor) -> Result<(), StoreError> {
        if mon.id == 0 {
            return Err(StoreError::NotFound);
        }
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO monitors (id, uuid, exp_id, setup_id, interval, amount, duration, created, stopat, active)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;
            stmt.execute(params![
                mon.id,
                mon.uuid.to_string(),
                mon.exp_id,
                mon.setup_id,
                mon.step,
                mon.amount,
                mon.duration,
                format_time(&mon.created),
                mon.stop_at.as_ref().map(format_time),
                mon.active,
            ])?;
        }
        tx.commit()?;
        Ok(())
    }

    // --- Detections ---

    /// Append one tick's readings as detection rows and bump the counters,
    /// atomically. Returns whether the tick counted as an error tick.
    pub fn append_detections(
        &self,
        mon: &Monitor,
        time: DateTime<Utc>,
        readings: &[f64],
    ) -> Result<bool, StoreError> {
        debug_assert_eq!(readings.len(), mon.values.len());
        let is_err = readings.is_empty() || readings.iter().any(|v| v.is_nan());

        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;

        if !readings.is_empty() {
            let (sql, args) = detections_insert(mon.exp_id, mon.id, &mon.values, time, readings);
            tx.execute(&sql, params_from_iter(args))?;
        }

        {
            let mut stmt = tx.prepare_cached(
                "UPDATE monitors_counters SET done = done + 1, err = err + ?1 WHERE uuid = ?2",
            )?;
            stmt.execute(params![is_err as i64, mon.uuid.to_string()])?;
        }

        tx.commit()?;
        Ok(is_err)
    }

    /// Append one off-tick sample without touching counters. Empty samples
    /// are ignored.
    pub fn append_strobe(
        &self,
        exp_id: i64,
        mon_id: i64,
        values: &[MonValue],
        time: DateTime<Utc>,
        readings: &[f64],
    ) -> Result<(), StoreError> {
        if readings.is_empty() {
            return Ok(());
        }
        debug_assert_eq!(readings.len(), values.len());

        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;
        let (sql, args) = detections_insert(exp_id, mon_id, values, time, readings);
        tx.execute(&sql, params_from_iter(args))?;
        tx.commit()?;
        Ok(())
    }

    /// Fetch detections of a monitor ordered by `(time, sensor, channel)`.
    /// Bounds are inclusive; absent bounds select everything.
    pub fn fetch_detections(
        &self,
        mon_id: i64,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<DetectionRow>, StoreError> {
        let mut sql = String::from(
            "SELECT time, sensor_id, sensor_val_id, detection, error FROM detections WHERE mon_id = ?1",
        );
        let mut args: Vec<SqlValue> = vec![SqlValue::Integer(mon_id)];
        if let Some(start) = start {
            sql.push_str(" AND time >= ?");
            sql.push_str(&(args.len() + 1).to_string());
            args.push(SqlValue::Text(format_time(&start)));
        }
        if let Some(end) = end {
            sql.push_str(" AND time <= ?");
            sql.push_str(&(args.len() + 1).to_string());
            args.push(SqlValue::Text(format_time(&end)));
        }
        sql.push_str(" ORDER BY time, sensor_id, sensor_val_id");

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(args), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, Option<f64>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(time, sensor, idx, value, error)| {
                Ok(DetectionRow {
                    time: parse_time(&time)?,
                    sensor,
                    channel_idx: idx as usize,
                    value,
                    error,
                })
            })
            .collect()
    }

    /// Total number of detection rows of a monitor.
    pub fn count_detections(&self, mon_id: i64) -> Result<u64, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached("SELECT COUNT(*) FROM detections WHERE mon_id = ?1")?;
        Ok(stmt.query_row(params![mon_id], |row| row.get(0))?)
    }

    /// Number of distinct detection timestamps, i.e. persisted tick groups.
    pub fn count_distinct_times(&self, mon_id: i64) -> Result<u64, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT COUNT(*) FROM (SELECT time FROM detections WHERE mon_id = ?1 GROUP BY time)",
        )?;
        Ok(stmt.query_row(params![mon_id], |row| row.get(0))?)
    }

    /// Number of detection rows of one channel.
    pub fn count_by_channel(
        &self,
        mon_id: i64,
        sensor: &str,
        channel_idx: usize,
    ) -> Result<u64, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT COUNT(*) FROM detections WHERE mon_id = ?1 AND sensor_id = ?2 AND sensor_val_id = ?3",
        )?;
        Ok(stmt.query_row(params![mon_id, sensor, channel_idx as i64], |row| row.get(0))?)
    }

    /// Time of the most recent detection, if any.
    pub fn last_detection_time(&self, mon_id: i64) -> Result<Option<DateTime<Utc>>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT time FROM detections WHERE mon_id = ?1 ORDER BY time DESC LIMIT 1",
        )?;
        let time: Option<String> = stmt
            .query_row(params![mon_id], |row| row.get(0))
            .optional()?;
        time.as_deref().map(parse_time).transpose()
    }

    /// Delete a monitor's counters, values and configuration, and
    /// conditionally its detection rows.
    ///
    /// All deletes are attempted; on any failure the transaction is rolled
    /// back and a single aggregated error is returned.
    pub fn delete_monitor(
        &self,
        mon_id: i64,
        uuid: &Uuid,
        with_data: bool,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;
        let uuid = uuid.to_string();
        let mut errors: Vec<String> = Vec::new();

        if with_data {
            if let Err(e) = exec_cached(&tx, "DELETE FROM detections WHERE mon_id = ?1", params![mon_id]) {
                errors.push(format!("data: {e}"));
            }
        }
        if let Err(e) = exec_cached(&tx, "DELETE FROM monitors_values WHERE uuid = ?1", params![&uuid]) {
            errors.push(format!("values: {e}"));
        }
        if let Err(e) = exec_cached(&tx, "DELETE FROM monitors_counters WHERE uuid = ?1", params![&uuid]) {
            errors.push(format!("counters: {e}"));
        }
        if let Err(e) = exec_cached(&tx, "DELETE FROM monitors WHERE id = ?1", params![mon_id]) {
            errors.push(format!("configuration: {e}"));
        }

        if !errors.is_empty() {
            tx.rollback()?;
            return Err(StoreError::Remove {
                mon_id,
                details: errors.join("; "),
            });
        }
        tx.commit()?;
        Ok(())
    }
}

fn query_counters(conn: &Connection, uuid: &str) -> Result<Counters, StoreError> {
    let mut stmt =
        conn.prepare_cached("SELECT done, err FROM monitors_counters WHERE uuid = ?1")?;
    let counters = stmt
        .query_row(params![uuid], |row| {
            Ok(Counters {
                done: row.get(0)?,
                err: row.get(1)?,
            })
        })
        .optional()?
        .unwrap_or_default();
    Ok(counters)
}

fn exec_cached(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> rusqlite::Result<usize> {
    let mut stmt = conn.prepare_cached(sql)?;
    stmt.execute(params)
}

/// Build one batched insert statement with one row per channel.
fn detections_insert(
    exp_id: i64,
    mon_id: i64,
    values: &[MonValue],
    time: DateTime<Utc>,
    readings: &[f64],
) -> (String, Vec<SqlValue>) {
    let mut sql = String::from(
        "INSERT INTO detections (exp_id, mon_id, time, sensor_id, sensor_val_id, detection, error) VALUES ",
    );
    let time = format_time(&time);
    let mut args: Vec<SqlValue> = Vec::with_capacity(readings.len() * 7);
    for (i, (v, reading)) in values.iter().zip(readings).enumerate() {
        if i > 0 {
            sql.push(',');
        }
        sql.push_str("(?, ?, ?, ?, ?, ?, ?)");
        args.push(SqlValue::Integer(exp_id));
        args.push(SqlValue::Integer(mon_id));
        args.push(SqlValue::Text(time.clone()));
        args.push(SqlValue::Text(v.sensor.clone()));
        args.push(SqlValue::Integer(v.channel_idx as i64));
        if reading.is_nan() {
            args.push(SqlValue::Null);
            args.push(SqlValue::Text("NaN".to_string()));
        } else {
            args.push(SqlValue::Real(*reading));
            args.push(SqlValue::Null);
        }
    }
    (sql, args)
}

fn format_time(time: &DateTime<Utc>) -> String {
    rfc3339_nanos::format(time)
}

fn parse_time(s: &str) -> Result<DateTime<Utc>, StoreError> {
    rfc3339_nanos::parse(s).map_err(|_| StoreError::BadTime(s.to_string()))
}
