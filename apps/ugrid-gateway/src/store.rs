//! SQLite persistence: telemetry, objectives, control parameters, alerts.
//!
//! One connection behind a mutex; every call holds the lock for a single
//! statement or a short read, so writers never interleave.

use crate::alerts::Alert;
use crate::control::{Objective, ObjectiveMode};
use crate::error::PersistenceError;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

type StoreResult<T> = Result<T, PersistenceError>;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS telemetry (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    endpoint_id TEXT NOT NULL,
    battery_index INTEGER NOT NULL,
    recorded_at TEXT NOT NULL,
    soc REAL,
    soh REAL,
    voltage REAL,
    current REAL,
    temperature_c REAL,
    power_kw REAL,
    optimal_u_kw REAL,
    device_state TEXT,
    grid_power_kw REAL,
    load_kw REAL,
    pv_kw REAL,
    profit_eur REAL
);
CREATE INDEX IF NOT EXISTS telemetry_endpoint_battery_id
    ON telemetry (endpoint_id, battery_index, id);
CREATE TABLE IF NOT EXISTS objectives (
    endpoint_id TEXT NOT NULL,
    battery_index INTEGER NOT NULL,
    mode TEXT NOT NULL,
    target_soc REAL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (endpoint_id, battery_index)
);
CREATE TABLE IF NOT EXISTS control_params (
    endpoint_id TEXT PRIMARY KEY,
    alpha REAL NOT NULL,
    beta REAL NOT NULL,
    gamma REAL NOT NULL,
    price REAL NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS alerts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    level TEXT NOT NULL,
    endpoint_id TEXT,
    battery_index INTEGER,
    message TEXT NOT NULL,
    payload TEXT,
    created_at TEXT NOT NULL
);
"#;

const DROP_SCHEMA: &str = r#"
DROP TABLE IF EXISTS telemetry;
DROP TABLE IF EXISTS objectives;
DROP TABLE IF EXISTS control_params;
DROP TABLE IF EXISTS alerts;
"#;

const TELEMETRY_COLUMNS: &str = "id, endpoint_id, battery_index, recorded_at, soc, soh, voltage, \
     current, temperature_c, power_kw, optimal_u_kw, device_state, grid_power_kw, load_kw, pv_kw, \
     profit_eur";

/// One persisted battery sample plus the derived economics of its cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryRecord {
    /// Assigned by the store; ignored on insert.
    pub id: i64,
    pub endpoint_id: String,
    pub battery_index: u32,
    pub recorded_at: DateTime<Utc>,
    pub soc: Option<f64>,
    pub soh: Option<f64>,
    pub voltage: Option<f64>,
    pub current: Option<f64>,
    pub temperature_c: Option<f64>,
    pub power_kw: Option<f64>,
    pub optimal_u_kw: Option<f64>,
    pub device_state: Option<String>,
    pub grid_power_kw: Option<f64>,
    pub load_kw: Option<f64>,
    pub pv_kw: Option<f64>,
    pub profit_eur: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControlParams {
    pub endpoint_id: String,
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
    /// EUR/kWh
    pub price: f64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertRecord {
    pub id: i64,
    pub level: String,
    pub endpoint_id: Option<String>,
    pub battery_index: Option<u32>,
    pub message: String,
    pub payload: Option<JsonValue>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl Store {
    pub fn open(path: impl AsRef<Path>, drop_schema: bool) -> StoreResult<Self> {
        let conn = Connection::open(path.as_ref())?;
        Self::init(conn, drop_schema)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::init(Connection::open_in_memory()?, false)
    }

    fn init(conn: Connection, drop_schema: bool) -> StoreResult<Self> {
        if drop_schema {
            tracing::warn!("dropping gateway tables before startup");
            conn.execute_batch(DROP_SCHEMA)?;
        }
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| PersistenceError::Poisoned)
    }

    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> StoreResult<()> {
        self.conn()?.execute_batch(sql)?;
        Ok(())
    }

    pub fn insert_telemetry(&self, record: &TelemetryRecord) -> StoreResult<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO telemetry (endpoint_id, battery_index, recorded_at, soc, soh, voltage, \
             current, temperature_c, power_kw, optimal_u_kw, device_state, grid_power_kw, load_kw, \
             pv_kw, profit_eur) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                record.endpoint_id,
                record.battery_index,
                timestamp(&record.recorded_at),
                record.soc,
                record.soh,
                record.voltage,
                record.current,
                record.temperature_c,
                record.power_kw,
                record.optimal_u_kw,
                record.device_state,
                record.grid_power_kw,
                record.load_kw,
                record.pv_kw,
                record.profit_eur,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Newest row per (endpoint, battery), ordered by endpoint then battery.
    pub fn latest_telemetry(&self) -> StoreResult<Vec<TelemetryRecord>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {TELEMETRY_COLUMNS} FROM telemetry WHERE id IN ( \
                 SELECT MAX(id) FROM telemetry GROUP BY endpoint_id, battery_index \
             ) ORDER BY endpoint_id, battery_index"
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map([], |row| Ok(read_telemetry(row)))?;
        collect_rows(rows)
    }

    /// Newest first.
    pub fn telemetry_history(
        &self,
        endpoint_id: &str,
        battery_index: u32,
        limit: usize,
    ) -> StoreResult<Vec<TelemetryRecord>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {TELEMETRY_COLUMNS} FROM telemetry \
             WHERE endpoint_id = ?1 AND battery_index = ?2 ORDER BY id DESC LIMIT ?3"
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(params![endpoint_id, battery_index, limit as i64], |row| {
            Ok(read_telemetry(row))
        })?;
        collect_rows(rows)
    }

    /// Replaces whatever objective the battery had.
    pub fn upsert_objective(&self, objective: &Objective) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO objectives (endpoint_id, battery_index, mode, target_soc, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT (endpoint_id, battery_index) DO UPDATE SET \
                 mode = excluded.mode, target_soc = excluded.target_soc, created_at = excluded.created_at",
            params![
                objective.endpoint_id,
                objective.battery_index,
                objective.mode.as_str(),
                objective.mode.target_soc(),
                timestamp(&objective.created_at),
            ],
        )?;
        Ok(())
    }

    /// Returns whether a row was removed.
    pub fn delete_objective(&self, endpoint_id: &str, battery_index: u32) -> StoreResult<bool> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM objectives WHERE endpoint_id = ?1 AND battery_index = ?2",
            params![endpoint_id, battery_index],
        )?;
        Ok(removed > 0)
    }

    /// Removes the objective only if it is still the one that was applied;
    /// a newer upsert for the same battery survives.
    pub fn delete_objective_if(&self, objective: &Objective) -> StoreResult<bool> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM objectives WHERE endpoint_id = ?1 AND battery_index = ?2 AND created_at = ?3",
            params![
                objective.endpoint_id,
                objective.battery_index,
                timestamp(&objective.created_at),
            ],
        )?;
        Ok(removed > 0)
    }

    pub fn objective(&self, endpoint_id: &str, battery_index: u32) -> StoreResult<Option<Objective>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT endpoint_id, battery_index, mode, target_soc, created_at FROM objectives \
             WHERE endpoint_id = ?1 AND battery_index = ?2",
        )?;
        let row = stmt
            .query_row(params![endpoint_id, battery_index], |row| Ok(read_objective(row)))
            .optional()?;
        row.transpose()
    }

    pub fn objectives_for_endpoint(&self, endpoint_id: &str) -> StoreResult<Vec<Objective>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT endpoint_id, battery_index, mode, target_soc, created_at FROM objectives \
             WHERE endpoint_id = ?1 ORDER BY battery_index",
        )?;
        let rows = stmt.query_map(params![endpoint_id], |row| Ok(read_objective(row)))?;
        collect_rows(rows)
    }

    pub fn all_objectives(&self) -> StoreResult<Vec<Objective>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT endpoint_id, battery_index, mode, target_soc, created_at FROM objectives \
             ORDER BY endpoint_id, battery_index",
        )?;
        let rows = stmt.query_map([], |row| Ok(read_objective(row)))?;
        collect_rows(rows)
    }

    pub fn upsert_control_params(&self, params: &ControlParams) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO control_params (endpoint_id, alpha, beta, gamma, price, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT (endpoint_id) DO UPDATE SET alpha = excluded.alpha, beta = excluded.beta, \
                 gamma = excluded.gamma, price = excluded.price, updated_at = excluded.updated_at",
            params![
                params.endpoint_id,
                params.alpha,
                params.beta,
                params.gamma,
                params.price,
                timestamp(&params.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn control_params(&self, endpoint_id: &str) -> StoreResult<Option<ControlParams>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT endpoint_id, alpha, beta, gamma, price, updated_at FROM control_params \
             WHERE endpoint_id = ?1",
        )?;
        let row = stmt
            .query_row(params![endpoint_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, f64>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, f64>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })
            .optional()?;
        row.map(|(endpoint_id, alpha, beta, gamma, price, updated_at)| {
            Ok(ControlParams {
                endpoint_id,
                alpha,
                beta,
                gamma,
                price,
                updated_at: parse_timestamp("control_params", &updated_at)?,
            })
        })
        .transpose()
    }

    pub fn insert_alert(&self, alert: &Alert) -> StoreResult<i64> {
        let payload = alert
            .payload
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|err| PersistenceError::Corrupt {
                table: "alerts",
                reason: err.to_string(),
            })?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO alerts (level, endpoint_id, battery_index, message, payload, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                alert.level.as_str(),
                alert.endpoint_id,
                alert.battery_index,
                alert.message,
                payload,
                timestamp(&alert.created_at),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Newest first.
    pub fn recent_alerts(&self, limit: usize) -> StoreResult<Vec<AlertRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT id, level, endpoint_id, battery_index, message, payload, created_at FROM alerts \
             ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| Ok(read_alert(row)))?;
        collect_rows(rows)
    }
}

fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(table: &'static str, raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|err| PersistenceError::Corrupt {
            table,
            reason: format!("bad timestamp {raw:?}: {err}"),
        })
}

/// Flattens sqlite errors and row-level decode errors into one result.
fn collect_rows<T>(
    rows: impl Iterator<Item = rusqlite::Result<StoreResult<T>>>,
) -> StoreResult<Vec<T>> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row??);
    }
    Ok(out)
}

fn read_telemetry(row: &Row<'_>) -> StoreResult<TelemetryRecord> {
    let recorded_at: String = row.get(3)?;
    Ok(TelemetryRecord {
        id: row.get(0)?,
        endpoint_id: row.get(1)?,
        battery_index: row.get(2)?,
        recorded_at: parse_timestamp("telemetry", &recorded_at)?,
        soc: row.get(4)?,
        soh: row.get(5)?,
        voltage: row.get(6)?,
        current: row.get(7)?,
        temperature_c: row.get(8)?,
        power_kw: row.get(9)?,
        optimal_u_kw: row.get(10)?,
        device_state: row.get(11)?,
        grid_power_kw: row.get(12)?,
        load_kw: row.get(13)?,
        pv_kw: row.get(14)?,
        profit_eur: row.get(15)?,
    })
}

fn read_objective(row: &Row<'_>) -> StoreResult<Objective> {
    let mode: String = row.get(2)?;
    let target_soc: Option<f64> = row.get(3)?;
    let created_at: String = row.get(4)?;
    let mode = ObjectiveMode::from_parts(&mode, target_soc).map_err(|err| PersistenceError::Corrupt {
        table: "objectives",
        reason: err.to_string(),
    })?;
    Ok(Objective {
        endpoint_id: row.get(0)?,
        battery_index: row.get(1)?,
        mode,
        created_at: parse_timestamp("objectives", &created_at)?,
    })
}

fn read_alert(row: &Row<'_>) -> StoreResult<AlertRecord> {
    let payload: Option<String> = row.get(5)?;
    let created_at: String = row.get(6)?;
    let payload = payload
        .map(|raw| serde_json::from_str::<JsonValue>(&raw))
        .transpose()
        .map_err(|err| PersistenceError::Corrupt {
            table: "alerts",
            reason: err.to_string(),
        })?;
    Ok(AlertRecord {
        id: row.get(0)?,
        level: row.get(1)?,
        endpoint_id: row.get(2)?,
        battery_index: row.get(3)?,
        message: row.get(4)?,
        payload,
        created_at: parse_timestamp("alerts", &created_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertLevel;
    use crate::test_support::telemetry_row;
    use serde_json::json;

    #[test]
    fn latest_telemetry_picks_newest_row_per_battery() {
        let store = Store::open_in_memory().unwrap();
        store.insert_telemetry(&telemetry_row("ug1", 0, Some(0.50))).unwrap();
        store.insert_telemetry(&telemetry_row("ug1", 1, Some(0.80))).unwrap();
        store.insert_telemetry(&telemetry_row("ug1", 0, Some(0.45))).unwrap();
        store.insert_telemetry(&telemetry_row("ug2", 0, Some(0.10))).unwrap();

        let latest = store.latest_telemetry().unwrap();
        let view: Vec<(&str, u32, Option<f64>)> = latest
            .iter()
            .map(|r| (r.endpoint_id.as_str(), r.battery_index, r.soc))
            .collect();
        assert_eq!(
            view,
            vec![("ug1", 0, Some(0.45)), ("ug1", 1, Some(0.80)), ("ug2", 0, Some(0.10))]
        );
    }

    #[test]
    fn history_is_newest_first_and_limited() {
        let store = Store::open_in_memory().unwrap();
        for soc in [0.9, 0.8, 0.7, 0.6] {
            store.insert_telemetry(&telemetry_row("ug1", 2, Some(soc))).unwrap();
        }
        let history = store.telemetry_history("ug1", 2, 3).unwrap();
        let socs: Vec<Option<f64>> = history.iter().map(|r| r.soc).collect();
        assert_eq!(socs, vec![Some(0.6), Some(0.7), Some(0.8)]);
        assert!(store.telemetry_history("ug1", 3, 10).unwrap().is_empty());
    }

    #[test]
    fn objective_upsert_replaces_and_delete_clears() {
        let store = Store::open_in_memory().unwrap();
        let first = Objective::new("ug1", 0, ObjectiveMode::FullDischarge);
        store.upsert_objective(&first).unwrap();
        let second = Objective::new("ug1", 0, ObjectiveMode::TargetSoc { target_soc: 0.6 });
        store.upsert_objective(&second).unwrap();

        let all = store.all_objectives().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].mode, ObjectiveMode::TargetSoc { target_soc: 0.6 });
        assert_eq!(store.objectives_for_endpoint("ug1").unwrap().len(), 1);
        assert!(store.objectives_for_endpoint("ug2").unwrap().is_empty());

        assert!(store.delete_objective("ug1", 0).unwrap());
        assert!(!store.delete_objective("ug1", 0).unwrap());
        assert_eq!(store.objective("ug1", 0).unwrap(), None);
    }

    #[test]
    fn conditional_delete_spares_a_newer_objective() {
        let store = Store::open_in_memory().unwrap();
        let applied = Objective::new("ug1", 4, ObjectiveMode::Detach);
        store.upsert_objective(&applied).unwrap();

        let mut replacement = Objective::new("ug1", 4, ObjectiveMode::TargetSoc { target_soc: 0.6 });
        replacement.created_at = applied.created_at + chrono::Duration::seconds(1);
        store.upsert_objective(&replacement).unwrap();

        assert!(!store.delete_objective_if(&applied).unwrap());
        let kept = store.objective("ug1", 4).unwrap().unwrap();
        assert_eq!(kept.mode, ObjectiveMode::TargetSoc { target_soc: 0.6 });

        assert!(store.delete_objective_if(&kept).unwrap());
        assert_eq!(store.objective("ug1", 4).unwrap(), None);
    }

    #[test]
    fn control_params_are_last_write_wins() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.control_params("ug1").unwrap(), None);
        let mut params = ControlParams {
            endpoint_id: "ug1".into(),
            alpha: 0.5,
            beta: 1.0,
            gamma: 0.1,
            price: 0.25,
            updated_at: Utc::now(),
        };
        store.upsert_control_params(&params).unwrap();
        params.price = 0.31;
        store.upsert_control_params(&params).unwrap();
        let stored = store.control_params("ug1").unwrap().unwrap();
        assert_eq!(stored.price, 0.31);
        assert_eq!(stored.alpha, 0.5);
    }

    #[test]
    fn alerts_round_trip_with_payload() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_alert(&Alert::new(AlertLevel::Info, "gateway started"))
            .unwrap();
        store
            .insert_alert(
                &Alert::new(AlertLevel::Critical, "high temperature")
                    .for_battery("ug1", 3)
                    .with_payload(json!({"temperature_c": 55.0})),
            )
            .unwrap();

        let alerts = store.recent_alerts(10).unwrap();
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].level, "critical");
        assert_eq!(alerts[0].battery_index, Some(3));
        assert_eq!(alerts[0].payload, Some(json!({"temperature_c": 55.0})));
        assert_eq!(alerts[1].endpoint_id, None);
        assert_eq!(store.recent_alerts(1).unwrap().len(), 1);
    }

    #[test]
    fn reopening_with_drop_schema_clears_tables() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.db");
        {
            let store = Store::open(&path, false).unwrap();
            store.insert_telemetry(&telemetry_row("ug1", 0, Some(0.5))).unwrap();
        }
        let kept = Store::open(&path, false).unwrap();
        assert_eq!(kept.latest_telemetry().unwrap().len(), 1);
        drop(kept);

        let fresh = Store::open(&path, true).unwrap();
        assert!(fresh.latest_telemetry().unwrap().is_empty());
    }
}
