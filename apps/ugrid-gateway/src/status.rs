//! Read view over the latest telemetry, device-reported extras and live
//! objectives.

use crate::codec::DeviceSnapshot;
use crate::control::Objective;
use crate::economics::profit_eur_per_hour;
use crate::error::PersistenceError;
use crate::store::{Store, TelemetryRecord};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

pub const DEFAULT_EXTRAS_CAPACITY: usize = 1024;

type BatteryKey = (String, u32);

/// Ephemeral fields the device reports but the store does not keep.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatteryExtras {
    pub state: Option<String>,
    pub ip: Option<String>,
}

/// Bounded map; when full the oldest inserted key goes first. Updating an
/// existing key keeps its position.
#[derive(Debug)]
pub struct ExtrasCache {
    capacity: usize,
    entries: HashMap<BatteryKey, BatteryExtras>,
    order: VecDeque<BatteryKey>,
}

impl ExtrasCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn insert(&mut self, endpoint_id: &str, battery_index: u32, extras: BatteryExtras) {
        let key = (endpoint_id.to_string(), battery_index);
        if let Some(slot) = self.entries.get_mut(&key) {
            *slot = extras;
            return;
        }
        while self.entries.len() >= self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
        }
        self.order.push_back(key.clone());
        self.entries.insert(key, extras);
    }

    pub fn get(&self, endpoint_id: &str, battery_index: u32) -> Option<&BatteryExtras> {
        self.entries.get(&(endpoint_id.to_string(), battery_index))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObjectiveView {
    pub mode: &'static str,
    pub target_soc: Option<f64>,
    pub created_at: DateTime<Utc>,
}

impl From<&Objective> for ObjectiveView {
    fn from(objective: &Objective) -> Self {
        Self {
            mode: objective.mode.as_str(),
            target_soc: objective.mode.target_soc(),
            created_at: objective.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatteryStatus {
    pub index: u32,
    pub recorded_at: DateTime<Utc>,
    pub soc: Option<f64>,
    pub soh: Option<f64>,
    pub voltage: Option<f64>,
    pub current: Option<f64>,
    pub temperature_c: Option<f64>,
    pub power_kw: Option<f64>,
    pub optimal_u_kw: Option<f64>,
    pub profit_eur: Option<f64>,
    pub state: Option<String>,
    pub ip: Option<String>,
    pub objective: Option<ObjectiveView>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EndpointStatus {
    pub load_kw: Option<f64>,
    pub pv_kw: Option<f64>,
    pub grid_power_kw: Option<f64>,
    pub price_eur_per_kwh: f64,
    pub profit_eur_interval: Option<f64>,
    pub profit_eur_per_hour: Option<f64>,
    pub batteries: Vec<BatteryStatus>,
}

#[derive(Debug)]
pub struct StatusAggregator {
    store: Store,
    extras: Mutex<ExtrasCache>,
    default_price: f64,
}

impl StatusAggregator {
    pub fn new(store: Store, extras_capacity: usize, default_price: f64) -> Self {
        Self {
            store,
            extras: Mutex::new(ExtrasCache::new(extras_capacity)),
            default_price,
        }
    }

    pub fn record_extras(&self, endpoint_id: &str, snapshot: &DeviceSnapshot) {
        let Ok(mut cache) = self.extras.lock() else {
            tracing::warn!("extras cache lock poisoned");
            return;
        };
        for reading in &snapshot.batteries {
            cache.insert(
                endpoint_id,
                reading.index,
                BatteryExtras {
                    state: reading.device_state.as_ref().map(|state| state.as_str().to_string()),
                    ip: reading.reported_ip.clone(),
                },
            );
        }
    }

    pub fn extras(&self, endpoint_id: &str, battery_index: u32) -> BatteryExtras {
        self.extras
            .lock()
            .ok()
            .and_then(|cache| cache.get(endpoint_id, battery_index).cloned())
            .unwrap_or_default()
    }

    /// Keyed by endpoint id; only endpoints with telemetry appear.
    pub fn snapshot(&self) -> Result<BTreeMap<String, EndpointStatus>, PersistenceError> {
        let latest = self.store.latest_telemetry()?;
        let objectives: HashMap<BatteryKey, Objective> = self
            .store
            .all_objectives()?
            .into_iter()
            .map(|objective| ((objective.endpoint_id.clone(), objective.battery_index), objective))
            .collect();

        let mut grouped: BTreeMap<String, Vec<TelemetryRecord>> = BTreeMap::new();
        for record in latest {
            grouped.entry(record.endpoint_id.clone()).or_default().push(record);
        }

        let mut view = BTreeMap::new();
        for (endpoint_id, records) in grouped {
            let price = self
                .store
                .control_params(&endpoint_id)?
                .map(|params| params.price)
                .unwrap_or(self.default_price);
            let status = self.endpoint_status(&endpoint_id, records, &objectives, price);
            view.insert(endpoint_id, status);
        }
        Ok(view)
    }

    fn endpoint_status(
        &self,
        endpoint_id: &str,
        records: Vec<TelemetryRecord>,
        objectives: &HashMap<BatteryKey, Objective>,
        price: f64,
    ) -> EndpointStatus {
        let newest = records.iter().max_by_key(|record| record.id);
        let (load_kw, pv_kw, grid_power_kw) = newest
            .map(|record| (record.load_kw, record.pv_kw, record.grid_power_kw))
            .unwrap_or_default();

        let shares: Vec<f64> = records.iter().filter_map(|record| record.profit_eur).collect();
        let profit_eur_interval = (!shares.is_empty()).then(|| shares.iter().sum());

        let batteries = records
            .into_iter()
            .map(|record| {
                let extras = self.extras(endpoint_id, record.battery_index);
                let objective = objectives
                    .get(&(endpoint_id.to_string(), record.battery_index))
                    .map(ObjectiveView::from);
                BatteryStatus {
                    index: record.battery_index,
                    recorded_at: record.recorded_at,
                    soc: record.soc,
                    soh: record.soh,
                    voltage: record.voltage,
                    current: record.current,
                    temperature_c: record.temperature_c,
                    power_kw: record.power_kw,
                    optimal_u_kw: record.optimal_u_kw,
                    profit_eur: record.profit_eur,
                    state: extras.state,
                    ip: extras.ip,
                    objective,
                }
            })
            .collect();

        EndpointStatus {
            load_kw,
            pv_kw,
            grid_power_kw,
            price_eur_per_kwh: price,
            profit_eur_interval,
            profit_eur_per_hour: grid_power_kw.map(|grid| profit_eur_per_hour(grid, price)),
            batteries,
        }
    }
}
