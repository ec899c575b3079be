//! Periodic device polling: fetch, decode, derive economics, persist,
//! alert and drive objectives, one endpoint at a time.

pub mod thresholds;


use crate::alerts::Alerter;
use crate::codec::{self, DeviceSnapshot};
use crate::control::{Decision, Objective, ObjectiveController};
use crate::device::{CommandPort, Endpoint};
use crate::economics::{self, EconomicsReport};
use crate::error::GatewayError;
use crate::status::StatusAggregator;
use crate::store::{Store, TelemetryRecord};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const SECONDS_PER_HOUR: f64 = 3600.0;

/// Counters for one pass over every endpoint.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub polled: usize,
    pub failed: Vec<String>,
    pub rows_written: usize,
    pub alerts: usize,
    pub objectives_applied: usize,
}

pub struct PollScheduler {
    endpoints: Vec<Endpoint>,
    commands: CommandPort,
    store: Store,
    status: Arc<StatusAggregator>,
    alerter: Alerter,
    controller: ObjectiveController,
    interval: Duration,
    default_price: f64,
    last_success: HashMap<String, Instant>,
}

impl PollScheduler {
    pub fn new(
        endpoints: Vec<Endpoint>,
        commands: CommandPort,
        store: Store,
        status: Arc<StatusAggregator>,
        alerter: Alerter,
        interval: Duration,
        default_price: f64,
    ) -> Self {
        let controller = ObjectiveController::new(commands.clone(), store.clone(), alerter.clone());
        Self {
            endpoints,
            commands,
            store,
            status,
            alerter,
            controller,
            interval,
            default_price,
            last_success: HashMap::new(),
        }
    }

    pub fn start(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    /// Polls until cancelled. Cancellation is observed between cycles.
    pub async fn run(mut self, cancel: CancellationToken) {
        tracing::info!(
            endpoints = self.endpoints.len(),
            interval_ms = self.interval.as_millis() as u64,
            "poll scheduler started"
        );
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let started = Instant::now();
            let report = self.poll_cycle().await;
            tracing::debug!(
                polled = report.polled,
                failed = report.failed.len(),
                rows = report.rows_written,
                alerts = report.alerts,
                objectives = report.objectives_applied,
                "poll cycle finished"
            );

            let pause = self.interval.saturating_sub(started.elapsed());
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }
        tracing::info!("poll scheduler stopped");
    }

    pub async fn poll_cycle(&mut self) -> CycleReport {
        let mut report = CycleReport::default();
        let endpoints = self.endpoints.clone();
        for endpoint in &endpoints {
            match self.poll_endpoint(endpoint, &mut report).await {
                Ok(()) => report.polled += 1,
                Err(err) => {
                    tracing::warn!(endpoint = %endpoint.id, error = %err, "poll failed");
                    report.failed.push(endpoint.id.clone());
                }
            }
        }
        report
    }

    async fn poll_endpoint(&mut self, endpoint: &Endpoint, report: &mut CycleReport) -> Result<(), GatewayError> {
        let payload = self.commands.fetch_state(endpoint).await?;
        let snapshot = codec::decode(&payload.body, payload.content_format)?;

        let now = Instant::now();
        let dt_hours = elapsed_hours(self.last_success.get(&endpoint.id).copied(), now, self.interval);
        self.last_success.insert(endpoint.id.clone(), now);

        let price = self.price_for(&endpoint.id);
        let economics = economics::assess(
            snapshot.load_kw,
            snapshot.pv_kw,
            &snapshot.battery_powers(),
            price,
            dt_hours,
        );
        tracing::debug!(
            endpoint = %endpoint.id,
            cnt = snapshot.sequence_counter,
            batteries = snapshot.batteries.len(),
            grid_kw = ?economics.grid_power_kw,
            profit_eur = ?economics.interval_profit_eur,
            "state decoded"
        );

        self.status.record_extras(&endpoint.id, &snapshot);
        self.persist(&endpoint.id, &snapshot, &economics, report);

        for reading in &snapshot.batteries {
            for alert in thresholds::evaluate(&endpoint.id, reading) {
                self.alerter.emit(alert);
                report.alerts += 1;
            }
        }

        let objectives: HashMap<u32, Objective> = match self.store.objectives_for_endpoint(&endpoint.id) {
            Ok(objectives) => objectives
                .into_iter()
                .map(|objective| (objective.battery_index, objective))
                .collect(),
            Err(err) => {
                tracing::error!(endpoint = %endpoint.id, error = %err, "failed to load objectives");
                HashMap::new()
            }
        };
        for reading in &snapshot.batteries {
            let Some(objective) = objectives.get(&reading.index) else {
                continue;
            };
            if self.controller.apply(endpoint, reading, objective).await != Decision::Skip {
                report.objectives_applied += 1;
            }
        }
        Ok(())
    }

    fn price_for(&self, endpoint_id: &str) -> f64 {
        match self.store.control_params(endpoint_id) {
            Ok(Some(params)) => params.price,
            Ok(None) => self.default_price,
            Err(err) => {
                tracing::warn!(endpoint = endpoint_id, error = %err, "failed to read price; using default");
                self.default_price
            }
        }
    }

    fn persist(
        &self,
        endpoint_id: &str,
        snapshot: &DeviceSnapshot,
        economics: &EconomicsReport,
        report: &mut CycleReport,
    ) {
        let recorded_at = Utc::now();
        for (reading, share) in snapshot.batteries.iter().zip(economics.shares.iter()) {
            let record = TelemetryRecord {
                id: 0,
                endpoint_id: endpoint_id.to_string(),
                battery_index: reading.index,
                recorded_at,
                soc: reading.soc,
                soh: reading.soh,
                voltage: reading.voltage,
                current: reading.current,
                temperature_c: reading.temperature_c,
                power_kw: reading.power_kw,
                optimal_u_kw: reading.optimal_u_kw,
                device_state: reading.device_state.as_ref().map(|state| state.as_str().to_string()),
                grid_power_kw: economics.grid_power_kw,
                load_kw: snapshot.load_kw,
                pv_kw: snapshot.pv_kw,
                profit_eur: *share,
            };
            match self.store.insert_telemetry(&record) {
                Ok(_) => report.rows_written += 1,
                Err(err) => tracing::error!(
                    endpoint = endpoint_id,
                    battery = reading.index,
                    error = %err,
                    "failed to persist telemetry"
                ),
            }
        }
    }
}

/// Hours since the last successful poll, never less than one cadence.
pub fn elapsed_hours(last: Option<Instant>, now: Instant, cadence: Duration) -> f64 {
    let elapsed = last
        .map(|last| now.saturating_duration_since(last))
        .unwrap_or(cadence)
        .max(cadence);
    elapsed.as_secs_f64() / SECONDS_PER_HOUR
}
