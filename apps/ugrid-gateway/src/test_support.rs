use crate::alerts::{self, Alert, Alerter};
use crate::codec::{BatteryReading, ContentFormat, DeviceState};
use crate::control::ObjectiveController;
use crate::device::{CommandPort, DeviceResource, DeviceTransport, Endpoint, StatePayload};
use crate::error::TransportError;
use crate::store::{Store, TelemetryRecord};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq)]
pub struct SentCommand {
    pub endpoint_id: String,
    pub resource: DeviceResource,
    pub body: Vec<u8>,
}

/// In-memory device fleet: canned state payloads, scripted failures and a
/// log of every PUT.
#[derive(Debug, Default)]
pub struct FakeTransport {
    states: Mutex<HashMap<String, StatePayload>>,
    unreachable: Mutex<HashSet<String>>,
    failing_puts: Mutex<HashSet<String>>,
    sent: Mutex<Vec<SentCommand>>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_state(&self, endpoint_id: &str, body: Vec<u8>, content_format: Option<ContentFormat>) {
        self.states.lock().unwrap().insert(
            endpoint_id.to_string(),
            StatePayload {
                body: Bytes::from(body),
                content_format,
            },
        );
    }

    pub fn set_unreachable(&self, endpoint_id: &str) {
        self.unreachable.lock().unwrap().insert(endpoint_id.to_string());
    }

    pub fn fail_puts(&self, endpoint_id: &str) {
        self.failing_puts.lock().unwrap().insert(endpoint_id.to_string());
    }

    pub fn sent(&self) -> Vec<SentCommand> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeviceTransport for FakeTransport {
    async fn fetch_state(&self, endpoint: &Endpoint) -> Result<StatePayload, TransportError> {
        if self.unreachable.lock().unwrap().contains(&endpoint.id) {
            return Err(TransportError::Timeout {
                target: endpoint.authority(),
                timeout: Duration::from_secs(3),
            });
        }
        self.states
            .lock()
            .unwrap()
            .get(&endpoint.id)
            .cloned()
            .ok_or_else(|| TransportError::Status {
                target: endpoint.authority(),
                code: "NotFound".to_string(),
            })
    }

    async fn put(
        &self,
        endpoint: &Endpoint,
        resource: DeviceResource,
        body: Vec<u8>,
    ) -> Result<(), TransportError> {
        if self.failing_puts.lock().unwrap().contains(&endpoint.id) {
            return Err(TransportError::Timeout {
                target: endpoint.authority(),
                timeout: Duration::from_secs(3),
            });
        }
        self.sent.lock().unwrap().push(SentCommand {
            endpoint_id: endpoint.id.clone(),
            resource,
            body,
        });
        Ok(())
    }
}

/// Store, fake fleet and alert queue wired together.
pub struct Harness {
    pub store: Store,
    pub transport: Arc<FakeTransport>,
    pub commands: CommandPort,
    pub alerter: Alerter,
    pub published: mpsc::Receiver<Alert>,
}

impl Harness {
    pub fn new() -> Self {
        let store = Store::open_in_memory().unwrap();
        let transport = FakeTransport::new();
        let commands = CommandPort::new(transport.clone());
        let (publisher, published) = alerts::channel(256);
        let alerter = Alerter::new(store.clone(), publisher);
        Self {
            store,
            transport,
            commands,
            alerter,
            published,
        }
    }

    pub fn controller(&self) -> ObjectiveController {
        ObjectiveController::new(self.commands.clone(), self.store.clone(), self.alerter.clone())
    }
}

pub fn endpoint(id: &str) -> Endpoint {
    Endpoint::parse(id, "coap://[fd00::1]/dev/state").unwrap()
}

pub fn reading(index: u32, soc: Option<f64>) -> BatteryReading {
    BatteryReading {
        soc,
        soh: Some(0.95),
        temperature_c: Some(25.0),
        power_kw: Some(0.0),
        device_state: Some(DeviceState::Running),
        ..BatteryReading::empty(index)
    }
}

pub fn telemetry_row(endpoint_id: &str, battery_index: u32, soc: Option<f64>) -> TelemetryRecord {
    TelemetryRecord {
        id: 0,
        endpoint_id: endpoint_id.to_string(),
        battery_index,
        recorded_at: Utc::now(),
        soc,
        soh: Some(0.95),
        voltage: Some(48.0),
        current: Some(0.0),
        temperature_c: Some(25.0),
        power_kw: Some(0.0),
        optimal_u_kw: None,
        device_state: Some("RUNNING".to_string()),
        grid_power_kw: Some(1.0),
        load_kw: Some(2.0),
        pv_kw: Some(1.0),
        profit_eur: None,
    }
}
