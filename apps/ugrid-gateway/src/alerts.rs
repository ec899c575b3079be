//! Alert model, fan-out to the store and the MQTT publish loop.

use crate::error::PublishError;
use crate::store::Store;
use chrono::{DateTime, SecondsFormat, Utc};
use rumqttc::{AsyncClient, MqttOptions, QoS};
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

impl AlertLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub level: AlertLevel,
    pub endpoint_id: Option<String>,
    pub battery_index: Option<u32>,
    pub message: String,
    pub payload: Option<JsonValue>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct AlertMessage<'a> {
    level: AlertLevel,
    endpoint_id: Option<&'a str>,
    battery_index: Option<u32>,
    message: &'a str,
    timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<&'a JsonValue>,
}

impl Alert {
    pub fn new(level: AlertLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            endpoint_id: None,
            battery_index: None,
            message: message.into(),
            payload: None,
            created_at: Utc::now(),
        }
    }

    pub fn for_battery(mut self, endpoint_id: impl Into<String>, battery_index: u32) -> Self {
        self.endpoint_id = Some(endpoint_id.into());
        self.battery_index = Some(battery_index);
        self
    }

    pub fn with_payload(mut self, payload: JsonValue) -> Self {
        self.payload = Some(payload);
        self
    }

    /// `{base}/{level}/{endpoint}[/{battery}]`; alerts without an endpoint
    /// go to `{base}/{level}/gateway`.
    pub fn topic(&self, base: &str) -> String {
        let base = base.trim_end_matches('/');
        let endpoint = self.endpoint_id.as_deref().unwrap_or("gateway");
        match self.battery_index {
            Some(idx) => format!("{base}/{}/{endpoint}/{idx}", self.level.as_str()),
            None => format!("{base}/{}/{endpoint}", self.level.as_str()),
        }
    }

    pub fn to_message(&self) -> Result<Vec<u8>, PublishError> {
        let message = AlertMessage {
            level: self.level,
            endpoint_id: self.endpoint_id.as_deref(),
            battery_index: self.battery_index,
            message: &self.message,
            timestamp: self.created_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            data: self.payload.as_ref(),
        };
        Ok(serde_json::to_vec(&message)?)
    }
}

/// Sending side of the publish queue.
#[derive(Debug, Clone)]
pub struct AlertPublisherHandle {
    tx: mpsc::Sender<Alert>,
}

impl AlertPublisherHandle {
    pub fn try_publish(&self, alert: Alert) -> Result<(), PublishError> {
        self.tx.try_send(alert).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => PublishError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => PublishError::Closed,
        })
    }
}

pub fn channel(capacity: usize) -> (AlertPublisherHandle, mpsc::Receiver<Alert>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (AlertPublisherHandle { tx }, rx)
}

/// Persists an alert and queues it for MQTT. The two sinks fail
/// independently; neither failure reaches the caller.
#[derive(Debug, Clone)]
pub struct Alerter {
    store: Store,
    publisher: AlertPublisherHandle,
}

impl Alerter {
    pub fn new(store: Store, publisher: AlertPublisherHandle) -> Self {
        Self { store, publisher }
    }

    pub fn emit(&self, alert: Alert) {
        tracing::info!(
            level = alert.level.as_str(),
            endpoint = alert.endpoint_id.as_deref().unwrap_or("-"),
            battery = ?alert.battery_index,
            message = %alert.message,
            "alert"
        );
        if let Err(err) = self.store.insert_alert(&alert) {
            tracing::warn!(error = %err, "failed to persist alert");
        }
        if let Err(err) = self.publisher.try_publish(alert) {
            tracing::warn!(error = %err, "dropping alert publish");
        }
    }
}

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    pub topic_base: String,
    pub keepalive: Duration,
}

/// Drains the alert queue into MQTT until cancelled or every handle is
/// dropped. Delivery is QoS 0 and never retained.
pub async fn run_publisher(settings: MqttSettings, mut rx: mpsc::Receiver<Alert>, cancel: CancellationToken) {
    let mut options = MqttOptions::new(settings.client_id.clone(), settings.host.clone(), settings.port);
    options.set_keep_alive(settings.keepalive);
    if let Some(username) = &settings.username {
        options.set_credentials(username.clone(), settings.password.clone().unwrap_or_default());
    }
    let (client, mut eventloop) = AsyncClient::new(options, 32);

    let poll_cancel = cancel.clone();
    let poller = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = poll_cancel.cancelled() => break,
                event = eventloop.poll() => {
                    if let Err(err) = event {
                        tracing::warn!(error = %err, "mqtt event loop error");
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        }
    });

    tracing::info!(host = %settings.host, port = settings.port, "alert publisher started");
    loop {
        let alert = tokio::select! {
            _ = cancel.cancelled() => break,
            alert = rx.recv() => match alert {
                Some(alert) => alert,
                None => break,
            },
        };
        // The client queue blocks while the broker is unreachable.
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = publish(&client, &settings.topic_base, &alert) => result,
        };
        if let Err(err) = result {
            tracing::warn!(error = %err, message = %alert.message, "failed to publish alert");
        }
    }

    if let Err(err) = client.try_disconnect() {
        tracing::debug!(error = %err, "mqtt disconnect failed");
    }
    poller.abort();
    tracing::info!("alert publisher stopped");
}

async fn publish(client: &AsyncClient, base: &str, alert: &Alert) -> Result<(), PublishError> {
    let payload = alert.to_message()?;
    client
        .publish(alert.topic(base), QoS::AtMostOnce, false, payload)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn topic_includes_level_endpoint_and_battery() {
        let alert = Alert::new(AlertLevel::Warning, "low soc").for_battery("ug1", 2);
        assert_eq!(alert.topic("ugrid/alerts"), "ugrid/alerts/warning/ug1/2");

        let mut endpoint_only = Alert::new(AlertLevel::Critical, "offline");
        endpoint_only.endpoint_id = Some("ug7".to_string());
        assert_eq!(endpoint_only.topic("ugrid/alerts/"), "ugrid/alerts/critical/ug7");

        let gateway = Alert::new(AlertLevel::Info, "started");
        assert_eq!(gateway.topic("base"), "base/info/gateway");
    }

    #[test]
    fn message_body_uses_utc_z_timestamp() {
        let alert = Alert::new(AlertLevel::Info, "target reached")
            .for_battery("ug1", 0)
            .with_payload(json!({"soc": 0.5}));
        let body: JsonValue = serde_json::from_slice(&alert.to_message().unwrap()).unwrap();
        assert_eq!(body["level"], "info");
        assert_eq!(body["endpoint_id"], "ug1");
        assert_eq!(body["battery_index"], 0);
        assert_eq!(body["message"], "target reached");
        assert_eq!(body["data"], json!({"soc": 0.5}));
        assert!(body["timestamp"].as_str().unwrap().ends_with('Z'));

        let bare = Alert::new(AlertLevel::Warning, "x");
        let body: JsonValue = serde_json::from_slice(&bare.to_message().unwrap()).unwrap();
        assert!(body.get("data").is_none());
        assert!(body["endpoint_id"].is_null());
    }

    #[test]
    fn full_queue_drops_but_still_persists() {
        let store = Store::open_in_memory().unwrap();
        let (handle, mut rx) = channel(1);
        let alerter = Alerter::new(store.clone(), handle.clone());

        alerter.emit(Alert::new(AlertLevel::Warning, "first"));
        alerter.emit(Alert::new(AlertLevel::Warning, "second"));

        assert_eq!(store.recent_alerts(10).unwrap().len(), 2);
        assert_eq!(rx.try_recv().unwrap().message, "first");
        assert!(rx.try_recv().is_err());
        assert!(matches!(
            handle.try_publish(Alert::new(AlertLevel::Info, "third")),
            Ok(())
        ));
        assert!(matches!(
            handle.try_publish(Alert::new(AlertLevel::Info, "fourth")),
            Err(PublishError::QueueFull)
        ));
    }
}
