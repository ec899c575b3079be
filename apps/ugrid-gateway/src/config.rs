use crate::alerts::MqttSettings;
use crate::cli::Args;
use crate::device::Endpoint;
use crate::status::DEFAULT_EXTRAS_CAPACITY;
use anyhow::{Context, Result};
use dotenvy::dotenv;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

fn setup_config_path(vars: &impl Fn(&str) -> Option<String>) -> Option<PathBuf> {
    if let Some(path) = non_empty(vars("GATEWAY_SETUP_CONFIG_PATH")) {
        return Some(PathBuf::from(path));
    }
    non_empty(vars("GATEWAY_STATE_DIR")).map(|dir| PathBuf::from(dir).join("config.json"))
}

/// Values from the optional JSON setup file. Each one applies only when the
/// matching env var is unset.
#[derive(Debug, Clone, Default, Deserialize)]
struct SetupConfigOverrides {
    #[serde(default)]
    endpoints: Option<BTreeMap<String, String>>,
    #[serde(default)]
    database_path: Option<String>,
    #[serde(default)]
    mqtt_host: Option<String>,
    #[serde(default)]
    mqtt_port: Option<u16>,
    #[serde(default)]
    mqtt_username: Option<String>,
    #[serde(default)]
    mqtt_password: Option<String>,
    #[serde(default)]
    mqtt_topic_base: Option<String>,
    #[serde(default)]
    poll_interval_ms: Option<u64>,
    #[serde(default)]
    request_timeout_ms: Option<u64>,
    #[serde(default)]
    default_price_eur_per_kwh: Option<f64>,
}

fn load_setup_config_overrides(vars: &impl Fn(&str) -> Option<String>) -> Option<SetupConfigOverrides> {
    let path = setup_config_path(vars)?;
    if !path.exists() {
        return None;
    }
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "ugrid-gateway failed to read setup config; using env defaults"
            );
            return None;
        }
    };
    let mut bytes = contents.into_bytes();
    match simd_json::serde::from_slice(&mut bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "ugrid-gateway failed to parse setup config; using env defaults"
            );
            None
        }
    }
}

fn apply_setup_overrides(
    config: &mut Config,
    overrides: &SetupConfigOverrides,
    vars: &impl Fn(&str) -> Option<String>,
) -> Result<()> {
    let env_allows = |key: &str| non_empty(vars(key)).is_none();

    if env_allows("GATEWAY_ENDPOINTS") {
        if let Some(endpoints) = overrides.endpoints.as_ref() {
            config.endpoints = endpoints
                .iter()
                .map(|(id, uri)| Endpoint::parse(id.trim(), uri))
                .collect::<Result<_, _>>()
                .context("invalid endpoint in setup config")?;
        }
    }
    if env_allows("GATEWAY_DATABASE_PATH") {
        if let Some(path) = non_empty(overrides.database_path.clone()) {
            config.database_path = PathBuf::from(path);
        }
    }
    if env_allows("GATEWAY_MQTT_HOST") {
        if let Some(host) = non_empty(overrides.mqtt_host.clone()) {
            config.mqtt_host = host;
        }
    }
    if env_allows("GATEWAY_MQTT_PORT") {
        if let Some(port) = overrides.mqtt_port.filter(|v| *v != 0) {
            config.mqtt_port = port;
        }
    }
    if env_allows("GATEWAY_MQTT_USERNAME") {
        if let Some(username) = overrides.mqtt_username.as_deref() {
            config.mqtt_username = non_empty(Some(username.to_string()));
        }
    }
    if env_allows("GATEWAY_MQTT_PASSWORD") {
        if let Some(password) = overrides.mqtt_password.as_deref() {
            config.mqtt_password = non_empty(Some(password.to_string()));
        }
    }
    if env_allows("GATEWAY_MQTT_TOPIC_BASE") {
        if let Some(base) = non_empty(overrides.mqtt_topic_base.clone()) {
            config.mqtt_topic_base = base;
        }
    }
    if env_allows("GATEWAY_POLL_INTERVAL_MS") {
        if let Some(value) = overrides.poll_interval_ms.filter(|v| *v != 0) {
            config.poll_interval_ms = value;
        }
    }
    if env_allows("GATEWAY_REQUEST_TIMEOUT_MS") {
        if let Some(value) = overrides.request_timeout_ms.filter(|v| *v != 0) {
            config.request_timeout_ms = value;
        }
    }
    if env_allows("GATEWAY_DEFAULT_PRICE") {
        if let Some(price) = overrides.default_price_eur_per_kwh.filter(|v| v.is_finite()) {
            config.default_price = price;
        }
    }
    Ok(())
}

#[derive(Clone, Debug, Serialize)]
pub struct Config {
    #[serde(serialize_with = "endpoints_by_id")]
    pub endpoints: Vec<Endpoint>,
    pub database_path: PathBuf,
    pub drop_schema: bool,
    pub http_host: String,
    pub http_port: u16,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    #[serde(serialize_with = "masked")]
    pub mqtt_password: Option<String>,
    pub mqtt_client_id: String,
    pub mqtt_topic_base: String,
    pub mqtt_keepalive_secs: u64,
    pub poll_interval_ms: u64,
    pub request_timeout_ms: u64,
    pub default_price: f64,
    pub alert_queue: usize,
    pub extras_capacity: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        Self::from_vars(|key| std::env::var(key).ok())
    }

    pub fn from_vars(vars: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let setup_overrides = load_setup_config_overrides(&vars);

        let endpoints = match non_empty(vars("GATEWAY_ENDPOINTS")) {
            Some(raw) => parse_endpoint_list(&raw)?,
            None => Vec::new(),
        };
        let database_path = non_empty(vars("GATEWAY_DATABASE_PATH"))
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("ugrid_gateway.db"));
        let drop_schema = flag(vars("GATEWAY_DROP_SCHEMA")).unwrap_or(false);

        let http_host = non_empty(vars("GATEWAY_HTTP_HOST")).unwrap_or_else(|| "0.0.0.0".to_string());
        let http_port = parse(&vars, "GATEWAY_HTTP_PORT")?.unwrap_or(3000);

        let mqtt_host = non_empty(vars("GATEWAY_MQTT_HOST")).unwrap_or_else(|| "127.0.0.1".to_string());
        let mqtt_port = parse(&vars, "GATEWAY_MQTT_PORT")?.unwrap_or(1883);
        let mqtt_username = non_empty(vars("GATEWAY_MQTT_USERNAME"));
        let mqtt_password = non_empty(vars("GATEWAY_MQTT_PASSWORD"));
        let mqtt_client_id = non_empty(vars("GATEWAY_MQTT_CLIENT_ID"))
            .unwrap_or_else(|| format!("ugrid-gateway-{}", std::process::id()));
        let mqtt_topic_base =
            non_empty(vars("GATEWAY_MQTT_TOPIC_BASE")).unwrap_or_else(|| "ugrid/alerts".to_string());
        let mqtt_keepalive_secs = parse(&vars, "GATEWAY_MQTT_KEEPALIVE_SECS")?.unwrap_or(30);

        let poll_interval_ms = parse(&vars, "GATEWAY_POLL_INTERVAL_MS")?.unwrap_or(5000);
        let request_timeout_ms = parse(&vars, "GATEWAY_REQUEST_TIMEOUT_MS")?.unwrap_or(3000);
        let default_price = parse(&vars, "GATEWAY_DEFAULT_PRICE")?.unwrap_or(0.25);
        let alert_queue = parse(&vars, "GATEWAY_ALERT_QUEUE")?.unwrap_or(256);
        let extras_capacity =
            parse(&vars, "GATEWAY_EXTRAS_CAPACITY")?.unwrap_or(DEFAULT_EXTRAS_CAPACITY);

        let mut config = Self {
            endpoints,
            database_path,
            drop_schema,
            http_host,
            http_port,
            mqtt_host,
            mqtt_port,
            mqtt_username,
            mqtt_password,
            mqtt_client_id,
            mqtt_topic_base,
            mqtt_keepalive_secs,
            poll_interval_ms,
            request_timeout_ms,
            default_price,
            alert_queue,
            extras_capacity,
        };

        if let Some(overrides) = setup_overrides.as_ref() {
            apply_setup_overrides(&mut config, overrides, &vars)?;
        }
        if !config.default_price.is_finite() {
            anyhow::bail!("GATEWAY_DEFAULT_PRICE must be a finite number");
        }
        if config.poll_interval_ms == 0 {
            anyhow::bail!("GATEWAY_POLL_INTERVAL_MS must be positive");
        }

        Ok(config)
    }

    pub fn apply_args(&mut self, args: &Args) {
        if let Some(host) = args.host.as_deref() {
            self.http_host = host.to_string();
        }
        if let Some(port) = args.port {
            self.http_port = port;
        }
    }

    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.http_host, self.http_port)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn mqtt_settings(&self) -> MqttSettings {
        MqttSettings {
            host: self.mqtt_host.clone(),
            port: self.mqtt_port,
            username: self.mqtt_username.clone(),
            password: self.mqtt_password.clone(),
            client_id: self.mqtt_client_id.clone(),
            topic_base: self.mqtt_topic_base.clone(),
            keepalive: Duration::from_secs(self.mqtt_keepalive_secs),
        }
    }
}

/// `ug1=coap://[fd00::1]/dev/state,ug2=coap://10.0.0.7/dev/state`
pub fn parse_endpoint_list(raw: &str) -> Result<Vec<Endpoint>> {
    let mut endpoints: Vec<Endpoint> = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|entry| !entry.is_empty()) {
        let (id, uri) = entry
            .split_once('=')
            .with_context(|| format!("endpoint entry {entry:?} must look like id=coap://host/dev/state"))?;
        let id = id.trim();
        if id.is_empty() {
            anyhow::bail!("endpoint entry {entry:?} has an empty id");
        }
        if endpoints.iter().any(|known| known.id == id) {
            anyhow::bail!("endpoint id {id:?} is configured twice");
        }
        endpoints.push(Endpoint::parse(id, uri).with_context(|| format!("invalid endpoint {id}"))?);
    }
    Ok(endpoints)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn flag(value: Option<String>) -> Option<bool> {
    non_empty(value).map(|v| v == "1" || v.eq_ignore_ascii_case("true") || v.eq_ignore_ascii_case("yes"))
}

fn parse<T>(vars: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    non_empty(vars(key))
        .map(|raw| {
            raw.parse::<T>()
                .map_err(|err| anyhow::anyhow!("{key}={raw:?} is invalid: {err}"))
        })
        .transpose()
}

fn endpoints_by_id<S: Serializer>(endpoints: &[Endpoint], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_map(
        endpoints
            .iter()
            .map(|endpoint| (endpoint.id.as_str(), endpoint.state_uri.as_str())),
    )
}

fn masked<S: Serializer>(secret: &Option<String>, serializer: S) -> Result<S::Ok, S::Error> {
    match secret {
        Some(_) => serializer.serialize_str("********"),
        None => serializer.serialize_none(),
    }
}
