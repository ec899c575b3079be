//! Device endpoints and the command port the controller and API talk through.

pub mod coap;

pub use coap::CoapTransport;

use crate::codec::{self, ContentFormat};
use crate::error::{ControlError, TransportError};
use crate::store::ControlParams;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use url::{Host, Url};

pub const DEFAULT_COAP_PORT: u16 = 5683;

/// A configured microgrid controller, addressed by its `/dev/state` URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub id: String,
    pub state_uri: Url,
}

impl Endpoint {
    pub fn parse(id: impl Into<String>, uri: &str) -> Result<Self, TransportError> {
        let invalid = |reason: &str| TransportError::InvalidUri {
            uri: uri.to_string(),
            reason: reason.to_string(),
        };
        let state_uri = Url::parse(uri.trim()).map_err(|err| invalid(&err.to_string()))?;
        if state_uri.scheme() != "coap" {
            return Err(invalid("scheme must be coap"));
        }
        if state_uri.host().is_none() {
            return Err(invalid("missing host"));
        }
        Ok(Self {
            id: id.into(),
            state_uri,
        })
    }

    pub fn host(&self) -> Option<Host<&str>> {
        self.state_uri.host()
    }

    pub fn port(&self) -> u16 {
        self.state_uri.port().unwrap_or(DEFAULT_COAP_PORT)
    }

    /// `host:port`, IPv6 hosts in brackets.
    pub fn authority(&self) -> String {
        let host = self.state_uri.host_str().unwrap_or_default();
        format!("{host}:{}", self.port())
    }

    pub fn uri_for(&self, resource: DeviceResource) -> String {
        format!("coap://{}/{}", self.authority(), resource.path(self).join("/"))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id, self.state_uri)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceResource {
    State,
    Objective,
    ControlParams,
}

impl DeviceResource {
    /// URI path segments. State comes from the configured URI; control
    /// resources live at fixed paths on the same authority.
    pub fn path(self, endpoint: &Endpoint) -> Vec<String> {
        match self {
            Self::State => endpoint
                .state_uri
                .path_segments()
                .map(|segments| {
                    segments
                        .filter(|segment| !segment.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            Self::Objective => vec!["ctrl".to_string(), "obj".to_string()],
            Self::ControlParams => vec!["ctrl".to_string(), "mpc".to_string()],
        }
    }
}

#[derive(Debug, Clone)]
pub struct StatePayload {
    pub body: Bytes,
    pub content_format: Option<ContentFormat>,
}

#[async_trait]
pub trait DeviceTransport: Send + Sync {
    async fn fetch_state(&self, endpoint: &Endpoint) -> Result<StatePayload, TransportError>;

    async fn put(
        &self,
        endpoint: &Endpoint,
        resource: DeviceResource,
        body: Vec<u8>,
    ) -> Result<(), TransportError>;
}

/// Encodes commands and hands them to the transport.
#[derive(Clone)]
pub struct CommandPort {
    transport: Arc<dyn DeviceTransport>,
}

impl fmt::Debug for CommandPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandPort").finish_non_exhaustive()
    }
}

impl CommandPort {
    pub fn new(transport: Arc<dyn DeviceTransport>) -> Self {
        Self { transport }
    }

    pub async fn fetch_state(&self, endpoint: &Endpoint) -> Result<StatePayload, TransportError> {
        self.transport.fetch_state(endpoint).await
    }

    pub async fn set_power(
        &self,
        endpoint: &Endpoint,
        battery_index: u32,
        power_kw: f64,
    ) -> Result<(), ControlError> {
        let body = codec::encode_set_power(battery_index, power_kw);
        self.transport
            .put(endpoint, DeviceResource::Objective, body)
            .await
            .map_err(|source| ControlError {
                endpoint: endpoint.id.clone(),
                battery: Some(battery_index),
                action: "set_power",
                source,
            })
    }

    pub async fn clear(&self, endpoint: &Endpoint, battery_index: u32) -> Result<(), ControlError> {
        let body = codec::encode_clear(battery_index);
        self.transport
            .put(endpoint, DeviceResource::Objective, body)
            .await
            .map_err(|source| ControlError {
                endpoint: endpoint.id.clone(),
                battery: Some(battery_index),
                action: "clear",
                source,
            })
    }

    pub async fn push_control_params(
        &self,
        endpoint: &Endpoint,
        params: &ControlParams,
    ) -> Result<(), ControlError> {
        let body = codec::encode_control_params(params.alpha, params.beta, params.gamma, params.price);
        self.transport
            .put(endpoint, DeviceResource::ControlParams, body)
            .await
            .map_err(|source| ControlError {
                endpoint: endpoint.id.clone(),
                battery: None,
                action: "control_params",
                source,
            })
    }
}
