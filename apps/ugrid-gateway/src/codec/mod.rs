//! Device state decoding and command encoding.
//!
//! `/dev/state` arrives either as JSON (CoAP content-format 50) or as the
//! integer-keyed, ×100 fixed-point CBOR map emitted by constrained firmware
//! (content-format 60). Both normalize into one [`DeviceSnapshot`].

mod command;
mod compact;
mod json;

pub use command::{encode_clear, encode_control_params, encode_set_power};

use crate::error::DecodeError;
use serde::Serialize;
use std::collections::HashSet;

pub const CONTENT_FORMAT_JSON: u16 = 50;
pub const CONTENT_FORMAT_CBOR: u16 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentFormat {
    Json,
    CompactBinary,
}

impl ContentFormat {
    pub fn from_coap(value: u16) -> Option<Self> {
        match value {
            CONTENT_FORMAT_JSON => Some(Self::Json),
            CONTENT_FORMAT_CBOR => Some(Self::CompactBinary),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(into = "String")]
pub enum DeviceState {
    Init,
    Running,
    Isolated,
    /// Code or label the gateway does not know, kept verbatim.
    Other(String),
}

impl DeviceState {
    pub fn from_code(code: i128) -> Self {
        match code {
            0 => Self::Init,
            1 => Self::Running,
            2 => Self::Isolated,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_uppercase().as_str() {
            "INI" | "INIT" => Self::Init,
            "RUN" | "RUNNING" => Self::Running,
            "ISO" | "ISOLATED" => Self::Isolated,
            _ => Self::Other(label.trim().to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Init => "INIT",
            Self::Running => "RUNNING",
            Self::Isolated => "ISOLATED",
            Self::Other(raw) => raw,
        }
    }
}

impl From<DeviceState> for String {
    fn from(state: DeviceState) -> Self {
        state.as_str().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatteryReading {
    pub index: u32,
    pub soc: Option<f64>,
    pub soh: Option<f64>,
    pub voltage: Option<f64>,
    pub current: Option<f64>,
    pub temperature_c: Option<f64>,
    /// Positive while charging, negative while discharging.
    pub power_kw: Option<f64>,
    pub optimal_u_kw: Option<f64>,
    pub device_state: Option<DeviceState>,
    pub reported_ip: Option<String>,
}

impl BatteryReading {
    pub fn empty(index: u32) -> Self {
        Self {
            index,
            soc: None,
            soh: None,
            voltage: None,
            current: None,
            temperature_c: None,
            power_kw: None,
            optimal_u_kw: None,
            device_state: None,
            reported_ip: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSnapshot {
    pub sequence_counter: u64,
    pub load_kw: Option<f64>,
    pub pv_kw: Option<f64>,
    pub batteries: Vec<BatteryReading>,
}

impl DeviceSnapshot {
    pub fn battery_powers(&self) -> Vec<Option<f64>> {
        self.batteries.iter().map(|b| b.power_kw).collect()
    }
}

/// A state payload after format detection and before normalization.
#[derive(Debug, Clone)]
pub(crate) enum WirePayload {
    Json(json::JsonState),
    Compact(compact::CompactState),
    /// CBOR map keyed by text: already in the JSON aggregate shape.
    Passthrough(json::JsonState),
}

impl WirePayload {
    fn into_snapshot(self) -> DeviceSnapshot {
        let snapshot = match self {
            WirePayload::Json(state) | WirePayload::Passthrough(state) => state.into_snapshot(),
            WirePayload::Compact(state) => state.into_snapshot(),
        };
        dedupe_batteries(snapshot)
    }
}

/// Decodes a `/dev/state` payload.
///
/// With a compact-binary hint the payload is read as CBOR only. Without one
/// JSON is tried first and CBOR second.
pub fn decode(payload: &[u8], hint: Option<ContentFormat>) -> Result<DeviceSnapshot, DecodeError> {
    let wire = match hint {
        Some(ContentFormat::CompactBinary) => compact::parse(payload)?,
        _ => match json::parse(payload) {
            Ok(state) => WirePayload::Json(state),
            Err(json_err) => compact::parse(payload).map_err(|cbor_err| DecodeError::Unrecognized {
                json: json_err,
                cbor: cbor_err.to_string(),
            })?,
        },
    };
    Ok(wire.into_snapshot())
}

/// Values at or above this are percent, not fractions.
const PERCENT_THRESHOLD: f64 = 2.0;

/// SoC and SoH are fractions. Firmware that reports them in percent gets
/// scaled down once more; a fraction slightly over 1.0 (a full pack reading
/// 101%) is clamped to 1.0.
pub(crate) fn normalize_fraction(value: f64) -> f64 {
    if value >= PERCENT_THRESHOLD {
        value / 100.0
    } else {
        value.min(1.0)
    }
}

fn dedupe_batteries(mut snapshot: DeviceSnapshot) -> DeviceSnapshot {
    let mut seen = HashSet::new();
    snapshot.batteries.retain(|reading| {
        let fresh = seen.insert(reading.index);
        if !fresh {
            tracing::debug!(battery = reading.index, "dropping duplicate battery entry");
        }
        fresh
    });
    snapshot
}
