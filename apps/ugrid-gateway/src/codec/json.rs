use super::{normalize_fraction, BatteryReading, DeviceSnapshot, DeviceState};
use serde::de::IgnoredAny;
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct JsonState {
    #[serde(default)]
    cnt: Option<Scalar>,
    #[serde(default)]
    load_kw: Option<Scalar>,
    #[serde(default)]
    pv_kw: Option<Scalar>,
    #[serde(default)]
    bats: Option<BatteryList>,
}

/// `bats` that is null or not an array counts as no batteries.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum BatteryList {
    List(Vec<MaybeBattery>),
    Other(IgnoredAny),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum MaybeBattery {
    Battery(JsonBattery),
    Other(IgnoredAny),
}

#[derive(Debug, Clone, Deserialize)]
struct JsonBattery {
    #[serde(default)]
    idx: Option<Scalar>,
    #[serde(default, rename = "u", alias = "optimal_u_kw")]
    optimal_u: Option<Scalar>,
    #[serde(default, rename = "S", alias = "soc")]
    soc: Option<Scalar>,
    #[serde(default, rename = "p", alias = "power_kw")]
    power: Option<Scalar>,
    #[serde(default, rename = "V", alias = "voltage")]
    voltage: Option<Scalar>,
    #[serde(default, rename = "I", alias = "current")]
    current: Option<Scalar>,
    #[serde(default, rename = "T", alias = "temperature")]
    temperature: Option<Scalar>,
    #[serde(default, rename = "H", alias = "soh")]
    soh: Option<Scalar>,
    #[serde(default)]
    state: Option<Scalar>,
    #[serde(default)]
    ip: Option<Scalar>,
}

/// Firmware sends some numbers as text (`"load_kw": "2.30"`).
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Scalar {
    Number(f64),
    Text(String),
    Other(IgnoredAny),
}

impl Scalar {
    fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Number(value) => Some(*value),
            Scalar::Text(raw) => raw.trim().parse::<f64>().ok(),
            Scalar::Other(_) => None,
        }
        .filter(|value| value.is_finite())
    }

    fn as_text(&self) -> Option<&str> {
        match self {
            Scalar::Text(raw) => Some(raw.trim()).filter(|v| !v.is_empty()),
            _ => None,
        }
    }

    fn as_index(&self) -> Option<u32> {
        let value = self.as_f64()?;
        if value < 0.0 || value.fract() != 0.0 || value > u32::MAX as f64 {
            return None;
        }
        Some(value as u32)
    }
}

fn number(field: &Option<Scalar>) -> Option<f64> {
    field.as_ref().and_then(Scalar::as_f64)
}

pub(super) fn parse(payload: &[u8]) -> Result<JsonState, String> {
    let mut bytes = payload.to_vec();
    simd_json::serde::from_slice::<JsonState>(&mut bytes).map_err(|err| err.to_string())
}

impl JsonState {
    pub(crate) fn into_snapshot(self) -> DeviceSnapshot {
        let sequence_counter = self
            .cnt
            .as_ref()
            .and_then(Scalar::as_index)
            .map(u64::from)
            .unwrap_or(0);

        let entries = match self.bats {
            Some(BatteryList::List(entries)) => entries,
            Some(BatteryList::Other(_)) | None => Vec::new(),
        };
        let batteries = entries
            .into_iter()
            .filter_map(|entry| match entry {
                MaybeBattery::Battery(battery) => battery.into_reading(),
                MaybeBattery::Other(_) => None,
            })
            .collect();

        DeviceSnapshot {
            sequence_counter,
            load_kw: number(&self.load_kw),
            pv_kw: number(&self.pv_kw),
            batteries,
        }
    }
}

impl JsonBattery {
    fn into_reading(self) -> Option<BatteryReading> {
        let Some(index) = self.idx.as_ref().and_then(Scalar::as_index) else {
            tracing::debug!("skipping JSON battery entry without a usable idx");
            return None;
        };
        let device_state = self.state.as_ref().and_then(|state| match state {
            Scalar::Text(label) => Some(DeviceState::from_label(label)),
            Scalar::Number(code) if code.fract() == 0.0 => Some(DeviceState::from_code(*code as i128)),
            _ => None,
        });

        Some(BatteryReading {
            index,
            soc: number(&self.soc).map(normalize_fraction),
            soh: number(&self.soh).map(normalize_fraction),
            voltage: number(&self.voltage),
            current: number(&self.current),
            temperature_c: number(&self.temperature),
            power_kw: number(&self.power),
            optimal_u_kw: number(&self.optimal_u),
            device_state,
            reported_ip: self.ip.as_ref().and_then(Scalar::as_text).map(str::to_string),
        })
    }
}
