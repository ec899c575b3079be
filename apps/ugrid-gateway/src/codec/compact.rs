use super::json::JsonState;
use super::{normalize_fraction, BatteryReading, DeviceSnapshot, DeviceState, WirePayload};
use crate::error::DecodeError;
use ciborium::value::Value;

const KEY_COUNTER: u8 = 0;
const KEY_LOAD: u8 = 1;
const KEY_PV: u8 = 2;
const KEY_BATTERIES: u8 = 3;

/// `[idx, u_c, soc_c, p_c, v_c, i_c, t_c, soh_c, state]`
const ENTRY_LEN: usize = 9;
const SCALE: f64 = 100.0;

#[derive(Debug, Clone)]
pub(crate) struct CompactState {
    pub(crate) counter: u64,
    pub(crate) load_c: i128,
    pub(crate) pv_c: i128,
    pub(crate) entries: Vec<[i128; ENTRY_LEN]>,
}

pub(super) fn parse(payload: &[u8]) -> Result<WirePayload, DecodeError> {
    let value: Value =
        ciborium::de::from_reader(payload).map_err(|err| DecodeError::Cbor(err.to_string()))?;
    let Value::Map(entries) = value else {
        return Err(DecodeError::NotAMap);
    };

    if entries.iter().any(|(key, _)| matches!(key, Value::Text(_))) {
        let state: JsonState = Value::Map(entries)
            .deserialized()
            .map_err(|err| DecodeError::Cbor(err.to_string()))?;
        return Ok(WirePayload::Passthrough(state));
    }

    let mut state = CompactState {
        counter: 0,
        load_c: 0,
        pv_c: 0,
        entries: Vec::new(),
    };
    for (key, value) in entries {
        let Some(key) = as_int(&key).and_then(|k| u8::try_from(k).ok()) else {
            continue;
        };
        match key {
            KEY_COUNTER => {
                state.counter = as_int(&value)
                    .and_then(|v| u64::try_from(v).ok())
                    .ok_or(DecodeError::Field { key })?;
            }
            KEY_LOAD => state.load_c = as_int(&value).ok_or(DecodeError::Field { key })?,
            KEY_PV => state.pv_c = as_int(&value).ok_or(DecodeError::Field { key })?,
            KEY_BATTERIES => {
                let Value::Array(raw) = value else {
                    return Err(DecodeError::Field { key });
                };
                state.entries = raw.iter().filter_map(parse_entry).collect();
            }
            _ => {}
        }
    }
    Ok(WirePayload::Compact(state))
}

fn parse_entry(entry: &Value) -> Option<[i128; ENTRY_LEN]> {
    let Value::Array(cells) = entry else {
        tracing::debug!("skipping compact battery entry that is not an array");
        return None;
    };
    if cells.len() < ENTRY_LEN {
        tracing::debug!(len = cells.len(), "skipping short compact battery entry");
        return None;
    }
    let mut out = [0i128; ENTRY_LEN];
    for (slot, cell) in out.iter_mut().zip(cells.iter()) {
        *slot = as_int(cell)?;
    }
    Some(out)
}

fn as_int(value: &Value) -> Option<i128> {
    match value {
        Value::Integer(int) => Some(i128::from(*int)),
        _ => None,
    }
}

fn unscale(value: i128) -> f64 {
    value as f64 / SCALE
}

impl CompactState {
    pub(crate) fn into_snapshot(self) -> DeviceSnapshot {
        let batteries = self
            .entries
            .into_iter()
            .filter_map(|[idx, u_c, soc_c, p_c, v_c, i_c, t_c, soh_c, state]| {
                let index = u32::try_from(idx).ok()?;
                Some(BatteryReading {
                    index,
                    soc: Some(normalize_fraction(unscale(soc_c))),
                    soh: Some(normalize_fraction(unscale(soh_c))),
                    voltage: Some(unscale(v_c)),
                    current: Some(unscale(i_c)),
                    temperature_c: Some(unscale(t_c)),
                    power_kw: Some(unscale(p_c)),
                    optimal_u_kw: Some(unscale(u_c)),
                    device_state: Some(DeviceState::from_code(state)),
                    reported_ip: None,
                })
            })
            .collect();

        DeviceSnapshot {
            sequence_counter: self.counter,
            load_kw: Some(unscale(self.load_c)),
            pv_kw: Some(unscale(self.pv_c)),
            batteries,
        }
    }
}
