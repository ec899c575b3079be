use serde::Serialize;

/// Body of `PUT /ctrl/obj`. Field order matters: the firmware scans the
/// payload positionally as `idx`, `power_kw`, `clear`.
#[derive(Debug, Serialize)]
struct ObjectiveCommand {
    idx: u32,
    power_kw: i64,
    clear: u8,
}

/// Body of `PUT /ctrl/mpc`.
#[derive(Debug, Serialize)]
struct ControlParamsCommand {
    a: i64,
    b: i64,
    g: i64,
    p: i64,
}

/// ×100 fixed point, rounded to the nearest centi-unit.
fn fixed_point(value: f64) -> i64 {
    (value * 100.0).round() as i64
}

fn to_bytes<T: Serialize>(body: &T) -> Vec<u8> {
    // Plain structs of integers always serialize.
    serde_json::to_vec(body).unwrap_or_default()
}

pub fn encode_set_power(battery_index: u32, power_kw: f64) -> Vec<u8> {
    to_bytes(&ObjectiveCommand {
        idx: battery_index,
        power_kw: fixed_point(power_kw),
        clear: 0,
    })
}

pub fn encode_clear(battery_index: u32) -> Vec<u8> {
    to_bytes(&ObjectiveCommand {
        idx: battery_index,
        power_kw: 0,
        clear: 1,
    })
}

pub fn encode_control_params(alpha: f64, beta: f64, gamma: f64, price: f64) -> Vec<u8> {
    to_bytes(&ControlParamsCommand {
        a: fixed_point(alpha),
        b: fixed_point(beta),
        g: fixed_point(gamma),
        p: fixed_point(price),
    })
}
