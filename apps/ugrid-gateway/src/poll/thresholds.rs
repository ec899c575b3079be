use crate::alerts::{Alert, AlertLevel};
use crate::codec::BatteryReading;
use serde_json::json;

pub const SOC_LOW_WARNING: f64 = 0.15;
pub const SOH_LOW_CRITICAL: f64 = 0.80;
pub const TEMP_HIGH_CRITICAL_C: f64 = 50.0;

/// Threshold alerts for one reading. Each check fires independently on
/// every cycle it holds.
pub fn evaluate(endpoint_id: &str, reading: &BatteryReading) -> Vec<Alert> {
    let mut alerts = Vec::new();
    let battery = |level, message: String| Alert::new(level, message).for_battery(endpoint_id, reading.index);

    if let Some(soh) = reading.soh.filter(|soh| *soh < SOH_LOW_CRITICAL) {
        alerts.push(
            battery(
                AlertLevel::Critical,
                format!("low SoH ({:.1}%), maintenance advised", soh * 100.0),
            )
            .with_payload(json!({ "soh": soh, "soc": reading.soc })),
        );
    }
    if let Some(temp) = reading.temperature_c.filter(|t| *t > TEMP_HIGH_CRITICAL_C) {
        alerts.push(
            battery(AlertLevel::Critical, format!("high temperature ({temp:.1} °C)"))
                .with_payload(json!({ "temperature_c": temp, "soc": reading.soc })),
        );
    }
    match reading.soc {
        Some(soc) if soc < SOC_LOW_WARNING => alerts.push(
            battery(AlertLevel::Warning, format!("low SoC ({:.1}%)", soc * 100.0))
                .with_payload(json!({ "soc": soc })),
        ),
        Some(_) => {}
        None => alerts.push(battery(
            AlertLevel::Warning,
            "missing telemetry: battery reported no SoC".to_string(),
        )),
    }
    alerts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::reading;

    fn levels(alerts: &[Alert]) -> Vec<AlertLevel> {
        alerts.iter().map(|alert| alert.level).collect()
    }

    #[test]
    fn healthy_reading_is_quiet() {
        assert!(evaluate("ug1", &reading(0, Some(0.5))).is_empty());
    }

    #[test]
    fn each_threshold_fires_on_its_own() {
        let mut hot = reading(0, Some(0.10));
        hot.soh = Some(0.75);
        hot.temperature_c = Some(55.0);
        let alerts = evaluate("ug1", &hot);
        assert_eq!(
            levels(&alerts),
            vec![AlertLevel::Critical, AlertLevel::Critical, AlertLevel::Warning]
        );
        assert!(alerts.iter().all(|alert| alert.battery_index == Some(0)));
        assert_eq!(alerts[2].message, "low SoC (10.0%)");
    }

    #[test]
    fn boundaries_do_not_fire() {
        let mut edge = reading(1, Some(SOC_LOW_WARNING));
        edge.soh = Some(SOH_LOW_CRITICAL);
        edge.temperature_c = Some(TEMP_HIGH_CRITICAL_C);
        assert!(evaluate("ug1", &edge).is_empty());
    }

    #[test]
    fn missing_soc_warns() {
        let alerts = evaluate("ug2", &reading(3, None));
        assert_eq!(levels(&alerts), vec![AlertLevel::Warning]);
        assert!(alerts[0].message.starts_with("missing telemetry"));
        assert_eq!(alerts[0].topic("ugrid/alerts"), "ugrid/alerts/warning/ug2/3");
    }
}
