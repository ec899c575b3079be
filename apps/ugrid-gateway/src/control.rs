//! Per-battery objective state machine.
//!
//! [`decide`] is pure; [`ObjectiveController::apply`] carries out the
//! decision against the device, the store and the alerter.

use crate::alerts::{Alert, AlertLevel, Alerter};
use crate::codec::BatteryReading;
use crate::device::{CommandPort, Endpoint};
use crate::error::ValidationError;
use crate::store::Store;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;

pub const MAX_CHARGE_KW: f64 = 5.0;
pub const MAX_DISCHARGE_KW: f64 = -5.0;
pub const GAIN: f64 = 5.0;
pub const DISCHARGE_FLOOR_SOC: f64 = 0.05;
pub const TARGET_BAND: f64 = 0.02;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ObjectiveMode {
    FullDischarge,
    TargetSoc { target_soc: f64 },
    Detach,
}

impl ObjectiveMode {
    /// Builds a mode from its wire name. `target_soc` is only read for
    /// `target_soc`, where it must be a finite fraction in `[0, 1]`.
    pub fn from_parts(mode: &str, target_soc: Option<f64>) -> Result<Self, ValidationError> {
        match mode.trim() {
            "full_discharge" => Ok(Self::FullDischarge),
            "detach" => Ok(Self::Detach),
            "target_soc" => {
                let target_soc = target_soc
                    .ok_or_else(|| ValidationError::new("target_soc is required for mode target_soc"))?;
                if !target_soc.is_finite() || !(0.0..=1.0).contains(&target_soc) {
                    return Err(ValidationError::new("target_soc must be between 0 and 1"));
                }
                Ok(Self::TargetSoc { target_soc })
            }
            other => Err(ValidationError::new(format!(
                "unknown mode {other:?}; expected full_discharge, target_soc or detach"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FullDischarge => "full_discharge",
            Self::TargetSoc { .. } => "target_soc",
            Self::Detach => "detach",
        }
    }

    pub fn target_soc(&self) -> Option<f64> {
        match self {
            Self::TargetSoc { target_soc } => Some(*target_soc),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Objective {
    pub endpoint_id: String,
    pub battery_index: u32,
    #[serde(flatten)]
    pub mode: ObjectiveMode,
    pub created_at: DateTime<Utc>,
}

impl Objective {
    pub fn new(endpoint_id: impl Into<String>, battery_index: u32, mode: ObjectiveMode) -> Self {
        Self {
            endpoint_id: endpoint_id.into(),
            battery_index,
            mode,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlCommand {
    SetPower(f64),
    Clear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    DischargeComplete,
    TargetReached,
    Detached,
}

impl Completion {
    pub fn message(self) -> &'static str {
        match self {
            Self::DischargeComplete => "discharge complete, objective removed",
            Self::TargetReached => "target SoC reached, objective removed",
            Self::Detached => "battery detached, objective removed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    /// SoC unknown: nothing sent, objective kept.
    Skip,
    /// Send the command and keep the objective.
    Hold(ControlCommand),
    /// Send the command, drop the objective and report.
    Complete(ControlCommand, Completion),
}

/// Proportional set-point toward `target`, saturated at the power limits.
pub fn target_power_kw(target: f64, soc: f64) -> f64 {
    let error = target - soc;
    if error > 0.0 {
        MAX_CHARGE_KW.min(MAX_CHARGE_KW * error * GAIN)
    } else {
        MAX_DISCHARGE_KW.max(MAX_DISCHARGE_KW * error.abs() * GAIN)
    }
}

/// Unknown SoC skips the cycle for every mode, detach included.
pub fn decide(mode: ObjectiveMode, soc: Option<f64>) -> Decision {
    let Some(soc) = soc else {
        return Decision::Skip;
    };
    match mode {
        ObjectiveMode::FullDischarge if soc > DISCHARGE_FLOOR_SOC => {
            Decision::Hold(ControlCommand::SetPower(MAX_DISCHARGE_KW))
        }
        ObjectiveMode::FullDischarge => {
            Decision::Complete(ControlCommand::Clear, Completion::DischargeComplete)
        }
        ObjectiveMode::TargetSoc { target_soc } if (soc - target_soc).abs() <= TARGET_BAND => {
            Decision::Complete(ControlCommand::Clear, Completion::TargetReached)
        }
        ObjectiveMode::TargetSoc { target_soc } => {
            Decision::Hold(ControlCommand::SetPower(target_power_kw(target_soc, soc)))
        }
        ObjectiveMode::Detach => Decision::Complete(ControlCommand::SetPower(0.0), Completion::Detached),
    }
}

#[derive(Debug, Clone)]
pub struct ObjectiveController {
    commands: CommandPort,
    store: Store,
    alerter: Alerter,
}

impl ObjectiveController {
    pub fn new(commands: CommandPort, store: Store, alerter: Alerter) -> Self {
        Self {
            commands,
            store,
            alerter,
        }
    }

    /// Runs one control step. A failed command is logged and the
    /// transition still happens.
    pub async fn apply(&self, endpoint: &Endpoint, reading: &BatteryReading, objective: &Objective) -> Decision {
        let battery = objective.battery_index;
        let decision = decide(objective.mode, reading.soc);
        let command = match decision {
            Decision::Skip => {
                tracing::warn!(
                    endpoint = %endpoint.id,
                    battery,
                    mode = objective.mode.as_str(),
                    "SoC unknown; objective not applied this cycle"
                );
                return decision;
            }
            Decision::Hold(command) | Decision::Complete(command, _) => command,
        };

        tracing::info!(
            endpoint = %endpoint.id,
            battery,
            mode = objective.mode.as_str(),
            soc = ?reading.soc,
            command = ?command,
            "applying objective"
        );
        let sent = match command {
            ControlCommand::SetPower(kw) => self.commands.set_power(endpoint, battery, kw).await,
            ControlCommand::Clear => self.commands.clear(endpoint, battery).await,
        };
        if let Err(err) = sent {
            tracing::error!(endpoint = %endpoint.id, battery, error = %err, "objective command failed");
        }

        if let Decision::Complete(_, completion) = decision {
            match self.store.delete_objective_if(objective) {
                Ok(true) => {}
                Ok(false) => tracing::info!(
                    endpoint = %endpoint.id,
                    battery,
                    "objective changed while its command was in flight; leaving the stored row"
                ),
                Err(err) => {
                    tracing::error!(endpoint = %endpoint.id, battery, error = %err, "failed to delete objective")
                }
            }
            let payload = match completion {
                Completion::DischargeComplete => json!({ "soc": reading.soc }),
                Completion::TargetReached => {
                    json!({ "soc": reading.soc, "target_soc": objective.mode.target_soc() })
                }
                Completion::Detached => json!({}),
            };
            self.alerter.emit(
                Alert::new(AlertLevel::Info, completion.message())
                    .for_battery(endpoint.id.clone(), battery)
                    .with_payload(payload),
            );
        }
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{endpoint, reading, Harness};

    #[test]
    fn full_discharge_converges_then_clears() {
        let decisions: Vec<Decision> = [0.40, 0.20, 0.06, 0.04]
            .into_iter()
            .map(|soc| decide(ObjectiveMode::FullDischarge, Some(soc)))
            .collect();
        assert_eq!(
            decisions,
            vec![
                Decision::Hold(ControlCommand::SetPower(-5.0)),
                Decision::Hold(ControlCommand::SetPower(-5.0)),
                Decision::Hold(ControlCommand::SetPower(-5.0)),
                Decision::Complete(ControlCommand::Clear, Completion::DischargeComplete),
            ]
        );
    }

    #[test]
    fn target_soc_clears_inside_band() {
        let mode = ObjectiveMode::TargetSoc { target_soc: 0.5 };
        assert_eq!(
            decide(mode, Some(0.5005)),
            Decision::Complete(ControlCommand::Clear, Completion::TargetReached)
        );
        assert_eq!(
            decide(mode, Some(0.485)),
            Decision::Complete(ControlCommand::Clear, Completion::TargetReached)
        );
    }

    #[test]
    fn target_soc_command_is_bounded() {
        let mode = ObjectiveMode::TargetSoc { target_soc: 0.5 };
        let Decision::Hold(ControlCommand::SetPower(charge)) = decide(mode, Some(0.30)) else {
            panic!("expected a charge command");
        };
        assert!(charge > 0.0 && charge <= MAX_CHARGE_KW);
        assert!((target_power_kw(0.5, 0.45) - 1.25).abs() < 1e-9);

        let Decision::Hold(ControlCommand::SetPower(discharge)) = decide(mode, Some(0.9)) else {
            panic!("expected a discharge command");
        };
        assert_eq!(discharge, MAX_DISCHARGE_KW);
    }

    #[test]
    fn unknown_soc_skips_every_mode() {
        assert_eq!(decide(ObjectiveMode::FullDischarge, None), Decision::Skip);
        assert_eq!(decide(ObjectiveMode::TargetSoc { target_soc: 0.2 }, None), Decision::Skip);
        assert_eq!(decide(ObjectiveMode::Detach, None), Decision::Skip);
        assert_eq!(
            decide(ObjectiveMode::Detach, Some(0.3)),
            Decision::Complete(ControlCommand::SetPower(0.0), Completion::Detached)
        );
    }

    #[test]
    fn mode_validation() {
        assert_eq!(ObjectiveMode::from_parts("detach", Some(7.0)), Ok(ObjectiveMode::Detach));
        assert!(ObjectiveMode::from_parts("target_soc", None).is_err());
        assert!(ObjectiveMode::from_parts("target_soc", Some(1.2)).is_err());
        assert!(ObjectiveMode::from_parts("target_soc", Some(f64::NAN)).is_err());
        assert!(ObjectiveMode::from_parts("charge", None).is_err());
        assert_eq!(
            ObjectiveMode::from_parts("target_soc", Some(1.0)),
            Ok(ObjectiveMode::TargetSoc { target_soc: 1.0 })
        );
    }

    #[tokio::test]
    async fn full_discharge_run_sends_three_commands_then_clear() {
        let harness = Harness::new();
        let ep = endpoint("ug1");
        let objective = Objective::new("ug1", 0, ObjectiveMode::FullDischarge);
        harness.store.upsert_objective(&objective).unwrap();

        for soc in [0.40, 0.20, 0.06, 0.04] {
            harness.controller().apply(&ep, &reading(0, Some(soc)), &objective).await;
        }

        let bodies: Vec<String> = harness
            .transport
            .sent()
            .into_iter()
            .map(|cmd| String::from_utf8(cmd.body).unwrap())
            .collect();
        assert_eq!(
            bodies,
            vec![
                r#"{"idx":0,"power_kw":-500,"clear":0}"#,
                r#"{"idx":0,"power_kw":-500,"clear":0}"#,
                r#"{"idx":0,"power_kw":-500,"clear":0}"#,
                r#"{"idx":0,"power_kw":0,"clear":1}"#,
            ]
        );
        assert_eq!(harness.store.objective("ug1", 0).unwrap(), None);
        let alerts = harness.store.recent_alerts(10).unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].level, "info");
        assert_eq!(alerts[0].message, Completion::DischargeComplete.message());
    }

    #[tokio::test]
    async fn failed_command_still_completes_transition() {
        let harness = Harness::new();
        harness.transport.fail_puts("ug1");
        let ep = endpoint("ug1");
        let objective = Objective::new("ug1", 2, ObjectiveMode::Detach);
        harness.store.upsert_objective(&objective).unwrap();

        let decision = harness.controller().apply(&ep, &reading(2, Some(0.5)), &objective).await;

        assert!(matches!(decision, Decision::Complete(_, Completion::Detached)));
        assert_eq!(harness.store.objective("ug1", 2).unwrap(), None);
        assert_eq!(harness.store.recent_alerts(10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_soc_leaves_objective_alone() {
        let harness = Harness::new();
        let ep = endpoint("ug1");
        let objective = Objective::new("ug1", 1, ObjectiveMode::TargetSoc { target_soc: 0.8 });
        harness.store.upsert_objective(&objective).unwrap();

        let decision = harness.controller().apply(&ep, &reading(1, None), &objective).await;

        assert_eq!(decision, Decision::Skip);
        assert!(harness.transport.sent().is_empty());
        assert!(harness.store.objective("ug1", 1).unwrap().is_some());
        assert!(harness.store.recent_alerts(10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn completion_keeps_an_objective_replaced_mid_command() {
        let harness = Harness::new();
        let ep = endpoint("ug1");
        let applied = Objective::new("ug1", 3, ObjectiveMode::Detach);
        harness.store.upsert_objective(&applied).unwrap();

        let mut replacement = Objective::new("ug1", 3, ObjectiveMode::TargetSoc { target_soc: 0.9 });
        replacement.created_at = applied.created_at + chrono::Duration::seconds(1);
        harness.store.upsert_objective(&replacement).unwrap();

        let decision = harness.controller().apply(&ep, &reading(3, Some(0.4)), &applied).await;

        assert!(matches!(decision, Decision::Complete(_, Completion::Detached)));
        let kept = harness.store.objective("ug1", 3).unwrap().unwrap();
        assert_eq!(kept.mode, ObjectiveMode::TargetSoc { target_soc: 0.9 });
    }
}
