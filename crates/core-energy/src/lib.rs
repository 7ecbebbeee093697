//! Energy safety: thermal/power evaluation with throttle and shutdown
//! decisions.
//!
//! Each evaluation reads the thermal and power caches, maps both onto
//! `Ok | Warn | Critical`, and takes the worse of the two. A shutdown is
//! only requested after `critical_streak_for_shutdown` consecutive
//! critical evaluations with enforcement on — a single hot sample throttles
//! but never kills the run. State transitions and shutdown requests are
//! audited; steady-state repeats are not.

use std::sync::Arc;

use core_audit::{AuditRow, AuditSink, NullSink};
use core_sensors::{SampleStatus, SensorManager, SensorSample};
use tracing::warn;

pub const THERMAL_SENSOR: &str = "thermal.temperature";
pub const POWER_SENSOR: &str = "power.voltage_current";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EnergyState {
    Ok,
    Warn,
    Critical,
}

impl EnergyState {
    fn as_str(self) -> &'static str {
        match self {
            EnergyState::Ok => "OK",
            EnergyState::Warn => "WARN",
            EnergyState::Critical => "CRITICAL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnergyPolicy {
    pub thermal_warn_c: f64,
    pub thermal_critical_c: f64,
    pub power_warn_w: f64,
    pub power_critical_w: f64,
    pub critical_streak_for_shutdown: u32,
    pub throttle_multiplier_on_warn: f64,
    pub throttle_multiplier_on_critical: f64,
}

impl Default for EnergyPolicy {
    fn default() -> Self {
        Self {
            thermal_warn_c: 85.0,
            thermal_critical_c: 95.0,
            power_warn_w: 45.0,
            power_critical_w: 65.0,
            critical_streak_for_shutdown: 3,
            throttle_multiplier_on_warn: 1.5,
            throttle_multiplier_on_critical: 2.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnergyDecision {
    pub state: EnergyState,
    /// Always >= 1; multiplies the runtime's target tick period.
    pub throttle_multiplier: f64,
    pub should_shutdown: bool,
    pub reason: Option<&'static str>,
    pub thermal_c: Option<f64>,
    pub power_w: Option<f64>,
}

/// Pluggable evaluation seam so the unified runtime can be driven by a
/// scripted controller in tests.
pub trait EnergyController: Send {
    fn evaluate(&mut self) -> EnergyDecision;
}

/// Controller backed by the sensor manager's thermal and power caches.
pub struct SensorEnergyController {
    sensors: Arc<SensorManager>,
    policy: EnergyPolicy,
    audit: Arc<dyn AuditSink>,
    enforce_shutdown: bool,
    critical_streak: u32,
    last_state: EnergyState,
}

impl SensorEnergyController {
    pub fn new(sensors: Arc<SensorManager>, policy: EnergyPolicy, enforce_shutdown: bool) -> Self {
        Self::with_audit(sensors, policy, enforce_shutdown, Arc::new(NullSink))
    }

    pub fn with_audit(
        sensors: Arc<SensorManager>,
        policy: EnergyPolicy,
        enforce_shutdown: bool,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            sensors,
            policy,
            audit,
            enforce_shutdown,
            critical_streak: 0,
            last_state: EnergyState::Ok,
        }
    }
}

impl EnergyController for SensorEnergyController {
    fn evaluate(&mut self) -> EnergyDecision {
        let thermal_c = extract_thermal_c(&self.sensors.read_sensor(THERMAL_SENSOR));
        let power_w = extract_power_w(&self.sensors.read_sensor(POWER_SENSOR));

        let thermal_state = state_for(
            thermal_c,
            self.policy.thermal_warn_c,
            self.policy.thermal_critical_c,
        );
        let power_state = state_for(
            power_w,
            self.policy.power_warn_w,
            self.policy.power_critical_w,
        );
        let state = thermal_state.max(power_state);

        let mut should_shutdown = false;
        let mut reason = None;
        if state == EnergyState::Critical {
            self.critical_streak += 1;
            if self.enforce_shutdown
                && self.critical_streak >= self.policy.critical_streak_for_shutdown
            {
                should_shutdown = true;
                reason = Some("sustained_critical_energy_telemetry");
            }
        } else {
            self.critical_streak = 0;
        }

        let throttle_multiplier = match state {
            EnergyState::Ok => 1.0,
            EnergyState::Warn => self.policy.throttle_multiplier_on_warn.max(1.0),
            EnergyState::Critical => self.policy.throttle_multiplier_on_critical.max(1.0),
        };

        let decision = EnergyDecision {
            state,
            throttle_multiplier,
            should_shutdown,
            reason,
            thermal_c,
            power_w,
        };
        if decision.state != self.last_state || decision.should_shutdown {
            if decision.should_shutdown {
                warn!(
                    target: "energy.safety",
                    thermal_c = ?decision.thermal_c,
                    power_w = ?decision.power_w,
                    "shutdown requested"
                );
            }
            let mut row = AuditRow::new("energy_safety_state", "energy_safety")
                .with_detail(decision.state.as_str());
            if decision.should_shutdown {
                row = row.with_detail(format!(
                    "{} shutdown={}",
                    decision.state.as_str(),
                    decision.reason.unwrap_or("requested")
                ));
            }
            self.audit.log(&row);
        }
        self.last_state = decision.state;
        decision
    }
}

fn state_for(value: Option<f64>, warn: f64, critical: f64) -> EnergyState {
    match value {
        None => EnergyState::Ok,
        Some(v) if v >= critical => EnergyState::Critical,
        Some(v) if v >= warn => EnergyState::Warn,
        Some(_) => EnergyState::Ok,
    }
}

fn extract_thermal_c(sample: &SensorSample) -> Option<f64> {
    if sample.status != SampleStatus::Ok {
        return None;
    }
    let value = sample.value.as_ref()?;
    value
        .as_scalar()
        .or_else(|| value.number_field("celsius"))
        .or_else(|| value.number_field("temperature_c"))
}

fn extract_power_w(sample: &SensorSample) -> Option<f64> {
    if sample.status != SampleStatus::Ok {
        return None;
    }
    let value = sample.value.as_ref()?;
    if let Some(watts) = value.as_scalar().or_else(|| value.number_field("power_w")) {
        return Some(watts);
    }
    let voltage = value.number_field("voltage_v")?;
    let current = value.number_field("current_a")?;
    Some(voltage * current)
}
