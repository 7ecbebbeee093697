//! Unified runtime: app lifecycle, presentation, and energy safety on one
//! thread.
//!
//! The loop interleaves, per tick: target event pump, close check, energy
//! evaluation (shutdown or throttle), `tick(ctx, dt)`, at most one
//! coalesced presentation, then a sleep of
//! `target_dt * throttle_multiplier - elapsed`. Presentation cadence can
//! be capped independently of tick cadence with `present_fps`. Teardown
//! runs on every exit path in a fixed order: app `stop`, HDI, sensors,
//! render target.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use core_app::{AppError, AppRuntime};
use core_display::{DisplayError, DisplayRuntime};
use core_energy::EnergyController;
use core_hdi::HdiThread;
use core_sensors::SensorManager;
use thiserror::Error;
use tracing::{error, info, warn};

/// Granted sensor capabilities auto-enable these sensor types at startup.
pub const SENSOR_CAPABILITY_TYPES: [(&str, &str); 6] = [
    ("sensor.thermal", "thermal.temperature"),
    ("sensor.power", "power.voltage_current"),
    ("sensor.motion", "sensor.motion"),
    ("sensor.camera", "camera.device"),
    ("sensor.microphone", "microphone.device"),
    ("sensor.speaker", "speaker.device"),
];

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    App(#[from] AppError),
    #[error(transparent)]
    Display(#[from] DisplayError),
    #[error("worker startup failed: {0}")]
    Startup(String),
    #[error("invalid run options: {0}")]
    InvalidOptions(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnifiedRunOptions {
    pub max_ticks: u64,
    pub target_fps: u32,
    /// Independent cap on presentation cadence; `None` presents every
    /// tick that has a pending commit.
    pub present_fps: Option<u32>,
    /// How long one presentation may wait for a commit event. `None`
    /// polls without blocking.
    pub display_timeout: Option<Duration>,
}

impl Default for UnifiedRunOptions {
    fn default() -> Self {
        Self {
            max_ticks: 1,
            target_fps: 60,
            present_fps: None,
            display_timeout: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnifiedRunResult {
    pub ticks_run: u64,
    pub frames_presented: u64,
    pub stopped_by_target_close: bool,
    pub stopped_by_energy_safety: bool,
}

pub struct UnifiedRuntime {
    app_runtime: AppRuntime,
    display: DisplayRuntime,
    hdi: Arc<HdiThread>,
    sensors: Arc<SensorManager>,
    energy: Option<Box<dyn EnergyController>>,
}

impl UnifiedRuntime {
    pub fn new(
        app_runtime: AppRuntime,
        display: DisplayRuntime,
        hdi: Arc<HdiThread>,
        sensors: Arc<SensorManager>,
    ) -> Self {
        Self {
            app_runtime,
            display,
            hdi,
            sensors,
            energy: None,
        }
    }

    pub fn with_energy_safety(mut self, controller: Box<dyn EnergyController>) -> Self {
        self.energy = Some(controller);
        self
    }

    pub fn app_runtime_mut(&mut self) -> &mut AppRuntime {
        &mut self.app_runtime
    }

    /// Load, grant, and drive the app at `app_dir` to completion.
    pub fn run_app(
        &mut self,
        app_dir: &Path,
        options: UnifiedRunOptions,
    ) -> Result<UnifiedRunResult, RuntimeError> {
        if options.max_ticks == 0 {
            return Err(RuntimeError::InvalidOptions("max_ticks must be > 0"));
        }
        if options.target_fps == 0 {
            return Err(RuntimeError::InvalidOptions("target_fps must be > 0"));
        }
        if options.present_fps == Some(0) {
            return Err(RuntimeError::InvalidOptions("present_fps must be > 0"));
        }

        let manifest = self.app_runtime.load_manifest(app_dir)?;
        let resolved = self.app_runtime.resolve_variant(app_dir, &manifest)?;
        let granted = self.app_runtime.resolve_capabilities(&manifest)?;
        let mut lifecycle = self.app_runtime.resolve_lifecycle(&manifest, &resolved)?;
        self.enable_granted_sensors(&granted);
        let mut ctx = self.app_runtime.build_context(granted);
        info!(
            target: "runtime.loop",
            app_id = %manifest.app_id,
            variant = ?resolved.variant_id,
            ticks = options.max_ticks,
            fps = options.target_fps,
            "starting unified run"
        );

        self.display.start_target()?;
        self.hdi
            .start()
            .map_err(|e| RuntimeError::Startup(e.to_string()))?;
        self.sensors
            .start()
            .map_err(|e| RuntimeError::Startup(e.to_string()))?;

        let target_dt = Duration::from_secs_f64(1.0 / f64::from(options.target_fps));
        let present_interval = options
            .present_fps
            .map(|fps| Duration::from_secs_f64(1.0 / f64::from(fps)));
        let mut result = UnifiedRunResult::default();
        let mut last_present: Option<Instant> = None;

        let outcome = (|| -> Result<(), RuntimeError> {
            lifecycle.init(&mut ctx).map_err(AppError::from)?;
            let mut last = Instant::now();
            for _ in 0..options.max_ticks {
                self.display.pump_target();
                if self.display.target_should_close() {
                    result.stopped_by_target_close = true;
                    break;
                }
                let mut throttle_multiplier = 1.0f64;
                if let Some(energy) = self.energy.as_mut() {
                    let decision = energy.evaluate();
                    throttle_multiplier = decision.throttle_multiplier.max(1.0);
                    if decision.should_shutdown {
                        result.stopped_by_energy_safety = true;
                        break;
                    }
                }
                let now = Instant::now();
                let dt = now.duration_since(last);
                last = now;
                lifecycle.tick(&mut ctx, dt).map_err(AppError::from)?;
                result.ticks_run += 1;

                let presentation_due = match (present_interval, last_present) {
                    (Some(interval), Some(at)) => now.duration_since(at) >= interval,
                    _ => true,
                };
                if presentation_due
                    && self.display.run_once(options.display_timeout)?.is_some()
                {
                    result.frames_presented += 1;
                    last_present = Some(now);
                }

                let elapsed = now.elapsed();
                let budget = target_dt.mul_f64(throttle_multiplier);
                if elapsed < budget {
                    std::thread::sleep(budget - elapsed);
                }
            }
            Ok(())
        })();

        // Fixed teardown order on every exit path.
        if let Err(error) = lifecycle.stop(&mut ctx) {
            warn!(target: "runtime.loop", %error, "app stop failed");
        }
        self.hdi.stop();
        self.sensors.stop();
        self.display.stop();

        match outcome {
            Ok(()) => {
                info!(
                    target: "runtime.loop",
                    ticks = result.ticks_run,
                    frames = result.frames_presented,
                    by_close = result.stopped_by_target_close,
                    by_energy = result.stopped_by_energy_safety,
                    "unified run finished"
                );
                Ok(result)
            }
            Err(error) => {
                error!(target: "runtime.loop", %error, "unified run failed");
                Err(error)
            }
        }
    }

    fn enable_granted_sensors(&self, granted: &std::collections::BTreeSet<String>) {
        for (capability, sensor_type) in SENSOR_CAPABILITY_TYPES {
            if granted.contains(capability) {
                self.sensors
                    .set_sensor_enabled(sensor_type, true, "unified_runtime");
            }
        }
    }
}
