//! App runtime: manifest-to-running-app orchestration without a display.
//!
//! Loads and validates the manifest, resolves the platform variant,
//! negotiates capabilities through the decider (auditing every decision),
//! freezes the grants into a context, and drives `init -> tick* -> stop`
//! at the requested cadence. Presentation is layered on top by the
//! unified runtime; this loop exists for headless embeddings and tests.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use core_audit::{AuditRow, AuditSink, NullSink};
use core_hdi::HdiThread;
use core_matrix::WindowMatrix;
use core_sensors::SensorManager;
use tracing::{error, info};

use crate::context::AppContext;
use crate::lifecycle::{AppLifecycle, EntrypointRegistry};
use crate::manifest::{self, AppManifest, ResolvedVariant};
use crate::AppError;

pub type CapabilityDecider = Box<dyn Fn(&str) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    pub max_ticks: u64,
    pub target_fps: u32,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_ticks: 1,
            target_fps: 60,
        }
    }
}

pub struct AppRuntime {
    matrix: Arc<WindowMatrix>,
    hdi: Arc<HdiThread>,
    sensors: Arc<SensorManager>,
    decider: CapabilityDecider,
    audit: Arc<dyn AuditSink>,
    registry: EntrypointRegistry,
    host_os: String,
    host_arch: String,
}

impl AppRuntime {
    pub fn new(
        matrix: Arc<WindowMatrix>,
        hdi: Arc<HdiThread>,
        sensors: Arc<SensorManager>,
    ) -> Self {
        Self {
            matrix,
            hdi,
            sensors,
            decider: Box::new(|_| true),
            audit: Arc::new(NullSink),
            registry: EntrypointRegistry::new(),
            host_os: std::env::consts::OS.to_string(),
            host_arch: std::env::consts::ARCH.to_string(),
        }
    }

    pub fn with_decider(mut self, decider: CapabilityDecider) -> Self {
        self.decider = decider;
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_registry(mut self, registry: EntrypointRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Override host platform detection; used by variant-resolution tests.
    pub fn with_host(mut self, os: impl Into<String>, arch: impl Into<String>) -> Self {
        self.host_os = os.into();
        self.host_arch = arch.into();
        self
    }

    pub fn registry_mut(&mut self) -> &mut EntrypointRegistry {
        &mut self.registry
    }

    pub fn load_manifest(&self, app_dir: &Path) -> Result<AppManifest, AppError> {
        Ok(AppManifest::load(app_dir)?)
    }

    pub fn resolve_variant(
        &self,
        app_dir: &Path,
        manifest: &AppManifest,
    ) -> Result<ResolvedVariant, AppError> {
        Ok(manifest::resolve_variant(
            app_dir,
            manifest,
            &self.host_os,
            &self.host_arch,
        )?)
    }

    /// Present each declared capability to the decider. Any required
    /// denial is fatal; optional denials are recorded and skipped.
    pub fn resolve_capabilities(
        &self,
        manifest: &AppManifest,
    ) -> Result<BTreeSet<String>, AppError> {
        let mut granted = BTreeSet::new();
        let mut denied_required = Vec::new();
        for capability in &manifest.required_capabilities {
            if (self.decider)(capability) {
                granted.insert(capability.clone());
                self.audit_capability("granted_required", capability);
            } else {
                denied_required.push(capability.clone());
                self.audit_capability("denied_required", capability);
            }
        }
        if !denied_required.is_empty() {
            denied_required.sort();
            return Err(AppError::RequiredCapabilitiesDenied(
                denied_required.join(", "),
            ));
        }
        for capability in &manifest.optional_capabilities {
            if (self.decider)(capability) {
                granted.insert(capability.clone());
                self.audit_capability("granted_optional", capability);
            } else {
                self.audit_capability("denied_optional", capability);
            }
        }
        Ok(granted)
    }

    pub fn build_context(&self, granted: BTreeSet<String>) -> AppContext {
        AppContext::with_audit(
            Arc::clone(&self.matrix),
            Arc::clone(&self.hdi),
            Arc::clone(&self.sensors),
            granted,
            Arc::clone(&self.audit),
        )
    }

    pub fn resolve_lifecycle(
        &self,
        manifest: &AppManifest,
        resolved: &ResolvedVariant,
    ) -> Result<Box<dyn AppLifecycle>, AppError> {
        self.registry.resolve(manifest, resolved)
    }

    /// Headless run: init, tick at the target cadence, stop. HDI and
    /// sensor workers are live for the duration and torn down on every
    /// exit path.
    pub fn run(&self, app_dir: &Path, options: RunOptions) -> Result<(), AppError> {
        if options.max_ticks == 0 {
            return Err(AppError::InvalidOptions("max_ticks must be > 0"));
        }
        if options.target_fps == 0 {
            return Err(AppError::InvalidOptions("target_fps must be > 0"));
        }
        let manifest = self.load_manifest(app_dir)?;
        let resolved = self.resolve_variant(app_dir, &manifest)?;
        let granted = self.resolve_capabilities(&manifest)?;
        let mut ctx = self.build_context(granted);
        let mut lifecycle = self.resolve_lifecycle(&manifest, &resolved)?;
        info!(
            target: "app.runtime",
            app_id = %manifest.app_id,
            variant = ?resolved.variant_id,
            "starting app"
        );

        let target_dt = Duration::from_secs_f64(1.0 / f64::from(options.target_fps));
        self.hdi.start().map_err(|e| AppError::App(e.into()))?;
        self.sensors.start().map_err(|e| AppError::App(e.into()))?;
        let outcome = (|| -> Result<(), AppError> {
            lifecycle.init(&mut ctx)?;
            let mut last = Instant::now();
            for _ in 0..options.max_ticks {
                let now = Instant::now();
                let dt = now.duration_since(last);
                last = now;
                lifecycle.tick(&mut ctx, dt)?;
                let elapsed = now.elapsed();
                if elapsed < target_dt {
                    std::thread::sleep(target_dt - elapsed);
                }
            }
            Ok(())
        })();
        let stop_outcome = lifecycle.stop(&mut ctx).map_err(AppError::from);
        self.hdi.stop();
        self.sensors.stop();
        if let Err(error) = &outcome {
            error!(target: "app.runtime", %error, "app run failed");
        }
        outcome.and(stop_outcome)
    }

    fn audit_capability(&self, action: &str, capability: &str) {
        self.audit
            .log(&AuditRow::new(action, "app_runtime").with_capability(capability));
    }
}
