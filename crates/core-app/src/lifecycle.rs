//! Application lifecycle boundary and entrypoint resolution.
//!
//! An app is a manifest plus a lifecycle object with three operations:
//! `init`, `tick` (the per-frame loop body), and `stop`. The runtime does
//! no dynamic code loading; native entrypoints are registered by the host
//! embedding under their manifest `module:symbol` string, and process-lane
//! manifests resolve to a [`ProcessLifecycle`](crate::ProcessLifecycle)
//! instead.

use std::collections::HashMap;
use std::time::Duration;

use crate::context::AppContext;
use crate::manifest::{AppManifest, ResolvedVariant};
use crate::process::ProcessLifecycle;
use crate::AppError;

/// The three operations every app implements.
pub trait AppLifecycle: Send {
    fn init(&mut self, ctx: &mut AppContext) -> anyhow::Result<()>;
    fn tick(&mut self, ctx: &mut AppContext, dt: Duration) -> anyhow::Result<()>;
    fn stop(&mut self, ctx: &mut AppContext) -> anyhow::Result<()>;
}

pub type LifecycleFactory = Box<dyn Fn() -> Box<dyn AppLifecycle> + Send + Sync>;

/// Host-registered native entrypoints keyed by `module:symbol`.
#[derive(Default)]
pub struct EntrypointRegistry {
    factories: HashMap<String, LifecycleFactory>,
}

impl EntrypointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        entrypoint: impl Into<String>,
        factory: impl Fn() -> Box<dyn AppLifecycle> + Send + Sync + 'static,
    ) {
        self.factories.insert(entrypoint.into(), Box::new(factory));
    }

    /// Instantiate the lifecycle for a resolved variant: the process lane
    /// when the manifest asks for it, a registered factory otherwise.
    pub fn resolve(
        &self,
        manifest: &AppManifest,
        resolved: &ResolvedVariant,
    ) -> Result<Box<dyn AppLifecycle>, AppError> {
        if manifest.is_process_app() {
            return Ok(Box::new(ProcessLifecycle::from_manifest(
                manifest,
                &resolved.module_dir,
            )?));
        }
        match self.factories.get(&resolved.entrypoint) {
            Some(factory) => Ok(factory()),
            None => Err(AppError::UnknownEntrypoint(resolved.entrypoint.clone())),
        }
    }
}
