//! Built-in demo lifecycles.
//!
//! The CLI hosts no dynamic code loading, so native (protocol 1) apps
//! resolve against entrypoints registered here; process (protocol 2) apps
//! bring their own executable and bypass the registry entirely. A
//! manifest selects a built-in by naming it, e.g.
//! `entrypoint = "builtin:color_cycle"`.

use std::time::Duration;

use core_app::{AppContext, AppLifecycle, EntrypointRegistry};
use core_hdi::{EventType, PressPhase};
use core_matrix::{PixelRect, WriteBatch, WriteOp};
use tracing::info;

pub fn register_builtin_apps(registry: &mut EntrypointRegistry) {
    registry.register("builtin:color_cycle", || Box::new(ColorCycleApp::default()));
    registry.register("builtin:input_logger", || Box::new(InputLoggerApp));
}

/// Sweeps the matrix hue over time; the smallest possible "something is
/// on screen" app.
#[derive(Default)]
struct ColorCycleApp {
    elapsed: f64,
}

impl AppLifecycle for ColorCycleApp {
    fn init(&mut self, ctx: &mut AppContext) -> anyhow::Result<()> {
        let extent = ctx.matrix_extent();
        let rect = PixelRect::solid(extent.width, extent.height, [0.0, 0.0, 0.0, 255.0])?;
        ctx.submit_write_batch(&WriteBatch::single(WriteOp::FullRewrite(rect)))?;
        Ok(())
    }

    fn tick(&mut self, ctx: &mut AppContext, dt: Duration) -> anyhow::Result<()> {
        self.elapsed += dt.as_secs_f64();
        let phase = self.elapsed.fract() as f32;
        let extent = ctx.matrix_extent();
        let rect = PixelRect::solid(
            extent.width,
            extent.height,
            [255.0 * phase, 64.0, 255.0 * (1.0 - phase), 255.0],
        )?;
        ctx.submit_write_batch(&WriteBatch::single(WriteOp::FullRewrite(rect)))?;
        Ok(())
    }

    fn stop(&mut self, _ctx: &mut AppContext) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Logs normalized input and coarse sensor reads; draws nothing.
struct InputLoggerApp;

impl AppLifecycle for InputLoggerApp {
    fn init(&mut self, _ctx: &mut AppContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn tick(&mut self, ctx: &mut AppContext, _dt: Duration) -> anyhow::Result<()> {
        for event in ctx.poll_hdi_events(64) {
            match event.event_type {
                EventType::Press if event.press_phase() == Some(PressPhase::HoldTick) => {}
                _ => info!(
                    target: "app.input_logger",
                    device = ?event.device,
                    kind = ?event.event_type,
                    status = ?event.status,
                    position = ?event.position(),
                    "event"
                ),
            }
        }
        let thermal = ctx.read_sensor("thermal.temperature");
        if thermal.status == core_sensors::SampleStatus::Ok {
            info!(
                target: "app.input_logger",
                value = ?thermal.value,
                "thermal sample"
            );
        }
        Ok(())
    }

    fn stop(&mut self, _ctx: &mut AppContext) -> anyhow::Result<()> {
        Ok(())
    }
}
