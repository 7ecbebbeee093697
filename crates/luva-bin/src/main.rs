//! Luvatrix entrypoint.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use core_app::{AppRuntime, EntrypointRegistry};
use core_audit::{AuditSink, JsonlSink, NullSink, SqliteSink};
use core_config::{Config, EnergyMode};
use core_display::{DisplayRuntime, HeadlessTarget};
use core_energy::{EnergyPolicy, SensorEnergyController};
use core_hdi::{HdiConfig, HdiThread, NoopSource, PressTimings};
use core_matrix::WindowMatrix;
use core_runtime::{UnifiedRunOptions, UnifiedRuntime};
use core_sensors::{
    FieldValue, SensorManager, SensorManagerConfig, SensorProvider, SensorValue, StaticProvider,
};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

mod demo;

/// CLI arguments.
#[derive(Parser, Debug)]
#[command(name = "luvatrix", version, about = "Luvatrix application runtime")]
struct Cli {
    #[command(subcommand)]
    command: Command,
    /// Optional log file; stderr is used when omitted.
    #[arg(long = "log-file", global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run an app directory (app.toml + entrypoint).
    RunApp(RunAppArgs),
    /// Print an audit summary from a JSONL or SQLite sink.
    AuditReport(AuditSinkArgs),
    /// Prune old audit rows down to a maximum row count.
    AuditPrune(AuditPruneArgs),
}

#[derive(Args, Debug)]
struct RunAppArgs {
    app_dir: PathBuf,
    /// Max app-loop ticks.
    #[arg(long)]
    ticks: Option<u64>,
    /// Tick cadence; overrides the config file.
    #[arg(long)]
    fps: Option<u32>,
    /// Presentation cadence cap, independent of tick cadence.
    #[arg(long = "present-fps")]
    present_fps: Option<u32>,
    /// Matrix/window width; overrides the config file.
    #[arg(long)]
    width: Option<u32>,
    /// Matrix/window height; overrides the config file.
    #[arg(long)]
    height: Option<u32>,
    #[arg(long, value_enum, default_value = "headless")]
    render: RenderBackend,
    #[arg(long = "sensor-backend", value_enum, default_value = "none")]
    sensor_backend: SensorBackend,
    #[arg(long = "energy-safety", value_enum)]
    energy_safety: Option<EnergySafetyArg>,
    #[arg(long = "energy-thermal-warn-c")]
    energy_thermal_warn_c: Option<f64>,
    #[arg(long = "energy-thermal-critical-c")]
    energy_thermal_critical_c: Option<f64>,
    #[arg(long = "energy-power-warn-w")]
    energy_power_warn_w: Option<f64>,
    #[arg(long = "energy-power-critical-w")]
    energy_power_critical_w: Option<f64>,
    #[arg(long = "energy-critical-streak")]
    energy_critical_streak: Option<u32>,
    /// Configuration file (defaults to discovering `luvatrix.toml`).
    #[arg(long)]
    config: Option<PathBuf>,
    #[command(flatten)]
    audit: AuditSinkArgs,
}

#[derive(Args, Debug)]
struct AuditSinkArgs {
    #[arg(long = "audit-jsonl")]
    audit_jsonl: Option<PathBuf>,
    #[arg(long = "audit-sqlite")]
    audit_sqlite: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct AuditPruneArgs {
    #[command(flatten)]
    sink: AuditSinkArgs,
    #[arg(long = "max-rows")]
    max_rows: u64,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum RenderBackend {
    Headless,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum SensorBackend {
    None,
    /// Fixed demo telemetry; useful for exercising gating end to end.
    Static,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum EnergySafetyArg {
    Off,
    Monitor,
    Enforce,
}

fn main() {
    let cli = Cli::parse();
    let _log_guard = match configure_logging(cli.log_file.as_deref()) {
        Ok(guard) => guard,
        Err(error) => {
            eprintln!("luvatrix: logging setup failed: {error}");
            std::process::exit(2);
        }
    };
    let outcome = match cli.command {
        Command::RunApp(args) => run_app(args),
        Command::AuditReport(args) => audit_report(&args),
        Command::AuditPrune(args) => audit_prune(&args),
    };
    if let Err(error) = outcome {
        eprintln!("luvatrix: {error:#}");
        std::process::exit(1);
    }
}

fn configure_logging(log_file: Option<&std::path::Path>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match log_file {
        Some(path) => {
            let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
            if let Some(parent) = parent {
                std::fs::create_dir_all(parent)?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            Ok(None)
        }
    }
}

fn run_app(args: RunAppArgs) -> Result<()> {
    let config = core_config::load_from(args.config.as_deref())?;
    let width = args.width.unwrap_or(config.file.display.width);
    let height = args.height.unwrap_or(config.file.display.height);
    let fps = args.fps.unwrap_or(config.file.display.fps);
    let present_fps = args.present_fps.or(config.file.display.present_fps);
    let ticks = args.ticks.unwrap_or(600);

    let matrix = Arc::new(
        WindowMatrix::with_dimensions(height, width)
            .with_context(|| format!("creating {width}x{height} matrix"))?,
    );
    let hdi = Arc::new(
        HdiThread::new(NoopSource, hdi_config(&config))
            .context("configuring hdi thread")?,
    );
    let audit = build_audit_sink(&args.audit)?;
    let sensors = Arc::new(
        SensorManager::new(
            sensor_providers(args.sensor_backend),
            SensorManagerConfig {
                poll_interval: Duration::from_millis(config.file.sensors.poll_interval_ms),
                audit: Arc::clone(&audit),
                ..SensorManagerConfig::default()
            },
        )
        .context("configuring sensor manager")?,
    );

    let mut registry = EntrypointRegistry::new();
    demo::register_builtin_apps(&mut registry);
    let app_runtime = AppRuntime::new(
        Arc::clone(&matrix),
        Arc::clone(&hdi),
        Arc::clone(&sensors),
    )
    .with_audit(Arc::clone(&audit))
    .with_registry(registry);

    let target = HeadlessTarget::new();
    let observer = target.clone();
    let display = match args.render {
        RenderBackend::Headless => {
            DisplayRuntime::new(Arc::clone(&matrix), Box::new(target))
        }
    };

    let mut runtime = UnifiedRuntime::new(
        app_runtime,
        display,
        Arc::clone(&hdi),
        Arc::clone(&sensors),
    );
    let mode = effective_energy_mode(&args, &config);
    if mode != EnergyMode::Off {
        let policy = energy_policy(&args, &config);
        let controller = SensorEnergyController::with_audit(
            Arc::clone(&sensors),
            policy,
            mode == EnergyMode::Enforce,
            Arc::clone(&audit),
        );
        runtime = runtime.with_energy_safety(Box::new(controller));
    }

    let result = runtime.run_app(
        &args.app_dir,
        UnifiedRunOptions {
            max_ticks: ticks,
            target_fps: fps,
            present_fps,
            display_timeout: None,
        },
    )?;
    info!(
        target: "runtime.cli",
        ticks = result.ticks_run,
        frames = result.frames_presented,
        "run complete"
    );
    println!(
        "ran {} ticks, presented {} frames{}{}",
        result.ticks_run,
        observer.frames_presented(),
        if result.stopped_by_target_close {
            " (target close)"
        } else {
            ""
        },
        if result.stopped_by_energy_safety {
            " (energy safety shutdown)"
        } else {
            ""
        },
    );
    audit.close();
    Ok(())
}

fn hdi_config(config: &Config) -> HdiConfig {
    let hdi = &config.file.hdi;
    HdiConfig {
        max_queue_size: hdi.max_queue_size,
        poll_interval: Duration::from_secs_f64(1.0 / f64::from(hdi.poll_hz.max(1))),
        timings: PressTimings {
            hold_threshold: Duration::from_millis(hdi.hold_threshold_ms),
            hold_tick_interval: Duration::from_millis(hdi.hold_tick_interval_ms),
            double_press_threshold: Duration::from_millis(hdi.double_press_threshold_ms),
        },
        ..HdiConfig::default()
    }
}

fn effective_energy_mode(args: &RunAppArgs, config: &Config) -> EnergyMode {
    match args.energy_safety {
        Some(EnergySafetyArg::Off) => EnergyMode::Off,
        Some(EnergySafetyArg::Monitor) => EnergyMode::Monitor,
        Some(EnergySafetyArg::Enforce) => EnergyMode::Enforce,
        None => config.file.energy.mode,
    }
}

fn energy_policy(args: &RunAppArgs, config: &Config) -> EnergyPolicy {
    let section = &config.file.energy;
    EnergyPolicy {
        thermal_warn_c: args.energy_thermal_warn_c.unwrap_or(section.thermal_warn_c),
        thermal_critical_c: args
            .energy_thermal_critical_c
            .unwrap_or(section.thermal_critical_c),
        power_warn_w: args.energy_power_warn_w.unwrap_or(section.power_warn_w),
        power_critical_w: args
            .energy_power_critical_w
            .unwrap_or(section.power_critical_w),
        critical_streak_for_shutdown: args
            .energy_critical_streak
            .unwrap_or(section.critical_streak),
        ..EnergyPolicy::default()
    }
}

fn sensor_providers(backend: SensorBackend) -> HashMap<String, Box<dyn SensorProvider>> {
    let mut providers: HashMap<String, Box<dyn SensorProvider>> = HashMap::new();
    if backend == SensorBackend::Static {
        providers.insert(
            "thermal.temperature".to_string(),
            Box::new(StaticProvider::new(SensorValue::Scalar(58.75), "C")),
        );
        providers.insert(
            "power.voltage_current".to_string(),
            Box::new(StaticProvider::new(
                SensorValue::record([
                    ("voltage_v", FieldValue::Number(11.98)),
                    ("current_a", FieldValue::Number(1.42)),
                ]),
                "mixed",
            )),
        );
        providers.insert(
            "sensor.motion".to_string(),
            Box::new(StaticProvider::new(
                SensorValue::record([
                    ("x", FieldValue::Number(0.02)),
                    ("y", FieldValue::Number(-0.01)),
                    ("z", FieldValue::Number(0.98)),
                ]),
                "raw",
            )),
        );
    }
    providers
}

fn build_audit_sink(args: &AuditSinkArgs) -> Result<Arc<dyn AuditSink>> {
    if args.audit_sqlite.is_some() && args.audit_jsonl.is_some() {
        bail!("choose one of --audit-sqlite or --audit-jsonl");
    }
    if let Some(path) = &args.audit_sqlite {
        return Ok(Arc::new(
            SqliteSink::open(path).context("opening sqlite audit sink")?,
        ));
    }
    if let Some(path) = &args.audit_jsonl {
        return Ok(Arc::new(
            JsonlSink::new(path.clone()).context("opening jsonl audit sink")?,
        ));
    }
    Ok(Arc::new(NullSink))
}

fn require_audit_sink(args: &AuditSinkArgs) -> Result<Arc<dyn AuditSink>> {
    if args.audit_sqlite.is_none() && args.audit_jsonl.is_none() {
        bail!("an audit sink is required: pass --audit-sqlite or --audit-jsonl");
    }
    build_audit_sink(args)
}

fn audit_report(args: &AuditSinkArgs) -> Result<()> {
    let sink = require_audit_sink(args)?;
    let summary = sink.summarize()?;
    println!("total: {}", summary.total);
    println!("by_action:");
    for (action, count) in &summary.by_action {
        println!("  {action}: {count}");
    }
    println!("by_sensor:");
    for (sensor, count) in &summary.by_sensor {
        let label = if sensor.is_empty() { "-" } else { sensor };
        println!("  {label}: {count}");
    }
    sink.close();
    Ok(())
}

fn audit_prune(args: &AuditPruneArgs) -> Result<()> {
    let sink = require_audit_sink(&args.sink)?;
    let removed = sink.prune(args.max_rows)?;
    println!("removed {removed} rows");
    sink.close();
    Ok(())
}
