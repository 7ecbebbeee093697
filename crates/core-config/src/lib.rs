//! Runtime configuration loading and parsing.
//!
//! `luvatrix.toml` carries the knobs an operator tunes without touching
//! code: matrix/display dimensions and cadence, HDI queue and press
//! timings, sensor poll rates, and the energy-safety policy. Every
//! section and field is optional with a sensible default, and unknown
//! fields are ignored so configs survive runtime upgrades in both
//! directions. CLI flags override file values in the binary.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::info;

pub const CONFIG_FILE_NAME: &str = "luvatrix.toml";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DisplaySection {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub present_fps: Option<u32>,
}

impl Default for DisplaySection {
    fn default() -> Self {
        Self {
            width: 640,
            height: 360,
            fps: 60,
            present_fps: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HdiSection {
    pub max_queue_size: usize,
    /// Source poll rate in hertz.
    pub poll_hz: u32,
    pub hold_threshold_ms: u64,
    pub hold_tick_interval_ms: u64,
    pub double_press_threshold_ms: u64,
}

impl Default for HdiSection {
    fn default() -> Self {
        Self {
            max_queue_size: 1024,
            poll_hz: 240,
            hold_threshold_ms: 500,
            hold_tick_interval_ms: 250,
            double_press_threshold_ms: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SensorSection {
    pub poll_interval_ms: u64,
    pub read_min_interval_ms: u64,
}

impl Default for SensorSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            read_min_interval_ms: 200,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnergyMode {
    Off,
    #[default]
    Monitor,
    Enforce,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EnergySection {
    pub mode: EnergyMode,
    pub thermal_warn_c: f64,
    pub thermal_critical_c: f64,
    pub power_warn_w: f64,
    pub power_critical_w: f64,
    pub critical_streak: u32,
}

impl Default for EnergySection {
    fn default() -> Self {
        Self {
            mode: EnergyMode::Monitor,
            thermal_warn_c: 85.0,
            thermal_critical_c: 95.0,
            power_warn_w: 45.0,
            power_critical_w: 65.0,
            critical_streak: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub display: DisplaySection,
    pub hdi: HdiSection,
    pub sensors: SensorSection,
    pub energy: EnergySection,
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Path the config was loaded from, when one existed.
    pub source: Option<PathBuf>,
    pub file: ConfigFile,
}

/// Load configuration from an explicit path, or discover
/// `luvatrix.toml` in the working directory. A missing discovered file
/// is not an error; a missing explicit file is.
pub fn load_from(explicit: Option<&Path>) -> Result<Config> {
    let (path, required) = match explicit {
        Some(path) => (path.to_path_buf(), true),
        None => (PathBuf::from(CONFIG_FILE_NAME), false),
    };
    if !path.exists() {
        if required {
            anyhow::bail!("config file not found: {}", path.display());
        }
        return Ok(Config::default());
    }
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let file: ConfigFile =
        toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))?;
    info!(target: "runtime.config", path = %path.display(), "config loaded");
    Ok(Config {
        source: Some(path),
        file,
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn absent_discovered_config_yields_defaults() {
        let config = load_from(None).unwrap();
        assert_eq!(config.file, ConfigFile::default());
        assert_eq!(config.file.display.fps, 60);
        assert_eq!(config.file.hdi.poll_hz, 240);
    }

    #[test]
    fn explicit_missing_config_is_an_error() {
        assert!(load_from(Some(Path::new("/definitely/not/here.toml"))).is_err());
    }

    #[test]
    fn partial_sections_merge_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(
            &path,
            r#"
            [display]
            width = 320
            fps = 30

            [energy]
            mode = "enforce"
            critical_streak = 2
            "#,
        )
        .unwrap();
        let config = load_from(Some(&path)).unwrap();
        assert_eq!(config.file.display.width, 320);
        assert_eq!(config.file.display.height, 360);
        assert_eq!(config.file.display.fps, 30);
        assert_eq!(config.file.energy.mode, EnergyMode::Enforce);
        assert_eq!(config.file.energy.critical_streak, 2);
        assert_eq!(config.file.hdi, HdiSection::default());
    }

    #[test]
    fn unknown_fields_are_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(
            &path,
            r#"
            future_top_level = true

            [display]
            width = 128
            future_field = "yes"
            "#,
        )
        .unwrap();
        let config = load_from(Some(&path)).unwrap();
        assert_eq!(config.file.display.width, 128);
    }
}
