// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Configuration file handling.
//!
//! The service reads a YAML document (TOML is accepted too, picked by file
//! extension). Default path: `/etc/default/pwm-fan-control.yaml`

use crate::curve::{self, SpeedCurve, SpeedPoint};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/default/pwm-fan-control.yaml";

/// Default sampling interval in seconds.
pub const DEFAULT_CHECK_INTERVAL_S: u64 = 5;

/// Longest accepted sampling interval in seconds (one day).
pub const MAX_CHECK_INTERVAL_S: u64 = 86_400;

/// Default PWM period in nanoseconds (2.5 kHz).
pub const DEFAULT_PWM_PERIOD_NS: u64 = 400_000;

/// Default PWM chip exposed by the board.
pub const DEFAULT_PWM_CHIP: &str = "/sys/class/pwm/pwmchip1";

/// Default CPU thermal zone.
pub const DEFAULT_THERMAL_ZONE: &str = "/sys/class/thermal/thermal_zone0/temp";

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

/// Top-level configuration. Loaded once at startup and never changed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FanControlConfig {
    /// Seconds between two samples.
    pub check_interval: u64,

    /// PWM period in nanoseconds.
    pub pwm_period: u64,

    /// Temperature-to-speed breakpoints, ascending by temperature.
    pub fan_speed: Vec<SpeedPoint>,

    /// Block devices whose SMART temperature is monitored.
    pub disk: Vec<String>,

    /// Degrees the temperature must fall below a threshold before the fan slows down.
    pub hysteresis: f64,

    /// Spin a stopped fan up at full curve speed for one cycle before settling.
    pub kick_start: bool,

    /// Duty cycle (percent) applied on shutdown.
    pub safe_speed: f64,

    /// Thermal zone `temp` files whose maximum is the CPU temperature.
    pub cpu_thermal_zones: Vec<PathBuf>,

    /// `smartctl` binary used for disk temperatures.
    pub smartctl: String,

    /// PWM channel addressing.
    pub pwm: PwmConfig,
}

/// Which PWM chip and channel drive the fan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PwmConfig {
    /// sysfs directory of the PWM chip.
    pub chip: PathBuf,
    /// Channel number on the chip (`pwmN`).
    pub channel: u32,
    /// Output polarity, set while the channel is disabled.
    pub polarity: Polarity,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Polarity {
    #[default]
    Normal,
    Inversed,
}

impl Polarity {
    /// Value understood by the sysfs `polarity` attribute.
    pub fn as_sysfs(self) -> &'static str {
        match self {
            Polarity::Normal => "normal",
            Polarity::Inversed => "inversed",
        }
    }
}

impl Default for PwmConfig {
    fn default() -> Self {
        Self {
            chip: PathBuf::from(DEFAULT_PWM_CHIP),
            channel: 0,
            polarity: Polarity::Normal,
        }
    }
}

impl Default for FanControlConfig {
    fn default() -> Self {
        Self {
            check_interval: DEFAULT_CHECK_INTERVAL_S,
            pwm_period: DEFAULT_PWM_PERIOD_NS,
            fan_speed: curve::default_points(),
            disk: Vec::new(),
            hysteresis: 0.0,
            kick_start: true,
            safe_speed: 100.0,
            cpu_thermal_zones: vec![PathBuf::from(DEFAULT_THERMAL_ZONE)],
            smartctl: "smartctl".to_string(),
            pwm: PwmConfig::default(),
        }
    }
}

impl FanControlConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval)
    }

    /// Build the validated speed curve.
    pub fn speed_curve(&self) -> Result<SpeedCurve> {
        SpeedCurve::new(self.fan_speed.clone())
    }

    /// Reject values the control loop cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.check_interval == 0 {
            return Err(Error::Config("check_interval must be greater than 0".to_string()));
        }
        if self.check_interval > MAX_CHECK_INTERVAL_S {
            return Err(Error::Config(format!(
                "check_interval {}s is longer than the {MAX_CHECK_INTERVAL_S}s maximum",
                self.check_interval
            )));
        }
        if self.pwm_period == 0 {
            return Err(Error::Config("pwm_period must be greater than 0".to_string()));
        }
        if !self.hysteresis.is_finite() || self.hysteresis < 0.0 {
            return Err(Error::Config(format!(
                "hysteresis must be a non-negative number, got {}",
                self.hysteresis
            )));
        }
        if !(0.0..=100.0).contains(&self.safe_speed) {
            return Err(Error::Config(format!(
                "safe_speed {} is outside 0-100",
                self.safe_speed
            )));
        }
        if self.cpu_thermal_zones.is_empty() {
            return Err(Error::Config(
                "cpu_thermal_zones must name at least one thermal zone".to_string(),
            ));
        }
        if let Some(bad) = self.disk.iter().find(|d| d.trim().is_empty()) {
            return Err(Error::Config(format!("invalid disk identifier {bad:?}")));
        }
        self.speed_curve().map(|_| ())
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Load config from a YAML or TOML file, or return the default if the file
/// doesn't exist. The result is validated before it is returned.
pub fn load_config(path: &Path) -> Result<FanControlConfig> {
    let config = if path.exists() {
        let contents = fs::read_to_string(path).map_err(|e| Error::ConfigLoad {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let config = parse_config(path, &contents)?;
        log::info!("Loaded config from {}", path.display());
        config
    } else {
        log::info!("No config file at {}, using defaults", path.display());
        FanControlConfig::default()
    };

    config.validate()?;
    Ok(config)
}

fn parse_config(path: &Path, contents: &str) -> Result<FanControlConfig> {
    let is_toml = path.extension().is_some_and(|ext| ext == "toml");
    let parsed = if is_toml {
        toml::from_str(contents).map_err(|e| e.to_string())
    } else if contents.trim().is_empty() {
        // An empty YAML document is `null`, which serde_yaml won't turn into a struct.
        Ok(FanControlConfig::default())
    } else {
        serde_yaml::from_str(contents).map_err(|e| e.to_string())
    };

    parsed.map_err(|reason| Error::ConfigLoad {
        path: path.to_path_buf(),
        reason,
    })
}
