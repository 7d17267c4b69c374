// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Temperature sources and worst-case aggregation.
//!
//! The CPU temperature comes from kernel thermal zones (millidegrees C),
//! disk temperatures from `smartctl -A -j <device>`. The value fed into the
//! speed curve is the maximum over the CPU and every disk that answered.

use crate::config::FanControlConfig;
use crate::error::{Error, Result};
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// Where a reading came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceId {
    Cpu,
    /// Block device path, e.g. "/dev/sda"
    Disk(String),
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceId::Cpu => f.write_str("cpu"),
            SourceId::Disk(device) => f.write_str(device),
        }
    }
}

/// One temperature sample, in degrees Celsius.
#[derive(Debug, Clone, PartialEq)]
pub struct TemperatureReading {
    pub source: SourceId,
    pub celsius: f64,
}

impl TemperatureReading {
    pub fn new(source: SourceId, celsius: f64) -> Self {
        Self { source, celsius }
    }
}

/// Anything that can produce a temperature on demand.
pub trait ReadTemperature {
    fn source_id(&self) -> SourceId;

    /// Read the current temperature. Fails with [`Error::SensorUnavailable`].
    fn read(&self) -> Result<TemperatureReading>;
}

/// The sensor kinds the service knows how to read.
#[derive(Debug, Clone)]
pub enum TemperatureSource {
    /// Kernel thermal zones; the hottest readable zone is reported.
    Cpu { thermal_zones: Vec<PathBuf> },
    /// A disk queried through smartctl.
    Disk { device: String, smartctl: String },
}

impl ReadTemperature for TemperatureSource {
    fn source_id(&self) -> SourceId {
        match self {
            TemperatureSource::Cpu { .. } => SourceId::Cpu,
            TemperatureSource::Disk { device, .. } => SourceId::Disk(device.clone()),
        }
    }

    fn read(&self) -> Result<TemperatureReading> {
        let celsius = match self {
            TemperatureSource::Cpu { thermal_zones } => read_thermal_zones(thermal_zones),
            TemperatureSource::Disk { device, smartctl } => read_smartctl(smartctl, device),
        };

        celsius
            .map(|c| TemperatureReading::new(self.source_id(), c))
            .map_err(|reason| Error::SensorUnavailable {
                source_id: self.source_id().to_string(),
                reason,
            })
    }
}

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

fn read_thermal_zones(zones: &[PathBuf]) -> std::result::Result<f64, String> {
    let mut hottest: Option<f64> = None;
    let mut failures = Vec::new();

    for zone in zones {
        match read_millidegrees(zone) {
            Ok(c) => hottest = Some(hottest.map_or(c, |h| h.max(c))),
            Err(e) => failures.push(format!("{}: {e}", zone.display())),
        }
    }

    hottest.ok_or_else(|| {
        if failures.is_empty() {
            "no thermal zones configured".to_string()
        } else {
            failures.join("; ")
        }
    })
}

fn read_millidegrees(path: &Path) -> std::result::Result<f64, String> {
    let raw = fs::read_to_string(path).map_err(|e| e.to_string())?;
    raw.trim()
        .parse::<i64>()
        .map(|millic| millic as f64 / 1000.0)
        .map_err(|e| format!("invalid value {:?}: {e}", raw.trim()))
}

fn read_smartctl(smartctl: &str, device: &str) -> std::result::Result<f64, String> {
    let output = Command::new(smartctl)
        .args(["-A", "-j", device])
        .output()
        .map_err(|e| format!("failed to run {smartctl}: {e}"))?;

    // smartctl's exit status is a bit mask that is often non-zero on healthy
    // disks, so only the JSON body decides.
    parse_smartctl_json(&output.stdout).ok_or_else(|| {
        format!(
            "no temperature in smartctl output (exit status {})",
            output.status
        )
    })
}

#[derive(Deserialize)]
struct SmartctlReport {
    temperature: Option<SmartctlTemperature>,
}

#[derive(Deserialize)]
struct SmartctlTemperature {
    current: Option<f64>,
}

/// Extract `temperature.current` from `smartctl -j` output.
pub fn parse_smartctl_json(stdout: &[u8]) -> Option<f64> {
    let report: SmartctlReport = serde_json::from_slice(stdout).ok()?;
    report.temperature?.current
}

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

/// Combine the CPU reading with the disk readings into one temperature.
///
/// The CPU reading is mandatory: its failure becomes
/// [`Error::PrimarySensorUnavailable`]. Failed disks are logged and left out;
/// they never count as 0 C.
pub fn aggregate(
    cpu: Result<TemperatureReading>,
    disks: Vec<Result<TemperatureReading>>,
) -> Result<f64> {
    let cpu = cpu.map_err(primary_unavailable)?;

    let hottest = disks
        .into_iter()
        .filter_map(|reading| match reading {
            Ok(r) => Some(r.celsius),
            Err(e) => {
                log::warn!("{e}");
                None
            }
        })
        .fold(cpu.celsius, f64::max);

    Ok(hottest)
}

fn primary_unavailable(e: Error) -> Error {
    Error::PrimarySensorUnavailable {
        reason: e.to_string(),
    }
}

/// One cycle's worth of temperatures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub cpu: f64,
    /// Hottest disk that answered, if any.
    pub disk: Option<f64>,
    /// Aggregated value fed into the speed curve.
    pub temperature: f64,
}

/// Reads the CPU and every configured disk.
#[derive(Debug)]
pub struct SensorAggregator<S = TemperatureSource> {
    cpu: S,
    disks: Vec<S>,
}

impl SensorAggregator<TemperatureSource> {
    pub fn from_config(config: &FanControlConfig) -> Self {
        let cpu = TemperatureSource::Cpu {
            thermal_zones: config.cpu_thermal_zones.clone(),
        };
        let disks = config
            .disk
            .iter()
            .map(|device| TemperatureSource::Disk {
                device: device.clone(),
                smartctl: config.smartctl.clone(),
            })
            .collect();
        Self::new(cpu, disks)
    }
}

impl<S: ReadTemperature> SensorAggregator<S> {
    pub fn new(cpu: S, disks: Vec<S>) -> Self {
        Self { cpu, disks }
    }

    /// Take one sample. Disks are not queried when the CPU read fails,
    /// since the cycle is skipped anyway.
    pub fn sample(&self) -> Result<Sample> {
        let cpu = self.cpu.read().map_err(primary_unavailable)?;
        let cpu_c = cpu.celsius;

        let disks: Vec<_> = self.disks.iter().map(ReadTemperature::read).collect();
        let disk = disks
            .iter()
            .filter_map(|r| r.as_ref().ok())
            .map(|r| r.celsius)
            .reduce(f64::max);
        let temperature = aggregate(Ok(cpu), disks)?;

        Ok(Sample {
            cpu: cpu_c,
            disk,
            temperature,
        })
    }
}
