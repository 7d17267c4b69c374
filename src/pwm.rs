// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! sysfs PWM channel claiming and duty-cycle actuation.
//!
//! A channel lives under `/sys/class/pwm/pwmchipN/pwmM/` and exposes
//! `period`, `duty_cycle` (both nanoseconds), `enable` and `polarity`.
//! The kernel rejects a duty cycle longer than the active period, so
//! [`PwmActuator`] orders its writes to never cross that line.

use crate::config::{Polarity, PwmConfig};
use crate::error::{Error, Result};
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

/// How long to wait for udev to create `pwmN/` after an export.
const EXPORT_TIMEOUT: Duration = Duration::from_secs(1);

const EXPORT_POLL: Duration = Duration::from_millis(50);

/// Kernel driver that claims the fan PWM when it is not blacklisted.
const CONFLICTING_MODULE: &str = "pwm_fan";

// ---------------------------------------------------------------------------
// Hardware interface
// ---------------------------------------------------------------------------

/// Raw access to one PWM channel. Values are nanoseconds.
pub trait PwmInterface {
    fn read_period(&mut self) -> io::Result<u64>;
    fn read_duty_cycle(&mut self) -> io::Result<u64>;
    fn write_period(&mut self, ns: u64) -> io::Result<()>;
    fn write_duty_cycle(&mut self, ns: u64) -> io::Result<()>;
    fn set_enabled(&mut self, enabled: bool) -> io::Result<()>;
}

/// A PWM channel exported through sysfs.
#[derive(Debug, Clone)]
pub struct SysfsPwm {
    channel_dir: PathBuf,
}

impl SysfsPwm {
    /// Export the configured channel and verify it can be driven.
    ///
    /// Fails with [`Error::PwmUnavailable`] when the chip is missing, the
    /// channel never shows up, or its control files are absent or read-only.
    pub fn claim(config: &PwmConfig) -> Result<Self> {
        let chip = &config.chip;
        let unavailable = |reason: String| Error::PwmUnavailable {
            path: chip.clone(),
            reason,
        };

        if !chip.is_dir() {
            return Err(unavailable("PWM chip not found".to_string()));
        }

        let channel_dir = chip.join(format!("pwm{}", config.channel));
        if !channel_dir.is_dir() {
            export_channel(chip, config.channel, &channel_dir).map_err(unavailable)?;
        } else {
            log::info!("{} already exported", channel_dir.display());
        }

        for attr in ["period", "duty_cycle", "enable"] {
            let path = channel_dir.join(attr);
            if !path.is_file() {
                return Err(unavailable(format!("{} not found", path.display())));
            }
            OpenOptions::new()
                .write(true)
                .open(&path)
                .map_err(|e| unavailable(format!("{} is not writable: {e}", path.display())))?;
        }

        let pwm = Self { channel_dir };
        pwm.set_polarity(config.polarity);
        Ok(pwm)
    }

    pub fn channel_dir(&self) -> &Path {
        &self.channel_dir
    }

    /// Polarity can only change while the output is disabled, and not every
    /// chip supports it, so failures are only warnings.
    fn set_polarity(&self, polarity: Polarity) {
        let path = self.channel_dir.join("polarity");
        let current = read_trimmed(&path).ok();
        if current.as_deref() == Some(polarity.as_sysfs()) {
            return;
        }
        if current.is_none() && polarity == Polarity::Normal {
            return;
        }

        let result = write_value(&self.channel_dir.join("enable"), "0")
            .and_then(|()| write_value(&path, polarity.as_sysfs()));
        match result {
            Ok(()) => log::info!("PWM polarity set to {}", polarity.as_sysfs()),
            Err(e) => log::warn!(
                "Failed to set PWM polarity to {}: {e}",
                polarity.as_sysfs()
            ),
        }
    }

    fn attr(&self, name: &str) -> PathBuf {
        self.channel_dir.join(name)
    }
}

impl PwmInterface for SysfsPwm {
    fn read_period(&mut self) -> io::Result<u64> {
        read_number(&self.attr("period"))
    }

    fn read_duty_cycle(&mut self) -> io::Result<u64> {
        read_number(&self.attr("duty_cycle"))
    }

    fn write_period(&mut self, ns: u64) -> io::Result<()> {
        write_value(&self.attr("period"), ns)
    }

    fn write_duty_cycle(&mut self, ns: u64) -> io::Result<()> {
        write_value(&self.attr("duty_cycle"), ns)
    }

    fn set_enabled(&mut self, enabled: bool) -> io::Result<()> {
        write_value(&self.attr("enable"), u8::from(enabled))
    }
}

fn export_channel(chip: &Path, channel: u32, channel_dir: &Path) -> std::result::Result<(), String> {
    // EBUSY here means someone exported it between our check and the write.
    if let Err(e) = write_value(&chip.join("export"), channel) {
        log::info!("Export of channel {channel} failed ({e}), waiting for it to appear");
    }

    let deadline = Instant::now() + EXPORT_TIMEOUT;
    while !channel_dir.is_dir() {
        if Instant::now() >= deadline {
            return Err(format!(
                "channel {channel} did not appear at {} after export",
                channel_dir.display()
            ));
        }
        thread::sleep(EXPORT_POLL);
    }

    log::info!("Exported {}", channel_dir.display());
    Ok(())
}

/// Fail if the in-kernel `pwm_fan` driver is loaded, since it owns the fan
/// and fights any userspace writes. An unreadable module list is not fatal.
pub fn check_conflicting_driver(proc_modules: &Path) -> Result<()> {
    let modules = match fs::read_to_string(proc_modules) {
        Ok(m) => m,
        Err(e) => {
            log::warn!("Could not read {}: {e}", proc_modules.display());
            return Ok(());
        }
    };

    let loaded = modules
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .any(|name| name == CONFLICTING_MODULE);

    if loaded {
        return Err(Error::PwmUnavailable {
            path: proc_modules.to_path_buf(),
            reason: format!("{CONFLICTING_MODULE} kernel module is loaded; it must be blacklisted"),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Actuator
// ---------------------------------------------------------------------------

/// What the hardware holds, as last written or read back. `None` means
/// unknown, e.g. an unreadable attribute.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PwmChannelState {
    pub period_ns: Option<u64>,
    pub duty_ns: Option<u64>,
    /// Duty cycle in percent that produced `duty_ns`.
    pub percent: Option<f64>,
    pub enabled: bool,
}

/// Convert a percentage of `period_ns` to nanoseconds, rounded to nearest.
pub fn duty_ns(period_ns: u64, percent: f64) -> u64 {
    let percent = percent.clamp(0.0, 100.0);
    (period_ns as f64 * percent / 100.0).round() as u64
}

/// Applies duty cycles to a [`PwmInterface`], skipping redundant writes.
#[derive(Debug)]
pub struct PwmActuator<P> {
    pwm: P,
    state: PwmChannelState,
}

impl<P: PwmInterface> PwmActuator<P> {
    /// Wrap a claimed channel, picking up whatever period and duty cycle are
    /// currently active. The output is treated as disabled until the first
    /// successful apply.
    pub fn new(pwm: P) -> Self {
        let mut actuator = Self {
            pwm,
            state: PwmChannelState::default(),
        };
        actuator.resync();
        actuator
    }

    pub fn state(&self) -> &PwmChannelState {
        &self.state
    }

    /// Drive the channel at `percent` of `period_ns`. Returns the duty cycle
    /// in nanoseconds.
    ///
    /// On failure the channel state is re-read from the hardware and the
    /// output counts as disabled, so the next call rewrites what differs.
    pub fn apply(&mut self, percent: f64, period_ns: u64) -> Result<u64> {
        let percent = percent.clamp(0.0, 100.0);
        let duty = duty_ns(period_ns, percent);

        if self.state.enabled
            && self.state.period_ns == Some(period_ns)
            && self.state.duty_ns == Some(duty)
        {
            self.state.percent = Some(percent);
            return Ok(duty);
        }

        match self.write(period_ns, duty) {
            Ok(()) => {
                self.state = PwmChannelState {
                    period_ns: Some(period_ns),
                    duty_ns: Some(duty),
                    percent: Some(percent),
                    enabled: true,
                };
                Ok(duty)
            }
            Err(source) => {
                self.resync();
                Err(Error::Actuation {
                    period_ns,
                    duty_ns: duty,
                    source,
                })
            }
        }
    }

    /// Pick up the period and duty cycle the hardware currently holds.
    /// Unreadable values stay unknown.
    fn resync(&mut self) {
        let period_ns = self.pwm.read_period().ok();
        let duty_ns = self.pwm.read_duty_cycle().ok();
        let percent = match (period_ns, duty_ns) {
            (Some(p), Some(d)) if p > 0 => Some(d as f64 * 100.0 / p as f64),
            _ => None,
        };
        self.state = PwmChannelState {
            period_ns,
            duty_ns,
            percent,
            enabled: false,
        };
    }

    fn write(&mut self, period_ns: u64, duty: u64) -> io::Result<()> {
        let active = match self.state.period_ns {
            Some(p) => Some(p),
            None => self.pwm.read_period().ok(),
        };

        match active {
            Some(p) if p == period_ns => self.pwm.write_duty_cycle(duty)?,
            // Growing: the old duty already fits the new period.
            Some(p) if period_ns > p => {
                self.pwm.write_period(period_ns)?;
                self.pwm.write_duty_cycle(duty)?;
            }
            // Shrinking: the new duty fits both periods, the old duty may not.
            Some(_) => {
                self.pwm.write_duty_cycle(duty)?;
                self.pwm.write_period(period_ns)?;
            }
            None => {
                self.pwm.write_duty_cycle(0)?;
                self.pwm.write_period(period_ns)?;
                self.pwm.write_duty_cycle(duty)?;
            }
        }

        if !self.state.enabled {
            self.pwm.set_enabled(true)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn read_trimmed(path: &Path) -> io::Result<String> {
    fs::read_to_string(path).map(|s| s.trim().to_string())
}

fn read_number(path: &Path) -> io::Result<u64> {
    read_trimmed(path)?
        .parse::<u64>()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn write_value(path: &Path, value: impl std::fmt::Display) -> io::Result<()> {
    fs::write(path, format!("{value}\n"))
}
