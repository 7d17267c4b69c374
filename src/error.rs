// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Error taxonomy for the fan controller.
//!
//! Startup errors ([`Error::Config`], [`Error::ConfigLoad`],
//! [`Error::PwmUnavailable`]) abort the service. Everything else is a
//! per-sensor or per-cycle failure that the control loop logs and survives.

use std::io;
use std::path::PathBuf;

/// Result alias used throughout the library.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Invalid configuration values (empty curve, zero interval, ...).
    #[error("Configuration error: {0}")]
    Config(String),

    /// The configuration file exists but could not be read or parsed.
    #[error("Failed to load config from {path}: {reason}")]
    ConfigLoad { path: PathBuf, reason: String },

    /// The PWM channel cannot be claimed or is not controllable.
    #[error("PWM interface {path} unavailable: {reason}")]
    PwmUnavailable { path: PathBuf, reason: String },

    /// A secondary (disk) sensor could not be read this cycle.
    #[error("Sensor {source_id} unavailable: {reason}")]
    SensorUnavailable { source_id: String, reason: String },

    /// The CPU temperature could not be read; the cycle is skipped.
    #[error("CPU temperature unavailable: {reason}")]
    PrimarySensorUnavailable { reason: String },

    /// The driver rejected a write or the sysfs file was not writable.
    #[error("Failed to apply duty cycle {duty_ns} ns with period {period_ns} ns: {source}")]
    Actuation {
        period_ns: u64,
        duty_ns: u64,
        source: io::Error,
    },
}
