// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Temperature-driven PWM fan control for single-board computers.
//!
//! [`control::ControlLoop`] samples the CPU and disk temperatures
//! ([`sensor`]), maps the hottest one through a step curve ([`curve`]) and
//! writes the resulting duty cycle to a sysfs PWM channel ([`pwm`]).

pub mod config;
pub mod control;
pub mod curve;
pub mod error;
pub mod pwm;
pub mod sensor;

#[cfg(test)]
mod test_utils;

pub use error::{Error, Result};
