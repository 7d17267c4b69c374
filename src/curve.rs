// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Speed curve definitions and lookup.
//!
//! A curve maps a temperature to a fan duty cycle in percent. Unlike an
//! interpolated curve this is a step table: the highest breakpoint whose
//! threshold is at or below the temperature wins.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// A single breakpoint on a speed curve.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SpeedPoint {
    /// Temperature threshold in degrees Celsius
    pub temperature: f64,
    /// Duty cycle in percent (0-100)
    pub speed: f64,
}

impl SpeedPoint {
    pub const fn new(temperature: f64, speed: f64) -> Self {
        Self { temperature, speed }
    }
}

/// A validated, ordered breakpoint table.
///
/// Construction rejects empty tables, speeds outside 0-100, thresholds that
/// are not strictly increasing and speeds that decrease as temperature rises.
/// Points are never reordered: a curve written out of order is a mistake in
/// the configuration, not something to guess about.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeedCurve {
    points: Vec<SpeedPoint>,
}

impl SpeedCurve {
    pub fn new(points: Vec<SpeedPoint>) -> Result<Self> {
        validate(&points)?;
        Ok(Self { points })
    }

    /// Speed of the highest breakpoint (the maximum fan speed).
    pub fn max_speed(&self) -> f64 {
        self.points[self.points.len() - 1].speed
    }

    /// Look up the duty cycle for a temperature.
    ///
    /// - Below the lowest threshold: the lowest breakpoint's speed
    /// - At or above the highest threshold: the highest breakpoint's speed
    /// - Exactly on a threshold: that breakpoint's speed
    pub fn evaluate(&self, temp_c: f64) -> f64 {
        self.points
            .iter()
            .rev()
            .find(|p| temp_c >= p.temperature)
            .unwrap_or(&self.points[0])
            .speed
    }

    /// Look up the duty cycle, holding the current speed on the way down.
    ///
    /// A breakpoint whose speed is at or below `current` stays selected until
    /// the temperature drops below `threshold - hysteresis`. Breakpoints above
    /// the current speed still need the full threshold. With no current speed
    /// or a zero hysteresis this is [`SpeedCurve::evaluate`].
    pub fn evaluate_with_hysteresis(
        &self,
        temp_c: f64,
        hysteresis: f64,
        current: Option<f64>,
    ) -> f64 {
        let Some(current) = current else {
            return self.evaluate(temp_c);
        };

        self.points
            .iter()
            .rev()
            .find(|p| {
                let margin = if current >= p.speed { hysteresis } else { 0.0 };
                temp_c >= p.temperature - margin
            })
            .unwrap_or(&self.points[0])
            .speed
    }
}

fn validate(points: &[SpeedPoint]) -> Result<()> {
    if points.is_empty() {
        return Err(Error::Config("fan_speed must have at least 1 point".to_string()));
    }
    for (i, p) in points.iter().enumerate() {
        if !p.temperature.is_finite() {
            return Err(Error::Config(format!(
                "fan_speed point {i}: temperature must be a finite number"
            )));
        }
        if !(0.0..=100.0).contains(&p.speed) {
            return Err(Error::Config(format!(
                "fan_speed point {i}: speed {} is outside 0-100",
                p.speed
            )));
        }
        if i > 0 {
            let prev = &points[i - 1];
            if p.temperature <= prev.temperature {
                return Err(Error::Config(format!(
                    "fan_speed points must have strictly increasing temperatures (point {i})"
                )));
            }
            if p.speed < prev.speed {
                return Err(Error::Config(format!(
                    "fan_speed point {i}: speed {} is lower than the previous point's {}",
                    p.speed, prev.speed
                )));
            }
        }
    }
    Ok(())
}

/// The curve used when no configuration file is present.
pub fn default_points() -> Vec<SpeedPoint> {
    vec![
        SpeedPoint::new(30.0, 10.0),
        SpeedPoint::new(45.0, 30.0),
        SpeedPoint::new(60.0, 60.0),
        SpeedPoint::new(75.0, 100.0),
    ]
}
