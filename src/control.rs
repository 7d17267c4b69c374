// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! The control loop: sample, look up the curve, actuate, wait.
//!
//! Cycles never overlap. The body of a cycle is synchronous and the only
//! suspension point is the wait for the next tick, which is also where a
//! shutdown request is noticed. Ticks are fixed-rate: a cycle that runs
//! longer than `check_interval` is followed immediately by the next one,
//! without a burst of catch-up cycles.

use crate::config::FanControlConfig;
use crate::curve::SpeedCurve;
use crate::error::{Error, Result};
use crate::pwm::{PwmActuator, PwmInterface, SysfsPwm};
use crate::sensor::{ReadTemperature, Sample, SensorAggregator, TemperatureSource};
use std::future::Future;
use tokio::time::{self, Instant, MissedTickBehavior};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initializing,
    Running,
    ShuttingDown,
}

/// Bookkeeping carried from one cycle to the next.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ControlLoopState {
    /// Duty cycle (percent) the fan is running at: the last successful
    /// actuation, or what the channel reported after a failed one.
    pub last_duty: Option<f64>,
    /// Curve speed chosen by the last cycle that reached the actuator. Hysteresis
    /// works from this, so a kick-start never holds the fan at full speed.
    pub last_target: Option<f64>,
    /// `None` before the first tick or when the next one is out of range.
    pub next_tick: Option<Instant>,
    pub cycles: u64,
    pub failed_cycles: u64,
}

/// What a successful cycle did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CycleReport {
    pub sample: Sample,
    /// Duty cycle applied, in percent.
    pub duty_percent: f64,
    pub duty_ns: u64,
    /// The fan was stopped and got a full-speed start instead of the curve value.
    pub kick_start: bool,
}

pub struct ControlLoop<S = TemperatureSource, P = SysfsPwm> {
    config: FanControlConfig,
    curve: SpeedCurve,
    sensors: SensorAggregator<S>,
    actuator: PwmActuator<P>,
    state: ControlLoopState,
    phase: Phase,
}

impl<S: ReadTemperature, P: PwmInterface> ControlLoop<S, P> {
    /// Validate the configuration and take ownership of the sensors and the
    /// claimed PWM channel.
    pub fn new(
        config: FanControlConfig,
        sensors: SensorAggregator<S>,
        actuator: PwmActuator<P>,
    ) -> Result<Self> {
        config.validate()?;
        let curve = config.speed_curve()?;
        Ok(Self {
            config,
            curve,
            sensors,
            actuator,
            state: ControlLoopState::default(),
            phase: Phase::Initializing,
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn state(&self) -> &ControlLoopState {
        &self.state
    }

    /// Run cycles every `check_interval` until `shutdown` resolves, then
    /// drive the fan to the configured safe speed.
    pub async fn run<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        self.phase = Phase::Running;
        log::info!(
            "Fan control running: every {}s, PWM period {} ns, {} disk(s)",
            self.config.check_interval,
            self.config.pwm_period,
            self.config.disk.len()
        );

        let period = self.config.check_interval();
        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;
                () = &mut shutdown => break,
                scheduled = interval.tick() => {
                    self.tick();
                    self.state.next_tick = scheduled
                        .checked_add(period)
                        .map(|next| next.max(Instant::now()));
                }
            }
        }

        self.shut_down();
    }

    /// Run one cycle and contain its failure: errors are logged, never
    /// propagated.
    pub fn tick(&mut self) -> Option<CycleReport> {
        self.state.cycles += 1;

        match self.run_cycle() {
            Ok(report) => Some(report),
            Err(e) => {
                self.state.failed_cycles += 1;
                match e {
                    Error::PrimarySensorUnavailable { .. } => {
                        log::error!("{e}; keeping current fan speed")
                    }
                    Error::Actuation { .. } => log::error!("{e}; will retry next cycle"),
                    _ => log::error!("Cycle failed: {e}"),
                }
                None
            }
        }
    }

    /// One sample-evaluate-actuate pass.
    ///
    /// A failed CPU read returns before the actuator is touched, so the fan
    /// keeps its last duty cycle.
    pub fn run_cycle(&mut self) -> Result<CycleReport> {
        let sample = self.sensors.sample()?;

        let target = self.curve.evaluate_with_hysteresis(
            sample.temperature,
            self.config.hysteresis,
            self.state.last_target,
        );
        let kick_start = self.config.kick_start && self.state.last_duty == Some(0.0) && target > 0.0;
        let duty_percent = if kick_start {
            self.curve.max_speed()
        } else {
            target
        };

        self.state.last_target = Some(target);
        let duty_ns = match self.actuator.apply(duty_percent, self.config.pwm_period) {
            Ok(ns) => ns,
            Err(e) => {
                self.state.last_duty = self.actuator.state().percent;
                return Err(e);
            }
        };
        self.state.last_duty = Some(duty_percent);

        log::debug!(
            "CPU: {:.1} °C, Disk: {}, Fan Speed: {duty_percent} %{}, {:.1} kHz, Polarity: {}",
            sample.cpu,
            sample
                .disk
                .map_or_else(|| "n/a".to_string(), |d| format!("{d:.1} °C")),
            if kick_start { " (kick-start)" } else { "" },
            1e6 / self.config.pwm_period as f64,
            self.config.pwm.polarity.as_sysfs(),
        );

        Ok(CycleReport {
            sample,
            duty_percent,
            duty_ns,
            kick_start,
        })
    }

    /// Best-effort move to the safe speed. Failure is only logged; the
    /// process is exiting either way.
    pub fn shut_down(&mut self) {
        self.phase = Phase::ShuttingDown;
        let speed = self.config.safe_speed;
        match self.actuator.apply(speed, self.config.pwm_period) {
            Ok(_) => {
                self.state.last_duty = Some(speed);
                log::info!("Shutting down, fan set to {speed} %");
            }
            Err(e) => log::warn!("Shutting down, could not set fan to {speed} %: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curve::SpeedPoint;
    use crate::sensor::SourceId;
    use crate::test_utils::{FakePwm, FakeSensor, PwmWrite};
    use std::time::Duration;

    struct Rig {
        cpu: FakeSensor,
        disks: Vec<FakeSensor>,
        pwm: FakePwm,
        control: ControlLoop<FakeSensor, FakePwm>,
    }

    fn rig(config: FanControlConfig, cpu: Option<f64>, disks: &[Option<f64>]) -> Rig {
        let cpu = FakeSensor::new(SourceId::Cpu, cpu);
        let disks: Vec<_> = disks
            .iter()
            .enumerate()
            .map(|(i, t)| FakeSensor::new(SourceId::Disk(format!("/dev/sd{i}")), *t))
            .collect();
        let pwm = FakePwm::new(config.pwm_period, 0);
        let control = ControlLoop::new(
            config,
            SensorAggregator::new(cpu.clone(), disks.clone()),
            PwmActuator::new(pwm.clone()),
        )
        .unwrap();
        Rig {
            cpu,
            disks,
            pwm,
            control,
        }
    }

    fn config(points: &[(f64, f64)]) -> FanControlConfig {
        FanControlConfig {
            fan_speed: points.iter().map(|&(t, s)| SpeedPoint::new(t, s)).collect(),
            ..Default::default()
        }
    }

    fn standard() -> FanControlConfig {
        config(&[(30.0, 10.0), (45.0, 30.0), (60.0, 60.0), (75.0, 100.0)])
    }

    #[test]
    fn test_end_to_end_cycle() {
        let mut rig = rig(standard(), Some(50.0), &[]);
        assert_eq!(rig.control.phase(), Phase::Initializing);

        let report = rig.control.run_cycle().unwrap();
        assert_eq!(report.sample.temperature, 50.0);
        assert_eq!(report.duty_percent, 30.0);
        assert_eq!(report.duty_ns, 120_000);
        assert!(!report.kick_start);
        assert_eq!(rig.pwm.duty(), 120_000);
        assert_eq!(rig.pwm.period(), 400_000);
        assert!(rig.pwm.enabled());
    }

    #[test]
    fn test_hot_disk_drives_the_fan() {
        let mut rig = rig(standard(), Some(40.0), &[None, Some(62.0)]);
        let report = rig.control.run_cycle().unwrap();
        assert_eq!(report.sample.cpu, 40.0);
        assert_eq!(report.sample.disk, Some(62.0));
        assert_eq!(report.duty_percent, 60.0);
        assert_eq!(rig.disks[0].reads(), 1);
    }

    #[test]
    fn test_cpu_failure_leaves_fan_alone() {
        let mut rig = rig(standard(), Some(50.0), &[Some(30.0)]);
        rig.control.tick().unwrap();
        let writes = rig.pwm.writes();

        rig.cpu.set(None);
        assert!(matches!(
            rig.control.run_cycle(),
            Err(Error::PrimarySensorUnavailable { .. })
        ));
        assert!(rig.control.tick().is_none());

        assert_eq!(rig.pwm.writes(), writes);
        assert_eq!(rig.pwm.duty(), 120_000);
        assert_eq!(rig.control.state().last_duty, Some(30.0));
        assert_eq!(rig.control.state().cycles, 2);
        assert_eq!(rig.control.state().failed_cycles, 1);
    }

    #[test]
    fn test_actuation_failure_is_retried() {
        let mut rig = rig(standard(), Some(50.0), &[]);
        rig.control.tick().unwrap();

        rig.cpu.set(Some(65.0));
        rig.pwm.fail_writes(true);
        assert!(matches!(
            rig.control.run_cycle(),
            Err(Error::Actuation { duty_ns: 240_000, .. })
        ));
        // The channel still holds the previous duty cycle.
        assert_eq!(rig.control.state().last_duty, Some(30.0));

        rig.pwm.fail_writes(false);
        let report = rig.control.tick().unwrap();
        assert_eq!(report.duty_percent, 60.0);
        assert_eq!(rig.pwm.duty(), 240_000);
    }

    #[test]
    fn test_kick_start_from_standstill() {
        let mut rig = rig(config(&[(30.0, 0.0), (50.0, 50.0), (70.0, 100.0)]), Some(20.0), &[]);
        assert_eq!(rig.control.run_cycle().unwrap().duty_percent, 0.0);

        rig.cpu.set(Some(55.0));
        let report = rig.control.run_cycle().unwrap();
        assert!(report.kick_start);
        assert_eq!(report.duty_percent, 100.0);

        let report = rig.control.run_cycle().unwrap();
        assert!(!report.kick_start);
        assert_eq!(report.duty_percent, 50.0);
    }

    #[test]
    fn test_kick_start_with_hysteresis() {
        let mut cfg = config(&[(30.0, 0.0), (50.0, 50.0), (70.0, 100.0)]);
        cfg.hysteresis = 2.0;
        let mut rig = rig(cfg, Some(20.0), &[]);
        assert_eq!(rig.control.run_cycle().unwrap().duty_percent, 0.0);

        rig.cpu.set(Some(69.0));
        let report = rig.control.run_cycle().unwrap();
        assert!(report.kick_start);
        assert_eq!(report.duty_percent, 100.0);

        // 69C is within 2C of the 70C breakpoint, but the fan only got there
        // through the kick, so it settles back to the curve.
        for _ in 0..2 {
            let report = rig.control.run_cycle().unwrap();
            assert!(!report.kick_start);
            assert_eq!(report.duty_percent, 50.0);
        }
        assert_eq!(rig.pwm.duty(), 200_000);
    }

    #[test]
    fn test_failed_kick_start_is_retried() {
        let mut rig = rig(config(&[(30.0, 0.0), (50.0, 50.0), (70.0, 100.0)]), Some(20.0), &[]);
        rig.control.run_cycle().unwrap();

        rig.cpu.set(Some(55.0));
        rig.pwm.fail_writes(true);
        assert!(matches!(
            rig.control.run_cycle(),
            Err(Error::Actuation { duty_ns: 400_000, .. })
        ));
        assert_eq!(rig.control.state().last_duty, Some(0.0));

        rig.pwm.fail_writes(false);
        let report = rig.control.run_cycle().unwrap();
        assert!(report.kick_start);
        assert_eq!(report.duty_percent, 100.0);
    }

    #[test]
    fn test_kick_start_disabled() {
        let mut cfg = config(&[(30.0, 0.0), (50.0, 50.0), (70.0, 100.0)]);
        cfg.kick_start = false;
        let mut rig = rig(cfg, Some(20.0), &[]);
        rig.control.run_cycle().unwrap();
        rig.cpu.set(Some(55.0));
        assert_eq!(rig.control.run_cycle().unwrap().duty_percent, 50.0);
    }

    #[test]
    fn test_hysteresis_across_cycles() {
        let mut cfg = standard();
        cfg.hysteresis = 2.0;
        let mut rig = rig(cfg, Some(61.0), &[]);

        assert_eq!(rig.control.run_cycle().unwrap().duty_percent, 60.0);
        rig.cpu.set(Some(59.0));
        assert_eq!(rig.control.run_cycle().unwrap().duty_percent, 60.0);
        rig.cpu.set(Some(57.0));
        assert_eq!(rig.control.run_cycle().unwrap().duty_percent, 30.0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let cpu = FakeSensor::new(SourceId::Cpu, Some(40.0));
        let result = ControlLoop::new(
            config(&[]),
            SensorAggregator::new(cpu, Vec::new()),
            PwmActuator::new(FakePwm::new(400_000, 0)),
        );
        assert!(matches!(result, Err(Error::Config(_))));

        let cpu = FakeSensor::new(SourceId::Cpu, Some(40.0));
        let result = ControlLoop::new(
            FanControlConfig {
                check_interval: u64::MAX,
                ..standard()
            },
            SensorAggregator::new(cpu, Vec::new()),
            PwmActuator::new(FakePwm::new(400_000, 0)),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_longest_check_interval_runs() {
        let mut rig = rig(
            FanControlConfig {
                check_interval: crate::config::MAX_CHECK_INTERVAL_S,
                ..standard()
            },
            Some(50.0),
            &[],
        );
        let start = Instant::now();
        rig.control.run(time::sleep(Duration::from_secs(1))).await;

        assert_eq!(rig.control.state().cycles, 1);
        assert_eq!(
            rig.control.state().next_tick,
            Some(start + Duration::from_secs(crate::config::MAX_CHECK_INTERVAL_S))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_ticks_at_check_interval() {
        let mut rig = rig(standard(), Some(50.0), &[]);

        // Ticks at 0s, 5s, 10s and 15s; shutdown arrives at 16s.
        rig.control
            .run(time::sleep(Duration::from_secs(16)))
            .await;

        assert_eq!(rig.control.state().cycles, 4);
        assert_eq!(rig.control.phase(), Phase::ShuttingDown);
        // Safe speed on the way out.
        assert_eq!(rig.pwm.duty(), 400_000);
        assert_eq!(rig.control.state().last_duty, Some(100.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_survives_failing_cycles() {
        let mut rig = rig(standard(), None, &[]);
        rig.control
            .run(time::sleep(Duration::from_secs(21)))
            .await;

        assert_eq!(rig.control.state().cycles, 5);
        assert_eq!(rig.control.state().failed_cycles, 5);
        // Nothing but the shutdown write reached the channel.
        assert_eq!(
            rig.pwm.writes(),
            vec![PwmWrite::DutyCycle(400_000), PwmWrite::Enable(true)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_shutdown_wins_over_tick() {
        let mut rig = rig(standard(), Some(50.0), &[]);
        rig.control.run(std::future::ready(())).await;

        assert_eq!(rig.control.state().cycles, 0);
        assert_eq!(rig.pwm.duty(), 400_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_tick_is_scheduled() {
        let mut rig = rig(standard(), Some(50.0), &[]);
        let start = Instant::now();
        rig.control.run(time::sleep(Duration::from_secs(1))).await;

        assert_eq!(rig.control.state().cycles, 1);
        assert_eq!(
            rig.control.state().next_tick,
            Some(start + Duration::from_secs(5))
        );
    }
}
