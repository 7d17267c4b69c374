// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! pwm-fan-control: system service that samples CPU and disk temperatures and
//! drives the board's PWM fan along a configured speed curve.

use anyhow::Context;
use clap::Parser;
use nix::unistd::Uid;
use pwm_fan_control::config::{self, FanControlConfig};
use pwm_fan_control::control::ControlLoop;
use pwm_fan_control::pwm::{self, PwmActuator, SysfsPwm};
use pwm_fan_control::sensor::SensorAggregator;
use std::path::{Path, PathBuf};
use tokio::signal::unix::{SignalKind, signal};

/// Loaded kernel modules, checked for a driver that already owns the fan.
const PROC_MODULES: &str = "/proc/modules";

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "pwm-fan-control", about = "PWM fan control service")]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, default_value = config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Validate the configuration, print the speed curve and exit.
    #[arg(long)]
    check_config: bool,

    /// Log every control cycle.
    #[arg(short, long)]
    verbose: bool,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

/// Startup runs before the runtime exists: claiming the channel polls sysfs
/// with blocking sleeps.
fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    let cfg = config::load_config(&cli.config)
        .with_context(|| format!("Invalid configuration in {}", cli.config.display()))?;

    if cli.check_config {
        print_summary(&cli.config, &cfg);
        return Ok(());
    }

    if !Uid::effective().is_root() {
        log::warn!("Not running as root, PWM writes will probably be refused");
    }

    pwm::check_conflicting_driver(Path::new(PROC_MODULES))?;
    let channel = SysfsPwm::claim(&cfg.pwm).context("Could not claim the PWM channel")?;
    log::info!("Using PWM channel {}", channel.channel_dir().display());

    let sensors = SensorAggregator::from_config(&cfg);
    let mut control = ControlLoop::new(cfg, sensors, PwmActuator::new(channel))?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start the async runtime")?;

    runtime.block_on(async move {
        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        let shutdown = async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => log::info!("Received SIGINT"),
                _ = sigterm.recv() => log::info!("Received SIGTERM"),
            }
        };

        control.run(shutdown).await;
        anyhow::Ok(())
    })
}

fn print_summary(path: &Path, cfg: &FanControlConfig) {
    println!("Configuration {} is valid", path.display());
    println!(
        "  check_interval: {}s, pwm_period: {} ns, hysteresis: {} °C",
        cfg.check_interval, cfg.pwm_period, cfg.hysteresis
    );
    println!(
        "  pwm: {} channel {} ({})",
        cfg.pwm.chip.display(),
        cfg.pwm.channel,
        cfg.pwm.polarity.as_sysfs()
    );
    if !cfg.disk.is_empty() {
        println!("  disks: {}", cfg.disk.join(", "));
    }
    println!("  fan_speed:");
    for p in &cfg.fan_speed {
        println!(
            "    >= {:>5.1} °C -> {:>5.1} % ({} ns)",
            p.temperature,
            p.speed,
            pwm::duty_ns(cfg.pwm_period, p.speed)
        );
    }
}
