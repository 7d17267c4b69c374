// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! In-memory stand-ins for the PWM channel and temperature sensors.
//!
//! Both fakes are cheap handles over shared state, so a test can hand one
//! clone to the code under test and inspect or steer it through another.

use crate::error::{Error, Result};
use crate::pwm::PwmInterface;
use crate::sensor::{ReadTemperature, SourceId, TemperatureReading};
use std::cell::{Cell, RefCell};
use std::io;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PwmWrite {
    Period(u64),
    DutyCycle(u64),
    Enable(bool),
}

#[derive(Debug, Default)]
struct PwmState {
    period: u64,
    duty: u64,
    enabled: bool,
    writes: Vec<PwmWrite>,
    fail_writes: bool,
    fail_reads: bool,
}

/// A PWM channel that behaves like the kernel: a duty cycle longer than the
/// period is rejected with `EINVAL`, in either write order.
#[derive(Debug, Clone, Default)]
pub struct FakePwm(Rc<RefCell<PwmState>>);

impl FakePwm {
    pub fn new(period: u64, duty: u64) -> Self {
        Self(Rc::new(RefCell::new(PwmState {
            period,
            duty,
            ..Default::default()
        })))
    }

    pub fn writes(&self) -> Vec<PwmWrite> {
        self.0.borrow().writes.clone()
    }

    pub fn period(&self) -> u64 {
        self.0.borrow().period
    }

    pub fn duty(&self) -> u64 {
        self.0.borrow().duty
    }

    pub fn enabled(&self) -> bool {
        self.0.borrow().enabled
    }

    pub fn fail_writes(&self, fail: bool) {
        self.0.borrow_mut().fail_writes = fail;
    }

    pub fn fail_reads(&self, fail: bool) {
        self.0.borrow_mut().fail_reads = fail;
    }

    fn check_write(&self) -> io::Result<()> {
        if self.0.borrow().fail_writes {
            return Err(io::Error::from(io::ErrorKind::PermissionDenied));
        }
        Ok(())
    }

    fn check_read(&self) -> io::Result<()> {
        if self.0.borrow().fail_reads {
            return Err(io::Error::from(io::ErrorKind::NotFound));
        }
        Ok(())
    }
}

impl PwmInterface for FakePwm {
    fn read_period(&mut self) -> io::Result<u64> {
        self.check_read()?;
        Ok(self.period())
    }

    fn read_duty_cycle(&mut self) -> io::Result<u64> {
        self.check_read()?;
        Ok(self.duty())
    }

    fn write_period(&mut self, ns: u64) -> io::Result<()> {
        self.check_write()?;
        let mut st = self.0.borrow_mut();
        if ns < st.duty {
            return Err(io::Error::from(io::ErrorKind::InvalidInput));
        }
        st.period = ns;
        st.writes.push(PwmWrite::Period(ns));
        Ok(())
    }

    fn write_duty_cycle(&mut self, ns: u64) -> io::Result<()> {
        self.check_write()?;
        let mut st = self.0.borrow_mut();
        if ns > st.period {
            return Err(io::Error::from(io::ErrorKind::InvalidInput));
        }
        st.duty = ns;
        st.writes.push(PwmWrite::DutyCycle(ns));
        Ok(())
    }

    fn set_enabled(&mut self, enabled: bool) -> io::Result<()> {
        self.check_write()?;
        let mut st = self.0.borrow_mut();
        st.enabled = enabled;
        st.writes.push(PwmWrite::Enable(enabled));
        Ok(())
    }
}

/// A sensor whose next reading is set by the test. `None` means the read fails.
#[derive(Debug, Clone)]
pub struct FakeSensor {
    id: SourceId,
    value: Rc<Cell<Option<f64>>>,
    reads: Rc<Cell<u32>>,
}

impl FakeSensor {
    pub fn new(id: SourceId, value: Option<f64>) -> Self {
        Self {
            id,
            value: Rc::new(Cell::new(value)),
            reads: Rc::new(Cell::new(0)),
        }
    }

    pub fn set(&self, value: Option<f64>) {
        self.value.set(value);
    }

    pub fn reads(&self) -> u32 {
        self.reads.get()
    }
}

impl ReadTemperature for FakeSensor {
    fn source_id(&self) -> SourceId {
        self.id.clone()
    }

    fn read(&self) -> Result<TemperatureReading> {
        self.reads.set(self.reads.get() + 1);
        self.value
            .get()
            .map(|c| TemperatureReading::new(self.id.clone(), c))
            .ok_or_else(|| Error::SensorUnavailable {
                source_id: self.id.to_string(),
                reason: "fake sensor offline".to_string(),
            })
    }
}
