// This file is only compiled during tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::pwm::{ActuatorDriver, DriverError};

/// Shared view of everything a [`MockDriver`] was asked to do.
#[derive(Clone, Default)]
pub struct DriverProbe {
    writes: Arc<Mutex<Vec<f64>>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl DriverProbe {
    pub fn writes(&self) -> Vec<f64> {
        self.writes.lock().unwrap().clone()
    }

    pub fn write_count(&self) -> usize {
        self.writes.lock().unwrap().len()
    }

    pub fn last_write(&self) -> Option<f64> {
        self.writes.lock().unwrap().last().copied()
    }

    /// Highest number of callers ever inside `set_duty` at the same time.
    pub fn max_concurrent_writers(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

pub struct MockDriver {
    channel: u8,
    probe: DriverProbe,
    write_delay: Duration,
}

impl MockDriver {
    pub fn new(channel: u8) -> (Self, DriverProbe) {
        Self::with_write_delay(channel, Duration::ZERO)
    }

    /// A driver whose every write blocks for `write_delay`.
    pub fn with_write_delay(channel: u8, write_delay: Duration) -> (Self, DriverProbe) {
        let probe = DriverProbe::default();
        let driver = Self {
            channel,
            probe: probe.clone(),
            write_delay,
        };
        (driver, probe)
    }
}

impl ActuatorDriver for MockDriver {
    fn channel(&self) -> u8 {
        self.channel
    }

    fn set_duty(&mut self, duty: f64) -> Result<(), DriverError> {
        let writers = self.probe.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.probe.max_in_flight.fetch_max(writers, Ordering::SeqCst);

        if !self.write_delay.is_zero() {
            thread::sleep(self.write_delay);
        }
        self.probe.writes.lock().unwrap().push(duty);

        self.probe.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}
