// This module is only compiled during tests
pub mod mock_pwm;

use std::time::Duration;

use crate::executor::MotionTiming;

/// Step delays short enough that a full sweep takes a few milliseconds.
pub fn fast_timing() -> MotionTiming {
    MotionTiming {
        slowest_step: Duration::from_micros(200),
        fastest_step: Duration::from_micros(20),
        ..MotionTiming::default()
    }
}
