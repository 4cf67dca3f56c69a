// ** CALIBRATION CONFIGURATION ** //

/// Calibration file shared with the `calibrate` tool.
pub const CALIBRATION_FILE: &str = "servo_calibration.json";

/// Default duty cycles (percent) for a typical SG90 servo.
/// These correspond to the physical 0, 90 and 180 degree positions.
pub const DEFAULT_MIN_DUTY: f64 = 2.5; // Logical -90°
pub const DEFAULT_CENTER_DUTY: f64 = 7.5; // Logical 0°
pub const DEFAULT_MAX_DUTY: f64 = 12.5; // Logical +90°

/// Absolute duty range the calibration tool will ever drive a servo to.
pub const SAFE_MIN_DUTY: f64 = 1.0;
pub const SAFE_MAX_DUTY: f64 = 14.0;

/// Duty adjustment applied per `w`/`s` keypress in the calibration tool.
pub const CALIBRATION_NUDGE: f64 = 0.1;

/// Time the calibration tool holds a new position before idling the servo.
pub const CALIBRATION_SETTLE_MS: u64 = 300;

// ** GPIO CONFIGURATION ** //

/// Servo id to BCM pin assignments.
pub const SERVO_PINS: [(&str, u8); 4] = [("s0", 16), ("s1", 17), ("s2", 18), ("s3", 19)];

/// Highest BCM pin number exposed on the 40 pin header.
pub const MAX_BCM_PIN: u8 = 27;

/// Standard servo PWM frequency (Hz)
pub const SERVO_FREQUENCY_HZ: f64 = 50.0;

//  ** MOTION CONFIGURATION ** //

/// Maximum logical angle either side of center (degrees).
pub const SERVO_MAX_ANGLE: f64 = 90.0;

/// Duty change per interpolation step.
pub const DUTY_STEP: f64 = 0.1;

/// Per-step delay at speed 0.0 (slowest cadence) and speed 1.0 (fastest).
pub const SLOWEST_STEP_DELAY_SECS: f64 = 0.04;
pub const FASTEST_STEP_DELAY_SECS: f64 = 0.002;

/// How long a cancelled control loop gets to exit before it is treated as stuck.
pub const STOP_GRACE_MS: u64 = 500;

/// Poll interval while waiting for a cancelled control loop.
pub const STOP_POLL_MS: u64 = 1;

/// Poll interval while a batch waits for its motion to finish.
pub const WAIT_POLL_MS: u64 = 5;

// ** COMMAND CONFIGURATION ** //

pub const DEFAULT_LOOP_COUNT: u32 = 1;
pub const DEFAULT_SPEED: f64 = 0.5;

/// Speed used by the synchronized reset to center.
pub const RESET_SPEED: f64 = 0.7;

/// Separates commands that run in parallel on one input line.
pub const PARALLEL_DELIMITER: char = '|';

// ** MAIN CONFIGURATION ** //
pub const PROMPT: &str = "> ";
pub const HISTORY_FILE: &str = ".ninja_servo_history";
