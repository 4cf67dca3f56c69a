use std::fmt;

use crate::calibration::CalibrationRecord;
use crate::config::SERVO_MAX_ANGLE;

/// One position in a motion sequence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AngleToken {
    /// Logical angle in degrees, clamped to ±90 when mapped.
    Degrees(f64),
    Minimum,
    Center,
    Maximum,
}

impl fmt::Display for AngleToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AngleToken::Degrees(angle) => write!(f, "{}", angle),
            AngleToken::Minimum => write!(f, "N"),
            AngleToken::Center => write!(f, "C"),
            AngleToken::Maximum => write!(f, "M"),
        }
    }
}

/// Map a logical angle or preset to a duty cycle using the given calibration.
///
/// -90° → `min_duty`, 0° → `center_duty`, +90° → `max_duty`, with each half
/// interpolated linearly. The end points are returned exactly. A non-finite
/// angle maps to center.
pub fn to_duty(token: AngleToken, calib: &CalibrationRecord) -> f64 {
    let angle = match token {
        AngleToken::Minimum => return calib.min_duty,
        AngleToken::Center => return calib.center_duty,
        AngleToken::Maximum => return calib.max_duty,
        AngleToken::Degrees(angle) if !angle.is_finite() => return calib.center_duty,
        AngleToken::Degrees(angle) => angle.clamp(-SERVO_MAX_ANGLE, SERVO_MAX_ANGLE),
    };

    if angle == 0.0 {
        calib.center_duty
    } else if angle >= SERVO_MAX_ANGLE {
        calib.max_duty
    } else if angle <= -SERVO_MAX_ANGLE {
        calib.min_duty
    } else if angle > 0.0 {
        let fraction = angle / SERVO_MAX_ANGLE;
        (calib.center_duty + fraction * (calib.max_duty - calib.center_duty)).min(calib.max_duty)
    } else {
        let fraction = -angle / SERVO_MAX_ANGLE;
        (calib.center_duty - fraction * (calib.center_duty - calib.min_duty)).max(calib.min_duty)
    }
}

/// Map a duty cycle back to a logical angle, for display only.
///
/// Degenerate calibrations (`min == center` or `center == max`) always read as
/// center.
pub fn to_angle(duty: f64, calib: &CalibrationRecord) -> f64 {
    if calib.is_degenerate() || duty == calib.center_duty {
        return 0.0;
    }

    if duty > calib.center_duty {
        (duty - calib.center_duty) / (calib.max_duty - calib.center_duty) * SERVO_MAX_ANGLE
    } else {
        (duty - calib.center_duty) / (calib.center_duty - calib.min_duty) * SERVO_MAX_ANGLE
    }
}
