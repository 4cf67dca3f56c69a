use log::{debug, trace, warn};
use rppal::gpio::{self, Gpio, OutputPin};
use thiserror::Error;

use crate::config::{MAX_BCM_PIN, SERVO_FREQUENCY_HZ};

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("GPIO channel {channel} is unavailable: {reason}")]
    ChannelUnavailable { channel: u8, reason: String },

    #[error("GPIO error on channel {channel}: {source}")]
    Gpio {
        channel: u8,
        #[source]
        source: gpio::Error,
    },
}

/// The only thing in the crate that touches a servo's signal line.
pub trait ActuatorDriver: Send {
    /// BCM channel this driver owns.
    fn channel(&self) -> u8;

    /// Write a new duty cycle (percent of the PWM period) immediately.
    fn set_duty(&mut self, duty: f64) -> Result<(), DriverError>;

    /// Stop pulsing so an unloaded servo does not jitter.
    fn idle(&mut self) -> Result<(), DriverError> {
        self.set_duty(0.0)
    }
}

/// Software PWM on a Raspberry Pi GPIO pin.
///
/// Pins 16 and 17 have no hardware PWM channel, so every servo is driven with
/// rppal's software PWM at [`SERVO_FREQUENCY_HZ`].
pub struct PwmDriver {
    pin: OutputPin,
    channel: u8,
}

impl PwmDriver {
    /// Claim `channel` for exclusive use by this driver.
    pub fn claim(channel: u8) -> Result<Self, DriverError> {
        let gpio = Gpio::new().map_err(|e| unavailable(channel, e))?;
        let mut pin = gpio.get(channel).map_err(|e| unavailable(channel, e))?.into_output_low();

        // Start idle: 50 Hz carrier with no pulses.
        pin.set_pwm_frequency(SERVO_FREQUENCY_HZ, 0.0)
            .map_err(|source| DriverError::Gpio { channel, source })?;

        debug!("Claimed GPIO {} for servo PWM", channel);
        Ok(Self { pin, channel })
    }
}

impl ActuatorDriver for PwmDriver {
    fn channel(&self) -> u8 {
        self.channel
    }

    fn set_duty(&mut self, duty: f64) -> Result<(), DriverError> {
        // rppal takes the duty cycle as a 0.0 - 1.0 fraction
        let fraction = (duty / 100.0).clamp(0.0, 1.0);
        self.pin
            .set_pwm_frequency(SERVO_FREQUENCY_HZ, fraction)
            .map_err(|source| DriverError::Gpio {
                channel: self.channel,
                source,
            })
    }
}

impl Drop for PwmDriver {
    fn drop(&mut self) {
        // Ensure the pin stops pulsing before it is released
        if let Err(e) = self.pin.clear_pwm() {
            warn!("Failed to clear PWM on GPIO {}: {}", self.channel, e);
        }
        self.pin.set_low();
        debug!("Released GPIO {}", self.channel);
    }
}

/// Stand-in driver for `--dry-run`: validates the channel and logs writes.
pub struct SimulatedDriver {
    channel: u8,
    duty: f64,
}

impl SimulatedDriver {
    pub fn claim(channel: u8) -> Result<Self, DriverError> {
        if channel > MAX_BCM_PIN {
            return Err(DriverError::ChannelUnavailable {
                channel,
                reason: format!("BCM pins range from 0 to {}", MAX_BCM_PIN),
            });
        }

        Ok(Self { channel, duty: 0.0 })
    }

    /// Last duty cycle written.
    pub fn duty(&self) -> f64 {
        self.duty
    }
}

impl ActuatorDriver for SimulatedDriver {
    fn channel(&self) -> u8 {
        self.channel
    }

    fn set_duty(&mut self, duty: f64) -> Result<(), DriverError> {
        self.duty = duty;
        trace!("[Sim PWM {}] Duty cycle set to {:.3}", self.channel, duty);
        Ok(())
    }
}

fn unavailable(channel: u8, e: gpio::Error) -> DriverError {
    DriverError::ChannelUnavailable {
        channel,
        reason: e.to_string(),
    }
}
