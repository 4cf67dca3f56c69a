//! Startup wiring: which servo sits on which channel, with which calibration.

use std::collections::BTreeSet;

use log::info;
use thiserror::Error;

use crate::calibration::{CalibrationError, CalibrationStore};
use crate::config::SERVO_PINS;
use crate::coordinator::BatchCoordinator;
use crate::executor::{MotionExecutor, MotionTiming};
use crate::pwm::{ActuatorDriver, DriverError};

#[derive(Debug, Error)]
pub enum RigError {
    #[error(transparent)]
    Calibration(#[from] CalibrationError),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("Servo id '{0}' is configured more than once")]
    DuplicateId(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActuatorConfig {
    pub id: String,
    /// BCM pin number.
    pub channel: u8,
}

/// The servos this process drives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RigConfig {
    pub actuators: Vec<ActuatorConfig>,
}

impl Default for RigConfig {
    fn default() -> Self {
        Self {
            actuators: SERVO_PINS
                .iter()
                .map(|(id, channel)| ActuatorConfig {
                    id: id.to_string(),
                    channel: *channel,
                })
                .collect(),
        }
    }
}

impl RigConfig {
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.actuators.iter().map(|a| a.id.as_str())
    }

    pub fn find(&self, id: &str) -> Option<&ActuatorConfig> {
        self.actuators.iter().find(|a| a.id == id)
    }

    /// Reject ids or channels that appear twice.
    pub fn validate(&self) -> Result<(), RigError> {
        let mut ids = BTreeSet::new();
        let mut channels = BTreeSet::new();

        for actuator in &self.actuators {
            if !ids.insert(actuator.id.as_str()) {
                return Err(RigError::DuplicateId(actuator.id.clone()));
            }
            if !channels.insert(actuator.channel) {
                return Err(DriverError::ChannelUnavailable {
                    channel: actuator.channel,
                    reason: format!("already bound to another servo (at '{}')", actuator.id),
                }
                .into());
            }
        }

        Ok(())
    }

    /// Claim every channel and build the coordinator.
    ///
    /// Any missing calibration or unavailable channel fails the whole rig.
    pub fn build<F, D>(
        &self,
        calibration: &CalibrationStore,
        timing: MotionTiming,
        mut claim: F,
    ) -> Result<BatchCoordinator, RigError>
    where
        F: FnMut(u8) -> Result<D, DriverError>,
        D: ActuatorDriver + 'static,
    {
        self.validate()?;

        let mut executors = Vec::with_capacity(self.actuators.len());
        for actuator in &self.actuators {
            let record = calibration.require(&actuator.id)?;
            let driver = claim(actuator.channel)?;
            info!(
                "Servo {} on GPIO {} (min {:.2}, center {:.2}, max {:.2})",
                actuator.id, actuator.channel, record.min_duty, record.center_duty, record.max_duty
            );
            executors.push(MotionExecutor::new(
                actuator.id.clone(),
                Box::new(driver),
                record,
                timing.clone(),
            ));
        }

        Ok(BatchCoordinator::new(executors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::CalibrationRecord;
    use crate::mocks::fast_timing;
    use crate::mocks::mock_pwm::MockDriver;

    fn calibrated(ids: &[&str]) -> CalibrationStore {
        let mut store = CalibrationStore::default();
        for id in ids {
            store.set(id, CalibrationRecord::default());
        }
        store
    }

    #[test]
    fn test_default_rig() {
        let rig = RigConfig::default();
        assert_eq!(rig.ids().collect::<Vec<_>>(), vec!["s0", "s1", "s2", "s3"]);
        assert_eq!(rig.find("s2").map(|a| a.channel), Some(18));
        assert!(rig.validate().is_ok());
    }

    #[test]
    fn test_duplicate_channel_is_rejected() {
        let mut rig = RigConfig::default();
        rig.actuators[1].channel = 16;
        assert!(matches!(
            rig.validate(),
            Err(RigError::Driver(DriverError::ChannelUnavailable { channel: 16, .. }))
        ));
    }

    #[test]
    fn test_duplicate_id_is_rejected() {
        let mut rig = RigConfig::default();
        rig.actuators[3].id = "s0".to_string();
        assert!(matches!(rig.validate(), Err(RigError::DuplicateId(_))));
    }

    #[test]
    fn test_build() -> Result<(), RigError> {
        let rig = RigConfig::default();
        let store = calibrated(&["s0", "s1", "s2", "s3"]);

        let coordinator = rig.build(&store, fast_timing(), |channel| Ok(MockDriver::new(channel).0))?;
        assert_eq!(coordinator.actuator_ids().count(), 4);
        Ok(())
    }

    #[test]
    fn test_missing_calibration_fails_startup() {
        let rig = RigConfig::default();
        let store = calibrated(&["s0", "s1", "s2"]);

        let result = rig.build(&store, fast_timing(), |channel| Ok(MockDriver::new(channel).0));
        assert!(matches!(
            result,
            Err(RigError::Calibration(CalibrationError::MissingActuator(_)))
        ));
    }

    #[test]
    fn test_unavailable_channel_fails_startup() {
        let rig = RigConfig::default();
        let store = calibrated(&["s0", "s1", "s2", "s3"]);

        let result = rig.build(&store, fast_timing(), |channel| {
            if channel == 18 {
                Err(DriverError::ChannelUnavailable {
                    channel,
                    reason: "busy".to_string(),
                })
            } else {
                Ok(MockDriver::new(channel).0)
            }
        });
        assert!(matches!(result, Err(RigError::Driver(_))));
    }
}
