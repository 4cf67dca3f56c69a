pub mod calibration;
pub mod command;
pub mod config;
pub mod coordinator;
pub mod executor;
pub mod logger;
pub mod mapper;
pub mod pwm;
pub mod rig;

// Re-export commonly used types
pub use calibration::{CalibrationRecord, CalibrationStore};
pub use coordinator::{BatchCoordinator, BatchError, BatchReport};
pub use executor::{ExecutorState, MotionExecutor, MotionPlan, MotionTiming, Repeat};
pub use mapper::AngleToken;
pub use rig::RigConfig;

#[cfg(test)]
pub(crate) mod mocks;
