//! Per-servo motion executor.
//!
//! Each [`MotionExecutor`] owns one servo. Motion runs on a background thread
//! which takes the driver with it and hands it back when it exits, so at most
//! one control loop can ever write to a given servo. Cancellation is
//! cooperative and checked before every interpolation step.

use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, warn};
use thiserror::Error;

use crate::calibration::CalibrationRecord;
use crate::config::{
    DUTY_STEP, FASTEST_STEP_DELAY_SECS, SLOWEST_STEP_DELAY_SECS, STOP_GRACE_MS, STOP_POLL_MS,
};
use crate::mapper::{self, AngleToken};
use crate::pwm::{ActuatorDriver, DriverError};

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Control loop for servo '{id}' did not exit within {grace:?}")]
    LoopDidNotExit { id: String, grace: Duration },

    #[error("Control loop for servo '{0}' panicked, its driver is gone")]
    LoopPanicked(String),
}

/// How many times a motion sequence is played.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repeat {
    Times(u32),
    Forever,
}

impl Repeat {
    /// Interpret a loop count where 0 means unbounded.
    pub fn from_count(count: u32) -> Self {
        if count == 0 {
            Repeat::Forever
        } else {
            Repeat::Times(count)
        }
    }

    /// Loop count with 0 meaning unbounded.
    pub fn count(self) -> u32 {
        match self {
            Repeat::Times(n) => n,
            Repeat::Forever => 0,
        }
    }

    pub fn is_finite(self) -> bool {
        matches!(self, Repeat::Times(_))
    }

    fn allows(self, completed_passes: u32) -> bool {
        match self {
            Repeat::Times(n) => completed_passes < n,
            Repeat::Forever => true,
        }
    }
}

/// What one control loop run plays.
#[derive(Debug, Clone, PartialEq)]
pub struct MotionPlan {
    pub angles: Vec<AngleToken>,
    pub repeat: Repeat,
    /// 0.0 (slowest) to 1.0 (fastest).
    pub speed: f64,
}

impl MotionPlan {
    pub fn new(angles: Vec<AngleToken>, repeat: Repeat, speed: f64) -> Self {
        Self {
            angles,
            repeat,
            speed: speed.clamp(0.0, 1.0),
        }
    }

    /// A single move to the calibrated center.
    pub fn center(speed: f64) -> Self {
        Self::new(vec![AngleToken::Center], Repeat::Times(1), speed)
    }
}

/// Step cadence and resolution of the control loop.
#[derive(Debug, Clone)]
pub struct MotionTiming {
    /// Delay per step at speed 0.0.
    pub slowest_step: Duration,
    /// Delay per step at speed 1.0.
    pub fastest_step: Duration,
    /// Duty change per interpolation step.
    pub duty_step: f64,
    /// How long `stop`/`start` wait for a cancelled loop to exit.
    pub stop_grace: Duration,
}

impl Default for MotionTiming {
    fn default() -> Self {
        Self {
            slowest_step: Duration::from_secs_f64(SLOWEST_STEP_DELAY_SECS),
            fastest_step: Duration::from_secs_f64(FASTEST_STEP_DELAY_SECS),
            duty_step: DUTY_STEP,
            stop_grace: Duration::from_millis(STOP_GRACE_MS),
        }
    }
}

impl MotionTiming {
    /// Per-step delay, linear between the slowest and fastest cadence.
    pub fn step_delay(&self, speed: f64) -> Duration {
        let slowest = self.slowest_step.as_secs_f64();
        let fastest = self.fastest_step.as_secs_f64();
        let delay = slowest - speed.clamp(0.0, 1.0) * (slowest - fastest);
        Duration::from_secs_f64(delay.max(0.0))
    }
}

/// Identifies one `start` call on one executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    Idle,
    Running,
    Cancelling,
}

/// A servo's driver together with its last committed position.
struct Actuator {
    driver: Box<dyn ActuatorDriver>,
    calibration: CalibrationRecord,
    current_duty: f64,
}

enum Segment {
    Completed,
    AlreadyThere,
    Cancelled,
}

impl Actuator {
    fn run(
        &mut self,
        plan: &MotionPlan,
        timing: &MotionTiming,
        cancel: &AtomicBool,
    ) -> Result<(), DriverError> {
        let delay = timing.step_delay(plan.speed);
        let mut passes: u32 = 0;

        while plan.repeat.allows(passes) && !cancel.load(Ordering::SeqCst) {
            let mut moved = false;

            for token in &plan.angles {
                if cancel.load(Ordering::SeqCst) {
                    return Ok(());
                }

                let target = mapper::to_duty(*token, &self.calibration);
                match self.move_to(target, delay, timing.duty_step, cancel)? {
                    Segment::Completed => moved = true,
                    Segment::AlreadyThere => {}
                    Segment::Cancelled => return Ok(()),
                }
            }

            passes = passes.saturating_add(1);

            // An unbounded plan that is already satisfied must not spin
            if !moved && plan.repeat == Repeat::Forever {
                thread::sleep(delay);
            }
        }

        Ok(())
    }

    fn move_to(
        &mut self,
        target: f64,
        delay: Duration,
        duty_step: f64,
        cancel: &AtomicBool,
    ) -> Result<Segment, DriverError> {
        let start = self.current_duty;
        let steps = ((target - start).abs() / duty_step).round() as u32;

        if steps == 0 {
            self.driver.idle()?;
            return Ok(Segment::AlreadyThere);
        }

        for i in 0..=steps {
            if cancel.load(Ordering::SeqCst) {
                return Ok(Segment::Cancelled);
            }

            let duty = start + (target - start) * (i as f64 / steps as f64);
            self.driver.set_duty(duty)?;
            thread::sleep(delay);
        }

        self.current_duty = target;
        self.driver.idle()?;
        Ok(Segment::Completed)
    }
}

enum Slot {
    Parked(Actuator),
    Running { run: RunId, handle: JoinHandle<Actuator> },
    Lost,
}

/// Runs motion plans on one servo, one control loop at a time.
pub struct MotionExecutor {
    id: String,
    calibration: CalibrationRecord,
    timing: MotionTiming,
    cancel: Arc<AtomicBool>,
    slot: Slot,
    runs_started: u64,
}

impl MotionExecutor {
    /// The servo starts out assumed to sit at its calibrated center.
    pub fn new(
        id: impl Into<String>,
        driver: Box<dyn ActuatorDriver>,
        calibration: CalibrationRecord,
        timing: MotionTiming,
    ) -> Self {
        let actuator = Actuator {
            driver,
            calibration,
            current_duty: calibration.center_duty,
        };

        Self {
            id: id.into(),
            calibration,
            timing,
            cancel: Arc::new(AtomicBool::new(false)),
            slot: Slot::Parked(actuator),
            runs_started: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn calibration(&self) -> &CalibrationRecord {
        &self.calibration
    }

    /// Number of times `start` has launched a control loop.
    pub fn runs_started(&self) -> u64 {
        self.runs_started
    }

    pub fn state(&self) -> ExecutorState {
        match &self.slot {
            Slot::Running { handle, .. } if !handle.is_finished() => {
                if self.cancel.load(Ordering::SeqCst) {
                    ExecutorState::Cancelling
                } else {
                    ExecutorState::Running
                }
            }
            _ => ExecutorState::Idle,
        }
    }

    /// Last committed duty cycle, if no control loop currently holds the servo.
    pub fn current_duty(&self) -> Option<f64> {
        match &self.slot {
            Slot::Parked(actuator) => Some(actuator.current_duty),
            _ => None,
        }
    }

    /// Last committed position as a logical angle.
    pub fn current_angle(&self) -> Option<f64> {
        self.current_duty()
            .map(|duty| mapper::to_angle(duty, &self.calibration))
    }

    /// Cancel whatever is running, then launch a control loop for `plan`.
    pub fn start(&mut self, plan: MotionPlan) -> Result<RunId, ExecutorError> {
        if self.halt()? {
            debug!("Servo {}: previous motion superseded", self.id);
            self.idle_output();
        }

        let mut actuator = match mem::replace(&mut self.slot, Slot::Lost) {
            Slot::Parked(actuator) => actuator,
            other => {
                self.slot = other;
                return Err(ExecutorError::LoopPanicked(self.id.clone()));
            }
        };

        self.cancel.store(false, Ordering::SeqCst);
        self.runs_started += 1;
        let run = RunId(self.runs_started);

        debug!(
            "Servo {}: starting {} position(s), loops {}, speed {:.2}",
            self.id,
            plan.angles.len(),
            plan.repeat.count(),
            plan.speed
        );

        let id = self.id.clone();
        let cancel = Arc::clone(&self.cancel);
        let timing = self.timing.clone();
        let handle = thread::spawn(move || {
            if let Err(e) = actuator.run(&plan, &timing, &cancel) {
                error!("Servo {}: motion aborted: {}", id, e);
            }
            actuator
        });

        self.slot = Slot::Running { run, handle };
        Ok(run)
    }

    /// Move to the calibrated center.
    pub fn center(&mut self, speed: f64) -> Result<RunId, ExecutorError> {
        self.start(MotionPlan::center(speed))
    }

    /// Whether the control loop launched as `run` is no longer moving the servo.
    ///
    /// A run that was superseded, stopped or already joined counts as finished.
    pub fn is_finished(&self, run: RunId) -> bool {
        match &self.slot {
            Slot::Running {
                run: current,
                handle,
            } if *current == run => handle.is_finished(),
            _ => true,
        }
    }

    /// Block until the control loop launched as `run` has finished.
    ///
    /// Returns at once if that run was superseded or already joined. Waiting
    /// on an unbounded run blocks until something else cancels it.
    pub fn wait(&mut self, run: RunId) -> Result<(), ExecutorError> {
        match mem::replace(&mut self.slot, Slot::Lost) {
            Slot::Running {
                run: current,
                handle,
            } if current == run => self.reclaim(handle),
            other => {
                self.slot = other;
                Ok(())
            }
        }
    }

    /// Cancel any running motion and idle the output. No-op when idle.
    pub fn stop(&mut self) -> Result<(), ExecutorError> {
        if self.halt()? {
            debug!("Servo {}: stopped", self.id);
            self.idle_output();
        }
        Ok(())
    }

    /// Stop, idle the output and give the driver back to the system.
    pub fn release(mut self) -> Result<(), ExecutorError> {
        self.stop()?;
        self.idle_output();
        Ok(())
    }

    /// Cancel a live control loop and take the servo back from it.
    ///
    /// Returns `true` if a loop was still running when called.
    fn halt(&mut self) -> Result<bool, ExecutorError> {
        match mem::replace(&mut self.slot, Slot::Lost) {
            Slot::Parked(actuator) => {
                self.slot = Slot::Parked(actuator);
                Ok(false)
            }
            Slot::Lost => Err(ExecutorError::LoopPanicked(self.id.clone())),
            Slot::Running { run, handle } => {
                let live = !handle.is_finished();

                if live {
                    self.cancel.store(true, Ordering::SeqCst);
                    let deadline = Instant::now() + self.timing.stop_grace;

                    while !handle.is_finished() {
                        if Instant::now() >= deadline {
                            self.slot = Slot::Running { run, handle };
                            return Err(ExecutorError::LoopDidNotExit {
                                id: self.id.clone(),
                                grace: self.timing.stop_grace,
                            });
                        }
                        thread::sleep(Duration::from_millis(STOP_POLL_MS));
                    }
                }

                self.reclaim(handle)?;
                Ok(live)
            }
        }
    }

    fn reclaim(&mut self, handle: JoinHandle<Actuator>) -> Result<(), ExecutorError> {
        let actuator = handle
            .join()
            .map_err(|_| ExecutorError::LoopPanicked(self.id.clone()))?;
        self.slot = Slot::Parked(actuator);
        Ok(())
    }

    fn idle_output(&mut self) {
        if let Slot::Parked(actuator) = &mut self.slot
            && let Err(e) = actuator.driver.idle()
        {
            warn!("Servo {}: failed to idle output: {}", self.id, e);
        }
    }
}

impl Drop for MotionExecutor {
    fn drop(&mut self) {
        // Never release a driver while a control loop may still write to it
        if let Err(e) = self.stop() {
            error!("Servo {} was not stopped cleanly: {}", self.id, e);
        }
    }
}
