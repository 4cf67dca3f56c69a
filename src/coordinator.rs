//! Batch coordinator.
//!
//! Fans one input line out to the servos, waits for every finite motion it
//! started, then brings the whole rig back to center unless something was
//! left looping in the background.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use thiserror::Error;

use crate::command::{self, CommandError, Instruction, ParseWarning};
use crate::config::{RESET_SPEED, WAIT_POLL_MS};
use crate::executor::{ExecutorError, MotionExecutor, RunId};

#[derive(Debug, Error)]
pub enum BatchError {
    #[error(transparent)]
    Executor(#[from] ExecutorError),

    /// The interrupt flag was raised while waiting for motion to finish.
    /// Servos may still be moving; call `stop_all` or `shutdown`.
    #[error("Interrupted while waiting for servos")]
    Interrupted,
}

/// Outcome of one input line.
#[derive(Debug, Default)]
pub struct BatchReport {
    /// Servo ids whose command was started, in input order.
    pub started: Vec<String>,
    pub rejected: Vec<CommandError>,
    /// Recoverable problems, tagged with the command text they came from.
    pub warnings: Vec<(String, ParseWarning)>,
    /// At least one unbounded command is still running.
    pub background: bool,
    /// The synchronized reset to center ran.
    pub reset: bool,
    /// Every servo was stopped where it was.
    pub stopped: bool,
}

/// Owns every servo's executor for the life of the process.
pub struct BatchCoordinator {
    executors: BTreeMap<String, MotionExecutor>,
    interrupt: Arc<AtomicBool>,
}

impl BatchCoordinator {
    pub fn new(executors: impl IntoIterator<Item = MotionExecutor>) -> Self {
        Self {
            executors: executors
                .into_iter()
                .map(|executor| (executor.id().to_string(), executor))
                .collect(),
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn actuator_ids(&self) -> impl Iterator<Item = &str> {
        self.executors.keys().map(String::as_str)
    }

    pub fn executor(&self, id: &str) -> Option<&MotionExecutor> {
        self.executors.get(id)
    }

    /// Flag that aborts any wait in progress once set, e.g. from a signal handler.
    ///
    /// It stays set: every later wait fails with [`BatchError::Interrupted`].
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    /// Act on one input line.
    ///
    /// An empty line stops every servo and `reset` centers them all. Otherwise
    /// every `|`-separated command is started and the call blocks until the
    /// finite ones have finished. Bad commands are reported and skipped, they
    /// never stop the rest of the batch. `quit` and `help` are left to the
    /// caller and do nothing here.
    pub fn run_batch(&mut self, line: &str) -> Result<BatchReport, BatchError> {
        let mut report = BatchReport::default();

        let commands = match command::parse_instruction(line) {
            Instruction::Batch(commands) => commands,
            Instruction::StopAll => {
                self.stop_all()?;
                report.stopped = true;
                return Ok(report);
            }
            Instruction::Reset => {
                self.reset_all(RESET_SPEED)?;
                report.reset = true;
                return Ok(report);
            }
            Instruction::Quit | Instruction::Help => {
                debug!("'{}' is not a motion command", line.trim());
                return Ok(report);
            }
        };

        let mut finite: Vec<(String, RunId)> = Vec::new();
        let mut unbounded: Vec<(String, RunId)> = Vec::new();

        for text in commands {
            let parsed = match command::parse_command(text) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!("{}", e);
                    report.rejected.push(e);
                    continue;
                }
            };

            for warning in parsed.warnings {
                warn!("{}: {}", text, warning);
                report.warnings.push((text.to_string(), warning));
            }

            let command = parsed.command;
            let Some(executor) = self.executors.get_mut(&command.actuator) else {
                let e = CommandError::UnknownActuator(command.actuator);
                warn!("{}", e);
                report.rejected.push(e);
                continue;
            };

            let is_finite = command.plan.repeat.is_finite();
            let run = executor.start(command.plan)?;
            if is_finite {
                finite.push((command.actuator.clone(), run));
            } else {
                unbounded.push((command.actuator.clone(), run));
            }
            report.started.push(command.actuator);
        }

        // A loop superseded later on the same line is no longer running
        report.background = unbounded.iter().any(|(id, run)| {
            self.executors
                .get(id)
                .is_some_and(|executor| !executor.is_finished(*run))
        });

        if finite.is_empty() {
            if report.background {
                info!("Infinite loop(s) running in the background");
            }
            return Ok(report);
        }

        info!("Executing command(s)... (waiting for completion)");
        self.wait_all(&finite)?;

        if report.background {
            info!("Finite movements complete. Infinite loops are still running.");
        } else {
            info!("Command sequence complete.");
            self.reset_all(RESET_SPEED)?;
            report.reset = true;
        }

        Ok(report)
    }

    /// Move every servo to its calibrated center and wait for all of them.
    ///
    /// Anything still running, looping or not, is cancelled first.
    pub fn reset_all(&mut self, speed: f64) -> Result<(), BatchError> {
        info!("Resetting all servos to their calibrated center positions...");

        let mut runs = Vec::with_capacity(self.executors.len());
        for (id, executor) in self.executors.iter_mut() {
            runs.push((id.clone(), executor.center(speed)?));
        }
        self.wait_all(&runs)?;

        info!("Reset complete.");
        Ok(())
    }

    /// Join each run, giving up as soon as the interrupt flag is raised.
    fn wait_all(&mut self, runs: &[(String, RunId)]) -> Result<(), BatchError> {
        for (id, run) in runs {
            let Some(executor) = self.executors.get_mut(id) else {
                continue;
            };

            while !executor.is_finished(*run) {
                if self.interrupt.load(Ordering::SeqCst) {
                    return Err(BatchError::Interrupted);
                }
                thread::sleep(Duration::from_millis(WAIT_POLL_MS));
            }
            executor.wait(*run)?;
        }

        Ok(())
    }

    /// Stop every servo where it is. Positions are not reset.
    ///
    /// Every executor is attempted; the first failure is returned.
    pub fn stop_all(&mut self) -> Result<(), ExecutorError> {
        let mut first_error = None;

        for executor in self.executors.values_mut() {
            if let Err(e) = executor.stop() {
                warn!("{}", e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                info!("All movements stopped.");
                Ok(())
            }
        }
    }

    /// Stop every control loop, then idle and release every driver.
    pub fn shutdown(mut self) -> Result<(), ExecutorError> {
        let stopped = self.stop_all();

        for (id, executor) in self.executors {
            debug!("Releasing servo {}", id);
            executor.release()?;
        }

        stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::CalibrationRecord;
    use crate::executor::ExecutorState;
    use crate::mocks::fast_timing;
    use crate::mocks::mock_pwm::{DriverProbe, MockDriver};
    use std::collections::HashMap;
    use std::error::Error;

    fn rig() -> (BatchCoordinator, HashMap<&'static str, DriverProbe>) {
        let mut probes = HashMap::new();
        let mut executors = Vec::new();

        for (id, pin) in [("s0", 16), ("s1", 17), ("s2", 18), ("s3", 19)] {
            let (driver, probe) = MockDriver::new(pin);
            probes.insert(id, probe);
            executors.push(MotionExecutor::new(
                id,
                Box::new(driver),
                CalibrationRecord::default(),
                fast_timing(),
            ));
        }

        (BatchCoordinator::new(executors), probes)
    }

    fn runs(coordinator: &BatchCoordinator, id: &str) -> u64 {
        coordinator.executor(id).map_or(0, |e| e.runs_started())
    }

    #[test]
    fn test_parallel_batch_joins_then_resets_once() -> Result<(), Box<dyn Error>> {
        let (mut coordinator, probes) = rig();

        let report = coordinator.run_batch("s0:M;L1 | s1:N;L1")?;
        assert_eq!(report.started, vec!["s0", "s1"]);
        assert!(report.reset);
        assert!(!report.background);

        // One command run plus one reset for the commanded servos, one reset for the rest
        assert_eq!(runs(&coordinator, "s0"), 2);
        assert_eq!(runs(&coordinator, "s1"), 2);
        assert_eq!(runs(&coordinator, "s2"), 1);
        assert_eq!(runs(&coordinator, "s3"), 1);

        for id in ["s0", "s1", "s2", "s3"] {
            let executor = coordinator.executor(id).unwrap();
            assert_eq!(executor.state(), ExecutorState::Idle);
            assert_eq!(executor.current_duty(), Some(7.5));
            assert!(probes[id].max_concurrent_writers() <= 1);
        }

        // s0 reached max before coming back
        assert!(probes["s0"].writes().contains(&12.5));
        assert!(probes["s1"].writes().contains(&2.5));
        Ok(())
    }

    #[test]
    fn test_bad_commands_do_not_abort_batch() -> Result<(), Box<dyn Error>> {
        let (mut coordinator, _probes) = rig();

        let report = coordinator.run_batch("bad | s9:M | s2:45;S1.5")?;
        assert_eq!(report.started, vec!["s2"]);
        assert_eq!(
            report.rejected,
            vec![
                CommandError::MissingSeparator("bad".to_string()),
                CommandError::UnknownActuator("s9".to_string()),
            ]
        );
        assert_eq!(report.warnings.len(), 1);
        assert!(report.reset);
        Ok(())
    }

    #[test]
    fn test_batch_of_only_bad_commands_does_not_reset() -> Result<(), Box<dyn Error>> {
        let (mut coordinator, probes) = rig();

        let report = coordinator.run_batch("bad")?;
        assert!(report.started.is_empty());
        assert!(!report.reset);
        assert_eq!(probes["s0"].write_count(), 0);
        Ok(())
    }

    #[test]
    fn test_unbounded_command_is_left_running() -> Result<(), Box<dyn Error>> {
        let (mut coordinator, _probes) = rig();

        let report = coordinator.run_batch("s0:M,N;L0")?;
        assert!(report.background);
        assert!(!report.reset);
        assert_eq!(
            coordinator.executor("s0").unwrap().state(),
            ExecutorState::Running
        );

        // reset cancels the loop before centering
        coordinator.reset_all(RESET_SPEED)?;
        let s0 = coordinator.executor("s0").unwrap();
        assert_eq!(s0.state(), ExecutorState::Idle);
        assert_eq!(s0.current_duty(), Some(7.5));
        assert_eq!(s0.runs_started(), 2);
        Ok(())
    }

    #[test]
    fn test_finite_and_unbounded_mix_skips_reset() -> Result<(), Box<dyn Error>> {
        let (mut coordinator, _probes) = rig();

        let report = coordinator.run_batch("s0:M,N;L0 | s1:M;L2")?;
        assert!(report.background);
        assert!(!report.reset);

        // s1 finished its finite run, s0 keeps looping
        assert_eq!(coordinator.executor("s1").unwrap().current_duty(), Some(12.5));
        assert_eq!(
            coordinator.executor("s0").unwrap().state(),
            ExecutorState::Running
        );

        coordinator.stop_all()?;
        Ok(())
    }

    #[test]
    fn test_stop_all_keeps_position() -> Result<(), Box<dyn Error>> {
        let (mut coordinator, probes) = rig();

        coordinator.run_batch("s3:M;L0")?;
        thread::sleep(Duration::from_millis(10));
        coordinator.stop_all()?;

        let s3 = coordinator.executor("s3").unwrap();
        assert_eq!(s3.state(), ExecutorState::Idle);
        assert_eq!(s3.runs_started(), 1);
        assert_eq!(probes["s3"].last_write(), Some(0.0));

        // Idle servos were not touched
        assert_eq!(probes["s0"].write_count(), 0);
        Ok(())
    }

    #[test]
    fn test_same_servo_twice_in_one_batch() -> Result<(), Box<dyn Error>> {
        let (mut coordinator, probes) = rig();

        let report = coordinator.run_batch("s0:M | s0:N")?;
        assert_eq!(report.started, vec!["s0", "s0"]);
        assert!(report.reset);
        assert_eq!(probes["s0"].max_concurrent_writers(), 1);
        Ok(())
    }

    #[test]
    fn test_empty_line_stops_everything() -> Result<(), Box<dyn Error>> {
        let (mut coordinator, probes) = rig();

        coordinator.run_batch("s0:M,N;L0")?;
        let report = coordinator.run_batch("")?;
        assert!(report.stopped);
        assert!(!report.reset);
        assert!(report.rejected.is_empty());

        let s0 = coordinator.executor("s0").unwrap();
        assert_eq!(s0.state(), ExecutorState::Idle);
        assert_eq!(s0.runs_started(), 1);
        assert_eq!(probes["s0"].last_write(), Some(0.0));
        assert_eq!(runs(&coordinator, "s1"), 0);
        Ok(())
    }

    #[test]
    fn test_reset_line_centers_everything() -> Result<(), Box<dyn Error>> {
        let (mut coordinator, _probes) = rig();

        coordinator.run_batch("s2:45,-45;L0")?;
        let report = coordinator.run_batch("  RESET ")?;
        assert!(report.reset);
        assert!(report.rejected.is_empty());

        for id in ["s0", "s1", "s2", "s3"] {
            let executor = coordinator.executor(id).unwrap();
            assert_eq!(executor.state(), ExecutorState::Idle);
            assert_eq!(executor.current_duty(), Some(7.5));
        }
        assert_eq!(runs(&coordinator, "s2"), 2);
        Ok(())
    }

    #[test]
    fn test_front_end_words_are_ignored() -> Result<(), Box<dyn Error>> {
        let (mut coordinator, probes) = rig();

        for line in ["help", "quit"] {
            let report = coordinator.run_batch(line)?;
            assert!(report.started.is_empty());
            assert!(report.rejected.is_empty());
        }
        assert_eq!(probes["s0"].write_count(), 0);
        Ok(())
    }

    #[test]
    fn test_superseded_loop_does_not_block_reset() -> Result<(), Box<dyn Error>> {
        let (mut coordinator, _probes) = rig();

        let report = coordinator.run_batch("s0:M;L0 | s0:N")?;
        assert_eq!(report.started, vec!["s0", "s0"]);
        assert!(!report.background);
        assert!(report.reset);

        let s0 = coordinator.executor("s0").unwrap();
        assert_eq!(s0.state(), ExecutorState::Idle);
        assert_eq!(s0.current_duty(), Some(7.5));
        Ok(())
    }

    #[test]
    fn test_interrupt_aborts_the_wait() -> Result<(), Box<dyn Error>> {
        let (mut coordinator, probes) = rig();
        let interrupt = coordinator.interrupt_flag();

        let raiser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            interrupt.store(true, Ordering::SeqCst);
        });

        // Would take well over a second to finish on its own
        let outcome = coordinator.run_batch("s0:M,N;L500");
        raiser.join().unwrap();
        assert!(matches!(outcome, Err(BatchError::Interrupted)));

        coordinator.shutdown()?;
        assert_eq!(probes["s0"].last_write(), Some(0.0));
        Ok(())
    }

    #[test]
    fn test_shutdown_idles_every_driver() -> Result<(), Box<dyn Error>> {
        let (mut coordinator, probes) = rig();

        coordinator.run_batch("s0:M,N;L0 | s1:45,-45;L0")?;
        coordinator.shutdown()?;

        for probe in probes.values() {
            assert_eq!(probe.last_write(), Some(0.0));
        }
        Ok(())
    }
}
