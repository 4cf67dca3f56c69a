use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use color_eyre::eyre::{Result, WrapErr, eyre};
use log::{info, warn};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use structopt::StructOpt;

use ninja_servo::config::{CALIBRATION_NUDGE, CALIBRATION_SETTLE_MS, SAFE_MAX_DUTY, SAFE_MIN_DUTY};
use ninja_servo::logger::{self, LevelFilter};
use ninja_servo::mapper::to_angle;
use ninja_servo::pwm::{ActuatorDriver, PwmDriver, SimulatedDriver};
use ninja_servo::calibration::CalibrationError;
use ninja_servo::{CalibrationRecord, CalibrationStore, RigConfig};

#[derive(Debug, StructOpt)]
#[structopt(name = "calibrate", about = "Record min/center/max duty cycles for each servo")]
struct Opts {
    /// Servos to calibrate: `s0`, `s1,s2` or `all`
    selection: String,

    #[structopt(short, long, parse(from_os_str), default_value = "servo_calibration.json")]
    calibration: PathBuf,

    /// Simulate the servos instead of driving GPIO
    #[structopt(long)]
    dry_run: bool,

    #[structopt(short, long, default_value = "info")]
    log_level: LevelFilter,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Preset {
    Min,
    Center,
    Max,
}

/// One line of operator input.
#[derive(Debug, Clone, PartialEq)]
enum Edit {
    Nudge(f64),
    Absolute(f64),
    Goto(Preset),
    Store(Preset),
    Next,
    Quit,
    Unknown(String),
}

impl Edit {
    fn parse(line: &str) -> Self {
        match line.trim() {
            "w" => Edit::Nudge(CALIBRATION_NUDGE),
            "s" => Edit::Nudge(-CALIBRATION_NUDGE),
            "x" => Edit::Goto(Preset::Min),
            "c" => Edit::Goto(Preset::Center),
            "v" => Edit::Goto(Preset::Max),
            "X" => Edit::Store(Preset::Min),
            "C" => Edit::Store(Preset::Center),
            "V" => Edit::Store(Preset::Max),
            "n" => Edit::Next,
            "q" => Edit::Quit,
            other => match other.parse::<f64>() {
                Ok(duty) if duty.is_finite() => Edit::Absolute(duty),
                _ => Edit::Unknown(other.to_string()),
            },
        }
    }
}

/// Calibration state for the servo being edited.
struct Session {
    id: String,
    calib: CalibrationRecord,
    duty: f64,
}

impl Session {
    fn new(id: &str, calib: CalibrationRecord) -> Self {
        Self {
            id: id.to_string(),
            calib,
            duty: calib.center_duty,
        }
    }

    /// Apply a positioning or storing edit, returning a message for the operator.
    fn apply(&mut self, edit: &Edit) -> Option<String> {
        let message = match edit {
            Edit::Nudge(delta) => {
                self.duty += delta;
                None
            }
            Edit::Absolute(duty) => {
                self.duty = *duty;
                None
            }
            Edit::Goto(preset) => {
                self.duty = match preset {
                    Preset::Min => self.calib.min_duty,
                    Preset::Center => self.calib.center_duty,
                    Preset::Max => self.calib.max_duty,
                };
                None
            }
            Edit::Store(preset) => {
                let value = (self.duty * 100.0).round() / 100.0;
                let name = match preset {
                    Preset::Min => {
                        self.calib.min_duty = value;
                        "MIN"
                    }
                    Preset::Center => {
                        self.calib.center_duty = value;
                        "CENTER"
                    }
                    Preset::Max => {
                        self.calib.max_duty = value;
                        "MAX"
                    }
                };
                Some(format!("Set {} {} to {:.2}", self.id, name, value))
            }
            Edit::Unknown(text) => Some(format!("Unknown input '{}'", text)),
            Edit::Next | Edit::Quit => None,
        };

        // Clamp the duty cycle to a safe absolute range
        self.duty = self.duty.clamp(SAFE_MIN_DUTY, SAFE_MAX_DUTY);
        message
    }

    /// Copy the edited record into `store`, only if it is a usable calibration.
    fn commit(&self, store: &mut CalibrationStore) -> Result<(), CalibrationError> {
        self.calib.validate(&self.id)?;
        store.set(&self.id, self.calib);
        Ok(())
    }

    fn print_status(&self, channel: u8) {
        println!(
            "{} (GPIO {}): duty {:.2}, logical angle {:.1}°",
            self.id,
            channel,
            self.duty,
            to_angle(self.duty, &self.calib)
        );
        println!(
            "    Min {:.2} (-90°) | Center {:.2} (0°) | Max {:.2} (+90°)",
            self.calib.min_duty, self.calib.center_duty, self.calib.max_duty
        );
    }
}

const CONTROLS: &str = "\
Controls: [w/s] adjust by 0.1 | <number> set duty | [x/c/v] go to Min/Center/Max
          [X/C/V] store Min/Center/Max | [n] next servo | [q] save & quit";

fn parse_selection(selection: &str, rig: &RigConfig) -> Result<Vec<String>> {
    if selection.trim().eq_ignore_ascii_case("all") {
        return Ok(rig.ids().map(String::from).collect());
    }

    selection
        .split(',')
        .map(str::trim)
        .map(|id| match rig.find(id) {
            Some(_) => Ok(id.to_string()),
            None => Err(eyre!("Unknown servo ID '{}'", id)),
        })
        .collect()
}

fn claim(channel: u8, dry_run: bool) -> Result<Box<dyn ActuatorDriver>> {
    let driver: Box<dyn ActuatorDriver> = if dry_run {
        Box::new(SimulatedDriver::claim(channel)?)
    } else {
        Box::new(PwmDriver::claim(channel)?)
    };
    Ok(driver)
}

/// Hold a position long enough to reach it, then stop pulsing.
fn settle(driver: &mut dyn ActuatorDriver, duty: f64) -> Result<()> {
    driver.set_duty(duty)?;
    thread::sleep(Duration::from_millis(CALIBRATION_SETTLE_MS));
    driver.idle()?;
    Ok(())
}

fn main() -> Result<()> {
    color_eyre::install()?;
    let opts = Opts::from_args();
    logger::logger_init(opts.log_level, None).wrap_err("Failed to initialise logging")?;

    let rig = RigConfig::default();
    rig.validate()?;
    let selected = parse_selection(&opts.selection, &rig)?;

    let mut store = CalibrationStore::load_or_default(&opts.calibration, rig.ids())
        .wrap_err("Failed to prepare the calibration file")?;

    // Ctrl-C during a settle delay is picked up before the next prompt, so
    // the drivers are still dropped and idled on the way out
    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupted);
    ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
        .wrap_err("Failed to install the Ctrl-C handler")?;
    let aborted = || {
        let aborted = interrupted.load(Ordering::SeqCst);
        if aborted {
            warn!("Calibration aborted, nothing saved");
        }
        aborted
    };

    let mut drivers = BTreeMap::new();
    for actuator in &rig.actuators {
        let mut driver = claim(actuator.channel, opts.dry_run)?;
        let center = store.get(&actuator.id).copied().unwrap_or_default().center_duty;
        driver.set_duty(center)?;
        drivers.insert(actuator.id.clone(), (actuator.channel, driver));
    }

    // Wait for servos to center, then stop pulses to reduce jitter
    thread::sleep(Duration::from_secs(1));
    for (_, driver) in drivers.values_mut() {
        driver.idle()?;
    }
    if aborted() {
        return Ok(());
    }

    let mut rl = DefaultEditor::new()?;

    for id in &selected {
        let Some((channel, driver)) = drivers.get_mut(id) else {
            continue;
        };
        let mut session = Session::new(id, store.get(id).copied().unwrap_or_default());

        println!("\n--- Calibrating {} ---\n{}", id, CONTROLS);
        session.print_status(*channel);

        loop {
            if aborted() {
                return Ok(());
            }

            let line = match rl.readline(&format!("{}> ", id)) {
                Ok(line) => line,
                Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => {
                    warn!("Calibration aborted, nothing saved");
                    return Ok(());
                }
                Err(e) => return Err(e).wrap_err("Failed to read input"),
            };

            let edit = Edit::parse(&line);
            match edit {
                Edit::Next | Edit::Quit => {
                    if let Err(e) = session.commit(&mut store) {
                        println!("Not accepted: {}", e);
                        continue;
                    }
                    if edit == Edit::Next {
                        break;
                    }
                    match store.save(&opts.calibration) {
                        Ok(()) => return Ok(()),
                        Err(e) => {
                            println!("Not saved: {}", e);
                            continue;
                        }
                    }
                }
                _ => {}
            }

            if let Some(message) = session.apply(&edit) {
                println!("{}", message);
            }
            settle(driver.as_mut(), session.duty)?;
            session.print_status(*channel);
        }
    }

    store
        .save(&opts.calibration)
        .wrap_err("Failed to save the calibration")?;
    info!("All selected servos calibrated.");

    Ok(())
}
