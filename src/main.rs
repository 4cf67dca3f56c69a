use std::path::PathBuf;
use std::sync::atomic::Ordering;

use color_eyre::eyre::{Result, WrapErr};
use log::{debug, info, warn};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use structopt::StructOpt;

use ninja_servo::command::{self, Instruction};
use ninja_servo::config::{HISTORY_FILE, PROMPT, RESET_SPEED};
use ninja_servo::logger::{self, LevelFilter};
use ninja_servo::pwm::{PwmDriver, SimulatedDriver};
use ninja_servo::coordinator::BatchError;
use ninja_servo::{BatchCoordinator, CalibrationStore, MotionTiming, RigConfig};

#[derive(Debug, StructOpt)]
#[structopt(name = "ninja-servo", about = "Drive calibrated servos from a command prompt")]
struct Opts {
    /// Calibration file written by the `calibrate` tool
    #[structopt(short, long, parse(from_os_str), default_value = "servo_calibration.json")]
    calibration: PathBuf,

    /// Simulate the servos instead of driving GPIO
    #[structopt(long)]
    dry_run: bool,

    #[structopt(short, long, default_value = "info")]
    log_level: LevelFilter,

    /// Also write the log to this file
    #[structopt(long, parse(from_os_str))]
    log_file: Option<PathBuf>,
}

// Usage:
//  s0:M,C,N;L2;S0.2          play max, center, min twice at speed 0.2, then reset
//  s0:45,-45;L0 | s1:M       s0 swings until stopped, s1 moves once
//  reset                     cancel everything and center all servos
//  <Enter>                   stop everything where it is
fn main() -> Result<()> {
    color_eyre::install()?;
    let opts = Opts::from_args();

    logger::logger_init(opts.log_level, opts.log_file.as_deref())
        .wrap_err("Failed to initialise logging")?;

    let calibration = CalibrationStore::load(&opts.calibration).wrap_err_with(|| {
        format!(
            "FATAL: calibration file '{}' is missing or corrupt, run `calibrate` first",
            opts.calibration.display()
        )
    })?;

    let rig = RigConfig::default();
    let timing = MotionTiming::default();
    let mut coordinator = if opts.dry_run {
        info!("Dry run: servo output is simulated");
        rig.build(&calibration, timing, SimulatedDriver::claim)
    } else {
        rig.build(&calibration, timing, PwmDriver::claim)
    }
    .wrap_err("Failed to set up the servos")?;

    // Ctrl-C outside the prompt must still end up in the cleanup below
    let interrupt = coordinator.interrupt_flag();
    ctrlc::set_handler(move || interrupt.store(true, Ordering::SeqCst))
        .wrap_err("Failed to install the Ctrl-C handler")?;

    let outcome = match run_prompt(&mut coordinator) {
        Err(e) if matches!(e.downcast_ref::<BatchError>(), Some(BatchError::Interrupted)) => {
            warn!("Interrupted");
            Ok(())
        }
        other => other,
    };

    info!("Exiting. Cleaning up GPIO...");
    let cleanup = coordinator.shutdown();
    outcome?;
    cleanup.wrap_err("Servos were not shut down cleanly")?;
    info!("Done.");

    Ok(())
}

fn run_prompt(coordinator: &mut BatchCoordinator) -> Result<()> {
    coordinator.reset_all(RESET_SPEED)?;
    println!("\nReady for commands. Type 'help' for instructions or 'quit' to exit.");

    let mut rl = DefaultEditor::new()?;
    if rl.load_history(HISTORY_FILE).is_err() {
        debug!("No history found at {}", HISTORY_FILE);
    }

    loop {
        let line = match rl.readline(PROMPT) {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(e) => return Err(e).wrap_err("Failed to read a command"),
        };

        if !line.trim().is_empty() {
            rl.add_history_entry(line.as_str())?;
        }

        match command::parse_instruction(&line) {
            Instruction::Quit => break,
            Instruction::Help => println!("\n{}", command::HELP),
            _ => {
                let report = coordinator.run_batch(&line)?;
                if !report.rejected.is_empty() {
                    println!("Type 'help' for the command format.");
                }
            }
        }
    }

    if let Err(e) = rl.save_history(HISTORY_FILE) {
        warn!("Could not save command history: {}", e);
    }

    Ok(())
}
