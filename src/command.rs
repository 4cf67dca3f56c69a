//! Text protocol for driving the servos.
//!
//! ```text
//! s0:M,C,N;L2;S0.2      one command: positions, optional loops and speed
//! s0:45,-45 | s1:M;L0   commands separated by `|` run in parallel
//! ```

use std::fmt;

use thiserror::Error;

use crate::config::{DEFAULT_LOOP_COUNT, DEFAULT_SPEED, PARALLEL_DELIMITER};
use crate::executor::{MotionPlan, Repeat};
use crate::mapper::AngleToken;

/// A command that cannot be run at all.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommandError {
    #[error("Invalid command format for '{0}', expected <id>:<angles>")]
    MissingSeparator(String),

    #[error("No positions given in '{0}'")]
    EmptyAngles(String),

    #[error("Unknown servo ID '{0}'")]
    UnknownActuator(String),
}

/// A problem that was worked around while parsing.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseWarning {
    #[error("Invalid loop format '{0}', using default L1")]
    MalformedLoop(String),

    #[error("Invalid speed format '{0}', using default S0.5")]
    MalformedSpeed(String),

    #[error("Speed {given} out of range (0.0-1.0), clamped to {clamped}")]
    SpeedClamped { given: f64, clamped: f64 },

    #[error("Unknown parameter '{0}', ignoring")]
    UnknownModifier(String),

    #[error("Invalid angle '{0}', using center")]
    InvalidAngle(String),
}

/// One `;`-separated suffix of a command.
#[derive(Debug, Clone, PartialEq)]
pub enum Modifier {
    Loop(u32),
    Speed(f64),
    /// Recognised prefix whose value could not be read.
    Malformed(char, String),
    Unknown(String),
}

impl Modifier {
    pub fn tokenize(text: &str) -> Self {
        let text = text.trim().to_uppercase();
        let mut chars = text.chars();

        match chars.next() {
            Some('L') => match chars.as_str().trim().parse::<u32>() {
                Ok(count) => Modifier::Loop(count),
                Err(_) => Modifier::Malformed('L', text),
            },
            Some('S') => match chars.as_str().trim().parse::<f64>() {
                Ok(speed) if !speed.is_nan() => Modifier::Speed(speed),
                _ => Modifier::Malformed('S', text),
            },
            _ => Modifier::Unknown(text),
        }
    }
}

/// A parsed motion command for one servo.
#[derive(Debug, Clone, PartialEq)]
pub struct MotionCommand {
    pub actuator: String,
    pub plan: MotionPlan,
}

impl MotionCommand {
    pub fn loop_count(&self) -> u32 {
        self.plan.repeat.count()
    }
}

impl fmt::Display for MotionCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let angles: Vec<String> = self.plan.angles.iter().map(|a| a.to_string()).collect();
        write!(
            f,
            "{}:{};L{};S{}",
            self.actuator,
            angles.join(","),
            self.loop_count(),
            self.plan.speed
        )
    }
}

/// A parsed command plus anything that had to be patched up on the way.
#[derive(Debug, Clone, PartialEq)]
pub struct Parsed {
    pub command: MotionCommand,
    pub warnings: Vec<ParseWarning>,
}

fn parse_angle(token: &str) -> Result<AngleToken, ParseWarning> {
    let token = token.trim();
    match token.to_uppercase().as_str() {
        "M" => Ok(AngleToken::Maximum),
        "C" => Ok(AngleToken::Center),
        "N" => Ok(AngleToken::Minimum),
        other => match other.parse::<f64>() {
            Ok(angle) if angle.is_finite() => Ok(AngleToken::Degrees(angle)),
            _ => Err(ParseWarning::InvalidAngle(token.to_string())),
        },
    }
}

/// Parse `<id>:<angle>[,<angle>...][;L<n>][;S<f>]`.
///
/// The servo id is not checked against the rig here.
pub fn parse_command(text: &str) -> Result<Parsed, CommandError> {
    let text = text.trim();
    let (id, payload) = text
        .split_once(':')
        .ok_or_else(|| CommandError::MissingSeparator(text.to_string()))?;

    let mut parts = payload.split(';');
    let angle_list = parts.next().unwrap_or_default().trim();
    if angle_list.is_empty() {
        return Err(CommandError::EmptyAngles(text.to_string()));
    }

    let mut warnings = Vec::new();
    let angles: Vec<AngleToken> = angle_list
        .split(',')
        .map(|token| {
            parse_angle(token).unwrap_or_else(|warning| {
                warnings.push(warning);
                AngleToken::Center
            })
        })
        .collect();

    let mut loop_count = DEFAULT_LOOP_COUNT;
    let mut speed = DEFAULT_SPEED;

    for part in parts.filter(|p| !p.trim().is_empty()) {
        match Modifier::tokenize(part) {
            Modifier::Loop(count) => loop_count = count,
            Modifier::Speed(given) => {
                let clamped = given.clamp(0.0, 1.0);
                if clamped != given {
                    warnings.push(ParseWarning::SpeedClamped { given, clamped });
                }
                speed = clamped;
            }
            Modifier::Malformed('L', raw) => {
                loop_count = DEFAULT_LOOP_COUNT;
                warnings.push(ParseWarning::MalformedLoop(raw));
            }
            Modifier::Malformed(_, raw) => {
                speed = DEFAULT_SPEED;
                warnings.push(ParseWarning::MalformedSpeed(raw));
            }
            Modifier::Unknown(raw) => warnings.push(ParseWarning::UnknownModifier(raw)),
        }
    }

    Ok(Parsed {
        command: MotionCommand {
            actuator: id.trim().to_string(),
            plan: MotionPlan::new(angles, Repeat::from_count(loop_count), speed),
        },
        warnings,
    })
}

/// What a whole input line asks for.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction<'a> {
    /// Empty line: stop everything where it is.
    StopAll,
    Reset,
    Quit,
    Help,
    /// One or more commands to run in parallel.
    Batch(Vec<&'a str>),
}

pub fn parse_instruction(line: &str) -> Instruction<'_> {
    let line = line.trim();
    match line.to_lowercase().as_str() {
        "" => Instruction::StopAll,
        "reset" => Instruction::Reset,
        "quit" | "exit" | "q" => Instruction::Quit,
        "help" => Instruction::Help,
        _ => Instruction::Batch(
            line.split(PARALLEL_DELIMITER)
                .map(str::trim)
                .filter(|cmd| !cmd.is_empty())
                .collect(),
        ),
    }
}

pub const HELP: &str = "\
--- Command Help ---
Behavior: Servos execute the command(s) then automatically reset to center.
Format:   s{ID}:<angles>[;L<loops>][;S<speed>]
  - angles: Comma-separated (M, C, N, or -90 to 90)
  - L<loops>: Optional loop count (e.g., L5, L0 for infinite). Default: L1
  - S<speed>: Optional speed (e.g., S0.75). Default: S0.5

Examples:
  s0:M,C,N;L2;S0.2  (Full command)
  s1:N,M;L3         (Default speed)
  s2:45,-45;S0.9    (Default loop)
  s3:C,M            (Default loop and speed)

Other Commands:
  Parallel:  command1 | command2
  Reset Now: reset
  Stop All:  Press Enter
  Quit:      quit, exit or q
";
