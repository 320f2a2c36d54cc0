//! GS-232B command set.
//!
//! Commands are ASCII lines terminated by `\r\n`. Only `C2` produces a reply,
//! which the driver uses as the echo confirming every command.

use crate::model::{RotatorError, RotatorResult};
use std::fmt;
use std::str::FromStr;

pub const LINE_TERMINATOR: &str = "\r\n";

/// Azimuth travel of a 450° rotator (degrees)
pub const MAX_AZIMUTH_DEG: u32 = 450;
pub const MAX_ELEVATION_DEG: u32 = 180;

/// Horizontal rotation speed selected by `X1`..`X4`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpeedTier {
    X1,
    #[default]
    X2,
    X3,
    X4,
}

impl SpeedTier {
    /// Nominal azimuth rate of the tier.
    pub fn deg_per_s(self) -> f64 {
        match self {
            SpeedTier::X1 => 2.0,
            SpeedTier::X2 => 6.0,
            SpeedTier::X3 => 12.0,
            SpeedTier::X4 => 24.0,
        }
    }

    pub fn index(self) -> u8 {
        match self {
            SpeedTier::X1 => 1,
            SpeedTier::X2 => 2,
            SpeedTier::X3 => 3,
            SpeedTier::X4 => 4,
        }
    }
}

impl FromStr for SpeedTier {
    type Err = RotatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "X1" | "1" => Ok(SpeedTier::X1),
            "X2" | "2" => Ok(SpeedTier::X2),
            "X3" | "3" => Ok(SpeedTier::X3),
            "X4" | "4" => Ok(SpeedTier::X4),
            other => Err(RotatorError::ProtocolError(format!("unknown speed tier '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    /// `W<AAA> <EEE>`: absolute move, rounded to whole degrees and clamped
    MoveTo { azimuth_deg: f64, elevation_deg: f64 },
    /// `X1`..`X4`
    Speed(SpeedTier),
    /// `R`: continuous clockwise rotation
    RotateClockwise,
    /// `S`: stop all motion
    Stop,
    /// `A`: stop azimuth only
    StopAzimuth,
    /// `C2`: report azimuth and elevation
    QueryPosition,
}

impl Command {
    /// The command text without the line terminator.
    pub fn encode(&self) -> String {
        match self {
            Command::MoveTo {
                azimuth_deg,
                elevation_deg,
            } => format!(
                "W{:03} {:03}",
                clamp_degrees(*azimuth_deg, MAX_AZIMUTH_DEG),
                clamp_degrees(*elevation_deg, MAX_ELEVATION_DEG)
            ),
            Command::Speed(tier) => format!("X{}", tier.index()),
            Command::RotateClockwise => "R".to_string(),
            Command::Stop => "S".to_string(),
            Command::StopAzimuth => "A".to_string(),
            Command::QueryPosition => "C2".to_string(),
        }
    }

    pub fn to_line(&self) -> String {
        format!("{}{}", self.encode(), LINE_TERMINATOR)
    }

    /// Parses a command line as the controller would receive it.
    pub fn parse(line: &str) -> Option<Command> {
        let line = line.trim();
        match line {
            "R" => return Some(Command::RotateClockwise),
            "S" => return Some(Command::Stop),
            "A" => return Some(Command::StopAzimuth),
            "C2" => return Some(Command::QueryPosition),
            _ => {}
        }
        if let Some(tier) = line.strip_prefix('X') {
            return tier.parse().ok().map(Command::Speed);
        }
        let (az, el) = line.strip_prefix('W')?.split_once(' ')?;
        Some(Command::MoveTo {
            azimuth_deg: az.trim().parse::<u32>().ok()? as f64,
            elevation_deg: el.trim().parse::<u32>().ok()? as f64,
        })
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

fn clamp_degrees(value: f64, max: u32) -> u32 {
    if value.is_nan() {
        return 0;
    }
    value.round().clamp(0.0, max as f64) as u32
}

/// Position reported by a `C2` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Echo {
    pub azimuth_deg: u32,
    pub elevation_deg: u32,
}

impl Echo {
    /// Parses `+0aaa+0eee` and the common variants (`+aaa+eee`,
    /// `AZ=aaa EL=eee`, `aaa eee`). Values are clamped to the rotator range.
    pub fn parse(reply: &str) -> RotatorResult<Echo> {
        let numbers = signed_integers(reply);
        match numbers.as_slice() {
            [az, el] => Ok(Echo {
                azimuth_deg: (*az).clamp(0, MAX_AZIMUTH_DEG as i64) as u32,
                elevation_deg: (*el).clamp(0, MAX_ELEVATION_DEG as i64) as u32,
            }),
            _ => Err(RotatorError::ProtocolError(format!(
                "unrecognised position reply '{}'",
                reply.trim()
            ))),
        }
    }

    /// Formats the reply the way the controller does.
    pub fn to_reply(&self) -> String {
        format!("+0{:03}+0{:03}", self.azimuth_deg, self.elevation_deg)
    }
}

impl fmt::Display for Echo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AZ {:03} EL {:03}", self.azimuth_deg, self.elevation_deg)
    }
}

fn signed_integers(text: &str) -> Vec<i64> {
    let mut numbers = Vec::new();
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        let negative = match c {
            '-' | '+' if chars.peek().is_some_and(|d| d.is_ascii_digit()) => c == '-',
            d if d.is_ascii_digit() => {
                let mut digits = d.to_string();
                while let Some(d) = chars.next_if(|d| d.is_ascii_digit()) {
                    digits.push(d);
                }
                numbers.push(digits.parse().unwrap_or(i64::MAX));
                continue;
            }
            _ => continue,
        };
        let mut digits = String::new();
        while let Some(d) = chars.next_if(|d| d.is_ascii_digit()) {
            digits.push(d);
        }
        let value: i64 = digits.parse().unwrap_or(i64::MAX);
        numbers.push(if negative { -value } else { value });
    }
    numbers
}
