use std::{fmt, str::FromStr};

use thiserror::Error;

use crate::domain::{Angles, SERVO_COUNT};

/// Line terminator expected by the arm controller. Appended by transports,
/// never by command formatting.
pub const LINE_TERMINATOR: char = '\n';

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("servo index {0} is out of range (expected 1..=6)")]
    ServoOutOfRange(u8),
    #[error("expected 6 angles, got {0}")]
    WrongAngleCount(usize),
    #[error("invalid number '{0}'")]
    InvalidNumber(String),
    #[error("unrecognised command '{0}'")]
    Unrecognised(String),
}

/// Commands understood by the arm controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArmCommand {
    /// `S{n}:{angle}`
    Servo { servo: u8, angle: i32 },
    /// `ALL:{a1},...,{a6}`
    All(Angles),
    /// `SMOOTH:{a1},...,{a6},{durationMs}`
    Smooth { angles: Angles, duration_ms: u64 },
}

impl ArmCommand {
    pub fn servo(servo: u8, angle: i32) -> Result<Self, ProtocolError> {
        if servo == 0 || usize::from(servo) > SERVO_COUNT {
            return Err(ProtocolError::ServoOutOfRange(servo));
        }
        Ok(ArmCommand::Servo { servo, angle })
    }

    pub fn to_wire(&self) -> String {
        self.to_string()
    }
}

fn join_angles(angles: &Angles) -> String {
    angles
        .iter()
        .map(i32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

impl fmt::Display for ArmCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArmCommand::Servo { servo, angle } => write!(f, "S{servo}:{angle}"),
            ArmCommand::All(angles) => write!(f, "ALL:{}", join_angles(angles)),
            ArmCommand::Smooth {
                angles,
                duration_ms,
            } => write!(f, "SMOOTH:{},{duration_ms}", join_angles(angles)),
        }
    }
}

fn parse_number<T: FromStr>(raw: &str) -> Result<T, ProtocolError> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| ProtocolError::InvalidNumber(raw.to_string()))
}

fn parse_angles(values: &[&str]) -> Result<Angles, ProtocolError> {
    if values.len() != SERVO_COUNT {
        return Err(ProtocolError::WrongAngleCount(values.len()));
    }
    let mut angles = [0; SERVO_COUNT];
    for (slot, raw) in angles.iter_mut().zip(values) {
        *slot = parse_number(raw)?;
    }
    Ok(angles)
}

impl FromStr for ArmCommand {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let line = s.trim();

        if let Some(rest) = line.strip_prefix("ALL:") {
            let values: Vec<&str> = rest.split(',').collect();
            return Ok(ArmCommand::All(parse_angles(&values)?));
        }

        if let Some(rest) = line.strip_prefix("SMOOTH:") {
            let values: Vec<&str> = rest.split(',').collect();
            let Some((duration, angles)) = values.split_last() else {
                return Err(ProtocolError::WrongAngleCount(0));
            };
            return Ok(ArmCommand::Smooth {
                angles: parse_angles(angles)?,
                duration_ms: parse_number(duration)?,
            });
        }

        if let Some((servo, angle)) = line.strip_prefix('S').and_then(|r| r.split_once(':')) {
            return ArmCommand::servo(parse_number(servo)?, parse_number(angle)?);
        }

        Err(ProtocolError::Unrecognised(line.to_string()))
    }
}

/// Lines the controller writes back over the serial link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerReply {
    Ready,
    ServoAck { servo: u8, angle: i32 },
    AllAck,
    Error(String),
    Other(String),
}

impl ControllerReply {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line == "SISTEMA:CONECTADO" {
            return ControllerReply::Ready;
        }
        if line == "ACK:ALL_OK" {
            return ControllerReply::AllAck;
        }
        if let Some(reason) = line.strip_prefix("ERROR:") {
            return ControllerReply::Error(reason.to_string());
        }
        if let Some((servo, angle)) = line
            .strip_prefix("ACK:S")
            .and_then(|rest| rest.split_once('='))
        {
            if let (Ok(servo), Ok(angle)) = (servo.parse(), angle.parse()) {
                return ControllerReply::ServoAck { servo, angle };
            }
        }
        ControllerReply::Other(line.to_string())
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ControllerReply::Error(_))
    }
}
