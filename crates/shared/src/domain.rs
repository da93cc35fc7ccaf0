use std::{fmt, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of joints on the arm. Servos are addressed 1-based on the wire.
pub const SERVO_COUNT: usize = 6;

pub type Angles = [i32; SERVO_COUNT];

pub const DEFAULT_STEP_DELAY_MS: u64 = 1000;

pub const GRIPPER_SERVO: u8 = 6;
pub const GRIPPER_OPEN_ANGLE: i32 = 30;
pub const GRIPPER_CLOSED_ANGLE: i32 = 180;

macro_rules! builtin_position {
    ($fn_name:ident, $label:literal, [$($angle:literal),+ $(,)?]) => {
        pub fn $fn_name() -> Position {
            Position::new($label, [$($angle),+])
        }
    };
}

builtin_position!(home_position, "HOME", [90, 90, 90, 90, 90, 90]);
builtin_position!(rest_position, "REPOSO", [0, 45, 180, 90, 90, 20]);
builtin_position!(work_position, "TRABAJO", [90, 45, 135, 90, 90, 90]);

/// Fixed positions that always precede the persisted library. They are never
/// written to the position document and cannot be deleted.
pub fn builtin_positions() -> Vec<Position> {
    vec![home_position(), rest_position(), work_position()]
}

pub fn is_builtin_name(name: &str) -> bool {
    builtin_positions().iter().any(|p| p.has_name(name))
}

/// Comparison key for position and routine names.
pub fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    #[serde(rename = "Nombre")]
    pub name: String,
    #[serde(rename = "Angulos")]
    pub angles: Angles,
}

impl Position {
    pub fn new(name: impl Into<String>, angles: Angles) -> Self {
        Self {
            name: name.into(),
            angles,
        }
    }

    pub fn has_name(&self, name: &str) -> bool {
        normalize_name(&self.name) == normalize_name(name)
    }

    pub fn display_name(&self) -> String {
        self.name.to_uppercase()
    }
}

/// A named sequence of positions. Steps are embedded by value so deleting a
/// library position never alters a saved routine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Routine {
    #[serde(rename = "Nombre")]
    pub name: String,
    #[serde(rename = "Pasos")]
    pub steps: Vec<Position>,
    #[serde(rename = "DelayEntrePasos")]
    pub step_delay_ms: u64,
}

impl Routine {
    pub fn new(name: impl Into<String>, steps: Vec<Position>, step_delay_ms: u64) -> Self {
        Self {
            name: name.into(),
            steps,
            step_delay_ms,
        }
    }

    pub fn has_name(&self, name: &str) -> bool {
        normalize_name(&self.name) == normalize_name(name)
    }

    pub fn step_delay(&self) -> Duration {
        Duration::from_millis(self.step_delay_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionMode {
    #[default]
    Serial,
    Mqtt,
}

impl ConnectionMode {
    /// Tag used as the prefix of operator log lines.
    pub fn tag(self) -> &'static str {
        match self {
            ConnectionMode::Serial => "SERIAL",
            ConnectionMode::Mqtt => "MQTT",
        }
    }
}

impl fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionMode::Serial => f.write_str("Serial"),
            ConnectionMode::Mqtt => f.write_str("MQTT"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown connection mode '{0}' (expected 'serial' or 'mqtt')")]
pub struct UnknownModeError(pub String);

impl FromStr for ConnectionMode {
    type Err = UnknownModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("serial") {
            Ok(ConnectionMode::Serial)
        } else if s.trim().eq_ignore_ascii_case("mqtt") {
            Ok(ConnectionMode::Mqtt)
        } else {
            Err(UnknownModeError(s.to_string()))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectionState {
    pub mode: ConnectionMode,
    pub connected: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GripperAction {
    Open,
    Close,
}

impl GripperAction {
    pub fn angle(self) -> i32 {
        match self {
            GripperAction::Open => GRIPPER_OPEN_ANGLE,
            GripperAction::Close => GRIPPER_CLOSED_ANGLE,
        }
    }
}
