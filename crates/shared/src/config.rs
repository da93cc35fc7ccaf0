use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{Angles, SERVO_COUNT};

pub const SUPPORTED_BAUD_RATES: [u32; 7] = [2400, 4800, 9600, 19200, 38400, 57600, 115200];
pub const DEFAULT_MQTT_PORT: u16 = 1883;
pub const SERVO_ANGLE_LIMIT: i32 = 180;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("servo {servo}: range {min}..={max} is invalid (expected 0 <= min <= max <= 180)")]
    InvalidRange { servo: usize, min: i32, max: i32 },
    #[error("unsupported baud rate {0}")]
    UnsupportedBaudRate(u32),
    #[error("mqtt broker address must not be empty")]
    EmptyBrokerAddress,
    #[error("invalid mqtt broker address '{0}'")]
    InvalidBrokerAddress(String),
    #[error("mqtt topic must not be empty")]
    EmptyTopic,
}

/// Per-arm calibration and connection settings, persisted as the configuration
/// document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServoConfig {
    #[serde(rename = "MqttAddress")]
    pub mqtt_address: String,
    #[serde(rename = "MqttTopic")]
    pub mqtt_topic: String,
    #[serde(rename = "BaudRate")]
    pub baud_rate: u32,
    #[serde(rename = "MinGrados")]
    pub min_angles: Angles,
    #[serde(rename = "MaxGrados")]
    pub max_angles: Angles,
}

impl Default for ServoConfig {
    fn default() -> Self {
        Self {
            mqtt_address: "localhost".into(),
            mqtt_topic: "mi_usuario/robot/comandos".into(),
            baud_rate: 9600,
            min_angles: [0; SERVO_COUNT],
            max_angles: [SERVO_ANGLE_LIMIT; SERVO_COUNT],
        }
    }
}

impl ServoConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (index, (&min, &max)) in self
            .min_angles
            .iter()
            .zip(self.max_angles.iter())
            .enumerate()
        {
            if min < 0 || max > SERVO_ANGLE_LIMIT || min > max {
                return Err(ConfigError::InvalidRange {
                    servo: index + 1,
                    min,
                    max,
                });
            }
        }

        if !SUPPORTED_BAUD_RATES.contains(&self.baud_rate) {
            return Err(ConfigError::UnsupportedBaudRate(self.baud_rate));
        }

        if self.mqtt_topic.trim().is_empty() {
            return Err(ConfigError::EmptyTopic);
        }

        self.broker_endpoint().map(|_| ())
    }

    /// Clamps `angle` into the range configured for the 0-based `servo_index`.
    pub fn clamp_angle(&self, servo_index: usize, angle: i32) -> i32 {
        let min = self.min_angles[servo_index];
        let max = self.max_angles[servo_index];
        if min > max {
            return angle;
        }
        angle.clamp(min, max)
    }

    pub fn clamp_angles(&self, angles: &Angles) -> Angles {
        let mut clamped = *angles;
        for (index, angle) in clamped.iter_mut().enumerate() {
            *angle = self.clamp_angle(index, *angle);
        }
        clamped
    }

    /// Splits `MqttAddress` into host and port. A bare host uses port 1883.
    pub fn broker_endpoint(&self) -> Result<(String, u16), ConfigError> {
        let raw = self.mqtt_address.trim();
        if raw.is_empty() {
            return Err(ConfigError::EmptyBrokerAddress);
        }

        let raw = raw
            .strip_prefix("mqtt://")
            .or_else(|| raw.strip_prefix("tcp://"))
            .unwrap_or(raw);

        match raw.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| ConfigError::InvalidBrokerAddress(self.mqtt_address.clone()))?;
                if host.is_empty() {
                    return Err(ConfigError::InvalidBrokerAddress(self.mqtt_address.clone()));
                }
                Ok((host.to_string(), port))
            }
            None => Ok((raw.to_string(), DEFAULT_MQTT_PORT)),
        }
    }
}
