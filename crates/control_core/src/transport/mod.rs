use std::time::Duration;

use async_trait::async_trait;
use shared::{
    config::{ConfigError, ServoConfig},
    domain::ConnectionMode,
    error::ErrorCode,
    protocol::LINE_TERMINATOR,
};
use thiserror::Error;
use tokio::sync::broadcast;

pub mod mqtt;
pub mod serial;

pub use mqtt::MqttTransport;
pub use serial::{available_ports, SerialTransport};

pub const MQTT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const INBOUND_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("timed out after {}ms connecting to {target}", .timeout.as_millis())]
    ConnectTimeout { target: String, timeout: Duration },
    #[error("failed to open {target}: {reason}")]
    Connect { target: String, reason: String },
    #[error("{given} parameters cannot open a {expected} transport")]
    WrongMode {
        expected: ConnectionMode,
        given: ConnectionMode,
    },
    #[error("transport is not open")]
    Closed,
    #[error("send timed out after {}ms", .0.as_millis())]
    SendTimeout(Duration),
    #[error("send failed: {0}")]
    Send(String),
}

impl TransportError {
    pub fn code(&self) -> ErrorCode {
        match self {
            TransportError::ConnectTimeout { .. }
            | TransportError::Connect { .. }
            | TransportError::WrongMode { .. } => ErrorCode::Connection,
            TransportError::Closed | TransportError::SendTimeout(_) | TransportError::Send(_) => {
                ErrorCode::Send
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialParams {
    pub port_name: String,
    pub baud_rate: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttParams {
    pub host: String,
    pub port: u16,
    pub topic: String,
    pub client_id: String,
    pub connect_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectParams {
    Serial(SerialParams),
    Mqtt(MqttParams),
}

impl ConnectParams {
    pub fn serial(port_name: impl Into<String>, config: &ServoConfig) -> Self {
        ConnectParams::Serial(SerialParams {
            port_name: port_name.into(),
            baud_rate: config.baud_rate,
        })
    }

    /// Broker endpoint and topic from `config`, with a client id unique to
    /// this process.
    pub fn mqtt(config: &ServoConfig) -> Result<Self, ConfigError> {
        let (host, port) = config.broker_endpoint()?;
        let topic = config.mqtt_topic.trim();
        if topic.is_empty() {
            return Err(ConfigError::EmptyTopic);
        }
        Ok(ConnectParams::Mqtt(MqttParams {
            host,
            port,
            topic: topic.to_string(),
            client_id: format!(
                "arm-control-{}-{}",
                std::process::id(),
                chrono::Utc::now().timestamp_millis()
            ),
            connect_timeout: MQTT_CONNECT_TIMEOUT,
        }))
    }

    pub fn mode(&self) -> ConnectionMode {
        match self {
            ConnectParams::Serial(_) => ConnectionMode::Serial,
            ConnectParams::Mqtt(_) => ConnectionMode::Mqtt,
        }
    }

    /// Human readable endpoint, used in logs and errors.
    pub fn target(&self) -> String {
        match self {
            ConnectParams::Serial(p) => format!("{} @ {} baud", p.port_name, p.baud_rate),
            ConnectParams::Mqtt(p) => format!("{}:{} ({})", p.host, p.port, p.topic),
        }
    }
}

/// A byte channel to the arm controller. Implementations own framing: callers
/// pass bare command text and each send puts exactly one terminated line on
/// the wire.
#[async_trait]
pub trait Transport: Send + Sync {
    fn mode(&self) -> ConnectionMode;

    async fn open(&mut self, params: &ConnectParams) -> Result<(), TransportError>;

    /// Releases the channel. Safe to call when already closed.
    async fn close(&mut self);

    fn is_open(&self) -> bool;

    async fn send(&mut self, line: &str) -> Result<(), TransportError>;

    /// Lines received from the controller, already trimmed.
    fn subscribe(&self) -> broadcast::Receiver<String>;
}

pub trait TransportFactory: Send + Sync {
    fn create(&self, mode: ConnectionMode) -> Box<dyn Transport>;
}

pub struct DefaultTransportFactory;

impl TransportFactory for DefaultTransportFactory {
    fn create(&self, mode: ConnectionMode) -> Box<dyn Transport> {
        match mode {
            ConnectionMode::Serial => Box::new(SerialTransport::new()),
            ConnectionMode::Mqtt => Box::new(MqttTransport::new()),
        }
    }
}

/// `line` with any trailing line breaks replaced by a single terminator.
pub fn frame_line(line: &str) -> String {
    let mut framed = line.trim_end_matches(['\r', '\n']).to_string();
    framed.push(LINE_TERMINATOR);
    framed
}

fn inbound_channel() -> broadcast::Sender<String> {
    broadcast::channel(INBOUND_CHANNEL_CAPACITY).0
}
