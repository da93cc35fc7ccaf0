use std::{sync::Arc, time::Duration};

use shared::{
    config::ServoConfig,
    domain::{
        Angles, ConnectionMode, ConnectionState, GripperAction, Position, GRIPPER_SERVO,
        SERVO_COUNT,
    },
    error::{ErrorCode, ReportedError},
    hooks::{log_now, ConnectionListener, LogSink, NoopConnectionListener},
    protocol::{ArmCommand, ControllerReply},
};
use tokio::{
    sync::{broadcast, broadcast::error::RecvError, watch, Mutex, RwLock},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::transport::{
    ConnectParams, DefaultTransportFactory, Transport, TransportError, TransportFactory,
};

pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(2);
const REPLY_CHANNEL_CAPACITY: usize = 256;

const CONNECT_LABEL: &str = "CONNECT";
const CONFIG_LABEL: &str = "CONFIG";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// Nothing was sent because no transport is connected.
    NotConnected,
}

impl SendOutcome {
    pub fn is_sent(self) -> bool {
        matches!(self, SendOutcome::Sent)
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherOptions {
    pub mode: ConnectionMode,
    pub config: ServoConfig,
    pub send_timeout: Duration,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            mode: ConnectionMode::default(),
            config: ServoConfig::default(),
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }
}

struct DispatcherInner {
    transport: Box<dyn Transport>,
    last_params: Option<ConnectParams>,
    reply_task: Option<JoinHandle<()>>,
}

impl DispatcherInner {
    fn stop_reply_task(&mut self) {
        if let Some(task) = self.reply_task.take() {
            task.abort();
        }
    }
}

/// Owns the active transport and is the only writer of [`ConnectionState`].
///
/// Every outbound command goes through [`CommandDispatcher::send_command`],
/// which serialises access to the transport and writes exactly one operator
/// log line per attempt.
pub struct CommandDispatcher {
    factory: Arc<dyn TransportFactory>,
    log: Arc<dyn LogSink>,
    listener: Arc<dyn ConnectionListener>,
    send_timeout: Duration,
    config: RwLock<ServoConfig>,
    inner: Mutex<DispatcherInner>,
    state: watch::Sender<ConnectionState>,
    replies: broadcast::Sender<ControllerReply>,
}

impl CommandDispatcher {
    pub fn new(config: ServoConfig, log: Arc<dyn LogSink>) -> Arc<Self> {
        Self::new_with_dependencies(
            Arc::new(DefaultTransportFactory),
            log,
            Arc::new(NoopConnectionListener),
            DispatcherOptions {
                config,
                ..DispatcherOptions::default()
            },
        )
    }

    pub fn new_with_dependencies(
        factory: Arc<dyn TransportFactory>,
        log: Arc<dyn LogSink>,
        listener: Arc<dyn ConnectionListener>,
        options: DispatcherOptions,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState {
            mode: options.mode,
            connected: false,
        });
        let (replies, _) = broadcast::channel(REPLY_CHANNEL_CAPACITY);
        Arc::new(Self {
            inner: Mutex::new(DispatcherInner {
                transport: factory.create(options.mode),
                last_params: None,
                reply_task: None,
            }),
            factory,
            log,
            listener,
            send_timeout: options.send_timeout,
            config: RwLock::new(options.config),
            state,
            replies,
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Replies parsed from lines the controller sends back while connected.
    pub fn subscribe_replies(&self) -> broadcast::Receiver<ControllerReply> {
        self.replies.subscribe()
    }

    pub async fn config(&self) -> ServoConfig {
        self.config.read().await.clone()
    }

    /// Writes one line to the operator log.
    pub fn log(&self, message: impl AsRef<str>) {
        log_now(self.log.as_ref(), message);
    }

    fn set_connected(&self, connected: bool) {
        let previous = self.state.send_replace(ConnectionState {
            mode: self.state().mode,
            connected,
        });
        if previous.connected != connected {
            self.listener.on_connection_changed(connected);
        }
    }

    /// Switches the active transport kind. A live connection is closed first,
    /// so the new mode is never connectable while the old link is open.
    pub async fn select_mode(&self, mode: ConnectionMode) {
        let mut inner = self.inner.lock().await;
        if self.state().mode == mode {
            return;
        }
        self.disconnect_locked(&mut inner).await;
        inner.transport = self.factory.create(mode);
        inner.last_params = None;
        self.state.send_replace(ConnectionState {
            mode,
            connected: false,
        });
        info!(%mode, "connection mode selected");
        self.log(format!("Mode: {mode}"));
    }

    /// Connection parameters for the current mode built from the active
    /// configuration. Serial mode needs a port name.
    pub async fn connect_params(
        &self,
        port_name: Option<&str>,
    ) -> Result<ConnectParams, ReportedError> {
        let config = self.config().await;
        match self.state().mode {
            ConnectionMode::Serial => {
                let port = port_name
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .ok_or_else(|| {
                        ReportedError::new(
                            ErrorCode::Validation,
                            CONNECT_LABEL,
                            "no serial port selected",
                        )
                    })?;
                Ok(ConnectParams::serial(port, &config))
            }
            ConnectionMode::Mqtt => ConnectParams::mqtt(&config).map_err(|err| {
                ReportedError::new(ErrorCode::Validation, CONNECT_LABEL, err.to_string())
            }),
        }
    }

    pub async fn connect(&self, params: ConnectParams) -> Result<(), ReportedError> {
        let mut inner = self.inner.lock().await;
        let state = self.state();
        if params.mode() != state.mode {
            let err = TransportError::WrongMode {
                expected: state.mode,
                given: params.mode(),
            };
            self.log(format!("Connection error: {err}"));
            return Err(ReportedError::new(err.code(), CONNECT_LABEL, err.to_string()));
        }
        if state.connected && inner.transport.is_open() {
            debug!(mode = %state.mode, "already connected");
            return Ok(());
        }

        inner.stop_reply_task();
        match inner.transport.open(&params).await {
            Ok(()) => {
                self.start_reply_task(&mut inner);
                inner.last_params = Some(params.clone());
                self.set_connected(true);
                info!(target = %params.target(), "connected");
                self.log(format!("Connected via {} to {}", state.mode, params.target()));
                Ok(())
            }
            Err(err) => {
                inner.transport.close().await;
                self.set_connected(false);
                error!(target = %params.target(), %err, "connection failed");
                self.log(format!("Connection error: {err}"));
                Err(ReportedError::new(err.code(), CONNECT_LABEL, err.to_string()))
            }
        }
    }

    /// Closes the active transport. Does nothing when already disconnected.
    pub async fn disconnect(&self) {
        let mut inner = self.inner.lock().await;
        self.disconnect_locked(&mut inner).await;
    }

    async fn disconnect_locked(&self, inner: &mut DispatcherInner) {
        if !self.state().connected && !inner.transport.is_open() {
            return;
        }
        inner.stop_reply_task();
        inner.transport.close().await;
        self.set_connected(false);
        info!(mode = %self.state().mode, "disconnected");
        self.log("Disconnected");
    }

    fn start_reply_task(&self, inner: &mut DispatcherInner) {
        let mut lines = inner.transport.subscribe();
        let log = Arc::clone(&self.log);
        let replies = self.replies.clone();
        inner.reply_task = Some(tokio::spawn(async move {
            loop {
                match lines.recv().await {
                    Ok(line) => {
                        let reply = ControllerReply::parse(&line);
                        if reply.is_error() {
                            warn!(%line, "controller reported an error");
                        }
                        log_now(log.as_ref(), format!("MCU: {line}"));
                        let _ = replies.send(reply);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "dropped controller replies");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }));
    }

    /// Sends one raw command line. While disconnected this is a no-op that
    /// never touches the transport.
    pub async fn send_command(
        &self,
        command: &str,
        label: &str,
    ) -> Result<SendOutcome, ReportedError> {
        let mut inner = self.inner.lock().await;
        let state = self.state();
        if !state.connected {
            debug!(%label, "not connected; command dropped");
            return Ok(SendOutcome::NotConnected);
        }
        let tag = state.mode.tag();
        let command = command.trim();

        let result = if inner.transport.is_open() {
            match tokio::time::timeout(self.send_timeout, inner.transport.send(command)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::SendTimeout(self.send_timeout)),
            }
        } else {
            // The link dropped underneath us. Record it; do not reconnect.
            inner.stop_reply_task();
            self.set_connected(false);
            Err(TransportError::Closed)
        };

        match result {
            Ok(()) => {
                debug!(%tag, %label, %command, "command sent");
                self.log(format!("[{tag}] {label}: {command}"));
                Ok(SendOutcome::Sent)
            }
            Err(err) => {
                error!(%tag, %label, %command, %err, "send failed");
                self.log(format!("[{tag}] {label} failed: {err}"));
                Err(ReportedError::new(ErrorCode::Send, label, err.to_string()))
            }
        }
    }

    async fn dispatch(
        &self,
        command: ArmCommand,
        label: &str,
    ) -> Result<SendOutcome, ReportedError> {
        self.send_command(&command.to_wire(), label).await
    }

    /// Moves one servo (1-based), clamped to its configured range.
    pub async fn move_servo(&self, servo: u8, angle: i32) -> Result<SendOutcome, ReportedError> {
        let label = format!("Servo {servo}");
        let config = self.config().await;
        let angle = match usize::from(servo).checked_sub(1) {
            Some(index) if index < SERVO_COUNT => config.clamp_angle(index, angle),
            _ => angle,
        };
        let command = ArmCommand::servo(servo, angle).map_err(|err| {
            ReportedError::new(ErrorCode::Validation, label.as_str(), err.to_string())
        })?;
        self.dispatch(command, &label).await
    }

    pub async fn move_all(
        &self,
        angles: Angles,
        label: &str,
    ) -> Result<SendOutcome, ReportedError> {
        let angles = self.config.read().await.clamp_angles(&angles);
        self.dispatch(ArmCommand::All(angles), label).await
    }

    pub async fn smooth_move(
        &self,
        angles: Angles,
        duration_ms: u64,
    ) -> Result<SendOutcome, ReportedError> {
        let angles = self.config.read().await.clamp_angles(&angles);
        self.dispatch(
            ArmCommand::Smooth {
                angles,
                duration_ms,
            },
            "SMOOTH",
        )
        .await
    }

    pub async fn go_to(&self, position: &Position) -> Result<SendOutcome, ReportedError> {
        let label = format!("PRESET: {}", position.display_name());
        self.move_all(position.angles, &label).await
    }

    pub async fn gripper(&self, action: GripperAction) -> Result<SendOutcome, ReportedError> {
        self.move_servo(GRIPPER_SERVO, action.angle()).await
    }

    /// Replaces the active configuration. A live serial link is reopened when
    /// the baud rate changes; broker settings take effect on the next connect.
    pub async fn apply_config(&self, config: ServoConfig) -> Result<(), ReportedError> {
        config.validate().map_err(|err| {
            ReportedError::new(ErrorCode::Validation, CONFIG_LABEL, err.to_string())
        })?;

        let mut inner = self.inner.lock().await;
        let previous = std::mem::replace(&mut *self.config.write().await, config.clone());
        let state = self.state();

        if state.connected && previous.baud_rate != config.baud_rate {
            if let Some(ConnectParams::Serial(mut serial)) = inner.last_params.clone() {
                serial.baud_rate = config.baud_rate;
                let params = ConnectParams::Serial(serial);
                inner.stop_reply_task();
                inner.transport.close().await;
                if let Err(err) = inner.transport.open(&params).await {
                    inner.transport.close().await;
                    self.set_connected(false);
                    self.log(format!("Connection error: {err}"));
                    return Err(ReportedError::new(err.code(), CONFIG_LABEL, err.to_string()));
                }
                self.start_reply_task(&mut inner);
                inner.last_params = Some(params.clone());
                self.log(format!("Reopened {}", params.target()));
            }
        }

        if state.connected
            && state.mode == ConnectionMode::Mqtt
            && (previous.mqtt_address != config.mqtt_address
                || previous.mqtt_topic != config.mqtt_topic)
        {
            self.log("Broker settings apply on the next connection");
        }

        info!(baud_rate = config.baud_rate, "configuration applied");
        self.log("Configuration applied");
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/dispatcher_tests.rs"]
mod tests;
