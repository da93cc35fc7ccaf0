//! Listens on the MQTT command topic and forwards each command line to the
//! arm controller's serial port.

use std::{path::PathBuf, time::Duration};

use anyhow::{bail, Context, Result};
use clap::Parser;
use control_core::{
    available_ports, ConnectParams, MqttTransport, SerialTransport, Transport, TransportError,
};
use shared::{
    hooks::{log_now, LogSink, TracingLogSink},
    protocol::{ArmCommand, ControllerReply},
};
use storage::{ConfigStore, CONFIG_FILE};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const LINK_CHECK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(name = "bridge", about = "Forward MQTT arm commands to a serial controller")]
struct Args {
    /// Serial port; defaults to the first one found
    #[arg(long)]
    port: Option<String>,
    /// Directory holding config.json
    #[arg(long, default_value = "Recursos")]
    data_dir: PathBuf,
    /// Broker as host or host:port
    #[arg(long)]
    broker: Option<String>,
    #[arg(long)]
    topic: Option<String>,
    #[arg(long)]
    baud_rate: Option<u32>,
}

/// Forwards one payload line. Returns `false` when the line is not an arm
/// command and was dropped.
async fn forward_line(
    serial: &mut dyn Transport,
    log: &dyn LogSink,
    line: &str,
) -> Result<bool, TransportError> {
    let line = line.trim();
    let command = match line.parse::<ArmCommand>() {
        Ok(command) => command,
        Err(err) => {
            warn!(%line, %err, "dropping payload");
            return Ok(false);
        }
    };
    serial.send(&command.to_wire()).await?;
    log_now(log, format!("[SERIAL] MQTT: {command}"));
    Ok(true)
}

fn pick_port(requested: Option<String>) -> Result<String> {
    if let Some(port) = requested {
        return Ok(port);
    }
    let ports = available_ports()?;
    match ports.into_iter().next() {
        Some(port) => {
            info!(%port, "using first available serial port");
            Ok(port)
        }
        None => bail!("no serial ports found; pass --port"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let mut config = ConfigStore::open(args.data_dir.join(CONFIG_FILE)).load_or_default();
    if let Some(broker) = args.broker {
        config.mqtt_address = broker;
    }
    if let Some(topic) = args.topic {
        config.mqtt_topic = topic;
    }
    if let Some(baud_rate) = args.baud_rate {
        config.baud_rate = baud_rate;
    }

    let port = pick_port(args.port)?;
    let mut serial = SerialTransport::new();
    serial
        .open(&ConnectParams::serial(port.as_str(), &config))
        .await
        .with_context(|| format!("failed to open serial port {port}"))?;

    let mut mqtt = MqttTransport::new();
    let mqtt_params = ConnectParams::mqtt(&config)?;
    let target = mqtt_params.target();
    mqtt.open(&mqtt_params)
        .await
        .with_context(|| format!("failed to connect to {target}"))?;
    let mut commands = mqtt.subscribe();
    let mut replies = serial.subscribe();
    mqtt.listen().await?;
    info!(%port, %target, "bridge running; Ctrl-C to stop");

    let log = TracingLogSink;
    let mut link_check = tokio::time::interval(LINK_CHECK_INTERVAL);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let result = loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutting down");
                break Ok(());
            }
            command = commands.recv() => match command {
                Ok(line) => {
                    if let Err(err) = forward_line(&mut serial, &log, &line).await {
                        error!(%err, "serial write failed");
                        break Err(err).context("serial link failed");
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "dropped mqtt commands"),
                Err(RecvError::Closed) => break Ok(()),
            },
            reply = replies.recv() => match reply {
                Ok(line) => {
                    if let ControllerReply::Error(reason) = ControllerReply::parse(&line) {
                        warn!(%reason, "controller reported an error");
                    }
                    log_now(&log, format!("MCU: {line}"));
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "dropped controller replies"),
                Err(RecvError::Closed) => break Ok(()),
            },
            _ = link_check.tick() => {
                if !mqtt.is_open() {
                    break Err(anyhow::anyhow!("broker connection lost"));
                }
                if !serial.is_open() {
                    break Err(anyhow::anyhow!("serial port closed"));
                }
            }
        }
    };

    mqtt.close().await;
    serial.close().await;
    result
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use chrono::{DateTime, Local};
    use shared::domain::ConnectionMode;
    use tokio::sync::broadcast;

    use super::*;

    #[derive(Default)]
    struct Lines(Mutex<Vec<String>>);

    impl LogSink for Lines {
        fn log(&self, _timestamp: DateTime<Local>, message: &str) {
            self.0.lock().expect("log").push(message.to_string());
        }
    }

    #[derive(Default)]
    struct Recorder {
        sent: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Transport for Recorder {
        fn mode(&self) -> ConnectionMode {
            ConnectionMode::Serial
        }

        async fn open(&mut self, _params: &ConnectParams) -> Result<(), TransportError> {
            Ok(())
        }

        async fn close(&mut self) {}

        fn is_open(&self) -> bool {
            true
        }

        async fn send(&mut self, line: &str) -> Result<(), TransportError> {
            self.sent.lock().expect("sent").push(line.to_string());
            Ok(())
        }

        fn subscribe(&self) -> broadcast::Receiver<String> {
            broadcast::channel(1).1
        }
    }

    #[tokio::test]
    async fn forwards_arm_commands_and_drops_the_rest() {
        let mut serial = Recorder::default();
        let log = Lines::default();

        assert!(forward_line(&mut serial, &log, " ALL:90,90,90,90,90,90 ")
            .await
            .expect("forward"));
        assert!(forward_line(&mut serial, &log, "S6:30").await.expect("forward"));
        assert!(!forward_line(&mut serial, &log, "hello").await.expect("drop"));

        assert_eq!(
            *serial.sent.lock().expect("sent"),
            ["ALL:90,90,90,90,90,90", "S6:30"]
        );
        assert_eq!(
            *log.0.lock().expect("log"),
            [
                "[SERIAL] MQTT: ALL:90,90,90,90,90,90",
                "[SERIAL] MQTT: S6:30"
            ]
        );
    }

    #[test]
    fn explicit_port_wins() {
        assert_eq!(pick_port(Some("COM9".into())).expect("port"), "COM9");
    }
}
