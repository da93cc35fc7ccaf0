use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS};
use shared::domain::ConnectionMode;
use tokio::{
    sync::{broadcast, oneshot},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use super::{frame_line, inbound_channel, ConnectParams, Transport, TransportError};

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const REQUEST_CAPACITY: usize = 16;
const DISCONNECT_GRACE: Duration = Duration::from_millis(500);

struct MqttSession {
    client: AsyncClient,
    topic: String,
    connected: Arc<AtomicBool>,
    event_task: JoinHandle<()>,
}

/// Publishes command lines to a broker topic. Publishes received on
/// subscribed topics are delivered through [`Transport::subscribe`].
pub struct MqttTransport {
    session: Option<MqttSession>,
    inbound: broadcast::Sender<String>,
}

impl MqttTransport {
    pub fn new() -> Self {
        Self {
            session: None,
            inbound: inbound_channel(),
        }
    }

    /// Subscribes to the command topic so that lines published by other
    /// clients arrive on [`Transport::subscribe`].
    pub async fn listen(&self) -> Result<(), TransportError> {
        let session = self.session.as_ref().ok_or(TransportError::Closed)?;
        session
            .client
            .subscribe(session.topic.clone(), QoS::AtLeastOnce)
            .await
            .map_err(|err| TransportError::Send(err.to_string()))?;
        info!(topic = %session.topic, "subscribed to command topic");
        Ok(())
    }
}

impl Default for MqttTransport {
    fn default() -> Self {
        Self::new()
    }
}

async fn drive_event_loop(
    mut eventloop: EventLoop,
    connected: Arc<AtomicBool>,
    inbound: broadcast::Sender<String>,
    ready: oneshot::Sender<Result<(), String>>,
) {
    let mut ready = Some(ready);
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    connected.store(true, Ordering::SeqCst);
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(Ok(()));
                    }
                } else if let Some(tx) = ready.take() {
                    let _ = tx.send(Err(format!("broker refused connection: {:?}", ack.code)));
                    break;
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let text = String::from_utf8_lossy(&publish.payload);
                for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
                    let _ = inbound.send(line.to_string());
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                if connected.swap(false, Ordering::SeqCst) {
                    warn!("broker closed the mqtt session");
                }
                break;
            }
            Ok(event) => debug!(?event, "mqtt event"),
            Err(err) => {
                // No automatic reconnect: the operator reconnects explicitly.
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Err(err.to_string()));
                } else if connected.swap(false, Ordering::SeqCst) {
                    warn!(%err, "mqtt connection lost");
                }
                break;
            }
        }
    }
    connected.store(false, Ordering::SeqCst);
}

#[async_trait]
impl Transport for MqttTransport {
    fn mode(&self) -> ConnectionMode {
        ConnectionMode::Mqtt
    }

    async fn open(&mut self, params: &ConnectParams) -> Result<(), TransportError> {
        let ConnectParams::Mqtt(mqtt) = params else {
            return Err(TransportError::WrongMode {
                expected: ConnectionMode::Mqtt,
                given: params.mode(),
            });
        };
        self.close().await;

        let target = params.target();
        let mut options = MqttOptions::new(mqtt.client_id.clone(), mqtt.host.clone(), mqtt.port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_session(true);

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let connected = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = oneshot::channel();
        let event_task = tokio::spawn(drive_event_loop(
            eventloop,
            Arc::clone(&connected),
            self.inbound.clone(),
            ready_tx,
        ));

        let failure = match tokio::time::timeout(mqtt.connect_timeout, ready_rx).await {
            Ok(Ok(Ok(()))) => None,
            Ok(Ok(Err(reason))) => Some(TransportError::Connect {
                target: target.clone(),
                reason,
            }),
            Ok(Err(_)) => Some(TransportError::Connect {
                target: target.clone(),
                reason: "mqtt event loop stopped before the broker answered".into(),
            }),
            Err(_) => Some(TransportError::ConnectTimeout {
                target: target.clone(),
                timeout: mqtt.connect_timeout,
            }),
        };
        if let Some(err) = failure {
            event_task.abort();
            return Err(err);
        }

        info!(%target, client_id = %mqtt.client_id, "mqtt session established");
        self.session = Some(MqttSession {
            client,
            topic: mqtt.topic.clone(),
            connected,
            event_task,
        });
        Ok(())
    }

    async fn close(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        session.connected.store(false, Ordering::SeqCst);
        if let Err(err) = session.client.disconnect().await {
            debug!(%err, "mqtt disconnect request was not delivered");
        }
        if tokio::time::timeout(DISCONNECT_GRACE, &mut session.event_task)
            .await
            .is_err()
        {
            session.event_task.abort();
        }
        info!(topic = %session.topic, "mqtt session closed");
    }

    fn is_open(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.connected.load(Ordering::SeqCst))
    }

    async fn send(&mut self, line: &str) -> Result<(), TransportError> {
        let session = self
            .session
            .as_ref()
            .filter(|s| s.connected.load(Ordering::SeqCst))
            .ok_or(TransportError::Closed)?;
        let payload = frame_line(line.trim());
        session
            .client
            .publish(
                session.topic.clone(),
                QoS::AtLeastOnce,
                false,
                payload.into_bytes(),
            )
            .await
            .map_err(|err| TransportError::Send(err.to_string()))
    }

    fn subscribe(&self) -> broadcast::Receiver<String> {
        self.inbound.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MqttParams;
    use tokio::net::TcpListener;

    fn params(port: u16, connect_timeout: Duration) -> ConnectParams {
        ConnectParams::Mqtt(MqttParams {
            host: "127.0.0.1".into(),
            port,
            topic: "arm/test".into(),
            client_id: "arm-control-test".into(),
            connect_timeout,
        })
    }

    #[tokio::test]
    async fn silent_broker_times_out() {
        // Accepts TCP but never answers CONNECT.
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();

        let mut transport = MqttTransport::new();
        let err = transport
            .open(&params(port, Duration::from_millis(200)))
            .await
            .expect_err("timeout");
        assert!(matches!(err, TransportError::ConnectTimeout { .. }), "{err}");
        assert!(!transport.is_open());
        drop(listener);
    }

    #[tokio::test]
    async fn refused_connection_is_a_connect_error() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
            listener.local_addr().expect("addr").port()
        };

        let mut transport = MqttTransport::new();
        let err = transport
            .open(&params(port, Duration::from_secs(5)))
            .await
            .expect_err("refused");
        assert_eq!(err.code(), shared::error::ErrorCode::Connection);
        assert!(!transport.is_open());
    }

    #[tokio::test]
    async fn send_without_session_is_closed() {
        let mut transport = MqttTransport::new();
        assert!(matches!(
            transport.send("ALL:90,90,90,90,90,90").await,
            Err(TransportError::Closed)
        ));
        assert!(matches!(transport.listen().await, Err(TransportError::Closed)));
    }
}
