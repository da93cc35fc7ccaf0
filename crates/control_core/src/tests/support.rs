use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Mutex,
};

use async_trait::async_trait;
use chrono::{DateTime, Local};
use shared::{
    domain::ConnectionMode,
    hooks::{ConnectionListener, LogSink},
};
use tokio::sync::broadcast;

use crate::transport::{frame_line, ConnectParams, Transport, TransportError, TransportFactory};

/// Shared recorder and fault switches behind every [`FakeTransport`] a
/// [`FakeFactory`] creates.
#[derive(Clone)]
pub struct FakeLink {
    pub wire: Arc<Mutex<Vec<String>>>,
    pub events: Arc<Mutex<Vec<String>>>,
    pub fail_open: Arc<AtomicBool>,
    pub hang_send: Arc<AtomicBool>,
    /// Zero-based index of the send that fails; `usize::MAX` for none.
    pub fail_send_at: Arc<AtomicUsize>,
    pub drop_link: Arc<AtomicBool>,
    pub inbound: broadcast::Sender<String>,
    sends: Arc<AtomicUsize>,
}

impl Default for FakeLink {
    fn default() -> Self {
        Self {
            wire: Arc::default(),
            events: Arc::default(),
            fail_open: Arc::default(),
            hang_send: Arc::default(),
            fail_send_at: Arc::new(AtomicUsize::new(usize::MAX)),
            drop_link: Arc::default(),
            inbound: broadcast::channel(16).0,
            sends: Arc::default(),
        }
    }
}

impl FakeLink {
    pub fn wire(&self) -> Vec<String> {
        self.wire.lock().expect("wire").clone()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().expect("events").clone()
    }

    fn record(&self, event: String) {
        self.events.lock().expect("events").push(event);
    }
}

pub struct FakeTransport {
    mode: ConnectionMode,
    link: FakeLink,
    open: bool,
}

#[async_trait]
impl Transport for FakeTransport {
    fn mode(&self) -> ConnectionMode {
        self.mode
    }

    async fn open(&mut self, params: &ConnectParams) -> Result<(), TransportError> {
        self.link.record(format!("open:{}", self.mode.tag()));
        if self.link.fail_open.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectTimeout {
                target: params.target(),
                timeout: std::time::Duration::from_secs(5),
            });
        }
        self.open = true;
        Ok(())
    }

    async fn close(&mut self) {
        if self.open {
            self.link.record(format!("close:{}", self.mode.tag()));
        }
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open && !self.link.drop_link.load(Ordering::SeqCst)
    }

    async fn send(&mut self, line: &str) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::Closed);
        }
        if self.link.hang_send.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let attempt = self.link.sends.fetch_add(1, Ordering::SeqCst);
        if attempt == self.link.fail_send_at.load(Ordering::SeqCst) {
            return Err(TransportError::Send("injected failure".into()));
        }
        self.link.wire.lock().expect("wire").push(frame_line(line));
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<String> {
        self.link.inbound.subscribe()
    }
}

pub struct FakeFactory(pub FakeLink);

impl TransportFactory for FakeFactory {
    fn create(&self, mode: ConnectionMode) -> Box<dyn Transport> {
        Box::new(FakeTransport {
            mode,
            link: self.0.clone(),
            open: false,
        })
    }
}

#[derive(Clone, Default)]
pub struct RecordingLog(pub Arc<Mutex<Vec<String>>>);

impl RecordingLog {
    pub fn lines(&self) -> Vec<String> {
        self.0.lock().expect("log").clone()
    }
}

impl LogSink for RecordingLog {
    fn log(&self, _timestamp: DateTime<Local>, message: &str) {
        self.0.lock().expect("log").push(message.to_string());
    }
}

#[derive(Clone, Default)]
pub struct RecordingListener(pub Arc<Mutex<Vec<bool>>>);

impl RecordingListener {
    pub fn changes(&self) -> Vec<bool> {
        self.0.lock().expect("listener").clone()
    }
}

impl ConnectionListener for RecordingListener {
    fn on_connection_changed(&self, connected: bool) {
        self.0.lock().expect("listener").push(connected);
    }
}
