use std::{
    io::{self, ErrorKind, Read, Write},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    thread,
    time::Duration,
};

use async_trait::async_trait;
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use shared::domain::ConnectionMode;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{frame_line, inbound_channel, ConnectParams, Transport, TransportError};

/// Read and write timeout on the port. Bounds how long a stuck write can hold
/// the link and how quickly the reader notices a close.
const SERIAL_IO_TIMEOUT: Duration = Duration::from_millis(500);

/// Names of the serial ports present on this machine, sorted.
pub fn available_ports() -> Result<Vec<String>, TransportError> {
    let mut names: Vec<String> = serialport::available_ports()
        .map_err(|err| TransportError::Connect {
            target: "serial port list".into(),
            reason: err.to_string(),
        })?
        .into_iter()
        .map(|info| info.port_name)
        .collect();
    names.sort();
    Ok(names)
}

/// Write half of the open port. Shared with the blocking write so an
/// abandoned send never takes the port away from the transport.
type SharedWriter = Arc<Mutex<WriterSlot>>;

type WriterSlot = Option<Box<dyn Write + Send>>;

fn lock_writer(writer: &Mutex<WriterSlot>) -> MutexGuard<'_, WriterSlot> {
    writer.lock().unwrap_or_else(PoisonError::into_inner)
}

fn write_error(err: io::Error) -> TransportError {
    match err.kind() {
        ErrorKind::TimedOut => TransportError::SendTimeout(SERIAL_IO_TIMEOUT),
        _ => TransportError::Send(err.to_string()),
    }
}

pub struct SerialTransport {
    writer: SharedWriter,
    port_name: Option<String>,
    stop_reader: Arc<AtomicBool>,
    inbound: broadcast::Sender<String>,
}

impl SerialTransport {
    pub fn new() -> Self {
        Self {
            writer: Arc::new(Mutex::new(None)),
            port_name: None,
            stop_reader: Arc::new(AtomicBool::new(false)),
            inbound: inbound_channel(),
        }
    }

    #[cfg(test)]
    fn with_writer(port_name: &str, writer: Box<dyn Write + Send>) -> Self {
        let transport = Self::new();
        *lock_writer(&transport.writer) = Some(writer);
        Self {
            port_name: Some(port_name.to_string()),
            ..transport
        }
    }

    fn spawn_reader(&mut self, reader: Box<dyn SerialPort>, port_name: String) {
        let stop = Arc::new(AtomicBool::new(false));
        self.stop_reader = Arc::clone(&stop);
        let inbound = self.inbound.clone();

        let spawned = thread::Builder::new()
            .name(format!("serial-reader {port_name}"))
            .spawn(move || {
                read_lines(reader, &stop, &inbound);
                debug!(port = %port_name, "serial reader stopped");
            });
        if let Err(err) = spawned {
            warn!(%err, "could not start serial reader; controller replies will not be shown");
        }
    }
}

impl Default for SerialTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn read_lines(
    mut port: Box<dyn SerialPort>,
    stop: &AtomicBool,
    inbound: &broadcast::Sender<String>,
) {
    let mut assembler = LineAssembler::default();
    let mut chunk = [0u8; 256];
    while !stop.load(Ordering::SeqCst) {
        match port.read(&mut chunk) {
            Ok(0) => continue,
            Ok(n) => {
                for line in assembler.push(&chunk[..n]) {
                    // No receivers is fine; replies are informational.
                    let _ = inbound.send(line);
                }
            }
            Err(err) if err.kind() == ErrorKind::TimedOut => continue,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                if !stop.load(Ordering::SeqCst) {
                    warn!(%err, "serial read failed");
                }
                break;
            }
        }
    }
}

/// Splits a byte stream into trimmed, non-empty text lines.
#[derive(Debug, Default)]
pub(crate) struct LineAssembler {
    pending: Vec<u8>,
}

impl LineAssembler {
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in bytes {
            if byte == b'\n' {
                let line = String::from_utf8_lossy(&self.pending).trim().to_string();
                self.pending.clear();
                if !line.is_empty() {
                    lines.push(line);
                }
            } else {
                self.pending.push(byte);
            }
        }
        lines
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn mode(&self) -> ConnectionMode {
        ConnectionMode::Serial
    }

    async fn open(&mut self, params: &ConnectParams) -> Result<(), TransportError> {
        let ConnectParams::Serial(params) = params else {
            return Err(TransportError::WrongMode {
                expected: ConnectionMode::Serial,
                given: params.mode(),
            });
        };
        self.close().await;

        let target = format!("{} @ {} baud", params.port_name, params.baud_rate);
        let (port_name, baud_rate) = (params.port_name.clone(), params.baud_rate);
        let opened = tokio::task::spawn_blocking(move || {
            let port = serialport::new(port_name.as_str(), baud_rate)
                .timeout(SERIAL_IO_TIMEOUT)
                .data_bits(DataBits::Eight)
                .stop_bits(StopBits::One)
                .parity(Parity::None)
                .flow_control(FlowControl::None)
                .open()?;
            let reader = port.try_clone()?;
            Ok::<_, serialport::Error>((port, reader))
        })
        .await
        .map_err(|err| TransportError::Connect {
            target: target.clone(),
            reason: err.to_string(),
        })?;

        let (port, reader) = opened.map_err(|err| TransportError::Connect {
            target: target.clone(),
            reason: err.to_string(),
        })?;

        self.spawn_reader(reader, params.port_name.clone());
        *lock_writer(&self.writer) = Some(Box::new(port));
        self.port_name = Some(params.port_name.clone());
        info!(%target, "serial port opened");
        Ok(())
    }

    async fn close(&mut self) {
        self.stop_reader.store(true, Ordering::SeqCst);
        let Some(port_name) = self.port_name.take() else {
            return;
        };
        // A stalled write holds the lock until the port's I/O timeout.
        let writer = Arc::clone(&self.writer);
        let released = tokio::task::spawn_blocking(move || drop(lock_writer(&writer).take())).await;
        if let Err(err) = released {
            warn!(%err, "serial writer did not release the port");
        }
        info!(port = %port_name, "serial port closed");
    }

    fn is_open(&self) -> bool {
        self.port_name.is_some()
    }

    async fn send(&mut self, line: &str) -> Result<(), TransportError> {
        if self.port_name.is_none() {
            return Err(TransportError::Closed);
        }
        let writer = Arc::clone(&self.writer);
        let framed = frame_line(line);

        tokio::task::spawn_blocking(move || {
            let mut slot = lock_writer(&writer);
            let port = slot.as_mut().ok_or(TransportError::Closed)?;
            port
                .write_all(framed.as_bytes())
                .and_then(|()| port.flush())
                .map_err(write_error)
        })
        .await
        .map_err(|err| TransportError::Send(err.to_string()))?
    }

    fn subscribe(&self) -> broadcast::Receiver<String> {
        self.inbound.subscribe()
    }
}
