//! Seams the core calls back into: operator log, connection status and
//! destructive-action confirmation.

use chrono::{DateTime, Local};

pub trait LogSink: Send + Sync {
    fn log(&self, timestamp: DateTime<Local>, message: &str);
}

pub trait ConnectionListener: Send + Sync {
    fn on_connection_changed(&self, connected: bool);
}

pub trait ConfirmPrompt {
    fn confirm(&self, message: &str) -> bool;
}

/// Writes a line to `sink` stamped with the current local time.
pub fn log_now(sink: &dyn LogSink, message: impl AsRef<str>) {
    sink.log(Local::now(), message.as_ref());
}

pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn log(&self, timestamp: DateTime<Local>, message: &str) {
        tracing::info!(target: "arm_log", at = %timestamp.format("%H:%M:%S"), "{message}");
    }
}

pub struct NoopConnectionListener;

impl ConnectionListener for NoopConnectionListener {
    fn on_connection_changed(&self, _connected: bool) {}
}

pub struct AssumeYes;

impl ConfirmPrompt for AssumeYes {
    fn confirm(&self, _message: &str) -> bool {
        true
    }
}
