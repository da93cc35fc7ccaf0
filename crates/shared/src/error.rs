use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Connection,
    Send,
    CorruptStore,
    NotFound,
    DuplicateName,
    Busy,
    Validation,
    Internal,
}

/// An error as it crosses from the core into a UI: classified, tagged with the
/// operation label the operator saw, and renderable as a single log line.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{label}: {message}")]
pub struct ReportedError {
    pub code: ErrorCode,
    pub label: String,
    pub message: String,
}

impl ReportedError {
    pub fn new(code: ErrorCode, label: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            label: label.into(),
            message: message.into(),
        }
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.code,
            ErrorCode::Connection | ErrorCode::Send | ErrorCode::Busy
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_label_and_message() {
        let err = ReportedError::new(ErrorCode::Send, "SEQUENCE: wave", "port closed");
        assert_eq!(err.to_string(), "SEQUENCE: wave: port closed");
        assert!(err.is_recoverable());
    }

    #[test]
    fn error_code_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorCode::CorruptStore).expect("json");
        assert_eq!(json, "\"corrupt_store\"");
    }
}
