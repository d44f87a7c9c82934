use thiserror::Error;

use crate::driver::{DriverError, DriverFault};

pub type BrowserResult<T> = Result<T, BrowserError>;

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("chromium launch failed: {0}")]
    Launch(String),
    #[error("cdp error: {0}")]
    Cdp(#[from] chromiumoxide::error::CdpError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("timeout waiting for {0}")]
    Timeout(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("profile error: {0}")]
    Profile(String),
    #[error("element not found: {0}")]
    ElementNotFound(String),
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl From<tokio::task::JoinError> for BrowserError {
    fn from(err: tokio::task::JoinError) -> Self {
        BrowserError::Unexpected(err.to_string())
    }
}

impl DriverFault for BrowserError {
    fn is_driver_fault(&self) -> bool {
        match self {
            BrowserError::Launch(message) => {
                let lowered = message.to_ascii_lowercase();
                [
                    "exec format",
                    "no such file",
                    "permission denied",
                    "version",
                    "not found",
                ]
                .iter()
                .any(|needle| lowered.contains(needle))
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_failures_count_as_driver_faults() {
        assert!(BrowserError::Launch("Exec format error (os error 8)".into()).is_driver_fault());
        assert!(BrowserError::Launch("unsupported browser version 118".into()).is_driver_fault());
        assert!(!BrowserError::Launch("websocket closed".into()).is_driver_fault());
        assert!(!BrowserError::Timeout("navigation".into()).is_driver_fault());
    }
}
