//! Error types for the serial link

use std::io;
use std::time::Duration;

use amdtp_protocol::{EncodeError, ProtocolViolation};
use thiserror::Error;

/// Errors that can occur on a BLE serial link
#[derive(Error, Debug)]
pub enum SerialError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Port is not open")]
    NotConnected,
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),
    #[error("Framing error: {0}")]
    Framing(#[from] EncodeError),
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
    #[error("Invalid input: {0}")]
    InvalidInput(&'static str),
    #[error("Background runtime stopped")]
    RuntimeStopped,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, SerialError>;

impl From<SerialError> for io::Error {
    fn from(err: SerialError) -> Self {
        let kind = match &err {
            SerialError::Io(inner) => inner.kind(),
            SerialError::DeviceNotFound(_) => io::ErrorKind::NotFound,
            SerialError::ConnectionFailed(_) => io::ErrorKind::ConnectionRefused,
            SerialError::NotConnected | SerialError::RuntimeStopped => io::ErrorKind::NotConnected,
            SerialError::Timeout(_) => io::ErrorKind::TimedOut,
            SerialError::InvalidInput(_) => io::ErrorKind::InvalidInput,
            SerialError::Protocol(_) | SerialError::Framing(_) => io::ErrorKind::InvalidData,
            SerialError::Transport(_) => io::ErrorKind::Other,
        };
        match err {
            SerialError::Io(inner) => inner,
            other => io::Error::new(kind, other),
        }
    }
}
