pub mod interface;
pub mod protocol;
pub mod simulator;
pub mod verify;

pub use interface::{SerialInterface, Transport};
pub use protocol::{PacemakerProtocol, ProtocolConfig, ProtocolTiming, ProtocolVariant, EngineState};
pub use simulator::SimulatedPacemaker;
pub use verify::{EchoVerification, FieldDiff, FieldValue};

use serde::{Deserialize, Serialize};

/// An enumerated serial endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialPortInfo {
    pub port_name: String,
    pub description: String,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    pub serial_number: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Incomplete data: expected {expected} bytes, got {actual}")]
    IncompleteData { expected: usize, actual: usize },

    #[error("Protocol mismatch: {0}")]
    ProtocolMismatch(String),

    #[error("Device rejected the request (NACK)")]
    Nack,

    #[error("Device response type is {actual}, expected {expected}; program response type {expected} first")]
    ResponseMode { expected: u8, actual: u8 },

    #[error("Invalid field {field}: {reason}")]
    InvalidField { field: String, reason: String },

    #[error("Short buffer: expected at least {expected} bytes, got {actual}")]
    ShortBuffer { expected: usize, actual: usize },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialport error: {0}")]
    SerialportError(#[from] serialport::Error),
}

impl SerialError {
    /// Transport-level failures; the connection must be re-established.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SerialError::ConnectionFailed(_)
                | SerialError::NotConnected
                | SerialError::IoError(_)
                | SerialError::SerialportError(_)
        )
    }

    pub(crate) fn invalid_field(field: &str, reason: impl Into<String>) -> Self {
        SerialError::InvalidField {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SerialError>;
