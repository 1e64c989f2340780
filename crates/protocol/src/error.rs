//! Protocol error types

use thiserror::Error;

/// Errors raised while decoding vendor wire structures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Buffer too small for the structure being decoded
    #[error("Buffer too small: needed {needed}, got {available}")]
    BufferTooSmall { needed: usize, available: usize },

    /// A serial-state notification field did not carry its fixed value
    #[error("Invalid serial state notification: {field} = {actual:#06x} (expected {expected:#06x})")]
    InvalidNotification {
        field: &'static str,
        actual: u16,
        expected: u16,
    },

    /// Declared network frame length outside the accepted window
    #[error("Invalid frame length: {length} (accepted {min}..={max})")]
    InvalidFrameLength { length: usize, min: usize, max: usize },

    /// Interface number cannot be looked up in the config-data block
    #[error("Interface {interface} out of range for config data")]
    InterfaceOutOfRange { interface: u8 },

    /// Raw port spec that names no known interface type
    #[error("Unknown port spec {0:#010x}")]
    UnknownPortSpec(u32),
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;
