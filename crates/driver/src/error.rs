//! Driver error types

use crate::registry::RegistryError;
use crate::transport::TransferError;
use protocol::ProtocolError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    /// The physical device was removed
    #[error("Device is gone")]
    Gone,

    /// A transmit did not complete within the watchdog period
    #[error("Device unresponsive: transmit stuck for {0:?}")]
    Unresponsive(Duration),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A single-slot resource is in use
    #[error("Busy")]
    Busy,

    #[error("Invalid argument: {0}")]
    Invalid(String),

    #[error("Operation not supported: {0}")]
    NotSupported(&'static str),

    #[error(transparent)]
    Common(#[from] common::Error),

    /// The function has not been opened
    #[error("Not running")]
    NotRunning,
}

pub type Result<T> = std::result::Result<T, DriverError>;
