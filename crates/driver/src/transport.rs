//! Transport boundary
//!
//! The core never talks to libusb directly. It hands owned buffers to a
//! [`Transport`] together with a weak [`CompletionHandler`] and gets them
//! back through [`CompletionHandler::complete`] once the transfer finished,
//! failed or was cancelled. The rusb adapter in [`crate::usb`] and the mock
//! in [`crate::test_utils`] are the two implementations.

use protocol::SetupPacket;
use std::fmt;
use std::sync::Weak;
use thiserror::Error;
use tracing::{debug, warn};

/// Identifier of one submitted transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferId(pub u64);

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "xfer#{}", self.0)
    }
}

/// What a completion belongs to, from the owner's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferTag {
    /// Receive slot `n` of the owner's pool
    Read(usize),
    /// The single outbound transfer
    Write,
    /// Modem status interrupt
    Notify,
}

/// Endpoint class and addressing of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Bulk { endpoint: u8 },
    Interrupt { endpoint: u8, interval: u8 },
    Control { setup: SetupPacket },
}

/// A transfer ready to be handed to the transport
///
/// IN transfers read up to `length` bytes into `buffer`; OUT transfers send
/// `buffer[..length]`.
#[derive(Debug)]
pub struct TransferRequest {
    pub kind: TransferKind,
    pub buffer: Vec<u8>,
    pub length: usize,
    /// Follow an OUT transfer with a zero-length packet
    pub zero_packet: bool,
}

impl TransferRequest {
    pub fn bulk(endpoint: u8, buffer: Vec<u8>, length: usize) -> Self {
        Self {
            kind: TransferKind::Bulk { endpoint },
            buffer,
            length,
            zero_packet: false,
        }
    }

    pub fn interrupt(endpoint: u8, interval: u8, buffer: Vec<u8>, length: usize) -> Self {
        Self {
            kind: TransferKind::Interrupt { endpoint, interval },
            buffer,
            length,
            zero_packet: false,
        }
    }

    /// Control transfer whose data stage is `setup.length` bytes of `buffer`
    pub fn control(setup: SetupPacket, buffer: Vec<u8>) -> Self {
        let length = setup.length as usize;
        Self {
            kind: TransferKind::Control { setup },
            buffer,
            length,
            zero_packet: false,
        }
    }

    pub fn with_zero_packet(mut self, zero_packet: bool) -> Self {
        self.zero_packet = zero_packet;
        self
    }

    pub fn is_in(&self) -> bool {
        match self.kind {
            TransferKind::Bulk { endpoint } | TransferKind::Interrupt { endpoint, .. } => {
                endpoint & 0x80 != 0
            }
            TransferKind::Control { setup } => setup.is_in(),
        }
    }
}

/// Status of a finished transfer
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransferError {
    #[error("transfer cancelled")]
    Cancelled,
    #[error("no such device")]
    NoDevice,
    #[error("endpoint stalled")]
    Stall,
    #[error("not enough bandwidth")]
    Bandwidth,
    #[error("device shut down")]
    Shutdown,
    #[error("device suspended")]
    Suspended,
    #[error("internal error: {0}")]
    Internal(String),
    #[error("protocol error")]
    Protocol,
    #[error("timed out")]
    Timeout,
    #[error("overflow")]
    Overflow,
    #[error("{0}")]
    Other(String),
}

/// How the data path reacts to a failed transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Device removed: stop resubmitting
    Gone,
    /// Link-level trouble: request a reset, do not resubmit
    Protocol,
    /// Resubmit unchanged
    Transient,
    /// Deliberately cancelled
    Cancelled,
}

impl TransferError {
    /// Human explanation used in logs
    pub fn explanation(&self) -> &'static str {
        match self {
            TransferError::Cancelled => "transfer cancelled",
            TransferError::NoDevice => "no device",
            TransferError::Stall => "endpoint stalled",
            TransferError::Bandwidth => "not enough bandwidth",
            TransferError::Shutdown => "device disabled",
            TransferError::Suspended => "device suspended",
            TransferError::Internal(_) => "internal error",
            TransferError::Protocol | TransferError::Timeout | TransferError::Overflow => {
                "protocol error"
            }
            TransferError::Other(_) => "unknown status",
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            TransferError::Cancelled => ErrorClass::Cancelled,
            TransferError::NoDevice | TransferError::Shutdown => ErrorClass::Gone,
            TransferError::Protocol | TransferError::Timeout | TransferError::Overflow => {
                ErrorClass::Protocol
            }
            _ => ErrorClass::Transient,
        }
    }
}

/// Log a transfer status with its explanation
pub fn log_transfer_error(context: &str, error: &TransferError) {
    match error.class() {
        ErrorClass::Cancelled => debug!("{}: {}", context, error.explanation()),
        _ => warn!("{}: {} ({})", context, error.explanation(), error),
    }
}

/// Log `error`, request a reset for link-level failures and classify it
pub fn handle_transfer_error(
    transport: &dyn Transport,
    context: &str,
    error: &TransferError,
) -> ErrorClass {
    log_transfer_error(context, error);
    let class = error.class();
    if class == ErrorClass::Protocol {
        debug!("{}: queueing device reset", context);
        transport.queue_reset();
    }
    class
}

/// A finished transfer; the buffer always comes back
#[derive(Debug)]
pub struct Completion {
    pub result: Result<(), TransferError>,
    pub buffer: Vec<u8>,
    pub actual_length: usize,
}

impl Completion {
    pub fn ok(buffer: Vec<u8>, actual_length: usize) -> Self {
        Self {
            result: Ok(()),
            buffer,
            actual_length,
        }
    }

    pub fn failed(buffer: Vec<u8>, error: TransferError) -> Self {
        Self {
            result: Err(error),
            buffer,
            actual_length: 0,
        }
    }

    /// Bytes actually transferred
    pub fn data(&self) -> &[u8] {
        &self.buffer[..self.actual_length.min(self.buffer.len())]
    }
}

/// A submission the transport refused; the buffer is handed back
#[derive(Debug)]
pub struct Rejected {
    pub error: TransferError,
    pub buffer: Vec<u8>,
}

/// Receiver of transfer completions
///
/// Runs on a transport context, possibly concurrently for different
/// transfers, never concurrently for the same one. Must not block and must
/// not call [`Transport::cancel`].
pub trait CompletionHandler: Send + Sync {
    fn complete(&self, tag: TransferTag, completion: Completion);
}

/// Runtime power state of the physical device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    Active,
    Suspended,
    Resuming,
}

/// Asynchronous USB transfer engine for one physical device
pub trait Transport: Send + Sync {
    /// Queue a transfer. Never calls `handler` on the calling stack.
    fn submit(
        &self,
        request: TransferRequest,
        handler: Weak<dyn CompletionHandler>,
        tag: TransferTag,
    ) -> Result<TransferId, Rejected>;

    /// Cancel a transfer and wait until its handler has run
    ///
    /// Unknown or finished ids return immediately. Callers must not hold
    /// any lock the handler takes.
    fn cancel(&self, id: TransferId);

    /// Blocking control read
    fn control_in(&self, setup: SetupPacket) -> Result<Vec<u8>, TransferError>;

    /// Blocking control write
    fn control_out(&self, setup: SetupPacket, data: &[u8]) -> Result<(), TransferError>;

    fn power_state(&self) -> PowerState;

    /// Take a runtime power reference, waking the device (blocking)
    fn power_get(&self) -> Result<(), TransferError>;

    /// Drop a runtime power reference
    fn power_put(&self);

    /// Ask for a device reset later; never blocks
    fn queue_reset(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert_eq!(TransferError::NoDevice.class(), ErrorClass::Gone);
        assert_eq!(TransferError::Shutdown.class(), ErrorClass::Gone);
        assert_eq!(TransferError::Timeout.class(), ErrorClass::Protocol);
        assert_eq!(TransferError::Stall.class(), ErrorClass::Transient);
        assert_eq!(
            TransferError::Internal("queue full".into()).class(),
            ErrorClass::Transient
        );
        assert_eq!(TransferError::Cancelled.class(), ErrorClass::Cancelled);
    }

    #[test]
    fn test_explanations() {
        assert_eq!(TransferError::Bandwidth.explanation(), "not enough bandwidth");
        assert_eq!(TransferError::Overflow.explanation(), "protocol error");
        assert_eq!(TransferError::Other("x".into()).explanation(), "unknown status");
    }

    #[test]
    fn test_request_direction() {
        let req = TransferRequest::bulk(0x81, vec![0; 64], 64);
        assert!(req.is_in());
        let req = TransferRequest::bulk(0x02, vec![1, 2], 2).with_zero_packet(true);
        assert!(!req.is_in());
        assert!(req.zero_packet);

        let setup = SetupPacket::mux_read(protocol::PortKind::Control, 1024);
        let req = TransferRequest::control(setup, vec![0; 1024]);
        assert!(req.is_in());
        assert_eq!(req.length, 1024);
    }

    #[test]
    fn test_completion_data_is_clamped() {
        let c = Completion::ok(vec![1, 2, 3], 5);
        assert_eq!(c.data(), &[1, 2, 3]);
    }
}
