//! Serial-state notification of the dedicated modem port
//!
//! The modem interface reports line status through a 10-byte interrupt
//! payload laid out like a CDC notification:
//!
//! ```text
//! [bmRequestType: u8 = 0xA1][bNotification: u8 = 0x20]
//! [wValue: u16 = 0][wIndex: u16 = interface][wLength: u16 = 2]
//! [UART state bitmap: u16]
//! ```

use crate::error::{ProtocolError, Result};
use byteorder::{ByteOrder, LittleEndian};

pub const NOTIFICATION_LEN: usize = 10;
pub const NOTIFICATION_REQUEST_TYPE: u8 = 0xA1;
pub const SERIAL_STATE: u8 = 0x20;

/// 16-bit UART state bitmap carried by a serial-state notification
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UartState(pub u16);

impl UartState {
    pub const OVERRUN: u16 = 1 << 6;
    pub const PARITY: u16 = 1 << 5;
    pub const FRAMING: u16 = 1 << 4;
    pub const RING: u16 = 1 << 3;
    pub const BREAK: u16 = 1 << 2;
    /// DSR-like carrier
    pub const TX_CARRIER: u16 = 1 << 1;
    /// CD-like carrier
    pub const RX_CARRIER: u16 = 1 << 0;

    pub fn contains(&self, bit: u16) -> bool {
        self.0 & bit != 0
    }

    pub fn overrun(&self) -> bool {
        self.contains(Self::OVERRUN)
    }

    pub fn parity(&self) -> bool {
        self.contains(Self::PARITY)
    }

    pub fn framing(&self) -> bool {
        self.contains(Self::FRAMING)
    }

    pub fn ring(&self) -> bool {
        self.contains(Self::RING)
    }

    pub fn brk(&self) -> bool {
        self.contains(Self::BREAK)
    }

    pub fn dsr(&self) -> bool {
        self.contains(Self::TX_CARRIER)
    }

    pub fn dcd(&self) -> bool {
        self.contains(Self::RX_CARRIER)
    }

    /// Bits that differ between two states
    pub fn changed(&self, previous: UartState) -> UartState {
        UartState(self.0 ^ previous.0)
    }
}

/// Decoded serial-state notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialStateNotification {
    pub interface: u16,
    pub state: UartState,
}

impl SerialStateNotification {
    /// Decode and validate a notification addressed to `interface`
    ///
    /// Any fixed field carrying an unexpected value rejects the whole payload.
    pub fn decode(bytes: &[u8], interface: u8) -> Result<Self> {
        if bytes.len() < NOTIFICATION_LEN {
            return Err(ProtocolError::BufferTooSmall {
                needed: NOTIFICATION_LEN,
                available: bytes.len(),
            });
        }

        check("bmRequestType", bytes[0] as u16, NOTIFICATION_REQUEST_TYPE as u16)?;
        check("bNotification", bytes[1] as u16, SERIAL_STATE as u16)?;
        check("wValue", LittleEndian::read_u16(&bytes[2..4]), 0)?;
        let index = LittleEndian::read_u16(&bytes[4..6]);
        check("wIndex", index, interface as u16)?;
        check("wLength", LittleEndian::read_u16(&bytes[6..8]), 2)?;

        Ok(Self {
            interface: index,
            state: UartState(LittleEndian::read_u16(&bytes[8..10])),
        })
    }

    pub fn encode(&self) -> [u8; NOTIFICATION_LEN] {
        let mut buf = [0u8; NOTIFICATION_LEN];
        buf[0] = NOTIFICATION_REQUEST_TYPE;
        buf[1] = SERIAL_STATE;
        LittleEndian::write_u16(&mut buf[4..6], self.interface);
        LittleEndian::write_u16(&mut buf[6..8], 2);
        LittleEndian::write_u16(&mut buf[8..10], self.state.0);
        buf
    }
}

fn check(field: &'static str, actual: u16, expected: u16) -> Result<()> {
    if actual != expected {
        return Err(ProtocolError::InvalidNotification {
            field,
            actual,
            expected,
        });
    }
    Ok(())
}
