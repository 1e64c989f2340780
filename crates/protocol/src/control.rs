//! Vendor control requests
//!
//! Every control transfer the driver issues is built here as a [`SetupPacket`],
//! encoded as the standard 8-byte little-endian USB setup stage:
//!
//! ```text
//! [bmRequestType: u8][bRequest: u8][wValue: u16][wIndex: u16][wLength: u16]
//! ```
//!
//! # Example
//! ```
//! use protocol::{PortKind, SetupPacket};
//!
//! let setup = SetupPacket::mux_read(PortKind::App, 1024);
//! assert_eq!(setup.encode(), [0xA1, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x04]);
//! ```

use crate::error::{ProtocolError, Result};
use crate::port::{CONFIG_DATA_LEN, PortKind};
use byteorder::{ByteOrder, LittleEndian};

/// Size of an encoded setup packet
pub const SETUP_PACKET_LEN: usize = 8;

/// Direction bit of bmRequestType
pub const DIR_IN: u8 = 0x80;
pub const TYPE_CLASS: u8 = 0x20;
pub const TYPE_VENDOR: u8 = 0x40;
pub const RECIP_DEVICE: u8 = 0x00;
pub const RECIP_INTERFACE: u8 = 0x01;

/// Option vendor-specific request type used for line control
pub const TYPE_OPTION_VENDOR: u8 = 0x20;

pub const SEND_ENCAPSULATED_COMMAND: u8 = 0x00;
pub const GET_ENCAPSULATED_RESPONSE: u8 = 0x01;
pub const SET_CONTROL_LINE_STATE: u8 = 0x22;
pub const RADIO_ON: u8 = 0x82;
pub const RADIO_OFF: u8 = 0x81;
pub const GET_CONFIG_DATA: u8 = 0x86;

/// Line-state bits of the control-line request
pub const LINE_DTR: u16 = 0x01;
pub const LINE_RTS: u16 = 0x02;

/// Setup stage of a control transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    /// Whether the data stage flows device-to-host
    pub fn is_in(&self) -> bool {
        self.request_type & DIR_IN != 0
    }

    /// Fetch a pending response of a mux sub-channel
    pub fn mux_read(port: PortKind, length: u16) -> Self {
        Self {
            request_type: DIR_IN | TYPE_CLASS | RECIP_INTERFACE,
            request: GET_ENCAPSULATED_RESPONSE,
            value: 0,
            index: port.mux_index(),
            length,
        }
    }

    /// Send a command on a mux sub-channel
    pub fn mux_write(port: PortKind, length: u16) -> Self {
        Self {
            request_type: TYPE_CLASS | RECIP_INTERFACE,
            request: SEND_ENCAPSULATED_COMMAND,
            value: 0,
            index: port.mux_index(),
            length,
        }
    }

    /// Raise or drop DTR/RTS on a dedicated modem interface
    pub fn line_control(interface: u8, dtr: bool, rts: bool) -> Self {
        let mut value = 0;
        if dtr {
            value |= LINE_DTR;
        }
        if rts {
            value |= LINE_RTS;
        }
        Self {
            request_type: TYPE_OPTION_VENDOR | RECIP_INTERFACE,
            request: SET_CONTROL_LINE_STATE,
            value,
            index: interface as u16,
            length: 0,
        }
    }

    /// Switch the radio on or off
    pub fn radio_power(on: bool) -> Self {
        Self {
            request_type: TYPE_VENDOR | RECIP_DEVICE,
            request: if on { RADIO_ON } else { RADIO_OFF },
            value: 0,
            index: 0,
            length: 0,
        }
    }

    /// Read the 17-byte interface layout block
    pub fn config_data() -> Self {
        Self {
            request_type: DIR_IN | TYPE_VENDOR | RECIP_DEVICE,
            request: GET_CONFIG_DATA,
            value: 0,
            index: 0,
            length: CONFIG_DATA_LEN as u16,
        }
    }

    pub fn encode(&self) -> [u8; SETUP_PACKET_LEN] {
        let mut buf = [0u8; SETUP_PACKET_LEN];
        buf[0] = self.request_type;
        buf[1] = self.request;
        LittleEndian::write_u16(&mut buf[2..4], self.value);
        LittleEndian::write_u16(&mut buf[4..6], self.index);
        LittleEndian::write_u16(&mut buf[6..8], self.length);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < SETUP_PACKET_LEN {
            return Err(ProtocolError::BufferTooSmall {
                needed: SETUP_PACKET_LEN,
                available: bytes.len(),
            });
        }
        Ok(Self {
            request_type: bytes[0],
            request: bytes[1],
            value: LittleEndian::read_u16(&bytes[2..4]),
            index: LittleEndian::read_u16(&bytes[4..6]),
            length: LittleEndian::read_u16(&bytes[6..8]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mux_requests_use_inverse_table() {
        let read = SetupPacket::mux_read(PortKind::Gps, 1024);
        assert!(read.is_in());
        assert_eq!(read.request_type, 0xA1);
        assert_eq!(read.index, 3);

        let write = SetupPacket::mux_write(PortKind::App2, 63);
        assert!(!write.is_in());
        assert_eq!(write.request_type, 0x21);
        assert_eq!(write.request, SEND_ENCAPSULATED_COMMAND);
        assert_eq!(write.index, 4);
        assert_eq!(write.length, 63);
    }

    #[test]
    fn test_line_control() {
        let setup = SetupPacket::line_control(2, true, false);
        assert_eq!(setup.encode(), [0x21, 0x22, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00]);
        assert_eq!(SetupPacket::line_control(0, true, true).value, 0x03);
    }

    #[test]
    fn test_radio_and_config() {
        assert_eq!(SetupPacket::radio_power(true).request, 0x82);
        assert_eq!(SetupPacket::radio_power(false).request, 0x81);
        assert_eq!(SetupPacket::radio_power(true).request_type, 0x40);

        let cfg = SetupPacket::config_data();
        assert_eq!(cfg.request_type, 0xC0);
        assert_eq!(cfg.length, 17);
    }

    #[test]
    fn test_decode() {
        let setup = SetupPacket::mux_read(PortKind::Pcsc, 512);
        assert_eq!(SetupPacket::decode(&setup.encode()).unwrap(), setup);
        assert!(SetupPacket::decode(&[0xA1, 0x01]).is_err());
    }
}
