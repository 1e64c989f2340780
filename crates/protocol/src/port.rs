//! Port specifications
//!
//! Every USB interface of the modem is described by a 32-bit port spec:
//!
//! ```text
//! bits 31..24  info flags      (0x01 = CRC trailer quirk)
//! bits 15..8   interface kind  (0x01 = shared mux, 0x02 = dedicated bulk)
//! bits  7..0   port kind       (Control, App, GPS, ..., Network)
//! ```
//!
//! The same module owns the fixed table that maps bits of the shared
//! interrupt bitmap to sub-channel port kinds, and its inverse used as the
//! `wIndex` of encapsulated command/response requests.

use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const INTF_MASK: u32 = 0xFF00;
const INTF_MUX: u32 = 0x0100;
const INTF_BULK: u32 = 0x0200;
const PORT_MASK: u32 = 0xFF;
const INFO_CRC_QUIRK: u32 = 0x0100_0000;

/// Size of the vendor config-data block returned by the 0x86 request
pub const CONFIG_DATA_LEN: usize = 17;

/// Logical function carried by an interface or a mux sub-channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortKind {
    NoPort,
    Control,
    App,
    Gps,
    Pcsc,
    App2,
    GpsControl,
    Msd,
    Voice,
    Diag2,
    Diag,
    Modem,
    Network,
}

impl PortKind {
    /// Raw port number as used in the low byte of a port spec
    pub fn to_raw(self) -> u8 {
        match self {
            PortKind::NoPort => 0x00,
            PortKind::Control => 0x01,
            PortKind::App => 0x02,
            PortKind::Gps => 0x03,
            PortKind::Pcsc => 0x04,
            PortKind::App2 => 0x05,
            PortKind::GpsControl => 0x06,
            PortKind::Msd => 0x07,
            PortKind::Voice => 0x08,
            PortKind::Diag2 => 0x09,
            PortKind::Diag => 0x10,
            PortKind::Modem => 0x11,
            PortKind::Network => 0x12,
        }
    }

    /// Parse the low byte of a port spec
    pub fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0x00 => PortKind::NoPort,
            0x01 => PortKind::Control,
            0x02 => PortKind::App,
            0x03 => PortKind::Gps,
            0x04 => PortKind::Pcsc,
            0x05 => PortKind::App2,
            0x06 => PortKind::GpsControl,
            0x07 => PortKind::Msd,
            0x08 => PortKind::Voice,
            0x09 => PortKind::Diag2,
            0x10 => PortKind::Diag,
            0x11 => PortKind::Modem,
            0x12 => PortKind::Network,
            _ => return None,
        })
    }

    /// Human readable port type, as reported to the application layer
    pub fn name(self) -> &'static str {
        match self {
            PortKind::Control => "Control",
            PortKind::App => "Application",
            PortKind::App2 => "Application2",
            PortKind::Gps => "GPS",
            PortKind::GpsControl => "GPS Control",
            PortKind::Pcsc => "PCSC",
            PortKind::Diag => "Diagnostic",
            PortKind::Diag2 => "Diagnostic2",
            PortKind::Modem => "Modem",
            PortKind::Network => "Network",
            PortKind::NoPort | PortKind::Msd | PortKind::Voice => "Unknown",
        }
    }

    /// Sub-channel index used in the `wIndex` of mux requests
    ///
    /// Port kinds that never live on the mux map to channel 0.
    pub fn mux_index(self) -> u16 {
        match self {
            PortKind::Control => 0,
            PortKind::App => 1,
            PortKind::Pcsc => 2,
            PortKind::Gps => 3,
            PortKind::App2 => 4,
            _ => 0,
        }
    }

    /// Port kind announced by one bit of the shared interrupt bitmap
    ///
    /// `bit` is the single-bit mask (0x01, 0x02, ...), not the bit number.
    pub fn from_mux_bit(bit: u8) -> Option<Self> {
        match bit {
            0x01 => Some(PortKind::Control),
            0x02 => Some(PortKind::App),
            0x04 => Some(PortKind::Pcsc),
            0x08 => Some(PortKind::Gps),
            0x10 => Some(PortKind::App2),
            _ => None,
        }
    }

    /// Port kind for one entry of the vendor config-data block
    pub fn from_config_byte(byte: u8) -> Option<Self> {
        match byte {
            0x1 => Some(PortKind::Diag),
            0x2 => Some(PortKind::Gps),
            0x3 => Some(PortKind::GpsControl),
            0x4 => Some(PortKind::App),
            0x5 => Some(PortKind::App2),
            0x6 => Some(PortKind::Control),
            0x7 => Some(PortKind::Network),
            0x8 => Some(PortKind::Modem),
            0x9 => Some(PortKind::Msd),
            0xa => Some(PortKind::Pcsc),
            0xb => Some(PortKind::Voice),
            _ => None,
        }
    }
}

impl fmt::Display for PortKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PortKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "control" => Ok(PortKind::Control),
            "app" | "application" => Ok(PortKind::App),
            "app2" | "application2" => Ok(PortKind::App2),
            "gps" => Ok(PortKind::Gps),
            "gps_control" => Ok(PortKind::GpsControl),
            "pcsc" => Ok(PortKind::Pcsc),
            "diag" | "diagnostic" => Ok(PortKind::Diag),
            "diag2" | "diagnostic2" => Ok(PortKind::Diag2),
            "modem" => Ok(PortKind::Modem),
            "network" => Ok(PortKind::Network),
            other => Err(format!("unknown port type: {}", other)),
        }
    }
}

/// How an interface carries its function(s)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterfaceKind {
    /// Shared interface: sub-channels signalled through one interrupt endpoint
    Mux,
    /// Dedicated bulk interface owning its endpoint pair
    Bulk,
}

/// Decoded port spec of one interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortSpec {
    pub interface: InterfaceKind,
    pub port: PortKind,
    /// Bulk IN transfers may end in a 4-byte sentinel that must be stripped
    pub crc_quirk: bool,
}

impl PortSpec {
    pub const fn new(interface: InterfaceKind, port: PortKind) -> Self {
        Self {
            interface,
            port,
            crc_quirk: false,
        }
    }

    pub const fn with_crc_quirk(mut self, crc_quirk: bool) -> Self {
        self.crc_quirk = crc_quirk;
        self
    }

    pub fn is_mux(&self) -> bool {
        self.interface == InterfaceKind::Mux
    }

    /// Decode a raw 32-bit port spec
    pub fn from_raw(raw: u32) -> Result<Self> {
        let interface = match raw & INTF_MASK {
            INTF_MUX => InterfaceKind::Mux,
            INTF_BULK => InterfaceKind::Bulk,
            _ => return Err(ProtocolError::UnknownPortSpec(raw)),
        };
        let port = PortKind::from_raw((raw & PORT_MASK) as u8)
            .ok_or(ProtocolError::UnknownPortSpec(raw))?;

        Ok(Self {
            interface,
            port,
            crc_quirk: raw & INFO_CRC_QUIRK != 0,
        })
    }

    /// Encode back to the raw 32-bit form
    pub fn to_raw(&self) -> u32 {
        let intf = match self.interface {
            InterfaceKind::Mux => INTF_MUX,
            InterfaceKind::Bulk => INTF_BULK,
        };
        let info = if self.crc_quirk { INFO_CRC_QUIRK } else { 0 };
        info | intf | self.port.to_raw() as u32
    }
}

/// Derive the port spec of `interface` from the vendor config-data block
///
/// Returns `Ok(None)` when the block marks the interface as unused.
/// Interfaces described this way are always dedicated bulk interfaces.
pub fn decode_config_data(data: &[u8], interface: u8) -> Result<Option<PortSpec>> {
    if data.len() < CONFIG_DATA_LEN {
        return Err(ProtocolError::BufferTooSmall {
            needed: CONFIG_DATA_LEN,
            available: data.len(),
        });
    }
    if interface as usize >= CONFIG_DATA_LEN {
        return Err(ProtocolError::InterfaceOutOfRange { interface });
    }

    let crc_quirk = data[CONFIG_DATA_LEN - 1] & 0x1 != 0;
    Ok(PortKind::from_config_byte(data[interface as usize])
        .map(|port| PortSpec::new(InterfaceKind::Bulk, port).with_crc_quirk(crc_quirk)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mux_table_is_inverse() {
        for bit in [0x01u8, 0x02, 0x04, 0x08, 0x10] {
            let port = PortKind::from_mux_bit(bit).unwrap();
            assert_eq!(1u8 << port.mux_index(), bit);
        }
        assert_eq!(PortKind::from_mux_bit(0x20), None);
        assert_eq!(PortKind::from_mux_bit(0x80), None);
    }

    #[test]
    fn test_port_spec_raw() {
        let spec = PortSpec::from_raw(0x0100 | 0x12).unwrap();
        assert_eq!(spec.interface, InterfaceKind::Mux);
        assert_eq!(spec.port, PortKind::Network);
        assert!(!spec.crc_quirk);

        let spec = PortSpec::from_raw(0x0100_0000 | 0x0200 | 0x11).unwrap();
        assert_eq!(spec.port, PortKind::Modem);
        assert!(spec.crc_quirk);
        assert_eq!(spec.to_raw(), 0x0100_0211);

        assert!(PortSpec::from_raw(0x0012).is_err());
    }

    #[test]
    fn test_config_data() {
        let mut data = [0u8; CONFIG_DATA_LEN];
        data[0] = 0x7;
        data[2] = 0x8;
        data[16] = 0x1;

        let net = decode_config_data(&data, 0).unwrap().unwrap();
        assert_eq!(net.port, PortKind::Network);
        assert_eq!(net.interface, InterfaceKind::Bulk);
        assert!(net.crc_quirk);

        assert_eq!(decode_config_data(&data, 1).unwrap(), None);
        assert_eq!(
            decode_config_data(&data, 2).unwrap().map(|s| s.port),
            Some(PortKind::Modem)
        );
        assert!(decode_config_data(&data, 17).is_err());
        assert!(decode_config_data(&data[..10], 0).is_err());
    }

    #[test]
    fn test_port_names() {
        assert_eq!(PortKind::App.to_string(), "Application");
        assert_eq!(PortKind::Voice.name(), "Unknown");
        assert_eq!("gps-control".parse::<PortKind>(), Ok(PortKind::GpsControl));
        assert!("printer".parse::<PortKind>().is_err());
    }
}
