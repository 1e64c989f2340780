//! Wire formats for Option HSO composite modems
//!
//! This crate holds the pure, I/O-free codecs the driver speaks to the modem:
//! port-spec encoding, the mux bitmap table, vendor control requests, the
//! serial-state notification of the modem port, network frame headers and
//! the static supported-device table.
//!
//! # Example
//!
//! ```
//! use protocol::{PortKind, declared_length, FRAME_HEADER_LEN};
//!
//! // Bit 0x08 of the interrupt bitmap signals the GPS sub-channel
//! assert_eq!(PortKind::from_mux_bit(0x08), Some(PortKind::Gps));
//!
//! let mut header = [0u8; FRAME_HEADER_LEN];
//! header[2..4].copy_from_slice(&60u16.to_be_bytes());
//! assert_eq!(declared_length(&header).unwrap(), 60);
//! ```

pub mod control;
pub mod device_table;
pub mod error;
pub mod frame;
pub mod notification;
pub mod port;

pub use control::SetupPacket;
pub use device_table::{
    DeviceLayout, OPTION_VENDOR_ID, SUPPORTED_DEVICES, SupportedDevice, VENDOR_SPECIFIC_CLASS,
};
pub use error::{ProtocolError, Result};
pub use frame::{
    CRC_SENTINEL, FRAME_HEADER_LEN, MAX_FRAME_SIZE, declared_length, fix_crc_trailer,
    needs_zero_packet,
};
pub use notification::{SerialStateNotification, UartState};
pub use port::{CONFIG_DATA_LEN, InterfaceKind, PortKind, PortSpec, decode_config_data};
