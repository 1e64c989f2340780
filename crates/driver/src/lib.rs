//! Host-side driver for Option HSO composite USB modems
//!
//! A modem exposes several vendor-specific interfaces. Each is bound to one
//! or more logical functions:
//!
//! - serial ports multiplexed over a shared interface, fetched with control
//!   transfers when a shared interrupt endpoint signals pending data;
//! - serial ports on dedicated bulk interfaces, the modem port among them
//!   with its own line-status endpoint;
//! - a network function that reassembles IP frames from bulk transfers.
//!
//! The core is written against the [`transport::Transport`] trait; the
//! [`usb`] module provides the rusb implementation and [`test_utils`] a
//! scripted one.

pub mod activity;
pub mod config;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod modem;
pub mod mux;
pub mod net;
pub mod pool;
pub mod reassembler;
pub mod registry;
pub mod serial;
pub mod status;
#[doc(hidden)]
pub mod test_utils;
pub mod transport;
pub mod usb;

pub use config::DriverConfig;
pub use device::{Device, DeviceKind};
pub use error::{DriverError, Result};
pub use modem::{InterfaceBinding, ModemDriver, PortInfo};
pub use net::{NetHandle, NetStatsSnapshot, PacketSink, TxOutcome};
pub use registry::{DeviceRegistry, HandleSpace, PortIndex};
pub use serial::{ByteConsumer, ModemLines, SerialHandle};
pub use status::{LineCounters, LineMask, StatusWait};
pub use transport::{Transport, TransferError};
