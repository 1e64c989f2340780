//! USB subsystem
//!
//! Finds supported modems on the bus and drives their transfers through
//! rusb. Transfers run on dedicated blocking threads so neither the Tokio
//! runtime nor the callers of the core ever block on libusb.

pub mod device;
pub mod transport;

pub use device::UsbModem;
pub use transport::{UsbTransport, map_rusb_error};

use crate::modem::ModemDriver;
use rusb::{Context, UsbContext};
use tracing::{debug, warn};

/// Supported modems currently connected
pub fn find_modems(
    context: &Context,
    driver: &ModemDriver,
) -> std::result::Result<Vec<UsbModem>, rusb::Error> {
    let mut modems = Vec::new();
    for device in context.devices()?.iter() {
        let descriptor = match device.device_descriptor() {
            Ok(descriptor) => descriptor,
            Err(e) => {
                debug!("Skipping device without descriptor: {}", e);
                continue;
            }
        };
        if !driver.is_supported(descriptor.vendor_id(), descriptor.product_id()) {
            continue;
        }
        match UsbModem::new(device) {
            Ok(modem) => modems.push(modem),
            Err(e) => warn!(
                "Failed to inspect {:04x}:{:04x}: {}",
                descriptor.vendor_id(),
                descriptor.product_id(),
                e
            ),
        }
    }
    debug!("Found {} supported modem(s)", modems.len());
    Ok(modems)
}
