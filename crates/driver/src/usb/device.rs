//! USB modem handle
//!
//! Wraps a rusb device with its cached descriptor, converts its interfaces
//! into the driver's descriptor types and hands out the [`UsbTransport`]
//! once the vendor interfaces are claimed.

use crate::descriptor::{EndpointDescriptor, EndpointType, InterfaceDescriptor};
use crate::error::{DriverError, Result};
use crate::usb::transport::UsbTransport;
use protocol::VENDOR_SPECIFIC_CLASS;
use rusb::{Context, Device, DeviceDescriptor, DeviceHandle};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

/// Alternate setting carrying the data endpoints on multi-setting interfaces
const DATA_ALT_SETTING: u8 = 1;

pub struct UsbModem {
    device: Device<Context>,
    descriptor: DeviceDescriptor,
    handle: Option<Arc<RwLock<DeviceHandle<Context>>>>,
    transport: Option<Arc<UsbTransport>>,
    claimed: Vec<u8>,
}

impl UsbModem {
    pub fn new(device: Device<Context>) -> std::result::Result<Self, rusb::Error> {
        let descriptor = device.device_descriptor()?;
        Ok(Self {
            device,
            descriptor,
            handle: None,
            transport: None,
            claimed: Vec::new(),
        })
    }

    pub fn vendor_id(&self) -> u16 {
        self.descriptor.vendor_id()
    }

    pub fn product_id(&self) -> u16 {
        self.descriptor.product_id()
    }

    pub fn bus_number(&self) -> u8 {
        self.device.bus_number()
    }

    pub fn address(&self) -> u8 {
        self.device.address()
    }

    /// Interfaces of the active configuration
    ///
    /// Endpoints are taken from the alternate setting the driver selects.
    pub fn interfaces(&self) -> Result<Vec<InterfaceDescriptor>> {
        let config = self
            .device
            .active_config_descriptor()
            .map_err(usb_error)?;

        let mut interfaces = Vec::new();
        for interface in config.interfaces() {
            let settings: Vec<_> = interface.descriptors().collect();
            let alt_settings = settings.len() as u8;
            let wanted = if alt_settings > 1 { DATA_ALT_SETTING } else { 0 };
            let Some(setting) = settings
                .iter()
                .find(|s| s.setting_number() == wanted)
                .or_else(|| settings.first())
            else {
                continue;
            };

            interfaces.push(InterfaceDescriptor {
                number: setting.interface_number(),
                class: setting.class_code(),
                alt_settings,
                endpoints: setting.endpoint_descriptors().map(convert_endpoint).collect(),
                extra: setting.extra().to_vec(),
            });
        }
        Ok(interfaces)
    }

    /// Open the device and claim its vendor-specific interfaces
    pub fn open(&mut self) -> Result<Arc<UsbTransport>> {
        if let Some(transport) = &self.transport {
            return Ok(transport.clone());
        }

        let mut handle = self.device.open().map_err(usb_error)?;
        debug!(
            "Opened {:04x}:{:04x} at {}:{}",
            self.vendor_id(),
            self.product_id(),
            self.bus_number(),
            self.address()
        );

        for intf in self.interfaces()? {
            if intf.class != VENDOR_SPECIFIC_CLASS {
                continue;
            }
            let number = intf.number;

            match handle.kernel_driver_active(number) {
                Ok(true) => {
                    debug!("Detaching kernel driver from interface {}", number);
                    if let Err(e) = handle.detach_kernel_driver(number) {
                        warn!("Failed to detach kernel driver from interface {}: {}", number, e);
                    }
                }
                Ok(false) => {}
                Err(e) => debug!("Kernel driver state of interface {} unknown: {}", number, e),
            }

            if let Err(e) = handle.claim_interface(number) {
                self.release(&mut handle);
                return Err(DriverError::Common(common::Error::Usb(format!(
                    "Failed to claim interface {}: {}",
                    number, e
                ))));
            }
            self.claimed.push(number);

            if intf.alt_settings > 1
                && let Err(e) = handle.set_alternate_setting(number, DATA_ALT_SETTING)
            {
                warn!("Failed to select alt setting on interface {}: {}", number, e);
            }
            debug!("Claimed interface {}", number);
        }

        let handle = Arc::new(RwLock::new(handle));
        let transport = Arc::new(UsbTransport::new(handle.clone()));
        self.handle = Some(handle);
        self.transport = Some(transport.clone());
        Ok(transport)
    }

    fn release(&mut self, handle: &mut DeviceHandle<Context>) {
        for number in self.claimed.drain(..) {
            if let Err(e) = handle.release_interface(number) {
                warn!("Failed to release interface {}: {}", number, e);
            }
            if let Err(e) = handle.attach_kernel_driver(number) {
                debug!("Could not reattach kernel driver to interface {}: {}", number, e);
            }
        }
    }

    /// Stop the transport and give the interfaces back to the kernel
    pub fn close(&mut self) {
        if let Some(transport) = self.transport.take() {
            transport.close();
        }
        if let Some(handle) = self.handle.take() {
            let mut guard = handle.write().unwrap_or_else(|e| e.into_inner());
            self.release(&mut guard);
            debug!("Closed {:04x}:{:04x}", self.vendor_id(), self.product_id());
        }
    }
}

impl Drop for UsbModem {
    fn drop(&mut self) {
        self.close();
    }
}

fn usb_error(e: rusb::Error) -> DriverError {
    DriverError::Common(common::Error::Usb(e.to_string()))
}

fn convert_endpoint(ep: rusb::EndpointDescriptor<'_>) -> EndpointDescriptor {
    EndpointDescriptor {
        address: ep.address(),
        transfer_type: map_transfer_type(ep.transfer_type()),
        max_packet_size: ep.max_packet_size(),
        interval: ep.interval(),
        extra: ep.extra().map(<[u8]>::to_vec).unwrap_or_default(),
    }
}

fn map_transfer_type(kind: rusb::TransferType) -> EndpointType {
    match kind {
        rusb::TransferType::Control => EndpointType::Control,
        rusb::TransferType::Isochronous => EndpointType::Isochronous,
        rusb::TransferType::Bulk => EndpointType::Bulk,
        rusb::TransferType::Interrupt => EndpointType::Interrupt,
    }
}
