//! Modem driver
//!
//! Binds vendor-specific interfaces of a supported modem to logical
//! functions, tracks them in the [`DeviceRegistry`], and drives the
//! interface-wide lifecycle events: disconnect, suspend and resume.

use crate::config::DriverConfig;
use crate::descriptor::{Direction, EndpointType, InterfaceDescriptor};
use crate::device::{Device, DeviceKind, Endpoints};
use crate::error::{DriverError, Result};
use crate::mux::SharedSubchannelDemux;
use crate::net::{NetHandle, NetPort, PacketSink};
use crate::registry::{DeviceRegistry, HandleSpace, PortIndex};
use crate::serial::{ByteConsumer, SerialHandle, SerialPort};
use crate::status::ModemStatus;
use crate::transport::Transport;
use common::WorkQueue;
use protocol::{
    DeviceLayout, InterfaceKind, PortKind, PortSpec, SetupPacket, SupportedDevice,
    VENDOR_SPECIFIC_CLASS, decode_config_data, device_table,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Everything probe created for one interface
pub struct InterfaceBinding {
    interface: u8,
    spec: PortSpec,
    transport: Arc<dyn Transport>,
    devices: Vec<Arc<Device>>,
    demux: Option<Arc<SharedSubchannelDemux>>,
}

impl InterfaceBinding {
    pub fn interface(&self) -> u8 {
        self.interface
    }

    pub fn spec(&self) -> PortSpec {
        self.spec
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn devices(&self) -> &[Arc<Device>] {
        &self.devices
    }

    pub fn demux(&self) -> Option<&Arc<SharedSubchannelDemux>> {
        self.demux.as_ref()
    }
}

/// Summary of one registered function
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    pub index: PortIndex,
    pub port: PortKind,
    pub interface: u8,
    pub mux: bool,
}

pub struct ModemDriver {
    config: DriverConfig,
    extra_devices: Vec<SupportedDevice>,
    registry: Arc<DeviceRegistry>,
    work: Arc<dyn WorkQueue>,
}

impl ModemDriver {
    pub fn new(config: DriverConfig, work: Arc<dyn WorkQueue>) -> Self {
        let extra_devices = config.extra_devices().unwrap_or_else(|e| {
            warn!("Ignoring configured devices: {}", e);
            Vec::new()
        });
        Self {
            registry: Arc::new(DeviceRegistry::from_limits(&config.limits)),
            extra_devices,
            config,
            work,
        }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Layout of a device; configured entries take precedence
    pub fn layout_for(&self, vendor_id: u16, product_id: u16) -> Option<DeviceLayout> {
        self.extra_devices
            .iter()
            .find(|d| d.vendor_id == vendor_id && d.product_id == product_id)
            .map(|d| d.layout)
            .or_else(|| device_table::lookup(vendor_id, product_id))
    }

    pub fn is_supported(&self, vendor_id: u16, product_id: u16) -> bool {
        self.layout_for(vendor_id, product_id).is_some()
    }

    // ---- probe ----

    /// Create the functions of one interface
    pub fn probe(
        &self,
        transport: Arc<dyn Transport>,
        vendor_id: u16,
        product_id: u16,
        intf: &InterfaceDescriptor,
    ) -> Result<InterfaceBinding> {
        if intf.class != VENDOR_SPECIFIC_CLASS {
            return Err(DriverError::NotSupported("not a vendor-specific interface"));
        }
        let layout = self.layout_for(vendor_id, product_id).ok_or_else(|| {
            DriverError::NotFound(format!("{:04x}:{:04x}", vendor_id, product_id))
        })?;

        let spec = self
            .port_spec(transport.as_ref(), layout, intf.number)?
            .ok_or_else(|| DriverError::NotFound(format!("function of interface {}", intf.number)))?;
        debug!("Interface {} is {:?} {}", intf.number, spec.interface, spec.port);

        let mut binding = InterfaceBinding {
            interface: intf.number,
            spec,
            transport: transport.clone(),
            devices: Vec::new(),
            demux: None,
        };
        let mut last_error = None;

        match spec.interface {
            InterfaceKind::Mux => self.probe_mux(&mut binding, spec, intf, &mut last_error)?,
            InterfaceKind::Bulk => self.probe_bulk(&mut binding, spec, intf, &mut last_error)?,
        }

        if binding.devices.is_empty() {
            return Err(last_error.unwrap_or_else(|| {
                DriverError::NotFound(format!("functions on interface {}", intf.number))
            }));
        }

        info!(
            "Interface {} bound: {} function(s)",
            intf.number,
            binding.devices.len()
        );
        Ok(binding)
    }

    fn port_spec(
        &self,
        transport: &dyn Transport,
        layout: DeviceLayout,
        interface: u8,
    ) -> Result<Option<PortSpec>> {
        if layout.is_static() {
            return Ok(layout.port_spec(interface));
        }
        let data = transport.control_in(SetupPacket::config_data())?;
        Ok(decode_config_data(&data, interface)?)
    }

    fn probe_mux(
        &self,
        binding: &mut InterfaceBinding,
        spec: PortSpec,
        intf: &InterfaceDescriptor,
        last_error: &mut Option<DriverError>,
    ) -> Result<()> {
        if spec.port == PortKind::Network {
            if self.config.driver.disable_net {
                debug!("Network functions disabled, skipping");
            } else {
                self.add_net(binding, spec, intf, last_error);
            }
        }

        let interrupt = intf
            .find_endpoint(EndpointType::Interrupt, Direction::In)
            .cloned()
            .ok_or(DriverError::NotSupported("mux interface without interrupt endpoint"))?;
        let mask = intf.mux_port_mask().unwrap_or_else(|| {
            warn!("Mux interface {} has no port mask", intf.number);
            0
        });

        let demux =
            SharedSubchannelDemux::new(binding.transport.clone(), intf.number, interrupt);
        for bit in (0..8).map(|n| 1u8 << n).filter(|bit| mask & bit != 0) {
            let Some(port) = PortKind::from_mux_bit(bit) else {
                debug!("Mux bit {:#04x} has no sub-channel", bit);
                continue;
            };
            let device = Device::new(
                PortSpec::new(InterfaceKind::Mux, port),
                intf.number,
                Endpoints::default(),
                binding.transport.clone(),
                self.work.clone(),
                DeviceKind::Serial(SerialPort::mux(port, demux.clone())),
            );
            demux.attach(port, Arc::downgrade(&device));
            self.register(binding, HandleSpace::Serial, device, last_error);
        }
        binding.demux = Some(demux);
        Ok(())
    }

    fn probe_bulk(
        &self,
        binding: &mut InterfaceBinding,
        spec: PortSpec,
        intf: &InterfaceDescriptor,
        last_error: &mut Option<DriverError>,
    ) -> Result<()> {
        if spec.port == PortKind::Network {
            if self.config.driver.disable_net {
                return Err(DriverError::NotSupported("network functions disabled"));
            }
            self.add_net(binding, spec, intf, last_error);
            return Ok(());
        }

        let endpoints = Self::bulk_endpoints(intf)?;
        let status = match spec.port {
            PortKind::Modem => endpoints.interrupt_in.clone().map(ModemStatus::new),
            _ => None,
        };
        let device = Device::new(
            spec,
            intf.number,
            endpoints,
            binding.transport.clone(),
            self.work.clone(),
            DeviceKind::Serial(SerialPort::bulk(
                spec.port,
                self.config.buffers.bulk_rx_slots,
                status,
            )),
        );
        self.register(binding, HandleSpace::Serial, device, last_error);
        Ok(())
    }

    fn add_net(
        &self,
        binding: &mut InterfaceBinding,
        spec: PortSpec,
        intf: &InterfaceDescriptor,
        last_error: &mut Option<DriverError>,
    ) {
        let endpoints = match Self::bulk_endpoints(intf) {
            Ok(endpoints) => endpoints,
            Err(e) => {
                warn!("Skipping network function on interface {}: {}", intf.number, e);
                *last_error = Some(e);
                return;
            }
        };
        let device = Device::new(
            PortSpec::new(InterfaceKind::Bulk, PortKind::Network).with_crc_quirk(spec.crc_quirk),
            intf.number,
            endpoints,
            binding.transport.clone(),
            self.work.clone(),
            DeviceKind::Network(NetPort::new(
                self.config.buffers.net_rx_slots,
                self.config.buffers.tx_timeout(),
            )),
        );
        self.register(binding, HandleSpace::Network, device, last_error);
    }

    fn bulk_endpoints(intf: &InterfaceDescriptor) -> Result<Endpoints> {
        let bulk_in = intf.find_endpoint(EndpointType::Bulk, Direction::In).cloned();
        let bulk_out = intf.find_endpoint(EndpointType::Bulk, Direction::Out).cloned();
        if bulk_in.is_none() || bulk_out.is_none() {
            return Err(DriverError::NotSupported("interface lacks a bulk endpoint pair"));
        }
        Ok(Endpoints {
            bulk_in,
            bulk_out,
            interrupt_in: intf
                .find_endpoint(EndpointType::Interrupt, Direction::In)
                .cloned(),
        })
    }

    fn register(
        &self,
        binding: &mut InterfaceBinding,
        space: HandleSpace,
        device: Arc<Device>,
        last_error: &mut Option<DriverError>,
    ) {
        match self.registry.register(space, device.clone()) {
            Ok(index) => {
                info!("{} is {} on interface {}", index, device.port_type(), binding.interface);
                binding.devices.push(device);
            }
            Err(e) => {
                warn!("Skipping {} function: {}", device.port_type(), e);
                *last_error = Some(e.into());
            }
        }
    }

    // ---- lifecycle ----

    /// The interface is gone: hang up, cancel everything, free the indices
    ///
    /// Open handles keep their devices alive until dropped; every
    /// operation on them fails with [`DriverError::Gone`].
    pub fn disconnect(&self, binding: InterfaceBinding) {
        for device in &binding.devices {
            match device.kind() {
                DeviceKind::Serial(port) => {
                    port.hangup();
                    {
                        let _guard = device.lock();
                        device.mark_gone();
                    }
                    port.shutdown(device);
                }
                DeviceKind::Network(net) => {
                    {
                        let _guard = device.lock();
                        device.mark_gone();
                    }
                    net.shutdown(device);
                }
            }
            if let Some(index) = device.index() {
                self.registry.unregister(index);
            }
        }
        if let Some(demux) = &binding.demux {
            demux.shutdown();
        }
        info!("Interface {} disconnected", binding.interface);
    }

    /// Stop all I/O on the interface
    pub fn suspend(&self, binding: &InterfaceBinding) {
        for device in &binding.devices {
            let _guard = device.lock();
            match device.kind() {
                DeviceKind::Serial(port) if port.is_open() => port.stop(device),
                DeviceKind::Network(net) if net.is_running() => net.stop(device),
                _ => {}
            }
        }
        debug!("Interface {} suspended", binding.interface);
    }

    /// Restart I/O of open functions
    pub fn resume(&self, binding: &InterfaceBinding) {
        for device in &binding.devices {
            let _guard = device.lock();
            if device.is_gone() {
                continue;
            }
            match device.kind() {
                DeviceKind::Serial(port) if port.is_open() => {
                    if let Err(e) = port.start(device) {
                        warn!("Failed to restart {}: {}", device.port_type(), e);
                    }
                    port.kick_transmit(device);
                }
                DeviceKind::Network(net) if net.is_running() => {
                    net.flush_lingering(device);
                    if let Err(e) = net.start(device) {
                        warn!("Failed to restart network receive: {}", e);
                    }
                }
                _ => {}
            }
        }
        debug!("Interface {} resumed", binding.interface);
    }

    // ---- handles ----

    pub fn open_serial(
        &self,
        index: PortIndex,
        consumer: Arc<dyn ByteConsumer>,
    ) -> Result<SerialHandle> {
        let device = self
            .registry
            .lookup(index)
            .ok_or_else(|| DriverError::NotFound(index.to_string()))?;
        SerialHandle::open(device, consumer)
    }

    pub fn open_net(&self, index: PortIndex, sink: Arc<dyn PacketSink>) -> Result<NetHandle> {
        let device = self
            .registry
            .lookup(index)
            .ok_or_else(|| DriverError::NotFound(index.to_string()))?;
        NetHandle::open(device, sink)
    }

    /// Index of the first function of kind `port`
    pub fn find(&self, port: PortKind) -> Option<PortIndex> {
        let space = match port {
            PortKind::Network => HandleSpace::Network,
            _ => HandleSpace::Serial,
        };
        self.registry
            .devices(space)
            .into_iter()
            .find(|d| d.spec().port == port)
            .and_then(|d| d.index())
    }

    /// Every registered function, serial ports first
    pub fn ports(&self) -> Vec<PortInfo> {
        [HandleSpace::Serial, HandleSpace::Network]
            .into_iter()
            .flat_map(|space| self.registry.devices(space))
            .filter_map(|d| {
                d.index().map(|index| PortInfo {
                    index,
                    port: d.spec().port,
                    interface: d.interface(),
                    mux: d.spec().is_mux(),
                })
            })
            .collect()
    }
}
