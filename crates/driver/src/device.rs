//! One logical function of the modem
//!
//! A [`Device`] is either a serial port or a network function. It owns the
//! endpoints it uses, a structural mutex serializing open/close/disconnect,
//! the `gone` flag and the activity tracker. Shared ownership replaces manual
//! reference counting: the registry, the interface binding and every open
//! handle hold an `Arc`, in-flight transfers only a `Weak`.

use crate::activity::ActivityTracker;
use crate::descriptor::EndpointDescriptor;
use crate::net::NetPort;
use crate::registry::PortIndex;
use crate::serial::SerialPort;
use crate::transport::{
    Completion, CompletionHandler, ErrorClass, TransferError, TransferTag, Transport,
    handle_transfer_error,
};
use common::WorkQueue;
use protocol::PortSpec;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use tracing::debug;

/// Endpoints a function transfers on
#[derive(Debug, Clone, Default)]
pub struct Endpoints {
    pub bulk_in: Option<EndpointDescriptor>,
    pub bulk_out: Option<EndpointDescriptor>,
    pub interrupt_in: Option<EndpointDescriptor>,
}

pub enum DeviceKind {
    Serial(SerialPort),
    Network(NetPort),
}

pub struct Device {
    this: Weak<Device>,
    spec: PortSpec,
    interface: u8,
    endpoints: Endpoints,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) work: Arc<dyn WorkQueue>,
    mutex: Mutex<()>,
    gone: AtomicBool,
    pub(crate) activity: ActivityTracker,
    index: OnceLock<PortIndex>,
    kind: DeviceKind,
}

impl Device {
    pub fn new(
        spec: PortSpec,
        interface: u8,
        endpoints: Endpoints,
        transport: Arc<dyn Transport>,
        work: Arc<dyn WorkQueue>,
        kind: DeviceKind,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            spec,
            interface,
            endpoints,
            activity: ActivityTracker::new(transport.clone(), work.clone()),
            transport,
            work,
            mutex: Mutex::new(()),
            gone: AtomicBool::new(false),
            index: OnceLock::new(),
            kind,
        })
    }

    pub fn spec(&self) -> PortSpec {
        self.spec
    }

    pub fn interface(&self) -> u8 {
        self.interface
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    pub fn kind(&self) -> &DeviceKind {
        &self.kind
    }

    pub fn serial(&self) -> Option<&SerialPort> {
        match &self.kind {
            DeviceKind::Serial(port) => Some(port),
            DeviceKind::Network(_) => None,
        }
    }

    pub fn net(&self) -> Option<&NetPort> {
        match &self.kind {
            DeviceKind::Network(net) => Some(net),
            DeviceKind::Serial(_) => None,
        }
    }

    pub fn index(&self) -> Option<PortIndex> {
        self.index.get().copied()
    }

    pub(crate) fn set_index(&self, index: PortIndex) {
        let _ = self.index.set(index);
    }

    /// Structural lock for open, close, suspend and disconnect
    pub(crate) fn lock(&self) -> MutexGuard<'_, ()> {
        self.mutex.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_gone(&self) -> bool {
        self.gone.load(Ordering::Acquire)
    }

    /// Record physical removal; caller holds [`Device::lock`]
    pub(crate) fn mark_gone(&self) {
        self.gone.store(true, Ordering::Release);
    }

    pub(crate) fn weak(&self) -> Weak<Device> {
        self.this.clone()
    }

    /// Handler reference handed to the transport with each submission
    pub(crate) fn handler(&self) -> Weak<dyn CompletionHandler> {
        let this: Weak<Device> = self.this.clone();
        this
    }

    pub(crate) fn handle_transfer_error(&self, context: &str, error: &TransferError) -> ErrorClass {
        handle_transfer_error(self.transport.as_ref(), context, error)
    }

    /// Human readable function name
    pub fn port_type(&self) -> &'static str {
        self.spec.port.name()
    }
}

impl CompletionHandler for Device {
    fn complete(&self, tag: TransferTag, completion: Completion) {
        match &self.kind {
            DeviceKind::Serial(port) => port.complete(self, tag, completion),
            DeviceKind::Network(net) => net.complete(self, tag, completion),
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        debug!(
            "Releasing {} function on interface {} ({:?})",
            self.spec.port, self.interface, self.index.get()
        );
    }
}
