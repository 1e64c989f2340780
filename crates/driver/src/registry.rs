//! Port index tables
//!
//! Serial ports and network functions live in two separate fixed-size index
//! spaces. An index is handed out on registration and stays taken until the
//! device is unregistered.

use crate::device::Device;
use crate::config::LimitSettings;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleSpace {
    Serial,
    Network,
}

/// Position of a device in one index space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortIndex {
    pub space: HandleSpace,
    pub index: usize,
}

impl PortIndex {
    pub fn serial(index: usize) -> Self {
        Self {
            space: HandleSpace::Serial,
            index,
        }
    }

    pub fn network(index: usize) -> Self {
        Self {
            space: HandleSpace::Network,
            index,
        }
    }
}

impl fmt::Display for PortIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.space {
            HandleSpace::Serial => write!(f, "ttyHS{}", self.index),
            HandleSpace::Network => write!(f, "hso{}", self.index),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("No free {space:?} index (capacity {capacity})")]
    Exhausted { space: HandleSpace, capacity: usize },
}

type Table = Vec<Option<Arc<Device>>>;

pub struct DeviceRegistry {
    serial: Mutex<Table>,
    network: Mutex<Table>,
}

impl DeviceRegistry {
    pub fn new(serial_ports: usize, net_devices: usize) -> Self {
        Self {
            serial: Mutex::new(vec![None; serial_ports]),
            network: Mutex::new(vec![None; net_devices]),
        }
    }

    pub fn from_limits(limits: &LimitSettings) -> Self {
        Self::new(limits.serial_ports, limits.net_devices)
    }

    fn table(&self, space: HandleSpace) -> MutexGuard<'_, Table> {
        let table = match space {
            HandleSpace::Serial => &self.serial,
            HandleSpace::Network => &self.network,
        };
        table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Put `device` in the first free slot of `space`
    pub fn register(
        &self,
        space: HandleSpace,
        device: Arc<Device>,
    ) -> Result<PortIndex, RegistryError> {
        let mut table = self.table(space);
        let capacity = table.len();
        let index = table
            .iter()
            .position(Option::is_none)
            .ok_or(RegistryError::Exhausted { space, capacity })?;

        let port = PortIndex { space, index };
        device.set_index(port);
        table[index] = Some(device);
        debug!("Registered {}", port);
        Ok(port)
    }

    pub fn lookup(&self, port: PortIndex) -> Option<Arc<Device>> {
        self.table(port.space).get(port.index).cloned().flatten()
    }

    /// Free an index; returns the device that held it
    pub fn unregister(&self, port: PortIndex) -> Option<Arc<Device>> {
        let removed = self
            .table(port.space)
            .get_mut(port.index)
            .and_then(Option::take);
        if removed.is_some() {
            debug!("Unregistered {}", port);
        }
        removed
    }

    /// Registered devices of one space, in index order
    pub fn devices(&self, space: HandleSpace) -> Vec<Arc<Device>> {
        self.table(space).iter().flatten().cloned().collect()
    }

    pub fn len(&self, space: HandleSpace) -> usize {
        self.table(space).iter().flatten().count()
    }

    pub fn capacity(&self, space: HandleSpace) -> usize {
        self.table(space).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestRig;
    use protocol::PortKind;

    #[test]
    fn test_first_free_slot_and_reuse() {
        let rig = TestRig::new();
        let registry = DeviceRegistry::new(2, 1);

        let a = registry
            .register(HandleSpace::Serial, rig.bulk_serial(PortKind::Diag))
            .unwrap();
        let b = registry
            .register(HandleSpace::Serial, rig.bulk_serial(PortKind::Modem))
            .unwrap();
        assert_eq!((a.index, b.index), (0, 1));

        let err = registry
            .register(HandleSpace::Serial, rig.bulk_serial(PortKind::Diag2))
            .unwrap_err();
        assert_eq!(
            err,
            RegistryError::Exhausted {
                space: HandleSpace::Serial,
                capacity: 2
            }
        );

        assert!(registry.unregister(a).is_some());
        assert!(registry.lookup(a).is_none());
        let c = registry
            .register(HandleSpace::Serial, rig.bulk_serial(PortKind::Diag2))
            .unwrap();
        assert_eq!(c.index, 0);
        assert_eq!(registry.len(HandleSpace::Serial), 2);
        assert_eq!(registry.len(HandleSpace::Network), 0);
    }

    #[test]
    fn test_spaces_are_independent() {
        let registry = DeviceRegistry::new(4, 1);
        assert_eq!(registry.capacity(HandleSpace::Serial), 4);
        assert_eq!(registry.capacity(HandleSpace::Network), 1);
        assert!(registry.lookup(PortIndex::network(3)).is_none());
        assert_eq!(PortIndex::serial(2).to_string(), "ttyHS2");
        assert_eq!(PortIndex::network(0).to_string(), "hso0");
    }

    #[test]
    fn test_concurrent_registration() {
        let rig = TestRig::new();
        let registry = Arc::new(DeviceRegistry::new(64, 1));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let devices: Vec<_> = (0..8).map(|_| rig.bulk_serial(PortKind::Diag)).collect();
                std::thread::spawn(move || {
                    devices
                        .into_iter()
                        .map(|d| registry.register(HandleSpace::Serial, d).unwrap().index)
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut indices: Vec<usize> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        indices.sort_unstable();
        assert_eq!(indices, (0..64).collect::<Vec<_>>());
    }
}
