//! Supported devices
//!
//! Static table of modems the driver binds to, and how the port spec of
//! each of their interfaces is obtained.

use crate::port::{InterfaceKind, PortKind, PortSpec};
use serde::{Deserialize, Serialize};
use self::DeviceLayout::{Default as Std, Icon321, Query};

/// Vendor ID of all built-in entries
pub const OPTION_VENDOR_ID: u16 = 0x0af0;

/// Interface class every bound interface must carry
pub const VENDOR_SPECIFIC_CLASS: u8 = 0xFF;

const DEFAULT_LAYOUT: &[PortSpec] = &[
    PortSpec::new(InterfaceKind::Mux, PortKind::Network),
    PortSpec::new(InterfaceKind::Bulk, PortKind::Diag),
    PortSpec::new(InterfaceKind::Bulk, PortKind::Modem),
];

const ICON321_LAYOUT: &[PortSpec] = &[
    PortSpec::new(InterfaceKind::Mux, PortKind::Network),
    PortSpec::new(InterfaceKind::Bulk, PortKind::Diag2),
    PortSpec::new(InterfaceKind::Bulk, PortKind::Modem),
    PortSpec::new(InterfaceKind::Bulk, PortKind::Diag),
];

/// Where the per-interface port spec comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceLayout {
    /// Mux|Network, Bulk|Diag, Bulk|Modem
    Default,
    /// Mux|Network, Bulk|Diag2, Bulk|Modem, Bulk|Diag
    Icon321,
    /// Ask the device with the vendor config-data request
    Query,
}

impl DeviceLayout {
    /// Port spec of `interface` for static layouts
    ///
    /// `None` for [`DeviceLayout::Query`] and for interface numbers past the
    /// end of the layout.
    pub fn port_spec(&self, interface: u8) -> Option<PortSpec> {
        let table = match self {
            DeviceLayout::Default => DEFAULT_LAYOUT,
            DeviceLayout::Icon321 => ICON321_LAYOUT,
            DeviceLayout::Query => return None,
        };
        table.get(interface as usize).copied()
    }

    pub fn is_static(&self) -> bool {
        !matches!(self, DeviceLayout::Query)
    }
}

/// One supported vendor/product pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SupportedDevice {
    pub vendor_id: u16,
    pub product_id: u16,
    pub layout: DeviceLayout,
}

const fn entry(product_id: u16, layout: DeviceLayout) -> SupportedDevice {
    SupportedDevice {
        vendor_id: OPTION_VENDOR_ID,
        product_id,
        layout,
    }
}

pub const SUPPORTED_DEVICES: &[SupportedDevice] = &[
    entry(0x6711, Std),
    entry(0x6731, Std),
    entry(0x6751, Std),
    entry(0x6771, Std),
    entry(0x6791, Std),
    entry(0x6811, Std),
    entry(0x6911, Std),
    entry(0x6951, Std),
    entry(0x6971, Std),
    entry(0x7011, Std),
    entry(0x7031, Std),
    entry(0x7051, Std),
    entry(0x7071, Std),
    entry(0x7111, Std),
    entry(0x7211, Std),
    entry(0x7251, Std),
    entry(0x7271, Std),
    entry(0x7311, Std),
    entry(0xc031, Std), // Icon-Edge
    entry(0xd013, Icon321), // Module HSxPA
    entry(0xd031, Icon321), // Icon-321
    entry(0xd033, Icon321), // Icon-322
    entry(0x7301, Query), // GE40x
    entry(0x7361, Query),
    entry(0x7381, Query),
    entry(0x7401, Query), // GI 0401
    entry(0x7501, Query), // GTM 382
    entry(0x7601, Query),
    entry(0x7701, Query),
    entry(0x7706, Query),
    entry(0x7801, Query),
    entry(0x7901, Query),
    entry(0x7a01, Query),
    entry(0x7a05, Query),
    entry(0x8200, Query),
    entry(0x8201, Query),
    entry(0x8300, Query),
    entry(0x8302, Query),
    entry(0x8304, Query),
    entry(0x8400, Query),
    entry(0x8600, Query),
    entry(0x8800, Query),
    entry(0x8900, Query),
    entry(0x9000, Query),
    entry(0x9200, Query), // GTM671WFS
    entry(0xd035, Query),
    entry(0xd055, Query),
    entry(0xd155, Query),
    entry(0xd255, Query),
    entry(0xd057, Query),
    entry(0xd157, Query),
    entry(0xd257, Query),
    entry(0xd357, Query),
    entry(0xd058, Query),
    entry(0xc100, Query),
];

/// Layout of a built-in supported device
pub fn lookup(vendor_id: u16, product_id: u16) -> Option<DeviceLayout> {
    SUPPORTED_DEVICES
        .iter()
        .find(|d| d.vendor_id == vendor_id && d.product_id == product_id)
        .map(|d| d.layout)
}
