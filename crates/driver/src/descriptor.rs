//! Interface and endpoint metadata
//!
//! A transport-neutral copy of the parts of the USB descriptors probe needs.

/// Endpoint transfer type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub address: u8,
    pub transfer_type: EndpointType,
    pub max_packet_size: u16,
    pub interval: u8,
    /// Class-specific descriptor bytes following the endpoint descriptor
    pub extra: Vec<u8>,
}

impl EndpointDescriptor {
    pub fn direction(&self) -> Direction {
        if self.address & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    pub fn max_packet(&self) -> usize {
        self.max_packet_size as usize
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    pub number: u8,
    pub class: u8,
    /// Number of alternate settings; endpoints are those of the one in use
    pub alt_settings: u8,
    pub endpoints: Vec<EndpointDescriptor>,
    pub extra: Vec<u8>,
}

/// Length of the class-specific descriptor that carries the mux port mask
const MUX_MASK_DESCRIPTOR_LEN: usize = 3;

impl InterfaceDescriptor {
    /// First endpoint of the given type and direction
    pub fn find_endpoint(
        &self,
        transfer_type: EndpointType,
        direction: Direction,
    ) -> Option<&EndpointDescriptor> {
        self.endpoints
            .iter()
            .find(|ep| ep.transfer_type == transfer_type && ep.direction() == direction)
    }

    /// Bitmap of the sub-channels present on a mux interface
    ///
    /// Taken from a 3-byte class-specific descriptor, looked up on the
    /// interface first and then on each endpoint.
    pub fn mux_port_mask(&self) -> Option<u8> {
        if self.extra.len() == MUX_MASK_DESCRIPTOR_LEN {
            return Some(self.extra[2]);
        }
        self.endpoints
            .iter()
            .find(|ep| ep.extra.len() == MUX_MASK_DESCRIPTOR_LEN)
            .map(|ep| ep.extra[2])
    }
}
