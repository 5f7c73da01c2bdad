//! Endpoint descriptors and bulk endpoint classification.

use std::fmt;

use crate::device::Device;
use crate::transport::{TransportError, UsbBackend};

/// Bit 7 of an endpoint address marks the IN direction.
pub const ENDPOINT_DIR_IN: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Device to host.
    In,
    /// Host to device.
    Out,
}

impl Direction {
    pub fn from_address(address: u8) -> Self {
        if address & ENDPOINT_DIR_IN != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::In => write!(f, "IN"),
            Direction::Out => write!(f, "OUT"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

impl fmt::Display for TransferType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferType::Control => write!(f, "CONTROL"),
            TransferType::Isochronous => write!(f, "ISOCHRONOUS"),
            TransferType::Bulk => write!(f, "BULK"),
            TransferType::Interrupt => write!(f, "INTERRUPT"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointDescriptor {
    pub address: u8,
    pub direction: Direction,
    pub transfer_type: TransferType,
    pub max_packet_size: usize,
}

impl EndpointDescriptor {
    pub fn new(address: u8, transfer_type: TransferType, max_packet_size: usize) -> Self {
        Self {
            address,
            direction: Direction::from_address(address),
            transfer_type,
            max_packet_size,
        }
    }

    pub fn bulk(address: u8, max_packet_size: usize) -> Self {
        Self::new(address, TransferType::Bulk, max_packet_size)
    }

    pub fn is_bulk(&self) -> bool {
        self.transfer_type == TransferType::Bulk
    }
}

impl fmt::Display for EndpointDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "0x{:02X} {} {} ({} bytes)",
            self.address, self.transfer_type, self.direction, self.max_packet_size
        )
    }
}

/// Bulk endpoints of one interface, bucketed by direction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointSet {
    pub interface: u8,
    pub bulk_in: Vec<EndpointDescriptor>,
    pub bulk_out: Vec<EndpointDescriptor>,
}

impl EndpointSet {
    /// Partition `endpoints`, keeping only bulk ones. Order within each
    /// bucket follows the input order.
    pub fn partition(interface: u8, endpoints: &[EndpointDescriptor]) -> Self {
        let (bulk_in, bulk_out) = endpoints
            .iter()
            .filter(|ep| ep.is_bulk())
            .copied()
            .partition(|ep| ep.direction == Direction::In);
        Self {
            interface,
            bulk_in,
            bulk_out,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bulk_in.is_empty() && self.bulk_out.is_empty()
    }

    pub fn in_addresses(&self) -> Vec<u8> {
        self.bulk_in.iter().map(|ep| ep.address).collect()
    }

    pub fn out_addresses(&self) -> Vec<u8> {
        self.bulk_out.iter().map(|ep| ep.address).collect()
    }
}

pub struct EndpointClassifier<'a, B: UsbBackend> {
    backend: &'a B,
}

impl<'a, B: UsbBackend> EndpointClassifier<'a, B> {
    pub fn new(backend: &'a B) -> Self {
        Self { backend }
    }

    /// Read the endpoints of `interface` and split the bulk ones by direction.
    pub fn classify(&self, device: &Device, interface: u8) -> Result<EndpointSet, TransportError> {
        let endpoints = self.backend.interface_endpoints(device, interface)?;
        let set = EndpointSet::partition(interface, &endpoints);
        tracing::debug!(
            interface,
            total = endpoints.len(),
            bulk_in = set.bulk_in.len(),
            bulk_out = set.bulk_out.len(),
            "Classified endpoints"
        );
        Ok(set)
    }
}
