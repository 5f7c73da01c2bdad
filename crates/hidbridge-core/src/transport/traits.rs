//! USB Transport layer abstraction.
//!
//! Defines the lower boundary the bridge is written against: a
//! [`UsbBackend`] that enumerates devices, negotiates access and opens
//! connections, and the [`UsbConnection`] those connections implement.

use std::time::Duration;

use thiserror::Error;

use crate::device::Device;
use crate::endpoint::EndpointDescriptor;
use crate::permission::PermissionResponder;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Device not found: VID={vid:04X} PID={pid:04X}")]
    DeviceNotFound { vid: u16, pid: u16 },

    #[error("Device enumeration failed: {0}")]
    EnumerationFailed(String),

    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Failed to claim interface {interface}: {message}")]
    ClaimInterfaceFailed { interface: u8, message: String },

    /// Another holder in this process has the interface; see `ClaimArbiter`.
    #[error("Interface {interface} is already claimed")]
    InterfaceBusy { interface: u8 },

    #[error("Endpoint 0x{address:02X} not found")]
    EndpointNotFound { address: u8 },

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Platform USB subsystem.
///
/// This trait enables:
/// - Production implementation using nusb
/// - Mock implementation for unit testing
pub trait UsbBackend: Send + Sync + 'static {
    type Connection: UsbConnection;

    /// Snapshot of the currently attached devices, in platform order.
    fn enumerate(&self) -> Result<Vec<Device>, TransportError>;

    /// Every endpoint of `interface` on `device`, in descriptor order.
    fn interface_endpoints(
        &self,
        device: &Device,
        interface: u8,
    ) -> Result<Vec<EndpointDescriptor>, TransportError>;

    /// Ask the platform for access to `device`.
    ///
    /// The outcome is delivered through `responder`, possibly from another
    /// thread and possibly before this call returns.
    fn request_permission(&self, device: &Device, responder: PermissionResponder);

    /// Open a connection to `device`. No interface is claimed yet.
    fn open(&self, device: &Device) -> Result<Self::Connection, TransportError>;
}

/// An open device handle.
pub trait UsbConnection: Send {
    /// Claim `interface` exclusively.
    fn claim_interface(&mut self, interface: u8) -> Result<(), TransportError>;

    /// Release a previously claimed interface.
    fn release_interface(&mut self, interface: u8) -> Result<(), TransportError>;

    /// Single bulk IN transfer of at most `max_len` bytes.
    ///
    /// Returns exactly the bytes the device sent, which may be empty.
    fn bulk_in(
        &mut self,
        endpoint: &EndpointDescriptor,
        max_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError>;

    /// Single bulk OUT transfer. Returns the number of bytes accepted.
    fn bulk_out(
        &mut self,
        endpoint: &EndpointDescriptor,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError>;

    /// Close the handle. Called exactly once by the owning `Connection`.
    fn close(&mut self);
}
