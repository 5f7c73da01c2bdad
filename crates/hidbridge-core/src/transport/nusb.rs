//! nusb-based USB backend.
//!
//! Desktop platforms have no interactive permission prompt, so access is
//! checked by opening the device: a refusal from the OS is a denial and
//! anything else is a grant.

use std::time::Duration;

use nusb::transfer::{Buffer, Bulk, In, Out, TransferError};
use nusb::{DeviceInfo, ErrorKind, Interface, MaybeFuture, list_devices};
use tracing::{debug, instrument, warn};

use super::traits::{TransportError, UsbBackend, UsbConnection};
use crate::device::Device;
use crate::endpoint::{EndpointDescriptor, TransferType};
use crate::permission::{PermissionOutcome, PermissionResponder};

fn handle_of(info: &DeviceInfo) -> String {
    format!("{}:{:03}", info.bus_id(), info.device_address())
}

fn open_error(e: nusb::Error) -> TransportError {
    match e.kind() {
        ErrorKind::PermissionDenied => TransportError::PermissionDenied(e.to_string()),
        ErrorKind::Disconnected | ErrorKind::NotFound => TransportError::Disconnected,
        _ => TransportError::OpenFailed(e.to_string()),
    }
}

fn timeout_ms(timeout: Duration) -> u64 {
    timeout.as_millis() as u64
}

/// nusb-based backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct NusbBackend;

impl NusbBackend {
    pub fn new() -> Self {
        Self
    }

    fn find(&self, device: &Device) -> Result<DeviceInfo, TransportError> {
        list_devices()
            .wait()
            .map_err(|e| TransportError::EnumerationFailed(e.to_string()))?
            .find(|info| handle_of(info) == device.handle && device.matches(info.vendor_id(), info.product_id()))
            .ok_or(TransportError::Disconnected)
    }
}

impl UsbBackend for NusbBackend {
    type Connection = NusbConnection;

    #[instrument(level = "trace", skip(self))]
    fn enumerate(&self) -> Result<Vec<Device>, TransportError> {
        let devices = list_devices()
            .wait()
            .map_err(|e| TransportError::EnumerationFailed(e.to_string()))?;

        Ok(devices
            .map(|info| Device {
                vendor_id: info.vendor_id(),
                product_id: info.product_id(),
                handle: handle_of(&info),
                display_name: info.product_string().unwrap_or_default().to_string(),
                interface_count: info.interfaces().count() as u8,
            })
            .collect())
    }

    fn interface_endpoints(
        &self,
        device: &Device,
        interface: u8,
    ) -> Result<Vec<EndpointDescriptor>, TransportError> {
        let handle = self.find(device)?.open().wait().map_err(open_error)?;
        let config = handle
            .active_configuration()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        // Only the default alternate setting is used for transfers.
        let endpoints = config
            .interfaces()
            .filter(|group| group.interface_number() == interface)
            .filter_map(|group| group.alt_settings().next())
            .flat_map(|alt| {
                alt.endpoints()
                    .map(|ep| {
                        let transfer_type = match ep.transfer_type() {
                            nusb::descriptors::TransferType::Control => TransferType::Control,
                            nusb::descriptors::TransferType::Isochronous => TransferType::Isochronous,
                            nusb::descriptors::TransferType::Bulk => TransferType::Bulk,
                            nusb::descriptors::TransferType::Interrupt => TransferType::Interrupt,
                        };
                        EndpointDescriptor::new(ep.address(), transfer_type, ep.max_packet_size())
                    })
                    .collect::<Vec<_>>()
            })
            .collect();
        Ok(endpoints)
    }

    fn request_permission(&self, device: &Device, responder: PermissionResponder) {
        let outcome = match self.find(device).and_then(|info| info.open().wait().map_err(open_error)) {
            Ok(_) => PermissionOutcome::Granted,
            Err(TransportError::PermissionDenied(message)) => {
                warn!(handle = %device.handle, %message, "Access to device refused by the OS");
                PermissionOutcome::Denied
            }
            // Other failures surface again on open, with a better error.
            Err(e) => {
                debug!(handle = %device.handle, error = %e, "Permission check failed");
                PermissionOutcome::Granted
            }
        };
        responder.resolve(outcome);
    }

    #[instrument(level = "debug", skip(self, device), fields(handle = %device.handle))]
    fn open(&self, device: &Device) -> Result<NusbConnection, TransportError> {
        let handle = self.find(device)?.open().wait().map_err(open_error)?;
        Ok(NusbConnection {
            device: Some(handle),
            interface: None,
        })
    }
}

/// An open nusb device with at most one claimed interface.
pub struct NusbConnection {
    device: Option<nusb::Device>,
    interface: Option<Interface>,
}

impl NusbConnection {
    fn claimed(&self) -> Result<&Interface, TransportError> {
        self.interface.as_ref().ok_or(TransportError::Disconnected)
    }
}

impl UsbConnection for NusbConnection {
    fn claim_interface(&mut self, interface: u8) -> Result<(), TransportError> {
        if let Some(held) = &self.interface {
            return Err(TransportError::ClaimInterfaceFailed {
                interface,
                message: format!("interface {} already claimed", held.interface_number()),
            });
        }
        let device = self.device.as_ref().ok_or(TransportError::Disconnected)?;
        // usbhid holds HID interfaces on Linux; take them over. A busy
        // interface here is held outside this process, not by the arbiter.
        let claimed = device
            .detach_and_claim_interface(interface)
            .wait()
            .map_err(|e| match e.kind() {
                ErrorKind::Disconnected => TransportError::Disconnected,
                _ => TransportError::ClaimInterfaceFailed {
                    interface,
                    message: e.to_string(),
                },
            })?;
        self.interface = Some(claimed);
        Ok(())
    }

    fn release_interface(&mut self, interface: u8) -> Result<(), TransportError> {
        if self
            .interface
            .as_ref()
            .is_some_and(|i| i.interface_number() == interface)
        {
            self.interface = None;
        }
        Ok(())
    }

    fn bulk_in(
        &mut self,
        endpoint: &EndpointDescriptor,
        max_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let mut ep = self
            .claimed()?
            .endpoint::<Bulk, In>(endpoint.address)
            .map_err(|_| TransportError::EndpointNotFound {
                address: endpoint.address,
            })?;

        let completion = ep.transfer_blocking(Buffer::new(max_len.max(1)), timeout);
        match completion.status {
            Ok(()) => {
                let mut data = completion.buffer.to_vec();
                data.truncate(completion.actual_len);
                Ok(data)
            }
            Err(TransferError::Cancelled) => Err(TransportError::Timeout {
                timeout_ms: timeout_ms(timeout),
            }),
            Err(TransferError::Disconnected) => Err(TransportError::Disconnected),
            Err(e) => Err(TransportError::ReadFailed(e.to_string())),
        }
    }

    fn bulk_out(
        &mut self,
        endpoint: &EndpointDescriptor,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        let mut ep = self
            .claimed()?
            .endpoint::<Bulk, Out>(endpoint.address)
            .map_err(|_| TransportError::EndpointNotFound {
                address: endpoint.address,
            })?;

        let mut buffer = Buffer::new(data.len());
        buffer.extend_from_slice(data);

        let completion = ep.transfer_blocking(buffer, timeout);
        match completion.status {
            Ok(()) => Ok(completion.actual_len),
            Err(TransferError::Cancelled) => Err(TransportError::Timeout {
                timeout_ms: timeout_ms(timeout),
            }),
            Err(TransferError::Disconnected) => Err(TransportError::Disconnected),
            Err(e) => Err(TransportError::WriteFailed(e.to_string())),
        }
    }

    fn close(&mut self) {
        self.interface = None;
        self.device = None;
    }
}
