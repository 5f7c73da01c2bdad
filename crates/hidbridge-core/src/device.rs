//! Device discovery.

use std::fmt;

use tracing::{debug, instrument};

use crate::transport::{TransportError, UsbBackend};

/// An attached USB device as reported by enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub vendor_id: u16,
    pub product_id: u16,
    /// Platform handle, stable while the device stays attached.
    pub handle: String,
    pub display_name: String,
    pub interface_count: u8,
}

impl Device {
    /// Whether this device carries the given (vendor, product) identity.
    pub fn matches(&self, vid: u16, pid: u16) -> bool {
        self.vendor_id == vid && self.product_id == pid
    }

    /// Whether `other` is the same physical attachment.
    pub fn same_attachment(&self, other: &Device) -> bool {
        self.handle == other.handle && self.matches(other.vendor_id, other.product_id)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04X}:{:04X} \"{}\" at {} ({} interface(s))",
            self.vendor_id, self.product_id, self.display_name, self.handle, self.interface_count
        )
    }
}

/// Finds the target device in the current enumeration snapshot.
pub struct DeviceLocator<'a, B: UsbBackend> {
    backend: &'a B,
}

impl<'a, B: UsbBackend> DeviceLocator<'a, B> {
    pub fn new(backend: &'a B) -> Self {
        Self { backend }
    }

    /// First device matching `(vid, pid)`, in platform enumeration order.
    ///
    /// Absence is `Ok(None)`. Which of several identical devices is returned
    /// is not stable across calls.
    #[instrument(level = "debug", skip(self), fields(vid = format!("{:04X}", vid), pid = format!("{:04X}", pid)))]
    pub fn locate(&self, vid: u16, pid: u16) -> Result<Option<Device>, TransportError> {
        let devices = self.backend.enumerate()?;
        debug!(count = devices.len(), "Enumerated devices");
        Ok(devices.into_iter().find(|d| d.matches(vid, pid)))
    }

    /// Whether `device` is still present in a fresh snapshot.
    pub fn is_present(&self, device: &Device) -> Result<bool, TransportError> {
        Ok(self
            .backend
            .enumerate()?
            .iter()
            .any(|d| d.same_attachment(device)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MockBackend, MockDevice};

    #[test]
    fn test_locate_absent_returns_none_without_opening() {
        let mock = MockBackend::new();
        mock.add_device(MockDevice::new(0x1234, 0x0001));

        let found = DeviceLocator::new(&mock).locate(0x0483, 0x5740).unwrap();
        assert!(found.is_none());
        assert_eq!(mock.open_count(), 0);
    }

    #[test]
    fn test_locate_empty_bus() {
        let mock = MockBackend::new();
        assert!(DeviceLocator::new(&mock).locate(1, 2).unwrap().is_none());
    }

    #[test]
    fn test_locate_first_in_enumeration_order() {
        let mock = MockBackend::new();
        mock.add_device(MockDevice::new(0x1234, 0x0001).with_name("other"));
        mock.add_device(MockDevice::new(0x0483, 0x5740).with_name("first"));
        mock.add_device(MockDevice::new(0x0483, 0x5740).with_name("second"));

        let found = DeviceLocator::new(&mock)
            .locate(0x0483, 0x5740)
            .unwrap()
            .unwrap();
        assert_eq!(found.display_name, "first");
        assert!(found.matches(1155, 22336));
    }

    #[test]
    fn test_is_present_tracks_detach() {
        let mock = MockBackend::new();
        mock.add_device(MockDevice::new(0x0483, 0x5740));
        let locator = DeviceLocator::new(&mock);
        let device = locator.locate(0x0483, 0x5740).unwrap().unwrap();

        assert!(locator.is_present(&device).unwrap());
        mock.disconnect();
        assert!(!locator.is_present(&device).unwrap());
    }
}
