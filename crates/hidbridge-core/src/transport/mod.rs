//! Transport layer module.

pub mod mock;
pub mod nusb;
pub mod traits;

pub use mock::{MockBackend, MockDevice, MockRead, PermissionMode};
pub use nusb::{NusbBackend, NusbConnection};
pub use traits::{TransportError, UsbBackend, UsbConnection};
