//! hidbridge-core: a USB HID bulk-transfer bridge.
//!
//! Binds to exactly one device identified by vendor/product ID, classifies
//! its bulk endpoints, negotiates access and then runs background polling
//! reads alongside on-demand writes. Inbound frames are buffered in a
//! [`ReceivedQueue`] for the host to drain.
//!
//! # Architecture
//!
//! - **Transport**: lower-boundary traits (`UsbBackend`, `UsbConnection`) with
//!   an nusb implementation and a scriptable mock
//! - **Device / Endpoint**: locating the target and classifying its endpoints
//! - **Permission**: one-shot asynchronous access negotiation
//! - **Connection**: RAII connections and the per-interface claim arbiter
//! - **Worker / Write**: the polling read loop and the write path
//! - **Events**: observer pattern carrying every diagnostic to the host
//! - **Bridge**: the orchestrator tying it together
//!
//! # Example
//!
//! ```no_run
//! use hidbridge_core::{Bridge, BridgeConfig, NusbBackend};
//! use std::time::Duration;
//!
//! let bridge = Bridge::new(NusbBackend::new(), BridgeConfig::default());
//! if bridge.open() {
//!     bridge.wait_for_permission(Duration::from_secs(5));
//!     bridge.start_reading();
//!     bridge.write(b"Hello");
//!     while let Some(data) = bridge.pop_data() {
//!         println!("{:02X?}", data);
//!     }
//! }
//! ```

pub mod bridge;
pub mod config;
pub mod connection;
pub mod device;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod permission;
pub mod queue;
pub mod state;
pub mod transport;
pub mod worker;
pub mod write;

// Re-exports for convenience
pub use bridge::Bridge;
pub use config::{BridgeConfig, ConfigOverrides, ReaderMode};
pub use device::{Device, DeviceLocator};
pub use endpoint::{Direction, EndpointClassifier, EndpointDescriptor, EndpointSet, TransferType};
pub use error::{BridgeError, Disposition, RetryPolicy};
pub use events::{BridgeEvent, BridgeObserver, LogLevel, LogSink, NullObserver, TracingObserver};
pub use permission::{AccessRequest, AccessStatus, PermissionGate, PermissionOutcome, PermissionTicket};
pub use queue::{Frame, OverflowPolicy, PushOutcome, ReceivedQueue};
pub use state::{BridgeState, ReaderState};
pub use transport::{MockBackend, MockDevice, NusbBackend, TransportError, UsbBackend, UsbConnection};
pub use worker::{ReadWorker, StopSignal};
pub use write::{EndpointWrite, WriteReport};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the guard if a panicking holder poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
