//! Connections and interface claims.
//!
//! A [`Connection`] closes its handle exactly once. A [`ClaimedInterface`]
//! pairs a physical interface claim with a lease from the [`ClaimArbiter`],
//! which serializes every holder of the same (device, interface) pair. The
//! read loop and the write path both go through the arbiter, so their claims
//! never overlap.

use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tracing::{debug, instrument, warn};

use crate::device::Device;
use crate::endpoint::EndpointDescriptor;
use crate::lock;
use crate::transport::{TransportError, UsbBackend, UsbConnection};

type ClaimKey = (String, u8);

/// Per-interface mutual exclusion.
#[derive(Default)]
pub struct ClaimArbiter {
    held: Mutex<HashSet<ClaimKey>>,
    released: Condvar,
}

impl ClaimArbiter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Take the lease for `interface` on `device`, waiting up to `wait` for
    /// the current holder to let go.
    pub fn acquire(
        self: &Arc<Self>,
        device: &Device,
        interface: u8,
        wait: Duration,
    ) -> Result<ClaimLease, TransportError> {
        let key = (device.handle.clone(), interface);
        let held = lock(&self.held);
        let (mut held, timeout) = self
            .released
            .wait_timeout_while(held, wait, |held| held.contains(&key))
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if timeout.timed_out() && held.contains(&key) {
            return Err(TransportError::InterfaceBusy { interface });
        }
        held.insert(key.clone());
        Ok(ClaimLease {
            arbiter: Arc::clone(self),
            key,
        })
    }

    /// Whether anyone currently holds `interface` on `device`.
    pub fn is_held(&self, device: &Device, interface: u8) -> bool {
        lock(&self.held).contains(&(device.handle.clone(), interface))
    }
}

/// Exclusive right to claim one interface. Released on drop.
pub struct ClaimLease {
    arbiter: Arc<ClaimArbiter>,
    key: ClaimKey,
}

impl Drop for ClaimLease {
    fn drop(&mut self) {
        lock(&self.arbiter.held).remove(&self.key);
        self.arbiter.released.notify_all();
    }
}

/// An open connection, closed exactly once on [`close`](Self::close) or drop.
pub struct Connection<C: UsbConnection> {
    inner: C,
    device: Device,
    closed: bool,
}

impl<C: UsbConnection> Connection<C> {
    #[instrument(level = "debug", skip(backend, device), fields(handle = %device.handle))]
    pub fn open<B: UsbBackend<Connection = C>>(
        backend: &B,
        device: &Device,
    ) -> Result<Self, TransportError> {
        let inner = backend.open(device)?;
        debug!("Connection opened");
        Ok(Self {
            inner,
            device: device.clone(),
            closed: false,
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Lease and claim `interface`. The claim is released when the returned
    /// guard drops.
    pub fn claim(
        &mut self,
        arbiter: &Arc<ClaimArbiter>,
        interface: u8,
        wait: Duration,
    ) -> Result<ClaimedInterface<'_, C>, TransportError> {
        let lease = arbiter.acquire(&self.device, interface, wait)?;
        self.inner.claim_interface(interface)?;
        Ok(ClaimedInterface {
            conn: &mut self.inner,
            interface,
            _lease: lease,
        })
    }

    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if !self.closed {
            self.closed = true;
            self.inner.close();
            debug!(handle = %self.device.handle, "Connection closed");
        }
    }
}

impl<C: UsbConnection> Drop for Connection<C> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A claimed interface. Releases the physical claim, then the lease.
pub struct ClaimedInterface<'c, C: UsbConnection> {
    conn: &'c mut C,
    interface: u8,
    _lease: ClaimLease,
}

impl<C: UsbConnection> ClaimedInterface<'_, C> {
    pub fn interface(&self) -> u8 {
        self.interface
    }

    pub fn bulk_in(
        &mut self,
        endpoint: &EndpointDescriptor,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        self.conn.bulk_in(endpoint, endpoint.max_packet_size, timeout)
    }

    pub fn bulk_out(
        &mut self,
        endpoint: &EndpointDescriptor,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        self.conn.bulk_out(endpoint, data, timeout)
    }
}

impl<C: UsbConnection> Drop for ClaimedInterface<'_, C> {
    fn drop(&mut self) {
        if let Err(e) = self.conn.release_interface(self.interface) {
            warn!(interface = self.interface, error = %e, "Failed to release interface");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MockBackend, MockDevice};
    use std::thread;
    use std::time::Instant;

    fn setup() -> (MockBackend, Device) {
        let mock = MockBackend::new();
        mock.add_device(MockDevice::new(0x0483, 0x5740).with_endpoint(EndpointDescriptor::bulk(0x81, 64)));
        let device = mock.enumerate().unwrap().remove(0);
        (mock, device)
    }

    #[test]
    fn test_lease_excludes_second_holder() {
        let (_mock, device) = setup();
        let arbiter = ClaimArbiter::new();

        let lease = arbiter.acquire(&device, 0, Duration::ZERO).unwrap();
        assert!(arbiter.is_held(&device, 0));
        let busy = arbiter.acquire(&device, 0, Duration::from_millis(20));
        assert!(matches!(busy, Err(TransportError::InterfaceBusy { interface: 0 })));

        // A different interface is independent.
        assert!(arbiter.acquire(&device, 1, Duration::ZERO).is_ok());

        drop(lease);
        assert!(!arbiter.is_held(&device, 0));
        assert!(arbiter.acquire(&device, 0, Duration::ZERO).is_ok());
    }

    #[test]
    fn test_waiter_gets_lease_after_release() {
        let (_mock, device) = setup();
        let arbiter = ClaimArbiter::new();
        let lease = arbiter.acquire(&device, 0, Duration::ZERO).unwrap();

        let waiter = {
            let arbiter = arbiter.clone();
            let device = device.clone();
            thread::spawn(move || {
                let start = Instant::now();
                let lease = arbiter.acquire(&device, 0, Duration::from_secs(5));
                (lease.is_ok(), start.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(30));
        drop(lease);

        let (acquired, waited) = waiter.join().unwrap();
        assert!(acquired);
        assert!(waited < Duration::from_secs(5));
    }

    #[test]
    fn test_claim_released_once_and_connection_closed_once() {
        let (mock, device) = setup();
        let arbiter = ClaimArbiter::new();

        let mut conn = Connection::open(&mock, &device).unwrap();
        {
            let claim = conn.claim(&arbiter, 0, Duration::ZERO).unwrap();
            assert_eq!(claim.interface(), 0);
            assert!(arbiter.is_held(&device, 0));
        }
        assert!(!arbiter.is_held(&device, 0));
        conn.close();

        let stats = mock.claim_stats();
        assert_eq!(stats.claims, 1);
        assert_eq!(stats.releases, 1);
        assert_eq!(mock.open_count(), 1);
        assert_eq!(mock.close_count(), 1);
    }

    #[test]
    fn test_failed_physical_claim_returns_lease() {
        let (mock, device) = setup();
        let arbiter = ClaimArbiter::new();
        let mut conn = Connection::open(&mock, &device).unwrap();

        mock.disconnect();
        assert!(conn.claim(&arbiter, 0, Duration::ZERO).is_err());
        assert!(!arbiter.is_held(&device, 0));
        drop(conn);
        assert_eq!(mock.close_count(), 1);
    }
}
