//! Mock USB backend for testing.
//!
//! Scripted devices, per-endpoint inbound data, captured writes and
//! instrumentation of every claim, open and close. Inbound data is keyed by
//! endpoint address only, so scripts are meant for one attached target.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use super::traits::{TransportError, UsbBackend, UsbConnection};
use crate::device::Device;
use crate::endpoint::EndpointDescriptor;
use crate::lock;
use crate::permission::{PermissionOutcome, PermissionResponder};

/// How the mock answers permission requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PermissionMode {
    /// Grant synchronously inside the request.
    #[default]
    Grant,
    /// Deny synchronously inside the request.
    Deny,
    /// Hold the request until `resolve_pending` or `drop_pending`.
    Manual,
}

/// One scripted result for a bulk IN transfer.
#[derive(Debug, Clone)]
pub enum MockRead {
    Data(Vec<u8>),
    Disconnect,
    Fail(String),
}

/// A device to attach to the mock bus.
#[derive(Debug, Clone)]
pub struct MockDevice {
    vid: u16,
    pid: u16,
    name: String,
    endpoints: Vec<(u8, EndpointDescriptor)>,
}

impl MockDevice {
    pub fn new(vid: u16, pid: u16) -> Self {
        Self {
            vid,
            pid,
            name: "Mock HID".to_string(),
            endpoints: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Add an endpoint on interface 0.
    pub fn with_endpoint(self, endpoint: EndpointDescriptor) -> Self {
        self.with_interface_endpoint(0, endpoint)
    }

    pub fn with_interface_endpoint(mut self, interface: u8, endpoint: EndpointDescriptor) -> Self {
        self.endpoints.push((interface, endpoint));
        self
    }
}

/// Claim instrumentation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClaimStats {
    pub claims: usize,
    pub releases: usize,
    /// Highest number of simultaneous claims seen on any one interface.
    pub max_concurrent: usize,
    /// Claims attempted while the interface was already claimed.
    pub double_claims: usize,
}

struct Attached {
    device: Device,
    endpoints: Vec<(u8, EndpointDescriptor)>,
    present: bool,
}

#[derive(Default)]
struct State {
    devices: Vec<Attached>,
    reads: HashMap<u8, VecDeque<MockRead>>,
    writes: Vec<(u8, Vec<u8>)>,
    permission: PermissionMode,
    pending: Vec<PermissionResponder>,
    denied: HashSet<String>,
    permission_requests: usize,
    opens: usize,
    closes: usize,
    failing_opens: usize,
    write_stall: Option<Duration>,
    stats: ClaimStats,
    active: HashMap<(String, u8), usize>,
}

impl State {
    fn attached(&self, handle: &str) -> Option<&Attached> {
        self.devices
            .iter()
            .find(|a| a.device.handle == handle && a.present)
    }

    fn endpoint(&self, handle: &str, interface: u8, address: u8) -> Result<(), TransportError> {
        let attached = self.attached(handle).ok_or(TransportError::Disconnected)?;
        if attached
            .endpoints
            .iter()
            .any(|(i, ep)| *i == interface && ep.address == address)
        {
            Ok(())
        } else {
            Err(TransportError::EndpointNotFound { address })
        }
    }
}

/// Mock backend. Clones share the same bus.
#[derive(Clone, Default)]
pub struct MockBackend {
    state: Arc<Mutex<State>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a device. Handles are assigned in attach order.
    pub fn add_device(&self, device: MockDevice) {
        let mut state = lock(&self.state);
        let handle = format!("mock:{}", state.devices.len() + 1);
        let interface_count = device
            .endpoints
            .iter()
            .map(|(i, _)| *i)
            .collect::<HashSet<_>>()
            .len()
            .max(1) as u8;
        state.devices.push(Attached {
            device: Device {
                vendor_id: device.vid,
                product_id: device.pid,
                handle,
                display_name: device.name,
                interface_count,
            },
            endpoints: device.endpoints,
            present: true,
        });
    }

    /// Queue data to be returned by the next bulk IN on `endpoint`.
    pub fn queue_read(&self, endpoint: u8, data: &[u8]) {
        self.queue_read_result(endpoint, MockRead::Data(data.to_vec()));
    }

    pub fn queue_read_result(&self, endpoint: u8, result: MockRead) {
        lock(&self.state)
            .reads
            .entry(endpoint)
            .or_default()
            .push_back(result);
    }

    /// Scripted reads not yet consumed on `endpoint`.
    pub fn pending_reads(&self, endpoint: u8) -> usize {
        lock(&self.state).reads.get(&endpoint).map_or(0, VecDeque::len)
    }

    /// Get all captured writes as (endpoint, data).
    pub fn writes(&self) -> Vec<(u8, Vec<u8>)> {
        lock(&self.state).writes.clone()
    }

    /// Simulate every device detaching.
    pub fn disconnect(&self) {
        for attached in lock(&self.state).devices.iter_mut() {
            attached.present = false;
        }
    }

    /// Simulate every device re-attaching at its old handle.
    pub fn reconnect(&self) {
        for attached in lock(&self.state).devices.iter_mut() {
            attached.present = true;
        }
    }

    /// Remove an endpoint from every device, as if it was reconfigured.
    pub fn remove_endpoint(&self, address: u8) {
        for attached in lock(&self.state).devices.iter_mut() {
            attached.endpoints.retain(|(_, ep)| ep.address != address);
        }
    }

    pub fn set_permission_mode(&self, mode: PermissionMode) {
        lock(&self.state).permission = mode;
    }

    /// Answer every held request. Returns how many were answered.
    pub fn resolve_pending(&self, outcome: PermissionOutcome) -> usize {
        let pending = {
            let mut state = lock(&self.state);
            let pending: Vec<_> = state.pending.drain(..).collect();
            for responder in &pending {
                let handle = responder.device_handle().to_string();
                match outcome {
                    PermissionOutcome::Granted => state.denied.remove(&handle),
                    PermissionOutcome::Denied => state.denied.insert(handle),
                };
            }
            pending
        };
        let count = pending.len();
        for responder in pending {
            responder.resolve(outcome);
        }
        count
    }

    /// Drop every held request without answering.
    pub fn drop_pending(&self) {
        let pending: Vec<_> = lock(&self.state).pending.drain(..).collect();
        drop(pending);
    }

    pub fn permission_requests(&self) -> usize {
        lock(&self.state).permission_requests
    }

    /// Fail the next `count` opens with `OpenFailed`.
    pub fn fail_next_opens(&self, count: usize) {
        lock(&self.state).failing_opens = count;
    }

    /// Make every bulk OUT take `stall` before completing.
    pub fn stall_writes(&self, stall: Option<Duration>) {
        lock(&self.state).write_stall = stall;
    }

    pub fn open_count(&self) -> usize {
        lock(&self.state).opens
    }

    pub fn close_count(&self) -> usize {
        lock(&self.state).closes
    }

    pub fn claim_stats(&self) -> ClaimStats {
        lock(&self.state).stats.clone()
    }

    /// Claims currently held across all interfaces.
    pub fn active_claims(&self) -> usize {
        lock(&self.state).active.values().sum()
    }
}

impl UsbBackend for MockBackend {
    type Connection = MockConnection;

    fn enumerate(&self) -> Result<Vec<Device>, TransportError> {
        Ok(lock(&self.state)
            .devices
            .iter()
            .filter(|a| a.present)
            .map(|a| a.device.clone())
            .collect())
    }

    fn interface_endpoints(
        &self,
        device: &Device,
        interface: u8,
    ) -> Result<Vec<EndpointDescriptor>, TransportError> {
        let state = lock(&self.state);
        let attached = state
            .attached(&device.handle)
            .ok_or(TransportError::Disconnected)?;
        Ok(attached
            .endpoints
            .iter()
            .filter(|(i, _)| *i == interface)
            .map(|(_, ep)| *ep)
            .collect())
    }

    fn request_permission(&self, device: &Device, responder: PermissionResponder) {
        let outcome = {
            let mut state = lock(&self.state);
            state.permission_requests += 1;
            match state.permission {
                PermissionMode::Grant => {
                    state.denied.remove(&device.handle);
                    PermissionOutcome::Granted
                }
                PermissionMode::Deny => {
                    state.denied.insert(device.handle.clone());
                    PermissionOutcome::Denied
                }
                PermissionMode::Manual => {
                    state.pending.push(responder);
                    return;
                }
            }
        };
        responder.resolve(outcome);
    }

    fn open(&self, device: &Device) -> Result<MockConnection, TransportError> {
        let mut state = lock(&self.state);
        if state.failing_opens > 0 {
            state.failing_opens -= 1;
            return Err(TransportError::OpenFailed("injected failure".into()));
        }
        if state.attached(&device.handle).is_none() {
            return Err(TransportError::DeviceNotFound {
                vid: device.vendor_id,
                pid: device.product_id,
            });
        }
        if state.denied.contains(&device.handle) {
            return Err(TransportError::PermissionDenied(device.handle.clone()));
        }
        state.opens += 1;
        Ok(MockConnection {
            state: self.state.clone(),
            handle: device.handle.clone(),
            claimed: None,
        })
    }
}

pub struct MockConnection {
    state: Arc<Mutex<State>>,
    handle: String,
    claimed: Option<u8>,
}

impl MockConnection {
    fn claimed_interface(&self) -> Result<u8, TransportError> {
        self.claimed
            .ok_or_else(|| TransportError::ReadFailed("interface not claimed".into()))
    }
}

impl UsbConnection for MockConnection {
    fn claim_interface(&mut self, interface: u8) -> Result<(), TransportError> {
        if let Some(held) = self.claimed {
            return Err(TransportError::ClaimInterfaceFailed {
                interface,
                message: format!("interface {} already claimed", held),
            });
        }
        let mut state = lock(&self.state);
        if state.attached(&self.handle).is_none() {
            return Err(TransportError::Disconnected);
        }
        let key = (self.handle.clone(), interface);
        let holders = *state.active.get(&key).unwrap_or(&0);
        if holders > 0 {
            state.stats.double_claims += 1;
            return Err(TransportError::ClaimInterfaceFailed {
                interface,
                message: "held by another connection".into(),
            });
        }
        state.active.insert(key, holders + 1);
        state.stats.claims += 1;
        state.stats.max_concurrent = state.stats.max_concurrent.max(holders + 1);
        self.claimed = Some(interface);
        Ok(())
    }

    fn release_interface(&mut self, interface: u8) -> Result<(), TransportError> {
        if self.claimed != Some(interface) {
            return Ok(());
        }
        let mut state = lock(&self.state);
        if let Some(holders) = state.active.get_mut(&(self.handle.clone(), interface)) {
            *holders = holders.saturating_sub(1);
        }
        state.stats.releases += 1;
        self.claimed = None;
        Ok(())
    }

    fn bulk_in(
        &mut self,
        endpoint: &EndpointDescriptor,
        max_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let interface = self.claimed_interface()?;
        let next = {
            let mut state = lock(&self.state);
            state.endpoint(&self.handle, interface, endpoint.address)?;
            state
                .reads
                .get_mut(&endpoint.address)
                .and_then(VecDeque::pop_front)
        };
        match next {
            Some(MockRead::Data(mut data)) => {
                data.truncate(max_len);
                Ok(data)
            }
            Some(MockRead::Disconnect) => Err(TransportError::Disconnected),
            Some(MockRead::Fail(message)) => Err(TransportError::ReadFailed(message)),
            None => {
                thread::sleep(timeout);
                Err(TransportError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    fn bulk_out(
        &mut self,
        endpoint: &EndpointDescriptor,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        let interface = self.claimed_interface()?;
        let stall = {
            let state = lock(&self.state);
            state.endpoint(&self.handle, interface, endpoint.address)?;
            state.write_stall
        };
        if let Some(stall) = stall {
            if stall > timeout {
                thread::sleep(timeout);
                return Err(TransportError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            thread::sleep(stall);
        }
        lock(&self.state)
            .writes
            .push((endpoint.address, data.to_vec()));
        Ok(data.len())
    }

    fn close(&mut self) {
        lock(&self.state).closes += 1;
    }
}
