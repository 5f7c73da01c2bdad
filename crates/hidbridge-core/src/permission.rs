//! Access negotiation.
//!
//! The platform answers a permission request asynchronously. The answer is
//! carried by a [`PermissionResponder`] handed to the backend, which fills a
//! shared one-shot [`PermissionTicket`] and runs the completion callback
//! registered by the caller.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tracing::{debug, warn};

use crate::device::Device;
use crate::lock;
use crate::transport::UsbBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionOutcome {
    Granted,
    Denied,
}

impl fmt::Display for PermissionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PermissionOutcome::Granted => write!(f, "granted"),
            PermissionOutcome::Denied => write!(f, "denied"),
        }
    }
}

/// One-shot outcome cell. Clones observe the same outcome.
#[derive(Clone, Default)]
pub struct PermissionTicket {
    cell: Arc<(Mutex<Option<PermissionOutcome>>, Condvar)>,
}

impl PermissionTicket {
    fn new() -> Self {
        Self::default()
    }

    fn resolved(outcome: PermissionOutcome) -> Self {
        let ticket = Self::new();
        ticket.complete(outcome);
        ticket
    }

    /// First completion wins; later ones are ignored.
    fn complete(&self, outcome: PermissionOutcome) -> bool {
        let (slot, ready) = &*self.cell;
        let mut slot = lock(slot);
        if slot.is_some() {
            return false;
        }
        *slot = Some(outcome);
        ready.notify_all();
        true
    }

    /// The outcome, if it has arrived.
    pub fn outcome(&self) -> Option<PermissionOutcome> {
        *lock(&self.cell.0)
    }

    /// Block until the outcome arrives or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> Option<PermissionOutcome> {
        let (slot, ready) = &*self.cell;
        let guard = lock(slot);
        let (guard, _) = ready
            .wait_timeout_while(guard, timeout, |outcome| outcome.is_none())
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard
    }
}

impl fmt::Debug for PermissionTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PermissionTicket")
            .field("outcome", &self.outcome())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessStatus {
    Pending,
    Granted,
    Denied,
}

struct AccessRecord {
    handle: String,
    status: AccessStatus,
    ticket: PermissionTicket,
}

type Completion = Box<dyn FnOnce(PermissionOutcome) + Send>;

/// Completes a single permission request.
///
/// Dropping an unresolved responder counts as a denial, so a backend can
/// never leave the bridge waiting forever.
pub struct PermissionResponder {
    handle: String,
    ticket: PermissionTicket,
    record: Arc<Mutex<Option<AccessRecord>>>,
    on_resolved: Option<Completion>,
}

impl PermissionResponder {
    /// The platform handle of the device this request concerns.
    pub fn device_handle(&self) -> &str {
        &self.handle
    }

    pub fn resolve(mut self, outcome: PermissionOutcome) {
        self.finish(outcome);
    }

    fn finish(&mut self, outcome: PermissionOutcome) {
        let Some(on_resolved) = self.on_resolved.take() else {
            return;
        };
        {
            let mut record = lock(&self.record);
            if let Some(rec) = record.as_mut().filter(|r| r.handle == self.handle) {
                rec.status = match outcome {
                    PermissionOutcome::Granted => AccessStatus::Granted,
                    PermissionOutcome::Denied => AccessStatus::Denied,
                };
            }
        }
        self.ticket.complete(outcome);
        debug!(handle = %self.handle, %outcome, "Permission resolved");
        on_resolved(outcome);
    }
}

impl Drop for PermissionResponder {
    fn drop(&mut self) {
        if self.on_resolved.is_some() {
            warn!(handle = %self.handle, "Permission request dropped unanswered, treating as denied");
            self.finish(PermissionOutcome::Denied);
        }
    }
}

/// Result of [`PermissionGate::request_access`].
#[derive(Debug, Clone)]
pub enum AccessRequest {
    /// Access was already granted; nothing was sent to the platform.
    AlreadyGranted,
    /// A request for this device is in flight; nothing new was sent.
    AlreadyPending(PermissionTicket),
    /// A new request was issued.
    Issued(PermissionTicket),
}

impl AccessRequest {
    pub fn ticket(&self) -> PermissionTicket {
        match self {
            AccessRequest::AlreadyGranted => PermissionTicket::resolved(PermissionOutcome::Granted),
            AccessRequest::AlreadyPending(ticket) | AccessRequest::Issued(ticket) => ticket.clone(),
        }
    }
}

/// Tracks the access decision for the bound device.
#[derive(Default)]
pub struct PermissionGate {
    record: Arc<Mutex<Option<AccessRecord>>>,
}

impl PermissionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request access to `device`.
    ///
    /// `on_resolved` runs once when a newly issued request completes. It is
    /// not run for `AlreadyGranted` or `AlreadyPending`. A previously denied
    /// device is asked again.
    pub fn request_access<B: UsbBackend>(
        &self,
        backend: &B,
        device: &Device,
        on_resolved: impl FnOnce(PermissionOutcome) + Send + 'static,
    ) -> AccessRequest {
        let ticket = {
            let mut record = lock(&self.record);
            if let Some(rec) = record.as_ref().filter(|r| r.handle == device.handle) {
                match rec.status {
                    AccessStatus::Granted => return AccessRequest::AlreadyGranted,
                    AccessStatus::Pending => return AccessRequest::AlreadyPending(rec.ticket.clone()),
                    AccessStatus::Denied => {}
                }
            }
            let ticket = PermissionTicket::new();
            *record = Some(AccessRecord {
                handle: device.handle.clone(),
                status: AccessStatus::Pending,
                ticket: ticket.clone(),
            });
            ticket
        };

        let responder = PermissionResponder {
            handle: device.handle.clone(),
            ticket: ticket.clone(),
            record: self.record.clone(),
            on_resolved: Some(Box::new(on_resolved)),
        };
        backend.request_permission(device, responder);
        AccessRequest::Issued(ticket)
    }

    /// Current decision for `device`, if any was requested.
    pub fn status(&self, device: &Device) -> Option<AccessStatus> {
        lock(&self.record)
            .as_ref()
            .filter(|r| r.handle == device.handle)
            .map(|r| r.status)
    }

    /// Ticket of the latest request, if any.
    pub fn ticket(&self) -> Option<PermissionTicket> {
        lock(&self.record).as_ref().map(|r| r.ticket.clone())
    }

    /// Forget any decision, e.g. once the device detaches.
    pub fn forget(&self) {
        *lock(&self.record) = None;
    }
}
