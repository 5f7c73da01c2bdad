//! Background polling reads.
//!
//! A [`ReadWorker`] owns one thread that polls one or more bulk-in endpoints
//! of the bound device. The connection is held for the worker's lifetime,
//! but the interface is claimed only around each transfer so that writes
//! and sibling workers get their turn between polls.

use std::collections::HashSet;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::bridge::BridgeContext;
use crate::connection::Connection;
use crate::device::{Device, DeviceLocator};
use crate::endpoint::EndpointDescriptor;
use crate::error::{BridgeError, Disposition};
use crate::events::{BridgeEvent, BridgeObserver};
use crate::lock;
use crate::queue::PushOutcome;
use crate::state::{BridgeState, ReaderState};
use crate::transport::{TransportError, UsbBackend};

/// Cooperative stop flag with interruptible sleeps.
#[derive(Default)]
pub struct StopSignal {
    raised: Mutex<bool>,
    wake: Condvar,
}

impl StopSignal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn raise(&self) {
        *lock(&self.raised) = true;
        self.wake.notify_all();
    }

    pub fn is_raised(&self) -> bool {
        *lock(&self.raised)
    }

    /// Sleep for `duration` or until raised. Returns true if raised.
    pub fn sleep(&self, duration: Duration) -> bool {
        let guard = lock(&self.raised);
        let (guard, _) = self
            .wake
            .wait_timeout_while(guard, duration, |raised| !*raised)
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard
    }
}

/// Handle to a running reader thread.
pub struct ReadWorker {
    endpoints: Vec<u8>,
    state: Arc<Mutex<ReaderState>>,
    handle: Option<JoinHandle<Result<(), BridgeError>>>,
}

impl ReadWorker {
    /// Start polling `endpoints` until `stop` is raised.
    pub(crate) fn spawn<B, O>(
        ctx: Arc<BridgeContext<B, O>>,
        endpoints: Vec<EndpointDescriptor>,
        stop: Arc<StopSignal>,
    ) -> io::Result<Self>
    where
        B: UsbBackend,
        O: BridgeObserver + 'static,
    {
        let addresses: Vec<u8> = endpoints.iter().map(|ep| ep.address).collect();
        let label = addresses.first().copied().unwrap_or_default();
        let state = Arc::new(Mutex::new(ReaderState::NoDevice));

        let mut read_loop = ReadLoop {
            ctx,
            endpoints,
            label,
            stop,
            state: state.clone(),
            conn: None,
            announced: HashSet::new(),
        };
        let handle = thread::Builder::new()
            .name(format!("hidbridge-ep{:02x}", label))
            .spawn(move || read_loop.main())?;

        Ok(Self {
            endpoints: addresses,
            state,
            handle: Some(handle),
        })
    }

    /// Addresses of the endpoints this worker polls.
    pub fn endpoints(&self) -> &[u8] {
        &self.endpoints
    }

    pub fn state(&self) -> ReaderState {
        *lock(&self.state)
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Wait for the thread to exit. `Err` means it terminated on a fatal error.
    pub fn join(mut self) -> Result<(), BridgeError> {
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .unwrap_or_else(|_| Err(BridgeError::Fatal("reader thread panicked".into()))),
            None => Ok(()),
        }
    }
}

struct ReadLoop<B: UsbBackend, O: BridgeObserver + 'static> {
    ctx: Arc<BridgeContext<B, O>>,
    endpoints: Vec<EndpointDescriptor>,
    /// Endpoint used to tag this worker's events.
    label: u8,
    stop: Arc<StopSignal>,
    state: Arc<Mutex<ReaderState>>,
    conn: Option<Connection<B::Connection>>,
    announced: HashSet<u8>,
}

impl<B: UsbBackend, O: BridgeObserver + 'static> ReadLoop<B, O> {
    fn main(&mut self) -> Result<(), BridgeError> {
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.run()))
            .unwrap_or_else(|_| Err(BridgeError::Fatal("reader panicked".into())));

        self.set_state(ReaderState::Stopping);
        self.drop_connection();
        self.set_state(ReaderState::Closed);

        match &result {
            Ok(()) => {
                info!(endpoint = %format!("0x{:02X}", self.label), "Reader exited");
                self.ctx.emit(BridgeEvent::ReaderStopped { endpoint: self.label });
            }
            Err(e) => self.ctx.emit(BridgeEvent::ReaderFailed {
                endpoint: self.label,
                message: e.to_string(),
            }),
        }
        result
    }

    fn run(&mut self) -> Result<(), BridgeError> {
        let policy = self.ctx.config.retry_policy();
        let interval = self.ctx.config.poll_interval();

        while !self.stop.is_raised() {
            let pause = match self.poll() {
                Ok(()) => interval,
                Err(err) => match policy.disposition(&err) {
                    Disposition::Benign => interval,
                    Disposition::Retry { backoff } => {
                        self.recover(&err);
                        self.ctx.emit(BridgeEvent::ReaderRetry {
                            endpoint: self.label,
                            reason: err.to_string(),
                            backoff_ms: backoff.as_millis() as u64,
                        });
                        backoff
                    }
                    Disposition::Fatal => return Err(err),
                },
            };
            if self.stop.sleep(pause) {
                break;
            }
        }
        Ok(())
    }

    /// One pass over every endpoint of this worker.
    fn poll(&mut self) -> Result<(), BridgeError> {
        let bound = match self.ctx.binding() {
            Some(bound) => bound,
            None => {
                self.set_state(ReaderState::NoDevice);
                self.ctx.open();
                self.ctx.binding().ok_or(BridgeError::DeviceNotFound {
                    vid: self.ctx.config.vendor_id,
                    pid: self.ctx.config.product_id,
                })?
            }
        };
        if !bound.authorized {
            return Err(BridgeError::PermissionDenied(bound.device.handle.clone()));
        }

        let stale = self
            .conn
            .as_ref()
            .is_some_and(|c| !c.device().same_attachment(&bound.device));
        if stale {
            self.drop_connection();
        }
        if self.conn.is_none() {
            self.conn = Some(Connection::open(&self.ctx.backend, &bound.device)?);
            self.set_state(ReaderState::Connected);
            self.ctx
                .advance(&[BridgeState::Authorized], BridgeState::Connected);
        }

        let interface = bound.endpoints.interface;
        let claim_timeout = self.ctx.config.claim_timeout();
        let read_timeout = self.ctx.config.read_timeout();
        let Some(conn) = self.conn.as_mut() else {
            return Ok(());
        };

        for endpoint in &self.endpoints {
            if self.stop.is_raised() {
                break;
            }
            let mut claim = match conn.claim(&self.ctx.arbiter, interface, claim_timeout) {
                Ok(claim) => claim,
                Err(TransportError::InterfaceBusy { .. }) => {
                    debug!(endpoint = %format!("0x{:02X}", endpoint.address), "Interface busy, skipping poll");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            if self.announced.insert(endpoint.address) {
                self.ctx.emit(BridgeEvent::ReaderStarted {
                    endpoint: endpoint.address,
                });
            }
            let read = claim.bulk_in(endpoint, read_timeout);
            drop(claim);

            match read {
                Ok(data) => {
                    let outcome = self.ctx.queue.push(endpoint.address, data.clone());
                    if outcome != PushOutcome::Rejected {
                        self.ctx.emit(BridgeEvent::FrameReceived {
                            endpoint: endpoint.address,
                            data,
                        });
                    }
                    if outcome.dropped() {
                        self.ctx.emit(BridgeEvent::FrameDropped {
                            policy: self.ctx.queue.policy(),
                            total_dropped: self.ctx.queue.dropped(),
                        });
                    }
                }
                Err(TransportError::Timeout { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }

        self.set_state(ReaderState::Polling);
        self.ctx.advance(
            &[BridgeState::Authorized, BridgeState::Connected],
            BridgeState::Reading,
        );
        Ok(())
    }

    /// Drop the connection after a transient failure and unbind the device
    /// if it is gone.
    fn recover(&mut self, err: &BridgeError) {
        let device: Option<Device> = self
            .conn
            .as_ref()
            .map(|c| c.device().clone())
            .or_else(|| self.ctx.binding().map(|bound| bound.device));
        self.drop_connection();

        let next = match err {
            BridgeError::DeviceNotFound { .. } | BridgeError::NotOpen => ReaderState::NoDevice,
            BridgeError::PermissionDenied(_) => ReaderState::PermissionFailed,
            _ => ReaderState::ConnectFailed,
        };
        self.set_state(next);

        let vanished = matches!(
            err,
            BridgeError::TransientRace(_) | BridgeError::DeviceNotFound { .. }
        );
        if let (true, Some(device)) = (vanished, device) {
            match DeviceLocator::new(&self.ctx.backend).is_present(&device) {
                Ok(false) => self.ctx.unbind(&device),
                Ok(true) => {}
                Err(e) => warn!(error = %e, "Presence check failed"),
            }
        }
    }

    fn drop_connection(&mut self) {
        if let Some(conn) = self.conn.take() {
            conn.close();
        }
    }

    fn set_state(&self, next: ReaderState) {
        let mut state = lock(&self.state);
        if *state != next {
            debug!(endpoint = %format!("0x{:02X}", self.label), from = %*state, to = %next, "Reader state");
            *state = next;
        }
    }
}
