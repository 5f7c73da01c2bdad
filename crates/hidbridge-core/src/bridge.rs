//! Bridge - the orchestrator.
//!
//! Owns the binding to the target device, the received queue and the read
//! workers, and exposes the write path. All state transitions happen under
//! one lock; events are emitted after it is released.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tracing::{debug, info, instrument};

use crate::config::{BridgeConfig, ReaderMode};
use crate::connection::ClaimArbiter;
use crate::device::{Device, DeviceLocator};
use crate::endpoint::{EndpointClassifier, EndpointDescriptor, EndpointSet};
use crate::error::BridgeError;
use crate::events::{BridgeEvent, BridgeObserver, LogLevel, TracingObserver};
use crate::lock;
use crate::permission::{AccessRequest, AccessStatus, PermissionGate, PermissionOutcome};
use crate::queue::{Frame, ReceivedQueue};
use crate::state::{BridgeState, ReaderState};
use crate::transport::UsbBackend;
use crate::worker::{ReadWorker, StopSignal};
use crate::write::{WriteReport, write_frame};

#[derive(Default)]
struct Binding {
    state: BridgeState,
    device: Option<Device>,
    endpoints: EndpointSet,
}

impl Binding {
    fn transition(&mut self, to: BridgeState) -> Option<BridgeEvent> {
        let from = self.state;
        if from == to || from == BridgeState::Closed {
            return None;
        }
        self.state = to;
        Some(BridgeEvent::StateChanged { from, to })
    }

    fn advance(&mut self, from: &[BridgeState], to: BridgeState) -> Option<BridgeEvent> {
        if from.contains(&self.state) {
            self.transition(to)
        } else {
            None
        }
    }
}

/// Snapshot of the bound device.
pub(crate) struct Bound {
    pub device: Device,
    pub endpoints: EndpointSet,
    pub authorized: bool,
}

/// State shared between the bridge, its workers and permission callbacks.
pub(crate) struct BridgeContext<B: UsbBackend, O: BridgeObserver + 'static> {
    pub(crate) backend: B,
    pub(crate) config: BridgeConfig,
    pub(crate) queue: ReceivedQueue,
    pub(crate) arbiter: Arc<ClaimArbiter>,
    observer: Arc<O>,
    gate: PermissionGate,
    binding: Mutex<Binding>,
    me: Weak<Self>,
}

impl<B: UsbBackend, O: BridgeObserver + 'static> BridgeContext<B, O> {
    pub(crate) fn emit(&self, event: BridgeEvent) {
        self.observer.on_event(&event);
    }

    fn emit_all(&self, events: impl IntoIterator<Item = Option<BridgeEvent>>) {
        for event in events.into_iter().flatten() {
            self.emit(event);
        }
    }

    pub(crate) fn state(&self) -> BridgeState {
        lock(&self.binding).state
    }

    /// Move to `to` if the current state is one of `from`.
    pub(crate) fn advance(&self, from: &[BridgeState], to: BridgeState) -> bool {
        let event = lock(&self.binding).advance(from, to);
        let moved = event.is_some();
        self.emit_all([event]);
        moved
    }

    pub(crate) fn binding(&self) -> Option<Bound> {
        let binding = lock(&self.binding);
        binding.device.clone().map(|device| Bound {
            device,
            endpoints: binding.endpoints.clone(),
            authorized: binding.state.is_authorized(),
        })
    }

    /// Locate, classify and request access. True iff the device was found.
    #[instrument(level = "debug", skip(self), fields(vid = format!("{:04X}", self.config.vendor_id), pid = format!("{:04X}", self.config.product_id)))]
    pub(crate) fn open(&self) -> bool {
        let (vid, pid) = (self.config.vendor_id, self.config.product_id);
        if self.state() == BridgeState::Closed {
            self.emit(BridgeEvent::log(LogLevel::Warn, "Bridge is closed"));
            return false;
        }

        let found = match DeviceLocator::new(&self.backend).locate(vid, pid) {
            Ok(found) => found,
            Err(e) => {
                self.emit(BridgeEvent::log(
                    LogLevel::Error,
                    format!("Device enumeration failed: {}", e),
                ));
                return false;
            }
        };
        let Some(device) = found else {
            self.emit(BridgeEvent::DeviceNotFound { vid, pid });
            if let Some(stale) = self.binding() {
                self.unbind(&stale.device);
            }
            return false;
        };
        self.emit(BridgeEvent::DeviceLocated {
            vid,
            pid,
            handle: device.handle.clone(),
            name: device.display_name.clone(),
            interfaces: device.interface_count,
        });

        let known = lock(&self.binding)
            .device
            .as_ref()
            .is_some_and(|d| d.same_attachment(&device));
        if !known {
            let interface = self.config.interface_number;
            let endpoints = EndpointClassifier::new(&self.backend)
                .classify(&device, interface)
                .unwrap_or_else(|e| {
                    self.emit(BridgeEvent::log(
                        LogLevel::Warn,
                        format!("Cannot read endpoints of interface {}: {}", interface, e),
                    ));
                    EndpointSet {
                        interface,
                        ..Default::default()
                    }
                });
            self.emit(BridgeEvent::EndpointsClassified {
                interface,
                bulk_in: endpoints.in_addresses(),
                bulk_out: endpoints.out_addresses(),
            });

            let event = {
                let mut binding = lock(&self.binding);
                binding.device = Some(device.clone());
                binding.endpoints = endpoints;
                binding.transition(BridgeState::Located)
            };
            self.emit_all([event]);
        }

        self.authorize(&device);
        true
    }

    fn authorize(&self, device: &Device) {
        if !matches!(
            self.gate.status(device),
            Some(AccessStatus::Granted | AccessStatus::Pending)
        ) {
            self.advance(&[BridgeState::Located], BridgeState::PermissionRequested);
            self.emit(BridgeEvent::PermissionRequested {
                vid: device.vendor_id,
                pid: device.product_id,
            });
        }

        let me = self.me.clone();
        let handle = device.handle.clone();
        let request = self.gate.request_access(&self.backend, device, move |outcome| {
            if let Some(ctx) = me.upgrade() {
                ctx.apply_permission(&handle, outcome);
            }
        });
        if let AccessRequest::AlreadyGranted = request {
            self.advance(
                &[BridgeState::Located, BridgeState::PermissionRequested],
                BridgeState::Authorized,
            );
        }
    }

    /// Completion of a permission request, possibly on another thread.
    fn apply_permission(&self, handle: &str, outcome: PermissionOutcome) {
        let event = {
            let mut binding = lock(&self.binding);
            if binding.device.as_ref().is_none_or(|d| d.handle != handle) {
                None
            } else {
                match outcome {
                    PermissionOutcome::Granted => binding.advance(
                        &[BridgeState::Located, BridgeState::PermissionRequested],
                        BridgeState::Authorized,
                    ),
                    PermissionOutcome::Denied => {
                        binding.advance(&[BridgeState::PermissionRequested], BridgeState::Located)
                    }
                }
            }
        };
        self.emit(BridgeEvent::PermissionResolved { outcome });
        self.emit_all([event]);
    }

    /// Forget `device` if it is still the bound one.
    pub(crate) fn unbind(&self, device: &Device) {
        let event = {
            let mut binding = lock(&self.binding);
            if !binding
                .device
                .as_ref()
                .is_some_and(|d| d.same_attachment(device))
            {
                return;
            }
            binding.device = None;
            binding.endpoints = EndpointSet::default();
            binding.transition(BridgeState::Idle)
        };
        self.gate.forget();
        self.emit(BridgeEvent::DeviceDetached {
            vid: device.vendor_id,
            pid: device.product_id,
        });
        self.emit_all([event]);
    }

    fn shut(&self) {
        let event = {
            let mut binding = lock(&self.binding);
            binding.device = None;
            binding.endpoints = EndpointSet::default();
            binding.transition(BridgeState::Closed)
        };
        self.gate.forget();
        self.emit_all([event]);
    }
}

struct Readers {
    stop: Arc<StopSignal>,
    workers: Vec<ReadWorker>,
}

/// USB bulk bridge bound to one device.
///
/// All methods take `&self`; a bridge can be shared between the thread that
/// writes and the thread that drains the queue.
pub struct Bridge<B: UsbBackend, O: BridgeObserver + 'static = TracingObserver> {
    ctx: Arc<BridgeContext<B, O>>,
    readers: Mutex<Readers>,
}

impl<B: UsbBackend> Bridge<B, TracingObserver> {
    /// Create a bridge that logs through tracing.
    pub fn new(backend: B, config: BridgeConfig) -> Self {
        Self::with_observer(backend, config, Arc::new(TracingObserver))
    }
}

impl<B: UsbBackend, O: BridgeObserver + 'static> Bridge<B, O> {
    /// Create a bridge with a custom observer.
    pub fn with_observer(backend: B, config: BridgeConfig, observer: Arc<O>) -> Self {
        let queue = ReceivedQueue::new(config.queue_capacity, config.overflow_policy);
        let ctx = Arc::new_cyclic(|me| BridgeContext {
            backend,
            config,
            queue,
            arbiter: ClaimArbiter::new(),
            observer,
            gate: PermissionGate::new(),
            binding: Mutex::new(Binding::default()),
            me: me.clone(),
        });
        Self {
            ctx,
            readers: Mutex::new(Readers {
                stop: StopSignal::new(),
                workers: Vec::new(),
            }),
        }
    }

    /// Locate the device, classify its endpoints and request access.
    ///
    /// Returns true iff the device was found. The permission outcome arrives
    /// later; see [`wait_for_permission`](Self::wait_for_permission).
    pub fn open(&self) -> bool {
        self.ctx.open()
    }

    /// Block until the pending permission request resolves.
    ///
    /// `None` if nothing was requested or the timeout elapsed first.
    pub fn wait_for_permission(&self, timeout: Duration) -> Option<PermissionOutcome> {
        self.ctx.gate.ticket()?.wait(timeout)
    }

    /// Spawn read workers for the bound device's bulk-in endpoints.
    ///
    /// Returns the number of workers spawned: zero if workers are still
    /// alive, no device is bound, or there is nothing to read from.
    pub fn start_reading(&self) -> usize {
        if self.ctx.state() == BridgeState::Closed {
            return 0;
        }
        let mut readers = lock(&self.readers);
        if readers.workers.iter().any(|w| !w.is_finished()) {
            debug!("Readers already running");
            return 0;
        }
        for finished in readers.workers.drain(..) {
            let endpoint = finished.endpoints().first().copied().unwrap_or_default();
            if let Err(e) = finished.join() {
                debug!(endpoint = %format!("0x{:02X}", endpoint), error = %e, "Reaped failed reader");
            }
        }
        self.ctx
            .advance(&[BridgeState::Stopping], BridgeState::Authorized);

        let Some(bound) = self.ctx.binding() else {
            self.ctx.emit(BridgeEvent::log(
                LogLevel::Warn,
                BridgeError::NotOpen.to_string(),
            ));
            return 0;
        };
        if bound.endpoints.bulk_in.is_empty() {
            self.ctx.emit(BridgeEvent::log(
                LogLevel::Warn,
                BridgeError::NoEndpoints {
                    direction: "IN",
                    interface: bound.endpoints.interface,
                }
                .to_string(),
            ));
            return 0;
        }

        let groups: Vec<Vec<EndpointDescriptor>> = match self.ctx.config.reader_mode {
            ReaderMode::PerEndpoint => bound.endpoints.bulk_in.iter().map(|ep| vec![*ep]).collect(),
            ReaderMode::Sweep => vec![bound.endpoints.bulk_in.clone()],
        };

        let stop = StopSignal::new();
        for group in groups {
            match ReadWorker::spawn(self.ctx.clone(), group, stop.clone()) {
                Ok(worker) => readers.workers.push(worker),
                Err(e) => self.ctx.emit(BridgeEvent::log(
                    LogLevel::Error,
                    format!("Cannot start reader thread: {}", e),
                )),
            }
        }
        readers.stop = stop;

        let count = readers.workers.len();
        info!(count, mode = ?self.ctx.config.reader_mode, "Readers started");
        count
    }

    /// Signal every worker to stop. Does not wait for them.
    pub fn stop_reading(&self) {
        let readers = lock(&self.readers);
        if readers.workers.is_empty() {
            return;
        }
        readers.stop.raise();
        self.ctx.advance(
            &[
                BridgeState::Authorized,
                BridgeState::Connected,
                BridgeState::Reading,
            ],
            BridgeState::Stopping,
        );
    }

    /// Wait for every worker to exit. Call after [`stop_reading`](Self::stop_reading).
    ///
    /// One result per worker; `Err` for workers that terminated on a fatal
    /// error.
    pub fn join_readers(&self) -> Vec<Result<(), BridgeError>> {
        let workers: Vec<ReadWorker> = lock(&self.readers).workers.drain(..).collect();
        let results = workers.into_iter().map(ReadWorker::join).collect();
        self.ctx
            .advance(&[BridgeState::Stopping], BridgeState::Authorized);
        results
    }

    pub fn is_reading(&self) -> bool {
        lock(&self.readers).workers.iter().any(|w| !w.is_finished())
    }

    /// State of each worker, keyed by its first endpoint.
    pub fn reader_states(&self) -> Vec<(u8, ReaderState)> {
        lock(&self.readers)
            .workers
            .iter()
            .map(|w| (w.endpoints().first().copied().unwrap_or_default(), w.state()))
            .collect()
    }

    /// Write `data` to every bulk-out endpoint.
    ///
    /// True only if every endpoint accepted the whole frame.
    pub fn write(&self, data: &[u8]) -> bool {
        self.write_report(data)
            .is_ok_and(|report| report.all_succeeded())
    }

    /// Like [`write`](Self::write), with the per-endpoint results.
    pub fn write_report(&self, data: &[u8]) -> Result<WriteReport, BridgeError> {
        write_frame(&*self.ctx, data)
    }

    pub fn has_data(&self) -> bool {
        !self.ctx.queue.is_empty()
    }

    /// Bytes of the oldest received frame.
    pub fn pop_data(&self) -> Option<Vec<u8>> {
        self.ctx.queue.pop().map(Frame::into_data)
    }

    pub fn pop_frame(&self) -> Option<Frame> {
        self.ctx.queue.pop()
    }

    /// Wait up to `timeout` for a received frame.
    pub fn wait_for_data(&self, timeout: Duration) -> Option<Frame> {
        self.ctx.queue.pop_timeout(timeout)
    }

    pub fn queue(&self) -> &ReceivedQueue {
        &self.ctx.queue
    }

    pub fn state(&self) -> BridgeState {
        self.ctx.state()
    }

    pub fn device(&self) -> Option<Device> {
        self.ctx.binding().map(|b| b.device)
    }

    pub fn endpoints(&self) -> Option<EndpointSet> {
        self.ctx.binding().map(|b| b.endpoints)
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.ctx.config
    }

    /// Stop and join the readers, then close the bridge for good.
    pub fn close(&self) {
        if self.ctx.state() == BridgeState::Closed {
            return;
        }
        self.stop_reading();
        self.join_readers();
        self.ctx.shut();
    }
}

impl<B: UsbBackend, O: BridgeObserver + 'static> Drop for Bridge<B, O> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::LogSink;
    use crate::transport::{MockBackend, MockDevice, MockRead, PermissionMode, UsbConnection};
    use std::thread;
    use std::time::Instant;

    #[derive(Default)]
    struct CollectingObserver {
        events: Mutex<Vec<BridgeEvent>>,
    }

    impl BridgeObserver for CollectingObserver {
        fn on_event(&self, event: &BridgeEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    impl CollectingObserver {
        fn count(&self, pred: impl Fn(&BridgeEvent) -> bool) -> usize {
            self.events.lock().unwrap().iter().filter(|e| pred(e)).count()
        }
    }

    fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    fn test_config() -> BridgeConfig {
        BridgeConfig {
            vendor_id: 1155,
            product_id: 22336,
            read_timeout_ms: 5,
            poll_interval_ms: Some(5),
            no_device_backoff_ms: 50,
            connect_backoff_ms: 20,
            write_timeout_ms: 200,
            claim_timeout_ms: 500,
            ..Default::default()
        }
    }

    fn hid_device() -> MockDevice {
        MockDevice::new(1155, 22336)
            .with_name("STM32 HID")
            .with_endpoint(EndpointDescriptor::bulk(0x81, 64))
            .with_endpoint(EndpointDescriptor::bulk(0x01, 64))
    }

    fn setup(device: MockDevice, config: BridgeConfig) -> (MockBackend, Arc<CollectingObserver>, Bridge<MockBackend, CollectingObserver>) {
        let mock = MockBackend::new();
        mock.add_device(device);
        let observer = Arc::new(CollectingObserver::default());
        let bridge = Bridge::with_observer(mock.clone(), config, observer.clone());
        (mock, observer, bridge)
    }

    fn assert_balanced(mock: &MockBackend) {
        let stats = mock.claim_stats();
        assert_eq!(stats.claims, stats.releases);
        assert_eq!(stats.double_claims, 0);
        assert_eq!(mock.active_claims(), 0);
        assert_eq!(mock.open_count(), mock.close_count());
    }

    #[test]
    fn test_read_and_write_scenario() {
        let (mock, _observer, bridge) = setup(hid_device(), test_config());

        assert!(bridge.open());
        assert_eq!(bridge.state(), BridgeState::Authorized);
        let endpoints = bridge.endpoints().unwrap();
        assert_eq!(endpoints.in_addresses(), vec![0x81]);
        assert_eq!(endpoints.out_addresses(), vec![0x01]);

        assert_eq!(bridge.start_reading(), 1);
        let payload: Vec<u8> = (1..=12).collect();
        mock.queue_read(0x81, &payload);

        assert!(wait_until(Duration::from_secs(2), || bridge.has_data()));
        assert_eq!(bridge.pop_data(), Some(payload));
        assert!(!bridge.has_data());

        assert!(bridge.write(b"Hello"));
        assert_eq!(mock.writes(), vec![(0x01, b"Hello".to_vec())]);

        bridge.close();
        assert_eq!(bridge.state(), BridgeState::Closed);
        assert_balanced(&mock);
    }

    #[test]
    fn test_absent_device_spawns_nothing() {
        let mock = MockBackend::new();
        let observer = Arc::new(CollectingObserver::default());
        let bridge = Bridge::with_observer(mock.clone(), test_config(), observer.clone());

        assert!(!bridge.open());
        assert_eq!(bridge.start_reading(), 0);
        assert!(!bridge.is_reading());
        assert!(bridge.reader_states().is_empty());
        assert!(!bridge.write(b"x"));
        assert!(matches!(bridge.write_report(b"x"), Err(BridgeError::NotOpen)));

        assert_eq!(mock.open_count(), 0);
        assert_eq!(
            observer.count(|e| matches!(e, BridgeEvent::DeviceNotFound { vid: 1155, pid: 22336 })),
            1
        );
    }

    #[test]
    fn test_open_twice_requests_permission_once() {
        let (mock, _observer, bridge) = setup(hid_device(), test_config());

        assert!(bridge.open());
        assert!(bridge.open());
        assert_eq!(mock.permission_requests(), 1);
        assert_eq!(bridge.state(), BridgeState::Authorized);
        assert_eq!(mock.open_count(), 0);
        assert_eq!(
            bridge.wait_for_permission(Duration::ZERO),
            Some(PermissionOutcome::Granted)
        );
    }

    #[test]
    fn test_start_reading_twice_does_not_double_spawn() {
        let (mock, _observer, bridge) = setup(hid_device(), test_config());
        assert!(bridge.open());

        assert_eq!(bridge.start_reading(), 1);
        assert_eq!(bridge.start_reading(), 0);
        assert_eq!(bridge.reader_states().len(), 1);

        bridge.close();
        assert_balanced(&mock);
    }

    #[test]
    fn test_stop_is_bounded_and_releases_once() {
        let mut device = hid_device();
        device = device.with_endpoint(EndpointDescriptor::bulk(0x82, 64));
        let (mock, observer, bridge) = setup(device, test_config());
        assert!(bridge.open());
        assert_eq!(bridge.start_reading(), 2);
        assert!(wait_until(Duration::from_secs(2), || bridge.state() == BridgeState::Reading));

        let start = Instant::now();
        bridge.stop_reading();
        assert!(wait_until(Duration::from_secs(1), || !bridge.is_reading()));
        assert!(
            bridge
                .reader_states()
                .iter()
                .all(|(_, state)| *state == ReaderState::Closed)
        );
        let results = bridge.join_readers();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(results.iter().all(Result::is_ok));
        assert_eq!(bridge.state(), BridgeState::Authorized);

        assert_balanced(&mock);
        assert_eq!(observer.count(|e| matches!(e, BridgeEvent::ReaderStopped { .. })), 2);
        assert_eq!(observer.count(|e| matches!(e, BridgeEvent::ReaderStarted { .. })), 2);
    }

    #[test]
    fn test_writes_never_overlap_reader_claims() {
        let device = hid_device().with_endpoint(EndpointDescriptor::bulk(0x82, 64));
        let config = BridgeConfig {
            read_timeout_ms: 2,
            ..test_config()
        };
        let (mock, _observer, bridge) = setup(device, config);
        assert!(bridge.open());
        assert_eq!(bridge.start_reading(), 2);

        for i in 0..20u8 {
            assert!(bridge.write(&[i; 8]));
            thread::sleep(Duration::from_millis(1));
        }
        bridge.close();

        let stats = mock.claim_stats();
        assert_eq!(stats.max_concurrent, 1);
        assert_eq!(stats.double_claims, 0);
        assert_eq!(mock.writes().len(), 20);
        assert_balanced(&mock);
    }

    #[test]
    fn test_write_reaches_every_out_endpoint() {
        let device = hid_device().with_endpoint(EndpointDescriptor::bulk(0x02, 64));
        let (mock, observer, bridge) = setup(device, test_config());
        assert!(bridge.open());

        let report = bridge.write_report(b"ping").unwrap();
        assert!(report.all_succeeded());
        assert_eq!(
            report.results.iter().map(|r| r.endpoint).collect::<Vec<_>>(),
            vec![0x01, 0x02]
        );
        assert_eq!(
            mock.writes(),
            vec![(0x01, b"ping".to_vec()), (0x02, b"ping".to_vec())]
        );
        assert_eq!(observer.count(|e| matches!(e, BridgeEvent::FrameWritten { .. })), 2);
        assert_balanced(&mock);
    }

    #[test]
    fn test_write_timeout_is_reported() {
        let config = BridgeConfig {
            write_timeout_ms: 20,
            ..test_config()
        };
        let (mock, observer, bridge) = setup(hid_device(), config);
        assert!(bridge.open());
        mock.stall_writes(Some(Duration::from_millis(500)));

        let report = bridge.write_report(b"slow").unwrap();
        assert!(!report.all_succeeded());
        assert!(matches!(
            report.results[0].outcome,
            Err(BridgeError::WriteTimeout {
                endpoint: 0x01,
                timeout_ms: 20
            })
        ));
        assert!(!bridge.write(b"slow"));
        assert!(observer.count(|e| matches!(e, BridgeEvent::WriteFailed { endpoint: 0x01, .. })) >= 1);
        assert_balanced(&mock);
    }

    #[test]
    fn test_permission_resolved_later() {
        let (mock, observer, bridge) = setup(hid_device(), test_config());
        mock.set_permission_mode(PermissionMode::Manual);

        assert!(bridge.open());
        assert_eq!(bridge.state(), BridgeState::PermissionRequested);
        assert!(matches!(
            bridge.write_report(b"x"),
            Err(BridgeError::PermissionDenied(_))
        ));

        // Workers wait for access without opening anything.
        assert_eq!(bridge.start_reading(), 1);
        assert!(wait_until(Duration::from_secs(2), || {
            bridge
                .reader_states()
                .iter()
                .all(|(_, s)| *s == ReaderState::PermissionFailed)
        }));
        assert_eq!(mock.open_count(), 0);

        mock.queue_read(0x81, &[0xAA, 0xBB]);
        let resolver = mock.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            resolver.resolve_pending(PermissionOutcome::Granted)
        });
        assert_eq!(
            bridge.wait_for_permission(Duration::from_secs(2)),
            Some(PermissionOutcome::Granted)
        );
        assert_eq!(handle.join().unwrap(), 1);

        let frame = bridge.wait_for_data(Duration::from_secs(2)).unwrap();
        assert_eq!(frame.endpoint(), 0x81);
        assert_eq!(frame.data(), &[0xAA, 0xBB]);
        assert_eq!(mock.permission_requests(), 1);
        assert_eq!(
            observer.count(|e| matches!(
                e,
                BridgeEvent::PermissionResolved {
                    outcome: PermissionOutcome::Granted
                }
            )),
            1
        );

        bridge.close();
        assert_balanced(&mock);
    }

    #[test]
    fn test_denied_permission_stays_located() {
        let (mock, _observer, bridge) = setup(hid_device(), test_config());
        mock.set_permission_mode(PermissionMode::Deny);

        assert!(bridge.open());
        assert_eq!(
            bridge.wait_for_permission(Duration::ZERO),
            Some(PermissionOutcome::Denied)
        );
        assert_eq!(bridge.state(), BridgeState::Located);
        assert!(!bridge.write(b"x"));
        assert_eq!(mock.open_count(), 0);

        // Asking again is an explicit new request.
        mock.set_permission_mode(PermissionMode::Grant);
        assert!(bridge.open());
        assert_eq!(mock.permission_requests(), 2);
        assert_eq!(bridge.state(), BridgeState::Authorized);
    }

    #[test]
    fn test_fatal_reader_cleans_up_and_reports() {
        let (mock, observer, bridge) = setup(hid_device(), test_config());
        assert!(bridge.open());
        mock.remove_endpoint(0x81);

        assert_eq!(bridge.start_reading(), 1);
        assert!(wait_until(Duration::from_secs(2), || !bridge.is_reading()));
        assert_eq!(bridge.reader_states(), vec![(0x81, ReaderState::Closed)]);

        let results = bridge.join_readers();
        assert!(matches!(results.as_slice(), [Err(BridgeError::Fatal(_))]));
        assert_eq!(observer.count(|e| matches!(e, BridgeEvent::ReaderFailed { endpoint: 0x81, .. })), 1);
        assert_balanced(&mock);
    }

    #[test]
    fn test_sweep_mode_single_worker_keeps_order() {
        let device = hid_device().with_endpoint(EndpointDescriptor::bulk(0x82, 64));
        let config = BridgeConfig {
            reader_mode: ReaderMode::Sweep,
            ..test_config()
        };
        let (mock, _observer, bridge) = setup(device, config);
        assert!(bridge.open());

        mock.queue_read(0x81, &[1]);
        mock.queue_read(0x82, &[2]);
        mock.queue_read(0x81, &[3]);
        assert_eq!(bridge.start_reading(), 1);

        assert!(wait_until(Duration::from_secs(2), || bridge.queue().len() == 3));
        let frames: Vec<(u8, Vec<u8>)> = std::iter::from_fn(|| bridge.pop_frame())
            .map(|f| (f.endpoint(), f.into_data()))
            .collect();
        assert_eq!(frames, vec![(0x81, vec![1]), (0x82, vec![2]), (0x81, vec![3])]);

        bridge.close();
        assert_balanced(&mock);
    }

    #[test]
    fn test_detach_and_reattach() {
        let (mock, observer, bridge) = setup(hid_device(), test_config());
        assert!(bridge.open());
        assert_eq!(bridge.start_reading(), 1);
        assert!(wait_until(Duration::from_secs(2), || bridge.state() == BridgeState::Reading));

        mock.disconnect();
        assert!(wait_until(Duration::from_secs(2), || {
            observer.count(|e| matches!(e, BridgeEvent::DeviceDetached { .. })) == 1
        }));
        assert!(bridge.device().is_none());

        mock.queue_read(0x81, &[7, 7]);
        mock.reconnect();
        let frame = bridge.wait_for_data(Duration::from_secs(3)).unwrap();
        assert_eq!(frame.data(), &[7, 7]);
        assert_eq!(mock.permission_requests(), 2);

        bridge.close();
        assert_balanced(&mock);
    }

    #[test]
    fn test_log_sink_reports_start_once() {
        let mock = MockBackend::new();
        mock.add_device(hid_device());
        let lines = Arc::new(Mutex::new(Vec::<String>::new()));
        let captured = lines.clone();
        let sink = Arc::new(LogSink::new(move |text: &str| {
            captured.lock().unwrap().push(text.to_string())
        }));
        let bridge = Bridge::with_observer(mock.clone(), test_config(), sink);

        assert!(bridge.open());
        bridge.start_reading();
        mock.queue_read(0x81, &[1, 2, 3]);
        assert!(bridge.wait_for_data(Duration::from_secs(2)).is_some());
        // Let a few more empty polls happen.
        thread::sleep(Duration::from_millis(30));
        bridge.close();

        let lines = lines.lock().unwrap();
        let started = lines.iter().filter(|l| l.contains("Reader was started")).count();
        assert_eq!(started, 1);
        assert!(
            lines
                .iter()
                .any(|l| l == "EP:0x81 Message received of length 3 and content: 01 02 03")
        );
    }

    #[test]
    fn test_closed_bridge_refuses_work() {
        let (mock, _observer, bridge) = setup(hid_device(), test_config());
        assert!(bridge.open());
        bridge.start_reading();
        bridge.close();
        bridge.close();

        assert_eq!(bridge.state(), BridgeState::Closed);
        assert!(!bridge.open());
        assert_eq!(bridge.start_reading(), 0);
        assert!(!bridge.write(b"x"));
        assert_balanced(&mock);
    }

    #[test]
    fn test_drop_while_reading_releases_everything() {
        let (mock, _observer, bridge) = setup(hid_device(), test_config());
        assert!(bridge.open());
        bridge.start_reading();
        assert!(wait_until(Duration::from_secs(2), || mock.open_count() == 1));
        drop(bridge);
        assert_balanced(&mock);
    }

    #[test]
    fn test_bounded_queue_drops_oldest() {
        let config = BridgeConfig {
            queue_capacity: 2,
            ..test_config()
        };
        let (mock, observer, bridge) = setup(hid_device(), config);
        assert!(bridge.open());
        for i in 0..4u8 {
            mock.queue_read(0x81, &[i]);
        }
        bridge.start_reading();
        assert!(wait_until(Duration::from_secs(2), || mock.pending_reads(0x81) == 0));
        assert!(wait_until(Duration::from_secs(1), || bridge.queue().dropped() == 2));
        bridge.close();

        assert_eq!(bridge.pop_data(), Some(vec![2]));
        assert_eq!(bridge.pop_data(), Some(vec![3]));
        assert_eq!(observer.count(|e| matches!(e, BridgeEvent::FrameDropped { .. })), 2);
    }

    #[test]
    fn test_drop_newest_reports_only_queued_frames() {
        let config = BridgeConfig {
            queue_capacity: 2,
            overflow_policy: crate::queue::OverflowPolicy::DropNewest,
            ..test_config()
        };
        let (mock, observer, bridge) = setup(hid_device(), config);
        assert!(bridge.open());
        for i in 0..4u8 {
            mock.queue_read(0x81, &[i]);
        }
        bridge.start_reading();
        assert!(wait_until(Duration::from_secs(2), || bridge.queue().dropped() == 2));
        bridge.close();

        assert_eq!(bridge.pop_data(), Some(vec![0]));
        assert_eq!(bridge.pop_data(), Some(vec![1]));
        assert_eq!(observer.count(|e| matches!(e, BridgeEvent::FrameReceived { .. })), 2);
        assert_eq!(observer.count(|e| matches!(e, BridgeEvent::FrameDropped { .. })), 2);
    }

    #[test]
    fn test_restart_without_join_reports_reading() {
        let (mock, _observer, bridge) = setup(hid_device(), test_config());
        assert!(bridge.open());
        assert_eq!(bridge.start_reading(), 1);
        assert!(wait_until(Duration::from_secs(2), || bridge.state() == BridgeState::Reading));

        bridge.stop_reading();
        assert_eq!(bridge.state(), BridgeState::Stopping);
        assert!(wait_until(Duration::from_secs(1), || !bridge.is_reading()));

        assert_eq!(bridge.start_reading(), 1);
        assert!(wait_until(Duration::from_secs(2), || bridge.state() == BridgeState::Reading));
        mock.queue_read(0x81, &[9]);
        assert_eq!(bridge.wait_for_data(Duration::from_secs(2)).unwrap().data(), &[9]);

        bridge.close();
        assert_balanced(&mock);
    }

    #[test]
    fn test_open_failure_backs_off_then_reads() {
        let config = BridgeConfig {
            connect_backoff_ms: 300,
            ..test_config()
        };
        let (mock, observer, bridge) = setup(hid_device(), config);
        assert!(bridge.open());
        mock.fail_next_opens(1);
        mock.queue_read(0x81, &[1, 2]);

        assert_eq!(bridge.start_reading(), 1);
        assert!(wait_until(Duration::from_secs(1), || {
            bridge.reader_states() == vec![(0x81, ReaderState::ConnectFailed)]
        }));

        let frame = bridge.wait_for_data(Duration::from_secs(2)).unwrap();
        assert_eq!(frame.data(), &[1, 2]);
        assert_eq!(
            observer.count(|e| matches!(e, BridgeEvent::ReaderRetry { endpoint: 0x81, backoff_ms: 300, .. })),
            1
        );
        assert!(wait_until(Duration::from_secs(1), || {
            bridge.reader_states() == vec![(0x81, ReaderState::Polling)]
        }));
        assert_eq!(bridge.state(), BridgeState::Reading);
        assert_eq!(mock.permission_requests(), 1);

        bridge.close();
        assert_balanced(&mock);
    }

    #[test]
    fn test_failed_transfer_on_present_device_retries_in_place() {
        let config = BridgeConfig {
            connect_backoff_ms: 300,
            ..test_config()
        };
        let (mock, observer, bridge) = setup(hid_device(), config);
        assert!(bridge.open());
        mock.queue_read_result(0x81, MockRead::Fail("babble".into()));
        mock.queue_read(0x81, &[5]);

        assert_eq!(bridge.start_reading(), 1);
        assert!(wait_until(Duration::from_secs(1), || {
            bridge.reader_states() == vec![(0x81, ReaderState::ConnectFailed)]
        }));
        assert!(bridge.device().is_some());

        let frame = bridge.wait_for_data(Duration::from_secs(2)).unwrap();
        assert_eq!(frame.data(), &[5]);
        assert_eq!(
            observer.count(|e| matches!(e, BridgeEvent::ReaderRetry { backoff_ms: 300, .. })),
            1
        );
        assert_eq!(observer.count(|e| matches!(e, BridgeEvent::DeviceDetached { .. })), 0);
        assert_eq!(mock.permission_requests(), 1);

        bridge.close();
        assert_balanced(&mock);
    }

    #[test]
    fn test_interface_held_elsewhere_is_reported() {
        let (mock, observer, bridge) = setup(hid_device(), test_config());
        assert!(bridge.open());
        let device = bridge.device().unwrap();
        let mut outsider = mock.open(&device).unwrap();
        outsider.claim_interface(0).unwrap();

        assert_eq!(bridge.start_reading(), 1);
        assert!(wait_until(Duration::from_secs(1), || {
            observer.count(|e| matches!(e, BridgeEvent::ReaderRetry { backoff_ms: 20, .. })) > 0
        }));
        assert!(!bridge.write(b"x"));
        assert!(observer.count(|e| matches!(e, BridgeEvent::Log { level: LogLevel::Error, .. })) > 0);

        outsider.release_interface(0).unwrap();
        outsider.close();
        mock.queue_read(0x81, &[3]);
        assert_eq!(bridge.wait_for_data(Duration::from_secs(2)).unwrap().data(), &[3]);

        bridge.close();
    }
}
