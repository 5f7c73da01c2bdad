//! Event system for host decoupling.
//!
//! Every diagnostic the bridge produces is a [`BridgeEvent`] handed to a
//! [`BridgeObserver`]. Hosts that only want text lines can wrap a closure in
//! [`LogSink`].

use std::fmt;

use crate::permission::PermissionOutcome;
use crate::queue::OverflowPolicy;
use crate::state::BridgeState;

/// Bytes shown in a frame preview before eliding the rest.
const PREVIEW_LEN: usize = 32;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Events emitted by the bridge and its workers.
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    /// Bridge state changed.
    StateChanged { from: BridgeState, to: BridgeState },
    /// Target device found during enumeration.
    DeviceLocated {
        vid: u16,
        pid: u16,
        handle: String,
        name: String,
        interfaces: u8,
    },
    /// No device with the target IDs is attached.
    DeviceNotFound { vid: u16, pid: u16 },
    /// The bound device disappeared.
    DeviceDetached { vid: u16, pid: u16 },
    /// Bulk endpoints discovered on the claimed interface.
    EndpointsClassified {
        interface: u8,
        bulk_in: Vec<u8>,
        bulk_out: Vec<u8>,
    },
    /// Access requested from the platform.
    PermissionRequested { vid: u16, pid: u16 },
    /// Access decision arrived.
    PermissionResolved { outcome: PermissionOutcome },
    /// A reader got its first successful claim.
    ReaderStarted { endpoint: u8 },
    /// A reader hit a transient failure and is backing off.
    ReaderRetry {
        endpoint: u8,
        reason: String,
        backoff_ms: u64,
    },
    /// A reader released its resources and exited normally.
    ReaderStopped { endpoint: u8 },
    /// A reader terminated on an unrecoverable error.
    ReaderFailed { endpoint: u8, message: String },
    /// Frame read from the device and queued.
    FrameReceived { endpoint: u8, data: Vec<u8> },
    /// The received queue was full.
    FrameDropped { policy: OverflowPolicy, total_dropped: u64 },
    /// Frame written to an OUT endpoint.
    FrameWritten {
        endpoint: u8,
        written: usize,
        data: Vec<u8>,
    },
    /// Write to an OUT endpoint failed.
    WriteFailed { endpoint: u8, message: String },
    /// Free-form log message.
    Log { level: LogLevel, message: String },
}

impl BridgeEvent {
    pub fn log(level: LogLevel, message: impl Into<String>) -> Self {
        BridgeEvent::Log {
            level,
            message: message.into(),
        }
    }

    /// Severity used when rendering the event.
    pub fn level(&self) -> LogLevel {
        match self {
            BridgeEvent::StateChanged { .. }
            | BridgeEvent::DeviceLocated { .. }
            | BridgeEvent::EndpointsClassified { .. }
            | BridgeEvent::PermissionRequested { .. }
            | BridgeEvent::ReaderStarted { .. }
            | BridgeEvent::ReaderStopped { .. } => LogLevel::Info,
            BridgeEvent::PermissionResolved { outcome } => match outcome {
                PermissionOutcome::Granted => LogLevel::Info,
                PermissionOutcome::Denied => LogLevel::Warn,
            },
            BridgeEvent::DeviceNotFound { .. }
            | BridgeEvent::DeviceDetached { .. }
            | BridgeEvent::ReaderRetry { .. }
            | BridgeEvent::FrameDropped { .. } => LogLevel::Warn,
            BridgeEvent::ReaderFailed { .. } | BridgeEvent::WriteFailed { .. } => LogLevel::Error,
            BridgeEvent::FrameReceived { .. } | BridgeEvent::FrameWritten { .. } => {
                LogLevel::Debug
            }
            BridgeEvent::Log { level, .. } => *level,
        }
    }
}

impl fmt::Display for BridgeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeEvent::StateChanged { from, to } => write!(f, "State {} -> {}", from, to),
            BridgeEvent::DeviceLocated {
                vid,
                pid,
                handle,
                name,
                interfaces,
            } => write!(
                f,
                "Found the device {:04X}:{:04X} \"{}\" at {} with {} interface(s)",
                vid, pid, name, handle, interfaces
            ),
            BridgeEvent::DeviceNotFound { vid, pid } => write!(
                f,
                "Cannot find the device VendorId={} ProductId={}. Is it plugged in?",
                vid, pid
            ),
            BridgeEvent::DeviceDetached { vid, pid } => {
                write!(f, "Device {:04X}:{:04X} detached", vid, pid)
            }
            BridgeEvent::EndpointsClassified {
                interface,
                bulk_in,
                bulk_out,
            } => write!(
                f,
                "Interface {}: bulk IN [{}], bulk OUT [{}]",
                interface,
                addresses(bulk_in),
                addresses(bulk_out)
            ),
            BridgeEvent::PermissionRequested { vid, pid } => {
                write!(f, "Requested permission for {:04X}:{:04X}", vid, pid)
            }
            BridgeEvent::PermissionResolved { outcome } => write!(f, "Permission {}", outcome),
            BridgeEvent::ReaderStarted { endpoint } => {
                write!(f, "EP:0x{:02X} Reader was started", endpoint)
            }
            BridgeEvent::ReaderRetry {
                endpoint,
                reason,
                backoff_ms,
            } => write!(
                f,
                "EP:0x{:02X} {}. Retrying in {} ms",
                endpoint, reason, backoff_ms
            ),
            BridgeEvent::ReaderStopped { endpoint } => {
                write!(f, "EP:0x{:02X} Reader stopped", endpoint)
            }
            BridgeEvent::ReaderFailed { endpoint, message } => {
                write!(f, "EP:0x{:02X} Reader terminated: {}", endpoint, message)
            }
            BridgeEvent::FrameReceived { endpoint, data } => write!(
                f,
                "EP:0x{:02X} Message received of length {} and content: {}",
                endpoint,
                data.len(),
                compose(data)
            ),
            BridgeEvent::FrameDropped {
                policy,
                total_dropped,
            } => write!(
                f,
                "Received queue full ({}), {} frame(s) dropped so far",
                policy, total_dropped
            ),
            BridgeEvent::FrameWritten {
                endpoint,
                written,
                data,
            } => write!(
                f,
                "EP:0x{:02X} Written {} bytes to the device. Data written: {}",
                endpoint,
                written,
                compose(data)
            ),
            BridgeEvent::WriteFailed { endpoint, message } => {
                write!(f, "EP:0x{:02X} Error while writing data: {}", endpoint, message)
            }
            BridgeEvent::Log { message, .. } => write!(f, "{}", message),
        }
    }
}

fn addresses(list: &[u8]) -> String {
    list.iter()
        .map(|a| format!("0x{:02X}", a))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Render bytes as space separated hex, eliding anything past the preview.
pub fn compose(data: &[u8]) -> String {
    let mut out = data
        .iter()
        .take(PREVIEW_LEN)
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ");
    if data.len() > PREVIEW_LEN {
        out.push_str(" ...");
    }
    out
}

/// Observer trait for receiving bridge events.
///
/// Called from reader threads as well as the caller's thread.
pub trait BridgeObserver: Send + Sync {
    fn on_event(&self, event: &BridgeEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl BridgeObserver for NullObserver {
    fn on_event(&self, _event: &BridgeEvent) {}
}

/// Adapts a text callback into an observer: `on_log_message(text)` for
/// every event.
pub struct LogSink<F: Fn(&str) + Send + Sync> {
    on_log_message: F,
}

impl<F: Fn(&str) + Send + Sync> LogSink<F> {
    pub fn new(on_log_message: F) -> Self {
        Self { on_log_message }
    }
}

impl<F: Fn(&str) + Send + Sync> BridgeObserver for LogSink<F> {
    fn on_event(&self, event: &BridgeEvent) {
        (self.on_log_message)(&event.to_string());
    }
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl BridgeObserver for TracingObserver {
    fn on_event(&self, event: &BridgeEvent) {
        match event {
            BridgeEvent::StateChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "Bridge state changed");
            }
            BridgeEvent::DeviceLocated {
                vid,
                pid,
                handle,
                name,
                ..
            } => {
                tracing::info!(vid = %format!("{:04X}", vid), pid = %format!("{:04X}", pid), handle = %handle, name = %name, "Device located");
            }
            BridgeEvent::FrameReceived { endpoint, data } => {
                tracing::debug!(endpoint = %format!("0x{:02X}", endpoint), len = data.len(), data = %compose(data), "Frame received");
            }
            BridgeEvent::FrameWritten {
                endpoint, written, ..
            } => {
                tracing::debug!(endpoint = %format!("0x{:02X}", endpoint), len = written, "Frame written");
            }
            BridgeEvent::ReaderRetry {
                endpoint,
                reason,
                backoff_ms,
            } => {
                tracing::warn!(endpoint = %format!("0x{:02X}", endpoint), backoff_ms, "{}", reason);
            }
            other => match other.level() {
                LogLevel::Trace => tracing::trace!("{}", other),
                LogLevel::Debug => tracing::debug!("{}", other),
                LogLevel::Info => tracing::info!("{}", other),
                LogLevel::Warn => tracing::warn!("{}", other),
                LogLevel::Error => tracing::error!("{}", other),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_compose_preview() {
        assert_eq!(compose(&[0x01, 0xAB, 0xFF]), "01 AB FF");
        assert_eq!(compose(&[]), "");

        let long = vec![0u8; 40];
        let rendered = compose(&long);
        assert!(rendered.ends_with(" ..."));
        assert_eq!(rendered.matches("00").count(), PREVIEW_LEN);
    }

    #[test]
    fn test_frame_received_rendering_uses_actual_length() {
        let event = BridgeEvent::FrameReceived {
            endpoint: 0x81,
            data: vec![1, 2, 3],
        };
        assert_eq!(
            event.to_string(),
            "EP:0x81 Message received of length 3 and content: 01 02 03"
        );
        assert_eq!(event.level(), LogLevel::Debug);
    }

    #[test]
    fn test_log_sink_receives_text() {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let captured = lines.clone();
        let sink = LogSink::new(move |text: &str| captured.lock().unwrap().push(text.to_string()));

        sink.on_event(&BridgeEvent::DeviceNotFound {
            vid: 1155,
            pid: 22336,
        });
        sink.on_event(&BridgeEvent::log(LogLevel::Info, "hello"));

        let lines = lines.lock().unwrap();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("VendorId=1155 ProductId=22336"));
        assert_eq!(lines[1], "hello");
    }
}
