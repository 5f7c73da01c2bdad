//! Bridge error taxonomy and the retry policy applied to it.

use std::time::Duration;

use thiserror::Error;

use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Device not found: VID={vid:04X} PID={pid:04X}")]
    DeviceNotFound { vid: u16, pid: u16 },

    #[error("Permission denied for {0}")]
    PermissionDenied(String),

    #[error("Connection unavailable: {0}")]
    ConnectionUnavailable(String),

    #[error("Interface {interface} is claimed by another holder")]
    InterfaceBusy { interface: u8 },

    #[error("Transfer timed out after {timeout_ms}ms")]
    TransferTimeout { timeout_ms: u64 },

    #[error("Write to endpoint 0x{endpoint:02X} timed out after {timeout_ms}ms")]
    WriteTimeout { endpoint: u8, timeout_ms: u64 },

    #[error("Device vanished mid-operation: {0}")]
    TransientRace(String),

    #[error("No bulk {direction} endpoints on interface {interface}")]
    NoEndpoints { direction: &'static str, interface: u8 },

    #[error("No device is bound; call open() first")]
    NotOpen,

    #[error("Fatal: {0}")]
    Fatal(String),
}

impl From<TransportError> for BridgeError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::DeviceNotFound { vid, pid } => BridgeError::DeviceNotFound { vid, pid },
            TransportError::PermissionDenied(msg) => BridgeError::PermissionDenied(msg),
            TransportError::InterfaceBusy { interface } => BridgeError::InterfaceBusy { interface },
            TransportError::Timeout { timeout_ms } => BridgeError::TransferTimeout { timeout_ms },
            TransportError::Disconnected => BridgeError::TransientRace(err.to_string()),
            TransportError::ReadFailed(_) | TransportError::WriteFailed(_) => {
                BridgeError::TransientRace(err.to_string())
            }
            TransportError::EndpointNotFound { .. } => BridgeError::Fatal(err.to_string()),
            TransportError::EnumerationFailed(_)
            | TransportError::OpenFailed(_)
            | TransportError::ClaimInterfaceFailed { .. }
            | TransportError::Io(_) => BridgeError::ConnectionUnavailable(err.to_string()),
        }
    }
}

/// What a polling loop should do about an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Not a failure; carry on with the next iteration.
    Benign,
    /// Transient; drop the connection and retry after `backoff`.
    Retry { backoff: Duration },
    /// Clean up and end the worker.
    Fatal,
}

/// Backoff constants for transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Wait before re-locating an absent device.
    pub no_device_backoff: Duration,
    /// Wait after a connect, permission or mid-transfer failure.
    pub connect_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            no_device_backoff: Duration::from_secs(10),
            connect_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn disposition(&self, err: &BridgeError) -> Disposition {
        match err {
            BridgeError::TransferTimeout { .. }
            | BridgeError::WriteTimeout { .. }
            | BridgeError::InterfaceBusy { .. } => Disposition::Benign,
            BridgeError::DeviceNotFound { .. } | BridgeError::NotOpen => Disposition::Retry {
                backoff: self.no_device_backoff,
            },
            BridgeError::PermissionDenied(_)
            | BridgeError::ConnectionUnavailable(_)
            | BridgeError::TransientRace(_) => Disposition::Retry {
                backoff: self.connect_backoff,
            },
            BridgeError::NoEndpoints { .. } | BridgeError::Fatal(_) => Disposition::Fatal,
        }
    }
}
