//! Bridge and reader state machines.

use std::fmt;

/// Lifecycle of the bridge as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BridgeState {
    /// Nothing located yet.
    #[default]
    Idle,
    /// A matching device is bound.
    Located,
    /// Waiting on the platform's access decision.
    PermissionRequested,
    /// Access granted.
    Authorized,
    /// A reader holds an open connection.
    Connected,
    /// Readers are polling.
    Reading,
    /// Stop signalled, readers winding down.
    Stopping,
    /// Closed for good.
    Closed,
}

impl BridgeState {
    /// Whether access to the bound device has been granted.
    pub fn is_authorized(&self) -> bool {
        matches!(
            self,
            BridgeState::Authorized
                | BridgeState::Connected
                | BridgeState::Reading
                | BridgeState::Stopping
        )
    }

    /// Whether a device is bound in this state.
    pub fn has_device(&self) -> bool {
        !matches!(self, BridgeState::Idle | BridgeState::Closed)
    }
}

impl fmt::Display for BridgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeState::Idle => write!(f, "IDLE"),
            BridgeState::Located => write!(f, "LOCATED"),
            BridgeState::PermissionRequested => write!(f, "PERMISSION_REQUESTED"),
            BridgeState::Authorized => write!(f, "AUTHORIZED"),
            BridgeState::Connected => write!(f, "CONNECTED"),
            BridgeState::Reading => write!(f, "READING"),
            BridgeState::Stopping => write!(f, "STOPPING"),
            BridgeState::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Lifecycle of a single read worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReaderState {
    #[default]
    NoDevice,
    ConnectFailed,
    PermissionFailed,
    Connected,
    Polling,
    Stopping,
    Closed,
}

impl ReaderState {
    pub fn is_closed(&self) -> bool {
        *self == ReaderState::Closed
    }
}

impl fmt::Display for ReaderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReaderState::NoDevice => write!(f, "NO_DEVICE"),
            ReaderState::ConnectFailed => write!(f, "CONNECT_FAILED"),
            ReaderState::PermissionFailed => write!(f, "PERMISSION_FAILED"),
            ReaderState::Connected => write!(f, "CONNECTED"),
            ReaderState::Polling => write!(f, "POLLING"),
            ReaderState::Stopping => write!(f, "STOPPING"),
            ReaderState::Closed => write!(f, "CLOSED"),
        }
    }
}
