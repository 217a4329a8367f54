//! Connection status tracking.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Current status of the websocket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionStatus {
    /// No live socket; the keepalive loop may be working to change that.
    Disconnected = 0,
    /// The session is established.
    Connected = 1,
    /// The server's certificate was rejected; reconnecting will not help
    /// until the trust configuration changes.
    InvalidCert = 2,
}

impl ConnectionStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connected,
            2 => Self::InvalidCert,
            _ => Self::Disconnected,
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connected => write!(f, "connected"),
            Self::InvalidCert => write!(f, "invalid certificate"),
        }
    }
}

/// Hook invoked with the new status on every actual transition.
pub type ConnectEventFn = Arc<dyn Fn(ConnectionStatus) + Send + Sync>;

/// Atomic status cell. `set` is the only writer and fires the change
/// hook only when the stored value actually changes, so the hook
/// observes transitions in true temporal order.
pub(crate) struct StatusCell {
    value: AtomicU8,
    on_change: Option<ConnectEventFn>,
}

impl StatusCell {
    pub(crate) fn new(on_change: Option<ConnectEventFn>) -> Self {
        Self {
            value: AtomicU8::new(ConnectionStatus::Disconnected as u8),
            on_change,
        }
    }

    pub(crate) fn get(&self) -> ConnectionStatus {
        ConnectionStatus::from_u8(self.value.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, status: ConnectionStatus) {
        let old = self.value.swap(status as u8, Ordering::AcqRel);
        if old != status as u8 {
            if let Some(hook) = &self.on_change {
                hook(status);
            }
        }
    }

    pub(crate) fn is_down(&self) -> bool {
        self.get() != ConnectionStatus::Connected
    }
}
