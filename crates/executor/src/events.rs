use serde::Serialize;
use std::fmt;

use crate::target::ConnectionTarget;

/// Lifecycle state of an [`ExecutorConnection`](crate::ExecutorConnection).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        })
    }
}

/// Notifications published on the connection's event channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ConnectionEvent {
    Connecting {
        target: ConnectionTarget,
    },
    Connected {
        target: ConnectionTarget,
    },
    Disconnected {
        target: ConnectionTarget,
    },
    Reconnecting {
        attempt: u32,
        max: u32,
    },
    /// A deliberate move, followed by the usual disconnect/connect pair.
    Switching {
        from: Option<ConnectionTarget>,
        to: ConnectionTarget,
    },
    Error {
        target: Option<ConnectionTarget>,
        message: String,
    },
    /// Automatic reconnection stopped; a new credential or `retry()` resumes it.
    ReconnectExhausted {
        target: ConnectionTarget,
        attempts: u32,
    },
}
