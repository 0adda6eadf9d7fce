//! Registry records describing daemons and their lifecycle.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Protocol version spoken by this client. A daemon registered with a
/// different version is never picked by the connector.
pub const PROTOCOL_VERSION: u32 = 1;

/// Immutable descriptor of a registered daemon.
///
/// The connection treats this as read-only metadata; it is only used to
/// locate the daemon and to render diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonInfo {
    pub id: String,
    pub pid: u32,
    pub socket_path: PathBuf,
    pub protocol_version: u32,
    pub locale: String,
    pub working_dir: PathBuf,
    pub registered_at: DateTime<Utc>,
    pub state: DaemonState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DaemonState {
    Idle,
    Busy,
    Stopping,
}

impl DaemonState {
    pub fn label(self) -> &'static str {
        match self {
            DaemonState::Idle => "idle",
            DaemonState::Busy => "busy",
            DaemonState::Stopping => "stopping",
        }
    }
}

/// Why a daemon left the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonExpirationStatus {
    /// The daemon expired itself after its idle timeout.
    IdleExpire,
    /// A client found the endpoint dead and evicted the entry.
    Evicted,
    /// Clean shutdown.
    Shutdown,
}

/// Record of when and why a daemon stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonStopEvent {
    pub daemon_id: String,
    pub timestamp: DateTime<Utc>,
    pub status: DaemonExpirationStatus,
    pub reason: String,
}
