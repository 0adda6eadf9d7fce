use std::io;

use thiserror::Error;

/// Process exit codes for the `anvil` CLI.
pub mod exit_codes {
    pub const SUCCESS: i32 = 0;
    pub const INTERNAL: i32 = 1;
    pub const USER_ERROR: i32 = 2;
    pub const DAEMON_UNAVAILABLE: i32 = 3;
    pub const INTERRUPTED: i32 = 130;
}

#[derive(Error, Debug)]
pub enum AnvilError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Failed to spawn the build daemon: {0}")]
    DaemonSpawn(String),

    #[error("Build assertion failed: {0}")]
    BuildAssertion(String),

    #[error("Global config error: {0}")]
    Config(String),

    #[error(transparent)]
    Daemon(#[from] DaemonError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AnvilError {
    pub fn exit_code(&self) -> i32 {
        match self {
            AnvilError::InvalidArgument(_) | AnvilError::BuildAssertion(_) => {
                exit_codes::USER_ERROR
            }

            AnvilError::Daemon(DaemonError::Interrupted) => exit_codes::INTERRUPTED,

            AnvilError::Daemon(_) | AnvilError::DaemonSpawn(_) => exit_codes::DAEMON_UNAVAILABLE,

            AnvilError::Registry(_)
            | AnvilError::Config(_)
            | AnvilError::Io(_)
            | AnvilError::Json(_) => exit_codes::INTERNAL,
        }
    }
}

/// Failure taxonomy for a daemon connection.
///
/// The connection upgrades every low-level [`TransportError`] into one of
/// these before it reaches a caller; the variant decides whether the
/// connector retries against another daemon or gives up.
#[derive(Error, Debug)]
pub enum DaemonError {
    /// The daemon was reachable but the connection has since failed. The
    /// connector does not retry these; the failure is surfaced to the user.
    #[error("{0}")]
    Connect(String),

    /// The registry entry points at an endpoint that no longer belongs to a
    /// live daemon. The connector evicts the entry and retries elsewhere.
    #[error("{0}")]
    StaleAddress(String),

    /// The caller task was interrupted while handing a message over.
    #[error("interrupted while queueing a message for the daemon")]
    Interrupted,
}

/// Low-level transport failure: an I/O error or a malformed frame.
///
/// Cloneable so the receive pump can park the first failure in a shared slot
/// for the caller to classify later. Never escapes the connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("{message}")]
    Io { kind: io::ErrorKind, message: String },

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            TransportError::Io { kind, .. } => Some(*kind),
            TransportError::Protocol(_) => None,
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        TransportError::Io {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AnvilError>;
