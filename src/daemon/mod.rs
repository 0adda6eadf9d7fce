//! Client-side plumbing for talking to background build daemons.
//!
//! A build runs like this: the [`connector`] asks the [`registry`] for a
//! compatible idle daemon (using [`spawn`] to start one if needed), opens a
//! [`transport`] to its socket and wraps it in a [`connection`]. The
//! connection pumps framed [`message`]s in both directions until the build
//! terminates; on the failure path it consults the stale-address detector
//! and renders [`diagnostics`], and the connector decides whether to retry
//! against a different daemon.

pub mod codec;
pub mod connection;
pub mod connector;
pub mod diagnostics;
pub mod execution;
pub mod info;
pub mod message;
pub mod parameters;
pub mod registry;
pub mod spawn;
pub mod transport;

pub use connection::DaemonConnection;
pub use connector::{BuildEventHandler, DaemonConnector};
pub use execution::ExecutionResult;
pub use info::{DaemonInfo, DaemonState};
pub use message::{BuildRequest, Message};
pub use parameters::DaemonParameters;
pub use registry::{DaemonRegistry, FileRegistry};
pub use transport::{DaemonTransport, SocketStaleAddressDetector, StaleAddressDetector};
