//! anvil, a build-daemon launcher.
//!
//! The `anvil` CLI keeps a warm build worker (`anvild`) running in the
//! background and streams builds through it: locate or spawn a daemon,
//! open a duplex message channel, forward the build request, and relay
//! protocol messages in both directions until the build terminates.

pub mod cli;
pub mod daemon;
pub mod error;
pub mod output;

pub use error::{AnvilError, Result};
