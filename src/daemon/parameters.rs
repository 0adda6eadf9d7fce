//! Daemon client configuration.
//!
//! All tunables are read from the environment; values are either integer
//! milliseconds ("2500") or human durations ("2s 500ms"). Paths live under
//! the anvil home directory (`~/.anvil`, overridable with `ANVIL_HOME`).

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{AnvilError, Result};

pub const KEEP_ALIVE_VAR: &str = "ANVIL_KEEP_ALIVE";
pub const MAX_LOST_KEEP_ALIVE_VAR: &str = "ANVIL_MAX_LOST_KEEP_ALIVE";
pub const CONNECT_TIMEOUT_VAR: &str = "ANVIL_CONNECT_TIMEOUT";
pub const IDLE_TIMEOUT_VAR: &str = "ANVIL_IDLE_TIMEOUT";
pub const HOME_VAR: &str = "ANVIL_HOME";

const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(1);
const DEFAULT_MAX_LOST_KEEP_ALIVE: u32 = 10;
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Immutable configuration for daemon connections, loaded once per
/// invocation.
#[derive(Debug, Clone)]
pub struct DaemonParameters {
    /// Expected interval between liveness signals from the daemon.
    pub keep_alive: Duration,
    /// How many keep-alive intervals may pass in silence before the daemon
    /// is presumed dead.
    pub max_lost_keep_alive: u32,
    pub connect_timeout: Duration,
    /// How long a daemon lingers with no build before expiring itself.
    pub idle_timeout: Duration,
    /// Root directory for the registry, sockets and daemon logs.
    pub home_dir: PathBuf,
}

impl DaemonParameters {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(&|key| std::env::var(key).ok())
    }

    /// Build parameters from an arbitrary variable source.
    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self> {
        let home_dir = match lookup(HOME_VAR) {
            Some(dir) => PathBuf::from(dir),
            None => dirs::home_dir()
                .map(|home| home.join(".anvil"))
                .ok_or_else(|| {
                    AnvilError::Config("Could not determine home directory".into())
                })?,
        };

        let keep_alive = duration_var(lookup, KEEP_ALIVE_VAR)?.unwrap_or(DEFAULT_KEEP_ALIVE);
        let max_lost_keep_alive = match lookup(MAX_LOST_KEEP_ALIVE_VAR) {
            Some(raw) => raw.trim().parse::<u32>().ok().filter(|n| *n > 0).ok_or_else(|| {
                AnvilError::InvalidArgument(format!(
                    "{} must be a positive integer, got {:?}",
                    MAX_LOST_KEEP_ALIVE_VAR, raw
                ))
            })?,
            None => DEFAULT_MAX_LOST_KEEP_ALIVE,
        };

        Ok(Self {
            keep_alive,
            max_lost_keep_alive,
            connect_timeout: duration_var(lookup, CONNECT_TIMEOUT_VAR)?
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT),
            idle_timeout: duration_var(lookup, IDLE_TIMEOUT_VAR)?.unwrap_or(DEFAULT_IDLE_TIMEOUT),
            home_dir,
        })
    }

    /// Silence budget before a connection declares the daemon dead.
    pub fn max_keep_alive(&self) -> Duration {
        self.keep_alive * self.max_lost_keep_alive
    }

    /// Directory holding sockets, pid files and daemon logs.
    pub fn daemon_dir(&self) -> PathBuf {
        self.home_dir.join("daemon")
    }

    pub fn registry_path(&self) -> PathBuf {
        self.home_dir.join("registry.json")
    }

    pub fn socket_path(&self, daemon_id: &str) -> PathBuf {
        self.daemon_dir().join(format!("{}.sock", daemon_id))
    }

    pub fn daemon_log_path(&self, daemon_id: &str) -> PathBuf {
        self.daemon_dir().join(format!("{}.log", daemon_id))
    }
}

fn duration_var(
    lookup: &dyn Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<Duration>> {
    match lookup(key) {
        Some(raw) => parse_duration(&raw)
            .map(Some)
            .map_err(|e| AnvilError::InvalidArgument(format!("{}: {}", key, e))),
        None => Ok(None),
    }
}

/// Parse a duration given as integer milliseconds or a human duration.
fn parse_duration(raw: &str) -> std::result::Result<Duration, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err("empty duration".into());
    }
    if raw.bytes().all(|b| b.is_ascii_digit()) {
        let ms: u64 = raw
            .parse()
            .map_err(|e| format!("invalid millisecond value {:?}: {}", raw, e))?;
        return Ok(Duration::from_millis(ms));
    }
    humantime::parse_duration(raw).map_err(|e| format!("invalid duration {:?}: {}", raw, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn params_from(vars: &[(&str, &str)]) -> Result<DaemonParameters> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        DaemonParameters::from_lookup(&move |key| map.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let params = params_from(&[(HOME_VAR, "/tmp/anvil-home")]).unwrap();
        assert_eq!(params.keep_alive, DEFAULT_KEEP_ALIVE);
        assert_eq!(params.max_lost_keep_alive, DEFAULT_MAX_LOST_KEEP_ALIVE);
        assert_eq!(params.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(params.home_dir, PathBuf::from("/tmp/anvil-home"));
    }

    #[test]
    fn integer_values_are_milliseconds() {
        let params = params_from(&[(HOME_VAR, "/tmp/h"), (KEEP_ALIVE_VAR, "2500")]).unwrap();
        assert_eq!(params.keep_alive, Duration::from_millis(2500));
    }

    #[test]
    fn human_durations_are_accepted() {
        let params = params_from(&[
            (HOME_VAR, "/tmp/h"),
            (KEEP_ALIVE_VAR, "2s"),
            (IDLE_TIMEOUT_VAR, "1h 30m"),
        ])
        .unwrap();
        assert_eq!(params.keep_alive, Duration::from_secs(2));
        assert_eq!(params.idle_timeout, Duration::from_secs(90 * 60));
    }

    #[test]
    fn invalid_duration_is_a_user_error() {
        let err = params_from(&[(HOME_VAR, "/tmp/h"), (KEEP_ALIVE_VAR, "soon")]).unwrap_err();
        assert!(matches!(err, AnvilError::InvalidArgument(_)));
    }

    #[test]
    fn zero_max_lost_keep_alive_is_rejected() {
        let err = params_from(&[(HOME_VAR, "/tmp/h"), (MAX_LOST_KEEP_ALIVE_VAR, "0")])
            .unwrap_err();
        assert!(matches!(err, AnvilError::InvalidArgument(_)));
    }

    #[test]
    fn max_keep_alive_is_the_product() {
        let params = params_from(&[
            (HOME_VAR, "/tmp/h"),
            (KEEP_ALIVE_VAR, "1s"),
            (MAX_LOST_KEEP_ALIVE_VAR, "3"),
        ])
        .unwrap();
        assert_eq!(params.max_keep_alive(), Duration::from_secs(3));
    }

    #[test]
    fn paths_hang_off_the_home_dir() {
        let params = params_from(&[(HOME_VAR, "/tmp/h")]).unwrap();
        assert_eq!(
            params.socket_path("daemon-x"),
            PathBuf::from("/tmp/h/daemon/daemon-x.sock")
        );
        assert_eq!(params.registry_path(), PathBuf::from("/tmp/h/registry.json"));
        assert_eq!(
            params.daemon_log_path("daemon-x"),
            PathBuf::from("/tmp/h/daemon/daemon-x.log")
        );
    }
}
