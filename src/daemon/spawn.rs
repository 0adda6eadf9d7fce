//! Spawning a fresh daemon process.
//!
//! The `anvild` binary is expected next to the `anvil` binary. The child is
//! detached with null stdio; it sets up its own logging under the daemon
//! directory, binds its socket and registers itself. Spawning blocks until
//! that registration appears (or a startup budget runs out).

use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;

use tokio::time::sleep;

use crate::daemon::info::DaemonInfo;
use crate::daemon::parameters::{
    DaemonParameters, HOME_VAR, IDLE_TIMEOUT_VAR, KEEP_ALIVE_VAR, MAX_LOST_KEEP_ALIVE_VAR,
};
use crate::daemon::registry::DaemonRegistry;
use crate::error::{AnvilError, Result};

/// Starts a daemon and blocks until it is listening and registered.
#[allow(async_fn_in_trait)]
pub trait DaemonSpawner: Send + Sync {
    async fn spawn(
        &self,
        parameters: &DaemonParameters,
        registry: &dyn DaemonRegistry,
    ) -> Result<DaemonInfo>;
}

/// Spawns the real `anvild` binary.
pub struct ProcessSpawner {
    binary: Option<PathBuf>,
}

impl ProcessSpawner {
    /// Locate `anvild` next to the current executable.
    pub fn new() -> Self {
        Self { binary: None }
    }

    /// Use an explicit daemon binary, e.g. from a test harness.
    pub fn with_binary(binary: PathBuf) -> Self {
        Self {
            binary: Some(binary),
        }
    }

    fn daemon_binary(&self) -> Result<PathBuf> {
        if let Some(binary) = &self.binary {
            return Ok(binary.clone());
        }
        let current_exe = std::env::current_exe()?;
        Ok(current_exe.with_file_name("anvild"))
    }
}

impl Default for ProcessSpawner {
    fn default() -> Self {
        Self::new()
    }
}

impl DaemonSpawner for ProcessSpawner {
    async fn spawn(
        &self,
        parameters: &DaemonParameters,
        registry: &dyn DaemonRegistry,
    ) -> Result<DaemonInfo> {
        let daemon_path = self.daemon_binary()?;
        if !daemon_path.exists() {
            return Err(AnvilError::DaemonSpawn(format!(
                "daemon binary not found at {:?}",
                daemon_path
            )));
        }

        let daemon_id = generate_daemon_id();
        std::fs::create_dir_all(parameters.daemon_dir())?;

        tracing::debug!(%daemon_id, binary = %daemon_path.display(), "spawning daemon");
        // the daemon inherits the invoker's view of the tunables
        Command::new(&daemon_path)
            .arg("--daemon-id")
            .arg(&daemon_id)
            .env(HOME_VAR, &parameters.home_dir)
            .env(KEEP_ALIVE_VAR, parameters.keep_alive.as_millis().to_string())
            .env(
                MAX_LOST_KEEP_ALIVE_VAR,
                parameters.max_lost_keep_alive.to_string(),
            )
            .env(
                IDLE_TIMEOUT_VAR,
                parameters.idle_timeout.as_millis().to_string(),
            )
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                AnvilError::DaemonSpawn(format!("could not start {:?}: {}", daemon_path, e))
            })?;

        // wait for the child to come up: registered and listening
        for attempt in 0..10u64 {
            sleep(Duration::from_millis(50 * (attempt + 1))).await;

            let registered = registry
                .list()?
                .into_iter()
                .find(|daemon| daemon.id == daemon_id);
            if let Some(daemon) = registered {
                if daemon.socket_path.exists() {
                    return Ok(daemon);
                }
            }
        }

        Err(AnvilError::DaemonSpawn(format!(
            "daemon {} did not come up; check {}",
            daemon_id,
            parameters.daemon_log_path(&daemon_id).display()
        )))
    }
}

/// Opaque daemon identifier, e.g. `daemon-x3f1kq8z`.
pub fn generate_daemon_id() -> String {
    format!("daemon-{}", nanoid::nanoid!(8, &nanoid::alphabet::SAFE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::registry::FileRegistry;
    use tempfile::TempDir;

    #[test]
    fn daemon_ids_are_prefixed_and_unique() {
        let a = generate_daemon_id();
        let b = generate_daemon_id();
        assert!(a.starts_with("daemon-"));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn missing_binary_is_reported() {
        let dir = TempDir::new().unwrap();
        let spawner = ProcessSpawner::with_binary(dir.path().join("no-such-anvild"));
        let parameters = DaemonParameters::from_lookup(&|key| {
            if key == HOME_VAR {
                Some("/tmp/anvil-spawn-test".into())
            } else {
                None
            }
        })
        .unwrap();
        let registry = FileRegistry::new(dir.path().join("registry.json"));

        let err = spawner.spawn(&parameters, &registry).await.unwrap_err();
        assert!(matches!(err, AnvilError::DaemonSpawn(_)));
        assert!(err.to_string().contains("not found"));
    }
}
