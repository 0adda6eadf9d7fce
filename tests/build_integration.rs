//! End-to-end tests for the launcher against a real `anvild` process.
//!
//! Each test runs in isolation with its own temporary anvil home, so the
//! registry, sockets and daemon logs never touch the user's environment.
//! The daemon binary is the one cargo just built for this package.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use anvil::daemon::connection::DaemonConnection;
use anvil::daemon::connector::{BuildEventHandler, DaemonConnector};
use anvil::daemon::message::{BuildRequest, Message};
use anvil::daemon::parameters::{
    DaemonParameters, HOME_VAR, KEEP_ALIVE_VAR, MAX_LOST_KEEP_ALIVE_VAR,
};
use anvil::daemon::registry::{DaemonRegistry, FileRegistry};
use anvil::daemon::spawn::ProcessSpawner;
use anvil::daemon::transport::SocketStaleAddressDetector;
use anvil::Result;

/// Isolated anvil home plus best-effort daemon cleanup on drop.
struct TestHome {
    dir: TempDir,
}

impl TestHome {
    fn new() -> Self {
        Self {
            dir: TempDir::new().expect("create temp home"),
        }
    }

    fn parameters(&self, keep_alive_ms: u64, max_lost: u32) -> DaemonParameters {
        let home = self.dir.path().display().to_string();
        DaemonParameters::from_lookup(&move |key| match key {
            HOME_VAR => Some(home.clone()),
            KEEP_ALIVE_VAR => Some(keep_alive_ms.to_string()),
            MAX_LOST_KEEP_ALIVE_VAR => Some(max_lost.to_string()),
            // daemons started by these tests should not outlive them long
            anvil::daemon::parameters::IDLE_TIMEOUT_VAR => Some("10s".into()),
            _ => None,
        })
        .expect("build parameters")
    }

    fn registry(&self) -> Arc<FileRegistry> {
        Arc::new(FileRegistry::new(self.dir.path().join("registry.json")))
    }

    fn connector(
        &self,
        keep_alive_ms: u64,
        max_lost: u32,
    ) -> DaemonConnector<ProcessSpawner> {
        DaemonConnector::new(
            self.registry(),
            Arc::new(SocketStaleAddressDetector),
            ProcessSpawner::with_binary(env!("CARGO_BIN_EXE_anvild").into()),
            self.parameters(keep_alive_ms, max_lost),
        )
    }
}

impl Drop for TestHome {
    fn drop(&mut self) {
        // daemons also expire on their own; this just tightens the window
        if let Ok(daemons) = self.registry().list() {
            for daemon in daemons {
                let _ = std::process::Command::new("kill")
                    .arg(daemon.pid.to_string())
                    .status();
            }
        }
    }
}

/// Collects log lines; optionally cancels the build once it has started.
#[derive(Default)]
struct Collector {
    log_lines: Vec<String>,
    events: Vec<(String, String)>,
    cancel_on_start: bool,
}

impl BuildEventHandler for Collector {
    async fn on_message(
        &mut self,
        connection: &Arc<DaemonConnection>,
        message: &Message,
    ) -> Result<()> {
        match message {
            Message::LogLine(line) => self.log_lines.push(line.clone()),
            Message::ProjectEvent {
                project_id,
                message,
            } => self.events.push((project_id.clone(), message.clone())),
            Message::BuildStarted { .. } if self.cancel_on_start => {
                connection.dispatch(Message::CancelBuild).await?;
            }
            _ => {}
        }
        Ok(())
    }
}

fn request(args: &[&str], dir: &Path) -> BuildRequest {
    BuildRequest {
        args: args.iter().map(|a| a.to_string()).collect(),
        working_dir: dir.display().to_string(),
    }
}

#[tokio::test]
async fn spawns_a_daemon_and_streams_the_build() {
    let home = TestHome::new();
    let connector = home.connector(500, 10);

    let mut collector = Collector::default();
    let result = connector
        .execute_build(
            request(&["echo", "hello from the daemon"], home.dir.path()),
            &mut collector,
        )
        .await
        .expect("build should succeed");

    assert!(result.is_success());
    assert_eq!(result.exit_code(), 0);
    assert!(
        collector
            .log_lines
            .iter()
            .any(|line| line == "hello from the daemon"),
        "missing output, got {:?}",
        collector.log_lines
    );
    assert!(
        collector
            .events
            .iter()
            .any(|(_, message)| message == "build started"),
        "missing project events, got {:?}",
        collector.events
    );

    // the daemon stays registered and idle, warm for the next build
    let daemons = home.registry().list().unwrap();
    assert_eq!(daemons.len(), 1);
}

#[tokio::test]
async fn a_second_build_reuses_the_warm_daemon() {
    let home = TestHome::new();

    let connector = home.connector(500, 10);
    let mut collector = Collector::default();
    connector
        .execute_build(request(&["echo", "one"], home.dir.path()), &mut collector)
        .await
        .expect("first build");
    let first_pid = home.registry().list().unwrap()[0].pid;

    // give the daemon a beat to mark itself idle again
    tokio::time::sleep(Duration::from_millis(300)).await;

    let connector = home.connector(500, 10);
    let mut collector = Collector::default();
    let result = connector
        .execute_build(request(&["echo", "two"], home.dir.path()), &mut collector)
        .await
        .expect("second build");

    assert!(result.is_success());
    assert_eq!(collector.log_lines, vec!["two".to_string()]);

    let daemons = home.registry().list().unwrap();
    assert_eq!(daemons.len(), 1, "no second daemon should have spawned");
    assert_eq!(daemons[0].pid, first_pid);
}

#[tokio::test]
async fn build_failures_propagate_the_exit_code() {
    let home = TestHome::new();
    let connector = home.connector(500, 10);

    let mut collector = Collector::default();
    let result = connector
        .execute_build(
            request(&["sh", "-c", "echo failing; exit 3"], home.dir.path()),
            &mut collector,
        )
        .await
        .expect("the build itself ran");

    assert!(!result.is_success());
    assert_eq!(result.exit_code(), 3);
    assert!(result.assert_failure().is_ok());
    assert!(collector.log_lines.contains(&"failing".to_string()));
}

#[tokio::test]
async fn keep_alives_carry_a_quiet_build_past_the_silence_budget() {
    let home = TestHome::new();
    // 200ms × 3: anything silent for 600ms is presumed dead, unless the
    // daemon keeps signalling
    let connector = home.connector(200, 3);

    let mut collector = Collector::default();
    let result = connector
        .execute_build(request(&["sleep", "2"], home.dir.path()), &mut collector)
        .await
        .expect("quiet build should survive on keep-alives");

    assert!(result.is_success());
}

#[tokio::test]
async fn cancellation_kills_the_build_promptly() {
    let home = TestHome::new();
    let connector = home.connector(500, 10);

    let mut collector = Collector {
        cancel_on_start: true,
        ..Default::default()
    };

    let started = Instant::now();
    let result = connector
        .execute_build(request(&["sleep", "60"], home.dir.path()), &mut collector)
        .await
        .expect("cancellation is a result, not an error");

    assert_eq!(result.exit_code(), 130);
    assert!(
        started.elapsed() < Duration::from_secs(20),
        "cancellation took {:?}",
        started.elapsed()
    );
}

#[tokio::test]
async fn a_dead_registry_entry_is_evicted_and_replaced() {
    let home = TestHome::new();
    let registry = home.registry();

    // a plausible-looking daemon whose socket nobody listens on
    registry
        .register(&anvil::daemon::info::DaemonInfo {
            id: "daemon-ghost".into(),
            pid: 1,
            socket_path: home.dir.path().join("daemon").join("daemon-ghost.sock"),
            protocol_version: anvil::daemon::info::PROTOCOL_VERSION,
            locale: "C".into(),
            working_dir: home.dir.path().to_path_buf(),
            registered_at: chrono::Utc::now(),
            state: anvil::daemon::info::DaemonState::Idle,
        })
        .unwrap();

    let connector = home.connector(500, 10);
    let mut collector = Collector::default();
    let result = connector
        .execute_build(request(&["echo", "revived"], home.dir.path()), &mut collector)
        .await
        .expect("the connector should fall back to a fresh daemon");

    assert!(result.is_success());
    assert!(collector.log_lines.contains(&"revived".to_string()));

    let remaining = registry.list().unwrap();
    assert!(remaining.iter().all(|d| d.id != "daemon-ghost"));
    let events = registry.stop_events().unwrap();
    assert!(events.iter().any(|e| e.daemon_id == "daemon-ghost"));
}
