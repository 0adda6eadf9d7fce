//! Picking, spawning and retrying daemons for one build invocation.
//!
//! The connector owns the outer loop: ask the registry for a compatible
//! idle daemon (spawning one when there is none), open a connection, run
//! the build, and whenever the verdict is a stale address, evict the
//! registry entry and try again against another daemon. Stale addresses are
//! invisible to the user as long as a retry succeeds; connect failures are
//! never retried.

use std::sync::Arc;

use chrono::Utc;

use crate::daemon::connection::DaemonConnection;
use crate::daemon::execution::{self, ExecutionResult};
use crate::daemon::info::{
    DaemonExpirationStatus, DaemonInfo, DaemonState, DaemonStopEvent, PROTOCOL_VERSION,
};
use crate::daemon::message::{BuildRequest, Message};
use crate::daemon::parameters::DaemonParameters;
use crate::daemon::registry::DaemonRegistry;
use crate::daemon::spawn::DaemonSpawner;
use crate::daemon::transport::{DaemonTransport, StaleAddressDetector};
use crate::error::{AnvilError, DaemonError, Result};

/// How many stale endpoints one invocation tolerates before giving up.
const MAX_STALE_RETRIES: usize = 3;

/// Observer of inbound build traffic. The connector forwards every message
/// that is not part of the build lifecycle itself, so the CLI can render
/// logs and collect prompt answers.
#[allow(async_fn_in_trait)]
pub trait BuildEventHandler {
    /// Called once per attempt as soon as a connection is up, before the
    /// build request goes out.
    async fn on_attach(&mut self, connection: &Arc<DaemonConnection>) -> Result<()> {
        let _ = connection;
        Ok(())
    }

    /// Observe one inbound message. May dispatch follow-ups.
    async fn on_message(
        &mut self,
        connection: &Arc<DaemonConnection>,
        message: &Message,
    ) -> Result<()>;
}

pub struct DaemonConnector<S: DaemonSpawner> {
    registry: Arc<dyn DaemonRegistry>,
    detector: Arc<dyn StaleAddressDetector>,
    spawner: S,
    parameters: DaemonParameters,
}

impl<S: DaemonSpawner> DaemonConnector<S> {
    pub fn new(
        registry: Arc<dyn DaemonRegistry>,
        detector: Arc<dyn StaleAddressDetector>,
        spawner: S,
        parameters: DaemonParameters,
    ) -> Self {
        Self {
            registry,
            detector,
            spawner,
            parameters,
        }
    }

    /// Run one build to completion, retrying stale endpoints.
    pub async fn execute_build<H: BuildEventHandler>(
        &self,
        request: BuildRequest,
        handler: &mut H,
    ) -> Result<ExecutionResult> {
        let command = execution::command_line(&request.args);
        let mut stale_attempts = 0;

        loop {
            let (daemon, new_daemon) = self.pick_daemon().await?;
            tracing::debug!(
                daemon = %daemon.id,
                new_daemon,
                "connecting to daemon"
            );

            let connection = match self.open_connection(daemon, new_daemon).await {
                Ok(connection) => Arc::new(connection),
                Err(DaemonError::StaleAddress(reason)) => {
                    stale_attempts += 1;
                    self.note_stale(&reason, stale_attempts, &command)?;
                    continue;
                }
                Err(e) => return Err(build_failure(e, &command)),
            };

            match self.drive_build(&connection, &request, handler).await {
                Ok(result) => {
                    connection.close().await;
                    return Ok(result);
                }
                Err(AnvilError::Daemon(DaemonError::StaleAddress(reason))) => {
                    connection.close().await;
                    self.evict(connection.daemon(), &reason);
                    stale_attempts += 1;
                    self.note_stale(&reason, stale_attempts, &command)?;
                }
                Err(e) => {
                    connection.close().await;
                    return Err(build_failure(e, &command));
                }
            }
        }
    }

    /// Choose a compatible idle daemon from the registry, or spawn one.
    async fn pick_daemon(&self) -> Result<(DaemonInfo, bool)> {
        let compatible = self
            .registry
            .list()?
            .into_iter()
            .find(|d| d.protocol_version == PROTOCOL_VERSION && d.state == DaemonState::Idle);

        match compatible {
            Some(daemon) => Ok((daemon, false)),
            None => {
                tracing::debug!("no compatible idle daemon registered, spawning one");
                let daemon = self
                    .spawner
                    .spawn(&self.parameters, self.registry.as_ref())
                    .await?;
                Ok((daemon, true))
            }
        }
    }

    async fn open_connection(
        &self,
        daemon: DaemonInfo,
        new_daemon: bool,
    ) -> std::result::Result<DaemonConnection, DaemonError> {
        match DaemonTransport::connect(&daemon.socket_path, self.parameters.connect_timeout).await
        {
            Ok(transport) => Ok(DaemonConnection::new(
                transport,
                daemon,
                Arc::clone(&self.detector),
                new_daemon,
                self.parameters.clone(),
            )),
            Err(failure) => {
                let message = format!(
                    "could not connect to daemon {} at {}: {}",
                    daemon.id,
                    daemon.socket_path.display(),
                    failure
                );
                if self.detector.maybe_stale_address(&failure) {
                    self.evict(&daemon, &message);
                    Err(DaemonError::StaleAddress(message))
                } else {
                    Err(DaemonError::Connect(message))
                }
            }
        }
    }

    /// The per-connection build loop: send the request, consume batches
    /// until the build terminates.
    async fn drive_build<H: BuildEventHandler>(
        &self,
        connection: &Arc<DaemonConnection>,
        request: &BuildRequest,
        handler: &mut H,
    ) -> Result<ExecutionResult> {
        handler.on_attach(connection).await?;
        connection
            .dispatch(Message::BuildRequest(request.clone()))
            .await?;

        loop {
            for message in connection.receive().await? {
                match message {
                    Message::BuildFinished { exit_code } => {
                        return Ok(ExecutionResult::new(exit_code));
                    }
                    // the local echo: the daemon may still be working, but
                    // the user asked out
                    Message::CancelBuild => {
                        return Ok(ExecutionResult::canceled());
                    }
                    // prompt answers injected via `enqueue` travel on to the
                    // daemon from here, keeping wire writes on one task
                    Message::PromptResponse { .. } => {
                        connection.dispatch(message).await?;
                    }
                    other => handler.on_message(connection, &other).await?,
                }
            }
        }
    }

    fn evict(&self, daemon: &DaemonInfo, reason: &str) {
        tracing::debug!(daemon = %daemon.id, reason, "evicting stale registry entry");
        let _ = self.registry.remove(&daemon.id);
        let _ = self.registry.record_stop_event(&DaemonStopEvent {
            daemon_id: daemon.id.clone(),
            timestamp: Utc::now(),
            status: DaemonExpirationStatus::Evicted,
            reason: reason.to_string(),
        });
    }

    fn note_stale(&self, reason: &str, stale_attempts: usize, command: &str) -> Result<()> {
        tracing::debug!(stale_attempts, reason, "stale daemon address, retrying");
        if stale_attempts >= MAX_STALE_RETRIES {
            return Err(build_failure(
                AnvilError::Daemon(DaemonError::Connect(format!(
                    "gave up connecting after {} stale daemon addresses; last: {}",
                    stale_attempts, reason
                ))),
                command,
            ));
        }
        Ok(())
    }
}

/// Attach the command line being run to a terminal failure, so the report
/// always shows what was being built.
fn build_failure(error: impl Into<AnvilError>, command: &str) -> AnvilError {
    match error.into() {
        AnvilError::Daemon(DaemonError::Connect(message)) => AnvilError::Daemon(
            DaemonError::Connect(format!("{}\ncommand: {}", message, command)),
        ),
        AnvilError::Daemon(DaemonError::StaleAddress(message)) => AnvilError::Daemon(
            DaemonError::StaleAddress(format!("{}\ncommand: {}", message, command)),
        ),
        other => other,
    }
}
