//! The `anvil build` command: forward a build to the daemon and stream it.
//!
//! The main loop consumes message batches from the connection. Ctrl-C is
//! watched by a side task that dispatches `CancelBuild`; the connection's
//! local echo wakes the loop even when the daemon is wedged. Prompts are
//! answered from stdin and handed back to the loop via the connection's
//! inbound queue, so answers keep their place in the message order.

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::daemon::connection::DaemonConnection;
use crate::daemon::connector::{BuildEventHandler, DaemonConnector};
use crate::daemon::message::{BuildRequest, Message};
use crate::daemon::parameters::DaemonParameters;
use crate::daemon::registry::FileRegistry;
use crate::daemon::spawn::ProcessSpawner;
use crate::daemon::transport::SocketStaleAddressDetector;
use crate::error::{AnvilError, Result};

/// Run a build; returns the exit code to terminate the process with.
pub async fn build(dir: Option<PathBuf>, args: Vec<String>) -> Result<i32> {
    let parameters = DaemonParameters::from_env()?;
    let working_dir = match dir {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };
    let working_dir = working_dir
        .canonicalize()
        .map_err(|e| AnvilError::InvalidArgument(format!("bad working directory: {}", e)))?;

    let registry = Arc::new(FileRegistry::new(parameters.registry_path()));
    let connector = DaemonConnector::new(
        registry,
        Arc::new(SocketStaleAddressDetector),
        ProcessSpawner::new(),
        parameters,
    );

    let request = BuildRequest {
        args,
        working_dir: working_dir.display().to_string(),
    };

    let mut handler = ConsoleEventHandler::default();
    let result = connector.execute_build(request, &mut handler).await;
    handler.stop_watching();
    Ok(result?.exit_code())
}

/// Renders build traffic on the terminal and wires up cancellation and
/// prompt answering.
#[derive(Default)]
struct ConsoleEventHandler {
    cancel_watch: Option<JoinHandle<()>>,
}

impl ConsoleEventHandler {
    fn stop_watching(&mut self) {
        if let Some(watch) = self.cancel_watch.take() {
            watch.abort();
        }
    }
}

impl Drop for ConsoleEventHandler {
    fn drop(&mut self) {
        self.stop_watching();
    }
}

impl BuildEventHandler for ConsoleEventHandler {
    async fn on_attach(&mut self, connection: &Arc<DaemonConnection>) -> Result<()> {
        // a fresh watcher per attempt; the previous connection is gone
        self.stop_watching();
        let connection = Arc::clone(connection);
        self.cancel_watch = Some(tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("cancelling build...");
                let _ = connection.dispatch(Message::CancelBuild).await;
            }
        }));
        Ok(())
    }

    async fn on_message(
        &mut self,
        connection: &Arc<DaemonConnection>,
        message: &Message,
    ) -> Result<()> {
        match message {
            Message::LogLine(line) => println!("{}", line),
            Message::ProjectEvent {
                project_id,
                message,
            } => eprintln!("[{}] {}", project_id, message),
            Message::BuildStarted { pid } => {
                tracing::debug!(worker_pid = *pid, "build started");
            }
            Message::Prompt {
                prompt_id,
                question,
            } => {
                eprintln!("{}", question);
                answer_prompt(connection, prompt_id.clone());
            }
            Message::KeepAlive => {}
            other => {
                tracing::debug!(discriminator = other.discriminator(), "ignoring message");
            }
        }
        Ok(())
    }
}

/// Read one line from stdin off the async runtime and feed it back through
/// the connection's inbound queue.
fn answer_prompt(connection: &Arc<DaemonConnection>, prompt_id: String) {
    let connection = Arc::clone(connection);
    tokio::spawn(async move {
        let answer = tokio::task::spawn_blocking(|| {
            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line).map(|_| line)
        })
        .await;

        if let Ok(Ok(line)) = answer {
            connection
                .enqueue(Message::PromptResponse {
                    prompt_id,
                    answer: line.trim_end().to_string(),
                })
                .await;
        }
    });
}
