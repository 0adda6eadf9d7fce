//! anvild - the background build worker.
//!
//! A long-lived process that:
//! - registers itself and listens on its own Unix socket
//! - accepts build clients and executes their build commands
//! - streams build output back as protocol messages
//! - sends keep-alive signals while a build is otherwise quiet
//! - honors cancellation by killing the build process
//! - expires itself after a configurable idle period
//!
//! The daemon is normally started by `anvil` on demand; manual start:
//! `anvild`.

use std::path::Path;
use std::process::Stdio;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::select;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing_appender::non_blocking::WorkerGuard;

use anvil::daemon::execution::CANCELED_EXIT_CODE;
use anvil::daemon::info::{
    DaemonExpirationStatus, DaemonInfo, DaemonState, DaemonStopEvent, PROTOCOL_VERSION,
};
use anvil::daemon::message::{BuildRequest, Message};
use anvil::daemon::parameters::DaemonParameters;
use anvil::daemon::registry::{DaemonRegistry, FileRegistry};
use anvil::daemon::spawn::generate_daemon_id;
use anvil::daemon::transport::{DaemonTransport, TransportReader, TransportWriter};

#[derive(Parser)]
#[command(name = "anvild")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Identifier to register under; generated when omitted
    #[arg(long)]
    daemon_id: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let daemon_id = args.daemon_id.unwrap_or_else(generate_daemon_id);

    let parameters = DaemonParameters::from_env()?;
    let daemon_dir = parameters.daemon_dir();
    std::fs::create_dir_all(&daemon_dir)?;

    let _guard = init_logging(&daemon_dir, &daemon_id)?;
    tracing::info!(%daemon_id, "anvild starting, version {}", env!("CARGO_PKG_VERSION"));

    let socket_path = parameters.socket_path(&daemon_id);
    if socket_path.exists() {
        std::fs::remove_file(&socket_path)?;
    }
    let listener = UnixListener::bind(&socket_path)?;
    tracing::info!("anvild listening on {:?}", socket_path);

    let registry = FileRegistry::new(parameters.registry_path());
    let info = DaemonInfo {
        id: daemon_id.clone(),
        pid: std::process::id(),
        socket_path: socket_path.clone(),
        protocol_version: PROTOCOL_VERSION,
        locale: std::env::var("LANG").unwrap_or_else(|_| "C".to_string()),
        working_dir: std::env::current_dir()?,
        registered_at: chrono::Utc::now(),
        state: DaemonState::Idle,
    };
    registry.register(&info)?;

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let mut last_activity = Instant::now();
    let expiration = loop {
        let idle_deadline = last_activity + parameters.idle_timeout;

        select! {
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
                break DaemonExpirationStatus::Shutdown;
            }
            _ = sigint.recv() => {
                tracing::info!("received SIGINT, shutting down");
                break DaemonExpirationStatus::Shutdown;
            }

            _ = tokio::time::sleep_until(idle_deadline) => {
                tracing::info!("idle for {:?}, expiring", parameters.idle_timeout);
                break DaemonExpirationStatus::IdleExpire;
            }

            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        if let Err(e) =
                            serve_client(stream, &registry, &parameters, &daemon_id).await
                        {
                            tracing::error!("client connection error: {}", e);
                        }
                        last_activity = Instant::now();
                    }
                    Err(e) => {
                        tracing::error!("accept error: {}", e);
                    }
                }
            }
        }
    };

    registry.remove(&daemon_id)?;
    registry.record_stop_event(&DaemonStopEvent {
        daemon_id: daemon_id.clone(),
        timestamp: chrono::Utc::now(),
        status: expiration,
        reason: match expiration {
            DaemonExpirationStatus::IdleExpire => "idle timeout".into(),
            _ => "signal".into(),
        },
    })?;
    let _ = std::fs::remove_file(&socket_path);

    tracing::info!("anvild shutdown complete");
    Ok(())
}

/// Serve one client connection: run each build request it sends, until it
/// disconnects. Builds on one connection are strictly sequential.
async fn serve_client(
    stream: UnixStream,
    registry: &FileRegistry,
    parameters: &DaemonParameters,
    daemon_id: &str,
) -> anyhow::Result<()> {
    let (reader, mut writer) = DaemonTransport::new(stream).into_split();

    // inbound traffic goes through its own task so the build loop can
    // select on it alongside child output without tearing frames
    let (inbound_tx, mut inbound) = mpsc::channel::<Message>(16);
    let pump = tokio::spawn(inbound_pump(reader, inbound_tx));

    loop {
        let request = match inbound.recv().await {
            Some(Message::BuildRequest(request)) => request,
            Some(other) => {
                tracing::warn!(
                    discriminator = other.discriminator(),
                    "ignoring message outside a build"
                );
                continue;
            }
            None => break,
        };

        tracing::info!(args = ?request.args, dir = %request.working_dir, "build requested");
        registry.update_state(daemon_id, DaemonState::Busy)?;
        let outcome = run_build(&request, &mut writer, &mut inbound, parameters).await;
        registry.update_state(daemon_id, DaemonState::Idle)?;

        match outcome {
            Ok(exit_code) => tracing::info!(exit_code, "build finished"),
            Err(e) => {
                tracing::error!("build aborted: {}", e);
                break;
            }
        }
    }

    pump.abort();
    Ok(())
}

async fn inbound_pump(mut reader: TransportReader, queue: mpsc::Sender<Message>) {
    loop {
        match reader.receive().await {
            Ok(Some(message)) => {
                if queue.send(message).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("client read failed: {}", e);
                break;
            }
        }
    }
}

/// Execute one build and stream it to the client. Returns the exit code
/// that was reported, or an error if the client became unreachable.
async fn run_build(
    request: &BuildRequest,
    writer: &mut TransportWriter,
    inbound: &mut mpsc::Receiver<Message>,
    parameters: &DaemonParameters,
) -> anyhow::Result<i32> {
    let program = match request.args.first() {
        Some(program) => program,
        None => {
            send(writer, &Message::LogLine("error: empty build command".into())).await?;
            send(writer, &Message::BuildFinished { exit_code: 2 }).await?;
            return Ok(2);
        }
    };

    let mut child = match tokio::process::Command::new(program)
        .args(&request.args[1..])
        .current_dir(&request.working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            send(
                writer,
                &Message::LogLine(format!("error: could not start {}: {}", program, e)),
            )
            .await?;
            send(writer, &Message::BuildFinished { exit_code: 127 }).await?;
            return Ok(127);
        }
    };

    let pid = child.id().unwrap_or_default();
    send(writer, &Message::BuildStarted { pid }).await?;

    let project = project_name(&request.working_dir);
    send(
        writer,
        &Message::ProjectEvent {
            project_id: project.clone(),
            message: "build started".into(),
        },
    )
    .await?;

    let mut stdout = BufReader::new(child.stdout.take().expect("stdout piped")).lines();
    let mut stderr = BufReader::new(child.stderr.take().expect("stderr piped")).lines();
    let mut stdout_open = true;
    let mut stderr_open = true;
    let mut canceled = false;

    let mut keep_alive = tokio::time::interval(parameters.keep_alive);
    keep_alive.tick().await; // skip the immediate first tick

    let status = loop {
        select! {
            line = stdout.next_line(), if stdout_open => match line {
                Ok(Some(line)) => send(writer, &Message::LogLine(line)).await?,
                _ => stdout_open = false,
            },
            line = stderr.next_line(), if stderr_open => match line {
                Ok(Some(line)) => send(writer, &Message::LogLine(line)).await?,
                _ => stderr_open = false,
            },

            _ = keep_alive.tick() => {
                send(writer, &Message::KeepAlive).await?;
            }

            message = inbound.recv() => match message {
                Some(Message::CancelBuild) => {
                    tracing::info!("cancellation requested, killing build");
                    canceled = true;
                    let _ = child.start_kill();
                }
                Some(Message::PromptResponse { prompt_id, .. }) => {
                    // no interactive prompts for subprocess builds yet;
                    // acknowledge by logging so answers are not lost silently
                    tracing::debug!(%prompt_id, "discarding prompt response");
                }
                Some(other) => {
                    tracing::warn!(
                        discriminator = other.discriminator(),
                        "unexpected message during build"
                    );
                }
                None => {
                    // client hung up; there is nobody left to build for
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    anyhow::bail!("client disconnected during build");
                }
            },

            status = child.wait() => break status?,
        }
    };

    // the pipes are at EOF now; flush whatever the child still had buffered
    while let Ok(Some(line)) = stdout.next_line().await {
        send(writer, &Message::LogLine(line)).await?;
    }
    while let Ok(Some(line)) = stderr.next_line().await {
        send(writer, &Message::LogLine(line)).await?;
    }

    let exit_code = if canceled {
        CANCELED_EXIT_CODE
    } else {
        exit_code_of(&status)
    };

    send(
        writer,
        &Message::ProjectEvent {
            project_id: project,
            message: format!("build finished with exit code {}", exit_code),
        },
    )
    .await?;
    send(writer, &Message::BuildFinished { exit_code }).await?;
    Ok(exit_code)
}

async fn send(writer: &mut TransportWriter, message: &Message) -> anyhow::Result<()> {
    writer.dispatch(message).await?;
    writer.flush().await?;
    Ok(())
}

fn project_name(working_dir: &str) -> String {
    Path::new(working_dir)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| working_dir.to_string())
}

fn exit_code_of(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(1)
}

/// File-based logging for the daemon; one log file per daemon id. The
/// returned guard must stay alive so buffered lines reach the file.
fn init_logging(daemon_dir: &Path, daemon_id: &str) -> anyhow::Result<WorkerGuard> {
    let file_appender =
        tracing_appender::rolling::never(daemon_dir, format!("{}.log", daemon_id));
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_level(true)
        .init();

    Ok(guard)
}
