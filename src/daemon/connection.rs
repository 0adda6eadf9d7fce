//! One client connection to a build daemon.
//!
//! Two tasks cooperate per connection: the caller task, which dispatches
//! outbound messages and consumes inbound batches, and a background receive
//! pump that drains the transport into a bounded queue. The queue capacity
//! is deliberately small: a slow caller blocks the pump, which in turn
//! backpressures the daemon through the socket buffers. Dropping build
//! events is not acceptable.
//!
//! Failure handling is asymmetric on purpose. Before the first inbound
//! message the connection cannot tell a stale registry entry from a daemon
//! that failed at startup, so classification consults the stale-address
//! detector and the `new_daemon` flag. After the first message, staleness
//! is the only retryable verdict.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::daemon::diagnostics::DaemonDiagnostics;
use crate::daemon::info::DaemonInfo;
use crate::daemon::message::Message;
use crate::daemon::parameters::DaemonParameters;
use crate::daemon::transport::{
    DaemonTransport, StaleAddressDetector, TransportReader, TransportWriter,
};
use crate::error::{DaemonError, TransportError};

/// Inbound queue capacity. Small enough that a stalled caller throttles the
/// daemon within a few frames.
const QUEUE_CAPACITY: usize = 16;

pub struct DaemonConnection {
    daemon: DaemonInfo,
    parameters: DaemonParameters,
    detector: Arc<dyn StaleAddressDetector>,
    /// True iff this connection is the first client of a freshly spawned
    /// daemon; failures before the first inbound message are then blamed on
    /// startup rather than on a stale registry entry.
    new_daemon: bool,
    /// False until at least one receive iteration has completed, success or
    /// failure. Monotonic.
    has_received: AtomicBool,
    running: Arc<AtomicBool>,
    /// First error observed by the pump; set at most once.
    terminal_error: Arc<OnceLock<TransportError>>,
    /// Silence budget for one receive poll, `keep_alive × max_lost_keep_alive`.
    max_keep_alive: std::time::Duration,
    /// Serialises the outbound half of the transport.
    writer: Mutex<TransportWriter>,
    queue_tx: mpsc::Sender<Message>,
    queue_rx: Mutex<mpsc::Receiver<Message>>,
    receiver: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl DaemonConnection {
    pub fn new(
        transport: DaemonTransport,
        daemon: DaemonInfo,
        detector: Arc<dyn StaleAddressDetector>,
        new_daemon: bool,
        parameters: DaemonParameters,
    ) -> Self {
        let (reader, writer) = transport.into_split();
        let (queue_tx, queue_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let running = Arc::new(AtomicBool::new(true));
        let terminal_error = Arc::new(OnceLock::new());

        let receiver = tokio::spawn(receive_pump(
            reader,
            queue_tx.clone(),
            Arc::clone(&running),
            Arc::clone(&terminal_error),
        ));

        Self {
            max_keep_alive: parameters.max_keep_alive(),
            daemon,
            parameters,
            detector,
            new_daemon,
            has_received: AtomicBool::new(false),
            running,
            terminal_error,
            writer: Mutex::new(writer),
            queue_tx,
            queue_rx: Mutex::new(queue_rx),
            receiver,
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn daemon(&self) -> &DaemonInfo {
        &self.daemon
    }

    /// Write one message to the daemon and flush it.
    ///
    /// After a successful write of `CancelBuild` the same message is also
    /// echoed into the inbound queue, so the caller's receive loop wakes up
    /// promptly even if the daemon is wedged and cannot answer.
    pub async fn dispatch(&self, message: Message) -> Result<(), DaemonError> {
        if !self.running.load(Ordering::Acquire) {
            return Err(closed_error());
        }
        tracing::debug!(
            daemon = %self.daemon.id,
            discriminator = message.discriminator(),
            "dispatching message"
        );

        let result = {
            let mut writer = self.writer.lock().await;
            match writer.dispatch(&message).await {
                Ok(()) => writer.flush().await,
                Err(e) => Err(e),
            }
        };

        if let Err(failure) = result {
            tracing::debug!(daemon = %self.daemon.id, %failure, "dispatch to the daemon failed");
            if !self.has_received.load(Ordering::Acquire)
                && self.detector.maybe_stale_address(&failure)
            {
                return Err(DaemonError::StaleAddress(format!(
                    "could not dispatch a message to the daemon: {}",
                    failure
                )));
            }
            return Err(DaemonError::Connect(format!(
                "could not dispatch a message to the daemon: {}",
                failure
            )));
        }

        if message.is_cancel() {
            self.queue_tx
                .send(message)
                .await
                .map_err(|_| DaemonError::Interrupted)?;
        }
        Ok(())
    }

    /// Wait for at least one inbound message, then drain and return every
    /// message currently queued, in arrival order.
    ///
    /// Waits at most `keep_alive × max_lost_keep_alive` for the first
    /// message; silence beyond that means the daemon is presumed dead. A
    /// terminal pump error preempts delivery even when messages were
    /// already collected: on a dying connection, failure takes precedence
    /// over a partial batch.
    pub async fn receive(&self) -> Result<Vec<Message>, DaemonError> {
        let mut rx = self.queue_rx.lock().await;
        let mut shutdown = self.shutdown_rx.clone();
        let max_keep_alive = self.max_keep_alive;

        loop {
            if *shutdown.borrow() {
                return Err(closed_error());
            }

            let polled = tokio::select! {
                message = rx.recv() => message,
                _ = tokio::time::sleep(max_keep_alive) => None,
                _ = shutdown.changed() => return Err(closed_error()),
            };

            let failure = 'batch: {
                // a pump error takes precedence over whatever was polled
                if let Some(e) = self.terminal_error.get() {
                    break 'batch e.clone();
                }
                let first = match polled {
                    Some(message) => message,
                    None => {
                        break 'batch TransportError::Io {
                            kind: std::io::ErrorKind::TimedOut,
                            message: format!(
                                "No message received within {}ms, daemon may have crashed. \
                                 You may want to check its status with `anvil daemon status`",
                                max_keep_alive.as_millis()
                            ),
                        };
                    }
                };

                let mut batch = Vec::with_capacity(4);
                batch.push(first);
                while let Ok(message) = rx.try_recv() {
                    batch.push(message);
                }

                if let Some(e) = self.terminal_error.get() {
                    break 'batch e.clone();
                }
                self.has_received.store(true, Ordering::Release);
                return Ok(batch);
            };

            let diagnostics = DaemonDiagnostics::new(&self.daemon, &self.parameters).describe();
            tracing::debug!(daemon = %self.daemon.id, %failure, "receive from the daemon failed");

            // classification reads the pre-iteration value; the flag itself
            // is set whatever the outcome
            let first_iteration = !self.has_received.swap(true, Ordering::AcqRel);
            if first_iteration && self.new_daemon {
                return Err(DaemonError::Connect(format!(
                    "could not receive a message from the daemon: {}\n{}",
                    failure, diagnostics
                )));
            }
            if self.detector.maybe_stale_address(&failure) {
                return Err(DaemonError::StaleAddress(format!(
                    "could not receive a message from the daemon: {}\n{}",
                    failure, diagnostics
                )));
            }
            // A transient failure is worth re-polling: the pump may still
            // deliver. Once the pump has exited nothing ever will, so
            // re-polling would spin against the timeout forever.
            if self.terminal_error.get().is_some() || self.receiver.is_finished() {
                return Err(DaemonError::Connect(format!(
                    "could not receive a message from the daemon: {}\n{}",
                    failure, diagnostics
                )));
            }
        }
    }

    /// Inject a locally synthesised message into the inbound queue, e.g. a
    /// prompt answer collected from the user. It is delivered to the receive
    /// loop through the same ordered channel as real daemon traffic.
    pub async fn enqueue(&self, message: Message) {
        // The queue outlives every caller of this method; a failed put means
        // the connection was torn down mid-call, which callers cannot
        // meaningfully handle.
        self.queue_tx
            .send(message)
            .await
            .expect("inbound queue closed while the connection was in use");
    }

    /// Tear the connection down: stop the pump, close the transport.
    /// Idempotent and callable from any task; concurrent `dispatch` and
    /// `receive` calls fail fast with a closed-connection error.
    pub async fn close(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(daemon = %self.daemon.id, "closing daemon connection");
        let _ = self.shutdown_tx.send(true);
        self.receiver.abort();
        // The lock is only ever held for one write+flush; an in-flight
        // dispatch finishes, then the write half is shut down for good.
        self.writer.lock().await.close().await;
    }
}

impl Drop for DaemonConnection {
    fn drop(&mut self) {
        self.receiver.abort();
    }
}

fn closed_error() -> DaemonError {
    DaemonError::Connect("the connection to the daemon is closed".into())
}

/// Background pump: drain the transport into the queue until EOF, an error,
/// or shutdown. The first error is parked for the caller unless a shutdown
/// is already in progress, in which case the race is benign and the error
/// is dropped.
async fn receive_pump(
    mut reader: TransportReader,
    queue: mpsc::Sender<Message>,
    running: Arc<AtomicBool>,
    terminal_error: Arc<OnceLock<TransportError>>,
) {
    while running.load(Ordering::Acquire) {
        match reader.receive().await {
            Ok(Some(message)) => {
                if queue.send(message).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(failure) => {
                if running.load(Ordering::Acquire) {
                    let _ = terminal_error.set(failure);
                }
                break;
            }
        }
    }
}
