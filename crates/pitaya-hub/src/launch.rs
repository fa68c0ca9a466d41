//! Worker hosting.
//!
//! A [`WorkerLauncher`] starts a worker and hands back its two channels plus
//! a [`WorkerHandle`] for waiting on or killing it. The broker does not care
//! whether the worker lives on a thread ([`ThreadLauncher`]) or in a child
//! process ([`crate::process::ProcessLauncher`]).

use crate::worker::{run_worker, WorkerConfig};
use async_trait::async_trait;
use pitaya_core::{BackendFactory, Command, PitayaError, PitayaResult, Response, WorkerMessage};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Shared flag that flips to dead once the worker is gone.
#[derive(Debug, Clone)]
pub struct Liveness(Arc<AtomicBool>);

impl Liveness {
    /// A live flag.
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    /// Whether the worker is believed to be running.
    pub fn is_alive(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Mark the worker as gone.
    pub fn mark_dead(&self) {
        self.0.store(false, Ordering::Release);
    }

    /// Guard that marks the worker dead when dropped.
    pub fn guard(&self) -> LivenessGuard {
        LivenessGuard(self.clone())
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

/// Marks its [`Liveness`] dead on drop, including during unwinding.
#[derive(Debug)]
pub struct LivenessGuard(Liveness);

impl Drop for LivenessGuard {
    fn drop(&mut self) {
        self.0.mark_dead();
    }
}

/// Control over a launched worker.
#[async_trait]
pub trait WorkerHandle: Send {
    /// Wait up to `timeout` for the worker to exit; true if it did.
    async fn wait(&mut self, timeout: Duration) -> bool;

    /// Stop the worker without its cooperation where the host allows it.
    async fn terminate(&mut self);

    /// Short description for logs.
    fn describe(&self) -> String;
}

/// A freshly launched worker.
pub struct WorkerChannels {
    /// Commands to the worker
    pub inbound: mpsc::Sender<Command>,
    /// Messages from the worker
    pub outbound: mpsc::UnboundedReceiver<WorkerMessage>,
    /// Flips to dead when the worker exits
    pub liveness: Liveness,
    /// Wait/kill control
    pub handle: Box<dyn WorkerHandle>,
}

/// Starts workers.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Launch a worker for `config`. Backend initialization happens inside
    /// the worker and is reported through its `Init` message.
    async fn launch(&self, config: &WorkerConfig) -> PitayaResult<WorkerChannels>;
}

/// Runs each worker on a dedicated OS thread with its own single-threaded
/// tokio runtime.
pub struct ThreadLauncher {
    factory: Arc<dyn BackendFactory>,
    capacity: usize,
}

impl ThreadLauncher {
    /// Launcher creating backends through `factory`, with an inbound channel
    /// of `capacity` commands.
    pub fn new(factory: Arc<dyn BackendFactory>, capacity: usize) -> Self {
        Self {
            factory,
            capacity: capacity.max(1),
        }
    }
}

#[async_trait]
impl WorkerLauncher for ThreadLauncher {
    async fn launch(&self, config: &WorkerConfig) -> PitayaResult<WorkerChannels> {
        let (cmd_tx, cmd_rx) = mpsc::channel(self.capacity);
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel::<()>();
        let liveness = Liveness::new();
        let guard = liveness.guard();
        let factory = Arc::clone(&self.factory);
        let config = config.clone();
        let name = format!("pitaya-worker-{}", config.address());

        let join = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                // Dropped last: signals exit after the runtime is gone
                let _exit = exit_tx;
                let _guard = guard;
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = msg_tx.send(WorkerMessage::Init {
                            response: Response::error(format!(
                                "failed to create worker runtime: {e}"
                            )),
                        });
                        return;
                    }
                };
                runtime.block_on(run_worker(&config, factory.as_ref(), cmd_rx, msg_tx));
            })
            .map_err(|e| PitayaError::Backend(format!("failed to spawn worker thread: {e}")))?;

        debug!(thread = %name, "Worker thread spawned");
        Ok(WorkerChannels {
            inbound: cmd_tx,
            outbound: msg_rx,
            liveness,
            handle: Box::new(ThreadWorker {
                name,
                exit: exit_rx,
                join: Some(join),
                exited: false,
            }),
        })
    }
}

struct ThreadWorker {
    name: String,
    exit: oneshot::Receiver<()>,
    join: Option<std::thread::JoinHandle<()>>,
    exited: bool,
}

#[async_trait]
impl WorkerHandle for ThreadWorker {
    async fn wait(&mut self, timeout: Duration) -> bool {
        if self.exited {
            return true;
        }
        // The sender is never used; the receiver resolves when it is dropped
        if tokio::time::timeout(timeout, &mut self.exit).await.is_err() {
            return false;
        }
        self.exited = true;
        if let Some(join) = self.join.take() {
            if join.is_finished() && join.join().is_err() {
                warn!(thread = %self.name, "Worker thread panicked");
            }
        }
        true
    }

    async fn terminate(&mut self) {
        // Threads cannot be killed; the worker exits once its command
        // channel closes and its current command returns.
        warn!(
            thread = %self.name,
            "Worker thread did not exit in time, detaching it"
        );
        self.join = None;
    }

    fn describe(&self) -> String {
        format!("thread {}", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::StandardBackendFactory;
    use pitaya_core::protocol::commands;
    use pitaya_core::{BackendSpec, Params, RetryPolicy};

    #[test]
    fn test_liveness_guard() {
        let liveness = Liveness::new();
        assert!(liveness.is_alive());
        {
            let _guard = liveness.guard();
        }
        assert!(!liveness.is_alive());
    }

    #[tokio::test]
    async fn test_thread_worker_lifecycle() {
        let launcher = ThreadLauncher::new(Arc::new(StandardBackendFactory::new()), 4);
        let config = WorkerConfig {
            spec: BackendSpec::new("sim-thread", "cfg", true),
            init_retry: RetryPolicy::default(),
        };
        let mut channels = launcher.launch(&config).await.unwrap();
        assert!(channels.handle.describe().contains("sim-thread"));

        let init = channels.outbound.recv().await.unwrap();
        assert!(matches!(init, WorkerMessage::Init { .. }));
        assert!(channels.liveness.is_alive());

        channels
            .inbound
            .send(Command::new(commands::SHUTDOWN, Params::new()))
            .await
            .unwrap();
        assert!(channels.outbound.recv().await.is_some());
        assert!(channels.handle.wait(Duration::from_secs(5)).await);
        assert!(!channels.liveness.is_alive());
        assert!(channels.outbound.recv().await.is_none());
    }
}
