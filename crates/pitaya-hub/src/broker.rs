//! Command broker.
//!
//! The broker starts and supervises one worker and lets any number of tasks
//! talk to it at once. Each call gets a fresh correlation id, parks a
//! oneshot in the [`PendingTable`] and waits; the [`ResponseListener`] wakes
//! it when the matching reply arrives. Callers never wait on each other,
//! only on their own reply or their own deadline.
//!
//! # Lifecycle
//!
//! ```text
//! start ──► launch worker ──► wait for Init ──► spawn listener ──► running
//!                               │ error/timeout
//!                               ▼
//!                          InitializationFailed / Timeout
//!
//! stop ──► shutdown command ──► stop listener ──► wait (or kill) ──► stopped
//! ```

use crate::launch::{Liveness, WorkerHandle, WorkerLauncher};
use crate::listener::ResponseListener;
use crate::pending::{BrokerStats, PendingTable};
use crate::teardown::TeardownReport;
use crate::worker::WorkerConfig;
use parking_lot::RwLock;
use pitaya_core::config::BrokerSettings;
use pitaya_core::protocol::{commands, to_params};
use pitaya_core::{
    Command, CorrelationId, Params, PitayaError, PitayaResult, Response, WorkerMessage,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// Identity of one running worker.
///
/// Two links are equal when they refer to the same worker generation.
#[derive(Debug, Clone)]
pub struct WorkerLink {
    generation: u64,
    config: Arc<WorkerConfig>,
    liveness: Liveness,
}

impl WorkerLink {
    /// Monotonic worker generation within this broker.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Configuration the worker was started with.
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Whether the worker is still running.
    pub fn is_alive(&self) -> bool {
        self.liveness.is_alive()
    }
}

impl PartialEq for WorkerLink {
    fn eq(&self, other: &Self) -> bool {
        self.generation == other.generation
    }
}

impl Eq for WorkerLink {}

#[derive(Clone)]
struct Route {
    link: WorkerLink,
    inbound: mpsc::Sender<Command>,
}

struct RunningWorker {
    route: Route,
    listener: ResponseListener,
    handle: Box<dyn WorkerHandle>,
}

/// Removes a pending entry on every exit path of a call, including
/// cancellation of the calling task.
struct PendingGuard<'a> {
    table: &'a PendingTable,
    id: CorrelationId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.table.discard(self.id);
    }
}

/// Facade over one worker, shared by many concurrent callers.
pub struct CommandBroker {
    launcher: Arc<dyn WorkerLauncher>,
    settings: BrokerSettings,
    state: Mutex<Option<RunningWorker>>,
    route: RwLock<Option<Route>>,
    pending: Arc<PendingTable>,
    generation: AtomicU64,
}

impl CommandBroker {
    /// Broker launching workers through `launcher`.
    pub fn new(launcher: Arc<dyn WorkerLauncher>, settings: BrokerSettings) -> Self {
        Self {
            launcher,
            settings,
            state: Mutex::new(None),
            route: RwLock::new(None),
            pending: Arc::new(PendingTable::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Timing settings.
    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    /// Start the worker, or return the running one.
    ///
    /// Calling this again while the worker runs returns the same link; a
    /// different `config` is logged and ignored. Fails with
    /// [`PitayaError::InitializationFailed`] when the backend never came up
    /// and [`PitayaError::Timeout`] when the worker did not report within
    /// `start_timeout`.
    pub async fn start(&self, config: WorkerConfig) -> PitayaResult<WorkerLink> {
        let mut state = self.state.lock().await;

        if let Some(running) = state.as_ref() {
            let link = &running.route.link;
            if link.is_alive() {
                if *link.config != config {
                    warn!(
                        address = %link.config.address(),
                        generation = link.generation,
                        "Worker already running with a different configuration; keeping it"
                    );
                } else {
                    debug!(generation = link.generation, "Worker already running");
                }
                return Ok(link.clone());
            }
        }
        if let Some(stale) = state.take() {
            info!(generation = stale.route.link.generation, "Replacing exited worker");
            *self.route.write() = None;
            let report = self.shutdown_worker(stale).await;
            report.log(config.address());
        }

        let mut channels = self.launcher.launch(&config).await?;
        let address = config.address().to_string();
        let init = tokio::time::timeout(
            self.settings.start_timeout,
            wait_for_init(&mut channels.outbound),
        )
        .await;

        let failure = match init {
            Ok(Some(response)) if response.is_ok() => None,
            Ok(Some(response)) => Some(PitayaError::InitializationFailed {
                address: address.clone(),
                attempts: config.init_retry.attempts.max(1),
                reason: response.reason().unwrap_or_default(),
            }),
            Ok(None) => Some(PitayaError::InitializationFailed {
                address: address.clone(),
                attempts: config.init_retry.attempts.max(1),
                reason: "worker exited before reporting readiness".into(),
            }),
            Err(_) => Some(PitayaError::Timeout {
                command: "start".into(),
                timeout: self.settings.start_timeout,
            }),
        };
        if let Some(error) = failure {
            warn!(address = %address, error = %error, worker = %channels.handle.describe(), "Worker failed to start");
            // Closing the inbound channel ends an inert worker
            drop(channels.inbound);
            if !channels.handle.wait(self.settings.shutdown_timeout).await {
                channels.handle.terminate().await;
            }
            return Err(error);
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let link = WorkerLink {
            generation,
            config: Arc::new(config),
            liveness: channels.liveness.clone(),
        };
        let route = Route {
            link: link.clone(),
            inbound: channels.inbound,
        };
        let listener = ResponseListener::spawn(
            channels.outbound,
            Arc::clone(&self.pending),
            channels.liveness,
        );
        *self.route.write() = Some(route.clone());
        info!(
            address = %address,
            generation,
            worker = %channels.handle.describe(),
            "Worker started"
        );
        *state = Some(RunningWorker {
            route,
            listener,
            handle: channels.handle,
        });
        Ok(link)
    }

    /// Send one command and wait up to `timeout` for its response.
    ///
    /// A worker that is not running yields [`PitayaError::NotRunning`]
    /// immediately. The pending entry is removed on every path out of this
    /// call.
    pub async fn send_command(
        &self,
        name: &str,
        params: Params,
        timeout: Duration,
    ) -> PitayaResult<Response> {
        let route = self
            .route
            .read()
            .clone()
            .ok_or_else(|| PitayaError::NotRunning("broker has not been started".into()))?;
        self.exchange(&route, name, params, timeout).await
    }

    /// Send a command with typed parameters and decode its typed payload.
    pub async fn call<P, T>(&self, name: &str, params: &P, timeout: Duration) -> PitayaResult<T>
    where
        P: Serialize + Sync,
        T: DeserializeOwned,
    {
        let params = to_params(params)?;
        self.send_command(name, params, timeout)
            .await?
            .into_payload(name)
    }

    async fn exchange(
        &self,
        route: &Route,
        name: &str,
        params: Params,
        timeout: Duration,
    ) -> PitayaResult<Response> {
        if !route.link.is_alive() {
            return Err(PitayaError::NotRunning(format!(
                "worker for '{}' has exited",
                route.link.config.address()
            )));
        }

        let command = Command::new(name, params);
        let id = command.correlation_id;
        let receiver = self.pending.register(id, name)?;
        let _guard = PendingGuard {
            table: &self.pending,
            id,
        };

        let exchange = async {
            route
                .inbound
                .send(command)
                .await
                .map_err(|_| PitayaError::NotRunning("worker command channel closed".into()))?;
            match receiver.await {
                Ok(completion) => completion,
                Err(_) => Err(PitayaError::NotRunning(
                    "response channel closed before a reply arrived".into(),
                )),
            }
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => {
                self.pending.record_timeout(id);
                Err(PitayaError::Timeout {
                    command: name.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Shut the worker down and collect its teardown report.
    ///
    /// Returns `None` when nothing was running.
    pub async fn stop(&self) -> PitayaResult<Option<TeardownReport>> {
        let mut state = self.state.lock().await;
        let Some(running) = state.take() else {
            return Ok(None);
        };
        *self.route.write() = None;
        Ok(Some(self.shutdown_worker(running).await))
    }

    /// Stop the current worker and start a new one with `config`.
    pub async fn restart(&self, config: WorkerConfig) -> PitayaResult<WorkerLink> {
        if let Some(report) = self.stop().await? {
            report.log(config.address());
        }
        self.start(config).await
    }

    async fn shutdown_worker(&self, running: RunningWorker) -> TeardownReport {
        let RunningWorker {
            route,
            listener,
            mut handle,
        } = running;
        let mut report = TeardownReport::new();

        if route.link.is_alive() {
            match self
                .exchange(
                    &route,
                    commands::SHUTDOWN,
                    Params::new(),
                    self.settings.shutdown_timeout,
                )
                .await
                .and_then(|response| response.into_payload::<TeardownReport>(commands::SHUTDOWN))
            {
                Ok(worker_report) => report.extend(worker_report),
                Err(e) => report.record("shutdown command", Err(e)),
            }
        }

        if listener.stop().await.is_none() {
            report.record(
                "stop response listener",
                Err(PitayaError::Backend("listener task failed".into())),
            );
        }
        drop(route);

        let describe = handle.describe();
        if handle.wait(self.settings.shutdown_timeout).await {
            report.record(format!("stop worker ({describe})"), Ok(()));
        } else {
            handle.terminate().await;
            report.record(
                format!("stop worker ({describe})"),
                Err(PitayaError::Timeout {
                    command: commands::SHUTDOWN.into(),
                    timeout: self.settings.shutdown_timeout,
                }),
            );
        }

        self.pending
            .fail_all(&PitayaError::NotRunning("broker stopped".into()));
        report
    }

    /// Whether a worker is running.
    pub fn is_running(&self) -> bool {
        self.route
            .read()
            .as_ref()
            .is_some_and(|route| route.link.is_alive())
    }

    /// Link to the current worker, if one was started.
    pub fn link(&self) -> Option<WorkerLink> {
        self.route.read().as_ref().map(|route| route.link.clone())
    }

    /// Commands currently waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Traffic counters.
    pub fn stats(&self) -> BrokerStats {
        self.pending.stats()
    }
}

impl std::fmt::Debug for CommandBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBroker")
            .field("link", &self.link())
            .field("pending", &self.pending.len())
            .finish()
    }
}

async fn wait_for_init(
    outbound: &mut mpsc::UnboundedReceiver<WorkerMessage>,
) -> Option<Response> {
    while let Some(message) = outbound.recv().await {
        match message {
            WorkerMessage::Init { response } => return Some(response),
            WorkerMessage::Tagged { correlation_id, .. } => {
                warn!(correlation_id = %correlation_id, "Reply before readiness message, dropping");
            }
        }
    }
    None
}
