//! The worker: sole owner of one backend.
//!
//! The loop reads [`Command`]s from its inbound channel one at a time,
//! dispatches each by name and writes exactly one tagged reply per command
//! to the outbound channel. Before the first command it initializes the
//! backend with bounded retries and reports the outcome once as
//! [`WorkerMessage::Init`].
//!
//! A worker whose backend never came up stays inert: it answers every
//! command with an error until `shutdown` or the end of its inbound channel.
//! Handler errors and panics are converted into error responses; the loop
//! only ends on `shutdown`, when the broker goes away, or when nobody reads
//! its replies any more.

use crate::dispatch::Dispatcher;
use crate::teardown::TeardownReport;
use futures::FutureExt;
use pitaya_core::config::PitayaConfig;
use pitaya_core::protocol::commands;
use pitaya_core::{
    Backend, BackendFactory, BackendSpec, Command, PitayaError, PitayaResult, Response,
    RetryPolicy, WorkerMessage,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Everything a worker needs to bring its backend up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Backend to open
    pub spec: BackendSpec,
    /// Initialization retries
    pub init_retry: RetryPolicy,
}

impl WorkerConfig {
    /// Worker configuration for one device, taking driver settings from `config`.
    pub fn new(
        config: &PitayaConfig,
        address: impl Into<String>,
        config_name: impl Into<String>,
        mock: bool,
    ) -> Self {
        let mut spec = BackendSpec::new(address, config_name, mock);
        spec.scpi = config.scpi.clone();
        spec.simulator = config.simulator.clone();
        Self {
            spec,
            init_retry: config.worker.init_retry.clone(),
        }
    }

    /// Device address.
    pub fn address(&self) -> &str {
        &self.spec.address
    }
}

/// Open a backend, retrying up to `retry.attempts` times with a fixed delay.
pub async fn initialize_backend(
    factory: &dyn BackendFactory,
    spec: &BackendSpec,
    retry: &RetryPolicy,
) -> PitayaResult<Box<dyn Backend>> {
    let attempts = retry.attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        let outcome = AssertUnwindSafe(factory.create(spec)).catch_unwind().await;
        match outcome {
            Ok(Ok(backend)) => {
                info!(
                    address = %spec.address,
                    config = %spec.config_name,
                    backend = backend.kind().label(),
                    attempt,
                    "Backend initialized"
                );
                return Ok(backend);
            }
            Ok(Err(e)) => last_error = e.to_string(),
            Err(panic) => last_error = format!("backend factory panicked: {}", panic_message(&*panic)),
        }
        warn!(
            address = %spec.address,
            attempt,
            attempts,
            error = %last_error,
            "Backend initialization attempt failed"
        );
        if attempt < attempts {
            tokio::time::sleep(retry.delay).await;
        }
    }

    Err(PitayaError::InitializationFailed {
        address: spec.address.clone(),
        attempts,
        reason: last_error,
    })
}

/// Run the worker loop until shutdown or until the inbound channel closes.
pub async fn run_worker(
    config: &WorkerConfig,
    factory: &dyn BackendFactory,
    mut inbound: mpsc::Receiver<Command>,
    outbound: mpsc::UnboundedSender<WorkerMessage>,
) {
    let address = config.address().to_string();

    let mut dispatcher = match initialize_backend(factory, &config.spec, &config.init_retry).await
    {
        Ok(backend) => {
            let init = WorkerMessage::Init {
                response: Response::ok(Value::String(backend.kind().label().to_string())),
            };
            if outbound.send(init).is_err() {
                debug!(address = %address, "Broker went away during initialization");
            }
            Dispatcher::new(backend)
        }
        Err(e) => {
            error!(address = %address, error = %e, "Worker is inert");
            let reason = match e {
                PitayaError::InitializationFailed { reason, .. } => reason,
                other => other.to_string(),
            };
            let _ = outbound.send(WorkerMessage::Init {
                response: Response::error(&reason),
            });
            run_inert(&address, &reason, &mut inbound, &outbound).await;
            return;
        }
    };

    while let Some(command) = inbound.recv().await {
        let is_shutdown = command.name == commands::SHUTDOWN;
        let response = handle(&mut dispatcher, &command).await;

        if is_shutdown {
            if let Ok(report) = serde_json::from_value::<TeardownReport>(response.data.clone()) {
                report.log(&address);
            }
        }
        if outbound.send(WorkerMessage::reply(&command, response)).is_err() {
            warn!(address = %address, "Outbound channel closed, stopping worker");
            break;
        }
        if is_shutdown {
            info!(address = %address, "Worker shut down");
            return;
        }
    }

    // Broker dropped us without a shutdown command
    let report = dispatcher.teardown().await;
    report.log(&address);
    info!(address = %address, "Worker exited after its command channel closed");
}

async fn run_inert(
    address: &str,
    reason: &str,
    inbound: &mut mpsc::Receiver<Command>,
    outbound: &mpsc::UnboundedSender<WorkerMessage>,
) {
    while let Some(command) = inbound.recv().await {
        let is_shutdown = command.name == commands::SHUTDOWN;
        let response = if is_shutdown {
            match serde_json::to_value(TeardownReport::new()) {
                Ok(data) => Response::ok(data),
                Err(e) => Response::error(e),
            }
        } else {
            Response::error(format!("backend for '{address}' is not initialized: {reason}"))
        };
        if outbound.send(WorkerMessage::reply(&command, response)).is_err() || is_shutdown {
            break;
        }
    }
    debug!(address, "Inert worker exited");
}

async fn handle(dispatcher: &mut Dispatcher, command: &Command) -> Response {
    debug!(
        correlation_id = %command.correlation_id,
        command = %command.name,
        "Executing command"
    );
    let outcome = AssertUnwindSafe(dispatcher.execute(&command.name, &command.params))
        .catch_unwind()
        .await;
    match outcome {
        Ok(Ok(data)) => Response::ok(data),
        Ok(Err(e)) => {
            debug!(correlation_id = %command.correlation_id, command = %command.name, error = %e, "Command failed");
            Response::error(e)
        }
        Err(panic) => {
            let message = panic_message(&*panic);
            error!(
                correlation_id = %command.correlation_id,
                command = %command.name,
                panic = %message,
                "Command handler panicked"
            );
            Response::error(format!("handler panicked: {message}"))
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
