//! Response listener.
//!
//! One background task per running worker drains the outbound channel and
//! hands each tagged reply to the caller waiting on its correlation id. It
//! is the only reader of that channel and never blocks on anything else.

use crate::launch::Liveness;
use crate::pending::PendingTable;
use pitaya_core::{PitayaError, WorkerMessage};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Handle to a running listener task.
pub struct ResponseListener {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<mpsc::UnboundedReceiver<WorkerMessage>>,
}

impl ResponseListener {
    /// Start routing messages from `outbound` into `pending`.
    pub fn spawn(
        outbound: mpsc::UnboundedReceiver<WorkerMessage>,
        pending: Arc<PendingTable>,
        liveness: Liveness,
    ) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(listen(outbound, pending, liveness, shutdown_rx));
        Self { shutdown, task }
    }

    /// Whether the listener task has ended on its own.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the listener and take back the channel so it can be restarted.
    ///
    /// Returns `None` if the task panicked or was cancelled.
    pub async fn stop(self) -> Option<mpsc::UnboundedReceiver<WorkerMessage>> {
        let _ = self.shutdown.send(true);
        match self.task.await {
            Ok(outbound) => Some(outbound),
            Err(e) => {
                warn!(error = %e, "Response listener did not stop cleanly");
                None
            }
        }
    }
}

async fn listen(
    mut outbound: mpsc::UnboundedReceiver<WorkerMessage>,
    pending: Arc<PendingTable>,
    liveness: Liveness,
    mut shutdown: watch::Receiver<bool>,
) -> mpsc::UnboundedReceiver<WorkerMessage> {
    debug!("Response listener started");
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!("Response listener stopping");
                    break;
                }
            }
            message = outbound.recv() => match message {
                Some(WorkerMessage::Tagged { correlation_id, response }) => {
                    pending.complete(correlation_id, response);
                }
                Some(WorkerMessage::Init { response }) => {
                    info!(ok = response.is_ok(), data = %response.data, "Ignoring readiness message after start");
                }
                None => {
                    liveness.mark_dead();
                    let failed = pending.fail_all(&PitayaError::NotRunning(
                        "worker exited before responding".into(),
                    ));
                    if failed > 0 {
                        warn!(failed, "Worker channel closed with commands in flight");
                    } else {
                        debug!("Worker channel closed");
                    }
                    break;
                }
            }
        }
    }
    outbound
}
