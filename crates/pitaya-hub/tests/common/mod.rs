//! Shared fixtures for the hub integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use pitaya_core::backend::{Acquisition, Backend, BackendFactory, BackendSpec, RegisterValue};
use pitaya_core::config::{BrokerSettings, PitayaConfig};
use pitaya_core::payload::{Quadratures, ScopeTrace};
use pitaya_core::{
    BackendKind, Command, ModuleId, PitayaError, PitayaResult, Register, Response, RetryPolicy,
    Signal, Simulation, WorkerMessage,
};
use pitaya_driver_sim::{PlantBank, SimBackend};
use pitaya_hub::{WorkerChannels, WorkerConfig, WorkerHandle, WorkerLauncher};
use pitaya_hub::launch::Liveness;
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Broker settings with short timeouts.
pub fn fast_broker_settings() -> BrokerSettings {
    BrokerSettings {
        start_timeout: Duration::from_secs(5),
        command_timeout: Duration::from_secs(5),
        shutdown_timeout: Duration::from_secs(2),
        channel_capacity: 16,
    }
}

/// Config with quick retries and no simulator noise.
pub fn test_config() -> PitayaConfig {
    let mut config = PitayaConfig::default();
    config.broker = fast_broker_settings();
    config.worker.init_retry = RetryPolicy {
        attempts: 2,
        delay: Duration::from_millis(10),
    };
    config.simulator.noise_std = 0.0;
    config.simulator.seed = Some(7);
    config
}

pub fn mock_worker(address: &str) -> WorkerConfig {
    WorkerConfig::new(&test_config(), address, "cfg", true)
}

/// Simulator whose `identify` takes `delay` and whose `iq2` quadrature read
/// panics.
pub struct SlowBackend {
    inner: SimBackend,
    delay: Duration,
}

#[async_trait]
impl Backend for SlowBackend {
    fn kind(&self) -> BackendKind {
        self.inner.kind()
    }

    async fn identify(&mut self) -> PitayaResult<String> {
        tokio::time::sleep(self.delay).await;
        self.inner.identify().await
    }

    async fn read_register(
        &mut self,
        module: ModuleId,
        register: Register,
    ) -> PitayaResult<RegisterValue> {
        self.inner.read_register(module, register).await
    }

    async fn write_register(
        &mut self,
        module: ModuleId,
        register: Register,
        value: RegisterValue,
    ) -> PitayaResult<()> {
        self.inner.write_register(module, register, value).await
    }

    async fn read_signal(&mut self, signal: Signal) -> PitayaResult<f64> {
        self.inner.read_signal(signal).await
    }

    async fn read_quadratures(&mut self, module: ModuleId) -> PitayaResult<Quadratures> {
        if module.index() == 2 {
            panic!("quadrature engine exploded");
        }
        self.inner.read_quadratures(module).await
    }

    async fn acquire(&mut self, request: &Acquisition) -> PitayaResult<ScopeTrace> {
        self.inner.acquire(request).await
    }

    async fn close(&mut self) -> PitayaResult<()> {
        self.inner.close().await
    }

    fn simulation(&mut self) -> Option<&mut dyn Simulation> {
        self.inner.simulation()
    }
}

/// Opens [`SlowBackend`]s.
pub struct SlowFactory {
    pub delay: Duration,
    pub plants: PlantBank,
}

impl SlowFactory {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            plants: PlantBank::new(),
        }
    }
}

#[async_trait]
impl BackendFactory for SlowFactory {
    async fn create(&self, spec: &BackendSpec) -> PitayaResult<Box<dyn Backend>> {
        Ok(Box::new(SlowBackend {
            inner: SimBackend::open(spec, &self.plants)?,
            delay: self.delay,
        }))
    }
}

/// Never manages to open a backend.
#[derive(Default)]
pub struct UnreachableFactory {
    pub calls: AtomicU32,
}

#[async_trait]
impl BackendFactory for UnreachableFactory {
    async fn create(&self, spec: &BackendSpec) -> PitayaResult<Box<dyn Backend>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(PitayaError::Backend(format!(
            "no route to host {}",
            spec.address
        )))
    }
}

/// Simulator factory that takes `stall` to open the device at `address`;
/// every other address opens at once.
pub struct StallingFactory {
    pub address: String,
    pub stall: Duration,
    pub opened: AtomicU32,
    pub plants: PlantBank,
}

impl StallingFactory {
    pub fn new(address: &str, stall: Duration) -> Self {
        Self {
            address: address.to_string(),
            stall,
            opened: AtomicU32::new(0),
            plants: PlantBank::new(),
        }
    }
}

#[async_trait]
impl BackendFactory for StallingFactory {
    async fn create(&self, spec: &BackendSpec) -> PitayaResult<Box<dyn Backend>> {
        if spec.address == self.address {
            tokio::time::sleep(self.stall).await;
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SimBackend::open(spec, &self.plants)?))
    }
}

/// Fake worker host whose worker answers commands in batches of `batch`,
/// last received first. Each reply echoes the command's `tag` parameter.
pub struct ReorderingLauncher {
    pub batch: usize,
}

/// Fake worker host whose worker reports ready, then exits on the first
/// command without answering it.
pub struct VanishingLauncher;

struct TaskWorker {
    task: JoinHandle<()>,
}

#[async_trait]
impl WorkerHandle for TaskWorker {
    async fn wait(&mut self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, &mut self.task).await.is_ok()
    }

    async fn terminate(&mut self) {
        self.task.abort();
    }

    fn describe(&self) -> String {
        "test task".to_string()
    }
}

fn channels(
    inbound: mpsc::Sender<Command>,
    outbound: mpsc::UnboundedReceiver<WorkerMessage>,
    liveness: Liveness,
    task: JoinHandle<()>,
) -> WorkerChannels {
    WorkerChannels {
        inbound,
        outbound,
        liveness,
        handle: Box::new(TaskWorker { task }),
    }
}

#[async_trait]
impl WorkerLauncher for ReorderingLauncher {
    async fn launch(&self, _config: &WorkerConfig) -> PitayaResult<WorkerChannels> {
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<Command>(64);
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let liveness = Liveness::new();
        let guard = liveness.guard();
        let batch = self.batch.max(1);

        let task = tokio::spawn(async move {
            let _guard = guard;
            let _ = msg_tx.send(WorkerMessage::Init {
                response: Response::ok(json!("fake")),
            });
            let mut held: Vec<Command> = Vec::new();
            while let Some(command) = cmd_rx.recv().await {
                if command.name == "shutdown" {
                    let _ = msg_tx.send(WorkerMessage::reply(
                        &command,
                        Response::ok(json!({"steps": []})),
                    ));
                    return;
                }
                held.push(command);
                if held.len() == batch {
                    for command in held.drain(..).rev() {
                        let tag = command.params.get("tag").cloned().unwrap_or_default();
                        let _ = msg_tx.send(WorkerMessage::reply(
                            &command,
                            Response::ok(json!({ "tag": tag })),
                        ));
                    }
                }
            }
        });
        Ok(channels(cmd_tx, msg_rx, liveness, task))
    }
}

#[async_trait]
impl WorkerLauncher for VanishingLauncher {
    async fn launch(&self, _config: &WorkerConfig) -> PitayaResult<WorkerChannels> {
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<Command>(8);
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let liveness = Liveness::new();
        let guard = liveness.guard();

        let task = tokio::spawn(async move {
            let _guard = guard;
            let _ = msg_tx.send(WorkerMessage::Init {
                response: Response::ok(json!("fake")),
            });
            let _ = cmd_rx.recv().await;
        });
        Ok(channels(cmd_tx, msg_rx, liveness, task))
    }
}

pub fn shared<F: BackendFactory + 'static>(factory: F) -> Arc<dyn BackendFactory> {
    Arc::new(factory)
}
