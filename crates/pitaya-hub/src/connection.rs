//! One device connection, shared by every caller of the same key.
//!
//! A [`Connection`] reaches its backend in one of two ways:
//!
//! - **IPC**: through a [`CommandBroker`] and the worker it supervises.
//! - **Direct**: the connection owns a [`Dispatcher`] behind an async mutex.
//!   Each command runs to completion on its own task; a caller that times
//!   out stops waiting but never interrupts a query mid-exchange.
//!
//! Both paths run the same dispatcher and report failures the same way, so
//! the typed operations below behave identically in either mode.

use crate::broker::CommandBroker;
use crate::dispatch::Dispatcher;
use crate::launch::WorkerLauncher;
use crate::pending::BrokerStats;
use crate::teardown::TeardownReport;
use crate::worker::{initialize_backend, panic_message, WorkerConfig};
use futures::FutureExt;
use parking_lot::RwLock;
use pitaya_core::config::PitayaConfig;
use pitaya_core::protocol::{commands, params, payload, to_params};
use pitaya_core::{
    BackendFactory, OutputDirect, Params, PitayaError, PitayaResult, Response, Signal,
    TransportMode, TriggerSource, Waveform,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Registry key of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionKey {
    /// Device address (host, `host:port` or simulated device name)
    pub address: String,
    /// Named instrument configuration
    pub config_name: String,
}

impl ConnectionKey {
    /// Key for `address` under `config_name`.
    pub fn new(address: impl Into<String>, config_name: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            config_name: config_name.into(),
        }
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.config_name)
    }
}

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Not started, or torn down
    Disconnected,
    /// Backend initialization in progress
    Connecting,
    /// Ready for commands
    Connected,
    /// Backend initialization failed
    Error,
}

/// PID controller settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PidSettings {
    /// Proportional gain
    pub p: f64,
    /// Integral gain (Hz)
    pub i: f64,
    /// Derivative gain
    pub d: f64,
    /// Setpoint (V)
    pub setpoint: f64,
    /// Controller input
    pub input: Signal,
    /// Output routing
    pub output_direct: OutputDirect,
}

/// Signal generator settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AsgSettings {
    /// Waveform
    pub waveform: Waveform,
    /// Frequency (Hz)
    pub frequency: f64,
    /// Amplitude (V)
    pub amplitude: f64,
    /// DC offset (V)
    pub offset: f64,
    /// Output routing
    pub output_direct: OutputDirect,
}

/// IQ demodulator settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IqSettings {
    /// Demodulation frequency (Hz)
    pub frequency: f64,
    /// Low-pass bandwidth (Hz)
    pub bandwidth: f64,
    /// Demodulated signal
    pub input: Signal,
    /// Output routing
    pub output_direct: OutputDirect,
}

/// One scope acquisition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScopeSettings {
    /// Decimation factor
    pub decimation: u32,
    /// Trigger source
    pub trigger_source: TriggerSource,
    /// Recorded signal
    pub input: Signal,
    /// Longest wait for the trigger
    pub timeout: Duration,
}

impl Default for ScopeSettings {
    fn default() -> Self {
        Self {
            decimation: 1,
            trigger_source: TriggerSource::Immediately,
            input: Signal::In1,
            timeout: Duration::from_secs(1),
        }
    }
}

enum Transport {
    Ipc(CommandBroker),
    Direct {
        factory: Arc<dyn BackendFactory>,
        dispatcher: Arc<Mutex<Option<Dispatcher>>>,
    },
}

/// One caller's claim on a [`Connection`]. Retired exactly once, either by
/// its holder or by a key-based disconnect.
#[derive(Debug, Clone)]
pub(crate) struct Lease(Arc<AtomicBool>);

impl Lease {
    fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub(crate) fn is_retired(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// True only for the call that actually retired it.
    fn retire(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }

    fn same(&self, other: &Lease) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// A logical connection to one device.
pub struct Connection {
    key: ConnectionKey,
    mock: bool,
    worker_config: WorkerConfig,
    transport: Transport,
    state: watch::Sender<ConnectionState>,
    last_error: RwLock<Option<PitayaError>>,
    leases: parking_lot::Mutex<VecDeque<Lease>>,
    session: Mutex<()>,
    command_timeout: Duration,
}

impl Connection {
    /// An unstarted connection.
    pub fn new(
        key: ConnectionKey,
        mock: bool,
        mode: TransportMode,
        config: &PitayaConfig,
        factory: Arc<dyn BackendFactory>,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> Self {
        let worker_config =
            WorkerConfig::new(config, key.address.clone(), key.config_name.clone(), mock);
        let transport = match mode {
            TransportMode::Ipc => Transport::Ipc(CommandBroker::new(launcher, config.broker.clone())),
            TransportMode::Direct => Transport::Direct {
                factory,
                dispatcher: Arc::new(Mutex::new(None)),
            },
        };
        Self {
            key,
            mock,
            worker_config,
            transport,
            state: watch::Sender::new(ConnectionState::Disconnected),
            last_error: RwLock::new(None),
            leases: parking_lot::Mutex::new(VecDeque::new()),
            session: Mutex::new(()),
            command_timeout: config.broker.command_timeout,
        }
    }

    /// Bring the backend up.
    pub async fn start(&self) -> PitayaResult<()> {
        self.set_state(ConnectionState::Connecting);
        let result = match &self.transport {
            Transport::Ipc(broker) => broker.start(self.worker_config.clone()).await.map(|_| ()),
            Transport::Direct {
                factory,
                dispatcher,
            } => {
                let mut slot = dispatcher.lock().await;
                if slot.is_some() {
                    Ok(())
                } else {
                    initialize_backend(
                        factory.as_ref(),
                        &self.worker_config.spec,
                        &self.worker_config.init_retry,
                    )
                    .await
                    .map(|backend| {
                        *slot = Some(Dispatcher::new(backend));
                    })
                }
            }
        };

        match &result {
            Ok(()) => {
                *self.last_error.write() = None;
                self.set_state(ConnectionState::Connected);
                info!(key = %self.key, mock = self.mock, transport = ?self.transport_mode(), "Connected");
            }
            Err(e) => {
                *self.last_error.write() = Some(e.clone());
                self.set_state(ConnectionState::Error);
                warn!(key = %self.key, error = %e, "Connection failed");
            }
        }
        result
    }

    /// Disable outputs and release the backend. Every step runs; failures
    /// are collected in the report.
    pub async fn teardown(&self) -> TeardownReport {
        let report = match &self.transport {
            Transport::Ipc(broker) => match broker.stop().await {
                Ok(Some(report)) => report,
                Ok(None) => TeardownReport::new(),
                Err(e) => {
                    let mut report = TeardownReport::new();
                    report.record("stop broker", Err(e));
                    report
                }
            },
            Transport::Direct { dispatcher, .. } => match dispatcher.lock().await.take() {
                Some(mut dispatcher) => dispatcher.teardown().await,
                None => TeardownReport::new(),
            },
        };
        self.set_state(ConnectionState::Disconnected);
        report.log(&self.key.to_string());
        report
    }

    /// Run a command with the default timeout and return its payload.
    pub async fn execute(&self, name: &str, params: Params) -> PitayaResult<Value> {
        self.execute_with_timeout(name, params, self.command_timeout)
            .await
    }

    /// Run a command, giving up after `timeout`.
    ///
    /// Failures reported by the handler surface as
    /// [`PitayaError::CommandFailed`] in both transport modes.
    pub async fn execute_with_timeout(
        &self,
        name: &str,
        params: Params,
        timeout: Duration,
    ) -> PitayaResult<Value> {
        let response = match &self.transport {
            Transport::Ipc(broker) => broker.send_command(name, params, timeout).await?,
            Transport::Direct { dispatcher, .. } => {
                let dispatcher = Arc::clone(dispatcher);
                let key = self.key.clone();
                let command = name.to_string();
                // Detached on timeout: the exchange finishes under the lock
                // and its late answer is discarded.
                let task = tokio::spawn(async move {
                    let mut guard = dispatcher.lock_owned().await;
                    let dispatcher = guard.as_mut().ok_or_else(|| {
                        PitayaError::NotRunning(format!("'{key}' is not connected"))
                    })?;
                    let outcome = AssertUnwindSafe(dispatcher.execute(&command, &params))
                        .catch_unwind()
                        .await;
                    Ok::<_, PitayaError>(match outcome {
                        Ok(result) => Response::from_result(result),
                        Err(panic) => {
                            let message = panic_message(&*panic);
                            warn!(key = %key, command = %command, panic = %message, "Command handler panicked");
                            Response::error(format!("handler panicked: {message}"))
                        }
                    })
                });
                match tokio::time::timeout(timeout, task).await {
                    Ok(Ok(response)) => response?,
                    Ok(Err(e)) => {
                        return Err(PitayaError::Backend(format!(
                            "'{name}' task on '{}' failed: {e}",
                            self.key
                        )))
                    }
                    Err(_) => {
                        debug!(key = %self.key, command = name, "Direct command still running after timeout");
                        return Err(PitayaError::Timeout {
                            command: name.to_string(),
                            timeout,
                        });
                    }
                }
            }
        };
        response.into_result(name)
    }

    async fn call<P, T>(&self, name: &str, params: &P) -> PitayaResult<T>
    where
        P: Serialize + Sync,
        T: DeserializeOwned,
    {
        self.call_with_timeout(name, params, self.command_timeout)
            .await
    }

    async fn call_with_timeout<P, T>(
        &self,
        name: &str,
        params: &P,
        timeout: Duration,
    ) -> PitayaResult<T>
    where
        P: Serialize + Sync,
        T: DeserializeOwned,
    {
        let data = self
            .execute_with_timeout(name, to_params(params)?, timeout)
            .await?;
        serde_json::from_value(data).map_err(|e| {
            PitayaError::Protocol(format!("unexpected '{name}' response payload: {e}"))
        })
    }

    /// Liveness probe.
    pub async fn ping(&self) -> PitayaResult<()> {
        let data = self.execute(commands::PING, Params::new()).await?;
        if data == Value::String("pong".into()) {
            Ok(())
        } else {
            Err(PitayaError::Protocol(format!("unexpected ping reply {data}")))
        }
    }

    /// Instrument identity.
    pub async fn identify(&self) -> PitayaResult<payload::Identity> {
        self.call(commands::IDN, &Params::new()).await
    }

    /// Configure a PID controller; returns the configured module name.
    pub async fn configure_pid(&self, channel: &str, settings: &PidSettings) -> PitayaResult<String> {
        let params = params::PidConfigure {
            channel: channel.to_string(),
            p: settings.p,
            i: settings.i,
            d: settings.d,
            setpoint: settings.setpoint,
            input: settings.input.to_string(),
            output_direct: settings.output_direct,
        };
        let done: payload::Configured = self.call(commands::PID_CONFIGURE, &params).await?;
        Ok(done.channel)
    }

    /// Configure a signal generator; returns the configured module name.
    pub async fn configure_asg(&self, channel: &str, settings: &AsgSettings) -> PitayaResult<String> {
        let params = params::AsgSetup {
            channel: channel.to_string(),
            waveform: settings.waveform,
            frequency: settings.frequency,
            amplitude: settings.amplitude,
            offset: settings.offset,
            output_direct: settings.output_direct,
        };
        let done: payload::Configured = self.call(commands::ASG_SETUP, &params).await?;
        Ok(done.channel)
    }

    /// Configure an IQ demodulator; returns the configured module name.
    pub async fn configure_iq(&self, channel: &str, settings: &IqSettings) -> PitayaResult<String> {
        let params = params::IqSetup {
            channel: channel.to_string(),
            frequency: settings.frequency,
            bandwidth: settings.bandwidth,
            input: settings.input.to_string(),
            output_direct: settings.output_direct,
        };
        let done: payload::Configured = self.call(commands::IQ_SETUP, &params).await?;
        Ok(done.channel)
    }

    /// Set a PID setpoint; returns the applied value.
    pub async fn set_pid_setpoint(&self, channel: &str, value: f64) -> PitayaResult<f64> {
        let params = params::SetValue {
            channel: channel.to_string(),
            value,
        };
        let applied: payload::Scalar = self.call(commands::PID_SET_SETPOINT, &params).await?;
        Ok(applied.value)
    }

    /// Read a PID setpoint.
    pub async fn get_pid_setpoint(&self, channel: &str) -> PitayaResult<f64> {
        let params = params::Channel {
            channel: channel.to_string(),
        };
        let current: payload::Scalar = self.call(commands::PID_GET_SETPOINT, &params).await?;
        Ok(current.value)
    }

    /// Read IQ quadratures.
    pub async fn get_iq_quadratures(&self, channel: &str) -> PitayaResult<payload::Quadratures> {
        let params = params::Channel {
            channel: channel.to_string(),
        };
        self.call(commands::IQ_GET_QUADRATURES, &params).await
    }

    /// Sample one signal.
    pub async fn read_sampler(&self, signal: &str) -> PitayaResult<f64> {
        let params = params::Channel {
            channel: signal.to_string(),
        };
        let sample: payload::Scalar = self.call(commands::SAMPLER_READ, &params).await?;
        Ok(sample.value)
    }

    /// Set the scope decimation; returns the applied factor.
    pub async fn set_scope_decimation(&self, decimation: u32) -> PitayaResult<u32> {
        let params = params::Decimation { value: decimation };
        let applied: payload::DecimationSet =
            self.call(commands::SCOPE_SET_DECIMATION, &params).await?;
        Ok(applied.decimation)
    }

    /// Record one scope trace. The call may take up to the trigger timeout
    /// on top of the usual command timeout.
    pub async fn acquire_scope(&self, settings: &ScopeSettings) -> PitayaResult<payload::ScopeTrace> {
        let params = params::ScopeAcquire {
            decimation: settings.decimation,
            trigger_source: settings.trigger_source,
            input_channel: settings.input.to_string(),
            timeout: settings.timeout.as_secs_f64(),
        };
        self.call_with_timeout(
            commands::SCOPE_ACQUIRE,
            &params,
            self.command_timeout + settings.timeout,
        )
        .await
    }

    /// Advance the simulated plant (simulated devices only).
    pub async fn sim_step(&self, controller_output: f64, dt: f64) -> PitayaResult<f64> {
        let params = params::SimStep {
            controller_output,
            dt,
        };
        let pv: payload::Scalar = self.call(commands::SIM_STEP, &params).await?;
        Ok(pv.value)
    }

    /// Step-response metrics of the simulated plant (simulated devices only).
    pub async fn sim_metrics(&self, target: f64, tolerance: f64) -> PitayaResult<payload::StepMetrics> {
        let params = params::SimMetrics { target, tolerance };
        self.call(commands::SIM_METRICS, &params).await
    }

    /// Exclusive session for multi-step sequences across callers.
    ///
    /// Operations do not take this lock themselves; callers that need
    /// several commands to run back to back without interleaving hold it
    /// around the sequence.
    pub async fn lock(&self) -> MutexGuard<'_, ()> {
        self.session.lock().await
    }

    /// Registry key.
    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    /// Whether the backend is simulated.
    pub fn mock(&self) -> bool {
        self.mock
    }

    /// How commands reach the backend.
    pub fn transport_mode(&self) -> TransportMode {
        match self.transport {
            Transport::Ipc(_) => TransportMode::Ipc,
            Transport::Direct { .. } => TransportMode::Direct,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Wait until a start in progress has finished; returns the state it
    /// settled in.
    pub async fn wait_started(&self) -> ConnectionState {
        let mut state = self.state.subscribe();
        let settled = state
            .wait_for(|s| *s != ConnectionState::Connecting)
            .await
            .map(|current| *current);
        settled.unwrap_or_else(|_| self.state())
    }

    /// Whether commands can be sent.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Reason of the last failed start.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().as_ref().map(ToString::to_string)
    }

    /// The error of the last failed start.
    pub(crate) fn start_error(&self) -> Option<PitayaError> {
        self.last_error.read().clone()
    }

    /// Number of callers holding this connection.
    pub fn reference_count(&self) -> usize {
        self.leases.lock().len()
    }

    /// Broker traffic counters (IPC mode only).
    pub fn stats(&self) -> Option<BrokerStats> {
        match &self.transport {
            Transport::Ipc(broker) => Some(broker.stats()),
            Transport::Direct { .. } => None,
        }
    }

    /// The broker behind an IPC connection.
    pub fn broker(&self) -> Option<&CommandBroker> {
        match &self.transport {
            Transport::Ipc(broker) => Some(broker),
            Transport::Direct { .. } => None,
        }
    }

    pub(crate) fn acquire(&self) -> Lease {
        let lease = Lease::new();
        self.leases.lock().push_back(lease.clone());
        lease
    }

    /// Retire `lease`, or the oldest outstanding one when `None`.
    ///
    /// Returns the remaining count, or `None` when nothing was retired.
    pub(crate) fn release(&self, lease: Option<&Lease>) -> Option<usize> {
        let mut leases = self.leases.lock();
        match lease {
            Some(lease) => {
                if !lease.retire() {
                    return None;
                }
                leases.retain(|held| !held.same(lease));
            }
            None => {
                leases.pop_front()?.retire();
            }
        }
        Some(leases.len())
    }

    /// Retire every lease at once; returns how many there were.
    pub(crate) fn clear_references(&self) -> usize {
        let mut leases = self.leases.lock();
        let count = leases.len();
        for lease in leases.drain(..) {
            lease.retire();
        }
        count
    }

    /// Mark a start that will never finish as failed.
    pub(crate) fn abandon_start(&self) {
        if self.state() != ConnectionState::Connecting {
            return;
        }
        warn!(key = %self.key, "Connection start abandoned");
        *self.last_error.write() = Some(PitayaError::NotRunning(format!(
            "start of '{}' was cancelled",
            self.key
        )));
        self.set_state(ConnectionState::Error);
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            debug!(key = %self.key, from = ?*current, to = ?state, "Connection state changed");
            *current = state;
            true
        });
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("key", &self.key)
            .field("mock", &self.mock)
            .field("transport", &self.transport_mode())
            .field("state", &self.state())
            .field("reference_count", &self.reference_count())
            .finish()
    }
}
