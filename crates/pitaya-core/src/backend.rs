//! Backend driver contract.
//!
//! A [`Backend`] is either the real instrument driver (SCPI over TCP) or the
//! synthetic plant simulator. The worker owns exactly one backend and is the
//! only code that ever calls it; everything outside the worker sees
//! serializable commands and responses.
//!
//! Per-module access goes through a [`ModuleHandle`], resolved by name right
//! before use. The handle mutably borrows the backend, so it cannot be stored
//! or carried across commands: every operation resolves its module afresh.

use crate::config::{ScpiSettings, SimulatorSettings};
use crate::error::{PitayaError, PitayaResult};
use crate::module::{ModuleId, ModuleKind, OutputDirect, Register, Signal, TriggerSource, Waveform};
use crate::protocol::payload::{Quadratures, ScopeTrace, StepMetrics};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Value stored in a module register.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RegisterValue {
    /// Numeric register (gains, frequencies, voltages, decimation)
    Number(f64),
    /// Named register (routing, waveform, trigger source)
    Text(String),
}

impl RegisterValue {
    /// Numeric value, or an error naming `register`.
    pub fn as_f64(&self, register: Register) -> PitayaResult<f64> {
        match self {
            RegisterValue::Number(v) => Ok(*v),
            RegisterValue::Text(t) => t.trim().parse::<f64>().map_err(|_| {
                PitayaError::invalid_parameter(register.as_str(), format!("'{t}' is not a number"))
            }),
        }
    }

    /// Textual value.
    pub fn as_text(&self) -> String {
        match self {
            RegisterValue::Number(v) => v.to_string(),
            RegisterValue::Text(t) => t.clone(),
        }
    }
}

impl fmt::Display for RegisterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterValue::Number(v) => write!(f, "{v}"),
            RegisterValue::Text(t) => f.write_str(t),
        }
    }
}

impl From<f64> for RegisterValue {
    fn from(v: f64) -> Self {
        RegisterValue::Number(v)
    }
}

impl From<u32> for RegisterValue {
    fn from(v: u32) -> Self {
        RegisterValue::Number(f64::from(v))
    }
}

impl From<OutputDirect> for RegisterValue {
    fn from(v: OutputDirect) -> Self {
        RegisterValue::Text(v.as_str().to_string())
    }
}

impl From<Waveform> for RegisterValue {
    fn from(v: Waveform) -> Self {
        RegisterValue::Text(v.as_str().to_string())
    }
}

impl From<TriggerSource> for RegisterValue {
    fn from(v: TriggerSource) -> Self {
        RegisterValue::Text(v.as_str().to_string())
    }
}

impl From<Signal> for RegisterValue {
    fn from(v: Signal) -> Self {
        RegisterValue::Text(v.to_string())
    }
}

/// Which implementation sits behind the contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Real instrument over SCPI/TCP
    Scpi,
    /// FOPDT plant simulator
    Simulated,
}

impl BackendKind {
    /// Short label for logs and error messages.
    pub fn label(&self) -> &'static str {
        match self {
            BackendKind::Scpi => "scpi",
            BackendKind::Simulated => "simulated",
        }
    }
}

/// Parameters of one scope acquisition.
#[derive(Debug, Clone, PartialEq)]
pub struct Acquisition {
    /// Decimation factor
    pub decimation: u32,
    /// Trigger source
    pub trigger: TriggerSource,
    /// Recorded signal
    pub input: Signal,
    /// Longest time to wait for the trigger
    pub timeout: Duration,
}

/// Synthetic-only extension: direct access to the simulated plant.
pub trait Simulation: Send {
    /// Advance the plant by `dt` seconds under `controller_output`; returns the
    /// new process variable.
    fn step(&mut self, controller_output: f64, dt: f64) -> f64;

    /// Recorded `(time, process_variable)` history, oldest first.
    fn history(&self) -> Vec<(f64, f64)>;

    /// Overshoot and settling time of the recorded history against `target`.
    fn metrics(&self, target: f64, tolerance: f64) -> StepMetrics;
}

/// Contract implemented by the real driver and the simulator.
///
/// Only the worker (or a direct-mode connection holding its lock) calls these
/// methods; implementations may assume exclusive, sequential access.
#[async_trait]
pub trait Backend: Send {
    /// Implementation kind.
    fn kind(&self) -> BackendKind;

    /// Identification string of the instrument.
    async fn identify(&mut self) -> PitayaResult<String>;

    /// Read one register of one module.
    async fn read_register(&mut self, module: ModuleId, register: Register)
        -> PitayaResult<RegisterValue>;

    /// Write one register of one module.
    async fn write_register(
        &mut self,
        module: ModuleId,
        register: Register,
        value: RegisterValue,
    ) -> PitayaResult<()>;

    /// Instantaneous value of a signal.
    async fn read_signal(&mut self, signal: Signal) -> PitayaResult<f64>;

    /// Current quadratures of an IQ module.
    async fn read_quadratures(&mut self, module: ModuleId) -> PitayaResult<Quadratures>;

    /// Record one scope trace.
    async fn acquire(&mut self, request: &Acquisition) -> PitayaResult<ScopeTrace>;

    /// Release the instrument. Further calls are undefined.
    async fn close(&mut self) -> PitayaResult<()>;

    /// Simulator access, `None` for real hardware.
    fn simulation(&mut self) -> Option<&mut dyn Simulation> {
        None
    }
}

/// Short-lived view of one module, valid for a single operation.
pub struct ModuleHandle<'a> {
    backend: &'a mut dyn Backend,
    id: ModuleId,
}

impl<'a> ModuleHandle<'a> {
    /// Resolve `name` against `backend`.
    pub fn resolve(backend: &'a mut dyn Backend, name: &str) -> PitayaResult<Self> {
        let id: ModuleId = name.parse()?;
        Ok(Self { backend, id })
    }

    /// Resolve `name`, requiring a module of `kind`.
    pub fn resolve_kind(
        backend: &'a mut dyn Backend,
        name: &str,
        kind: ModuleKind,
    ) -> PitayaResult<Self> {
        let id = ModuleId::parse_kind(name, kind)?;
        Ok(Self { backend, id })
    }

    /// Module id.
    pub fn id(&self) -> ModuleId {
        self.id
    }

    /// Read a register, checking it belongs to this module.
    pub async fn get(&mut self, register: Register) -> PitayaResult<RegisterValue> {
        self.id.check_register(register)?;
        self.backend.read_register(self.id, register).await
    }

    /// Read a numeric register.
    pub async fn get_f64(&mut self, register: Register) -> PitayaResult<f64> {
        self.get(register).await?.as_f64(register)
    }

    /// Write a register, checking it belongs to this module.
    pub async fn set(
        &mut self,
        register: Register,
        value: impl Into<RegisterValue> + Send,
    ) -> PitayaResult<()> {
        self.id.check_register(register)?;
        self.backend
            .write_register(self.id, register, value.into())
            .await
    }

    fn require(&self, kind: ModuleKind) -> PitayaResult<()> {
        if self.id.kind() != kind {
            return Err(PitayaError::invalid_parameter(
                "channel",
                format!("'{}' is not a {} module", self.id, kind.prefix()),
            ));
        }
        Ok(())
    }

    /// Quadratures of an IQ module.
    pub async fn quadratures(&mut self) -> PitayaResult<Quadratures> {
        self.require(ModuleKind::Iq)?;
        self.backend.read_quadratures(self.id).await
    }

    /// Record one trace (scope only).
    pub async fn acquire(&mut self, request: &Acquisition) -> PitayaResult<ScopeTrace> {
        self.require(ModuleKind::Scope)?;
        self.backend.acquire(request).await
    }

    /// Sample one signal (sampler only).
    pub async fn sample(&mut self, signal: Signal) -> PitayaResult<f64> {
        self.require(ModuleKind::Sampler)?;
        self.backend.read_signal(signal).await
    }
}

/// Everything needed to open one backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendSpec {
    /// Host name or IP of the instrument, or the name of a simulated device
    pub address: String,
    /// Named instrument configuration
    pub config_name: String,
    /// Use the simulator instead of real hardware
    pub mock: bool,
    /// Real-hardware connection settings
    #[serde(default)]
    pub scpi: ScpiSettings,
    /// Simulator settings
    #[serde(default)]
    pub simulator: SimulatorSettings,
}

impl BackendSpec {
    /// Spec with default driver settings.
    pub fn new(address: impl Into<String>, config_name: impl Into<String>, mock: bool) -> Self {
        Self {
            address: address.into(),
            config_name: config_name.into(),
            mock,
            scpi: ScpiSettings::default(),
            simulator: SimulatorSettings::default(),
        }
    }
}

/// Opens backends; called from inside the worker's execution context.
#[async_trait]
pub trait BackendFactory: Send + Sync {
    /// Initialize a backend for `spec` (one attempt).
    async fn create(&self, spec: &BackendSpec) -> PitayaResult<Box<dyn Backend>>;
}
