//! Command/response protocol between the broker and the worker.
//!
//! Every [`Command`] carries a fresh [`CorrelationId`]; the worker answers each
//! one with exactly one [`WorkerMessage::Tagged`] carrying the same id. The
//! readiness report sent once after backend initialization has no id and is
//! modelled as the separate [`WorkerMessage::Init`] variant, so routing is a
//! total match over a closed set.
//!
//! # Message Flow
//!
//! ```text
//! Caller task           Broker                  Worker
//! -----------           ------                  ------
//! send_command  ---->   register pending
//!                       push Command  ------->  dispatch by name
//!                                     <-------  Tagged { id, response }
//!               <----   listener matches id
//! ```
//!
//! Commands are parameterized with a JSON object; each command name has a
//! typed parameter struct in [`params`] and a typed payload in [`payload`].

use crate::error::{PitayaError, PitayaResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

/// Parameter map of a command.
pub type Params = Map<String, Value>;

/// Opaque token linking a command to its response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Generate a new random correlation id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Command names understood by the worker.
pub mod commands {
    /// Liveness probe, answered without touching the backend.
    pub const PING: &str = "ping";
    /// Disable outputs, close the backend and exit the worker loop.
    pub const SHUTDOWN: &str = "shutdown";
    /// Instrument identity string.
    pub const IDN: &str = "idn";
    /// Acquire one scope trace.
    pub const SCOPE_ACQUIRE: &str = "scope_acquire";
    /// Set scope decimation.
    pub const SCOPE_SET_DECIMATION: &str = "scope_set_decimation";
    /// Configure a PID controller.
    pub const PID_CONFIGURE: &str = "pid_configure";
    /// Set a PID setpoint.
    pub const PID_SET_SETPOINT: &str = "pid_set_setpoint";
    /// Read a PID setpoint.
    pub const PID_GET_SETPOINT: &str = "pid_get_setpoint";
    /// Configure a signal generator.
    pub const ASG_SETUP: &str = "asg_setup";
    /// Configure an IQ demodulator.
    pub const IQ_SETUP: &str = "iq_setup";
    /// Read IQ quadratures.
    pub const IQ_GET_QUADRATURES: &str = "iq_get_quadratures";
    /// Sample one signal.
    pub const SAMPLER_READ: &str = "sampler_read";
    /// Advance the simulated plant (synthetic backend only).
    pub const SIM_STEP: &str = "sim_step";
    /// Settling/overshoot metrics of the simulated plant (synthetic backend only).
    pub const SIM_METRICS: &str = "sim_metrics";

    /// Complete vocabulary.
    pub const ALL: &[&str] = &[
        PING,
        SHUTDOWN,
        IDN,
        SCOPE_ACQUIRE,
        SCOPE_SET_DECIMATION,
        PID_CONFIGURE,
        PID_SET_SETPOINT,
        PID_GET_SETPOINT,
        ASG_SETUP,
        IQ_SETUP,
        IQ_GET_QUADRATURES,
        SAMPLER_READ,
        SIM_STEP,
        SIM_METRICS,
    ];
}

/// A request for the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Command name (see [`commands`])
    pub name: String,
    /// Named parameters
    #[serde(default)]
    pub params: Params,
    /// Identifier echoed back in the response
    pub correlation_id: CorrelationId,
}

impl Command {
    /// Create a command with a fresh correlation id.
    pub fn new(name: impl Into<String>, params: Params) -> Self {
        Self {
            name: name.into(),
            params,
            correlation_id: CorrelationId::new(),
        }
    }

    /// Create a command from a serializable parameter struct.
    pub fn with_payload<T: Serialize>(name: impl Into<String>, payload: &T) -> PitayaResult<Self> {
        Ok(Self::new(name, to_params(payload)?))
    }

    /// Deserialize the parameters into a typed struct.
    pub fn params_as<T: DeserializeOwned>(&self) -> PitayaResult<T> {
        parse_params(&self.name, &self.params)
    }
}

/// Serialize a parameter struct into a [`Params`] map.
pub fn to_params<T: Serialize>(payload: &T) -> PitayaResult<Params> {
    match serde_json::to_value(payload)? {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Params::new()),
        other => Err(PitayaError::Protocol(format!(
            "command parameters must be an object, got {other}"
        ))),
    }
}

/// Deserialize a [`Params`] map into a typed struct, naming the command on failure.
pub fn parse_params<T: DeserializeOwned>(command: &str, params: &Params) -> PitayaResult<T> {
    serde_json::from_value(Value::Object(params.clone())).map_err(|e| {
        PitayaError::invalid_parameter(command, format!("malformed parameters: {e}"))
    })
}

/// Outcome of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Command succeeded
    Ok,
    /// Command failed; `data` holds the reason
    Error,
}

/// Result of one command as sent back by the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Success or failure
    pub status: Status,
    /// Payload on success, human-readable reason on failure
    #[serde(default)]
    pub data: Value,
}

impl Response {
    /// Successful response carrying `data`.
    pub fn ok(data: Value) -> Self {
        Self {
            status: Status::Ok,
            data,
        }
    }

    /// Failed response carrying a reason.
    pub fn error(reason: impl fmt::Display) -> Self {
        Self {
            status: Status::Error,
            data: Value::String(reason.to_string()),
        }
    }

    /// Build from a handler result.
    pub fn from_result(result: PitayaResult<Value>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(e) => Self::error(e),
        }
    }

    /// Whether the command succeeded.
    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }

    /// The failure reason, if any.
    pub fn reason(&self) -> Option<String> {
        match (self.status, &self.data) {
            (Status::Ok, _) => None,
            (Status::Error, Value::String(s)) => Some(s.clone()),
            (Status::Error, other) => Some(other.to_string()),
        }
    }

    /// Convert into the payload, mapping `error` to [`PitayaError::CommandFailed`].
    pub fn into_result(self, command: &str) -> PitayaResult<Value> {
        match self.status {
            Status::Ok => Ok(self.data),
            Status::Error => Err(PitayaError::command_failed(
                command,
                self.reason().unwrap_or_default(),
            )),
        }
    }

    /// Convert into a typed payload.
    pub fn into_payload<T: DeserializeOwned>(self, command: &str) -> PitayaResult<T> {
        let data = self.into_result(command)?;
        serde_json::from_value(data).map_err(|e| {
            PitayaError::Protocol(format!("unexpected '{command}' response payload: {e}"))
        })
    }
}

/// Anything the worker writes to its outbound channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Readiness report emitted once after backend initialization.
    Init {
        /// `ok` on success, `error` with the reason after exhausted retries
        response: Response,
    },
    /// Reply to exactly one command.
    Tagged {
        /// Id of the command being answered
        correlation_id: CorrelationId,
        /// Outcome
        response: Response,
    },
}

impl WorkerMessage {
    /// Reply to `command`.
    pub fn reply(command: &Command, response: Response) -> Self {
        Self::Tagged {
            correlation_id: command.correlation_id,
            response,
        }
    }
}

/// Typed command parameters.
pub mod params {
    use crate::module::{OutputDirect, TriggerSource, Waveform};
    use serde::{Deserialize, Serialize};

    /// A request naming a single module or signal.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Channel {
        /// Module or signal name
        pub channel: String,
    }

    /// `pid_configure`
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct PidConfigure {
        /// PID module name (`pid0`..`pid2`)
        pub channel: String,
        /// Proportional gain
        pub p: f64,
        /// Integral gain (Hz)
        pub i: f64,
        /// Derivative gain
        #[serde(default)]
        pub d: f64,
        /// Setpoint (V)
        pub setpoint: f64,
        /// Input signal name
        pub input: String,
        /// Output routing
        pub output_direct: OutputDirect,
    }

    /// `pid_set_setpoint`
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct SetValue {
        /// Module name
        pub channel: String,
        /// New value
        pub value: f64,
    }

    /// `asg_setup`
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct AsgSetup {
        /// Generator name (`asg0`..`asg1`)
        pub channel: String,
        /// Waveform
        pub waveform: Waveform,
        /// Frequency (Hz)
        pub frequency: f64,
        /// Amplitude (V)
        pub amplitude: f64,
        /// DC offset (V)
        #[serde(default)]
        pub offset: f64,
        /// Output routing
        pub output_direct: OutputDirect,
    }

    /// `iq_setup`
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct IqSetup {
        /// Demodulator name (`iq0`..`iq2`)
        pub channel: String,
        /// Demodulation frequency (Hz)
        pub frequency: f64,
        /// Low-pass bandwidth (Hz)
        pub bandwidth: f64,
        /// Input signal name
        pub input: String,
        /// Output routing
        pub output_direct: OutputDirect,
    }

    /// `scope_set_decimation`
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Decimation {
        /// Decimation factor
        pub value: u32,
    }

    /// `scope_acquire`
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct ScopeAcquire {
        /// Decimation factor
        pub decimation: u32,
        /// Trigger source
        #[serde(default = "default_trigger")]
        pub trigger_source: TriggerSource,
        /// Signal to record
        #[serde(default = "default_scope_input")]
        pub input_channel: String,
        /// Maximum time to wait for the trigger, in seconds
        #[serde(default = "default_acquire_timeout")]
        pub timeout: f64,
    }

    fn default_trigger() -> TriggerSource {
        TriggerSource::Immediately
    }

    fn default_scope_input() -> String {
        "in1".to_string()
    }

    fn default_acquire_timeout() -> f64 {
        1.0
    }

    /// `sim_step`
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct SimStep {
        /// Controller output applied to the plant
        pub controller_output: f64,
        /// Integration step in seconds
        pub dt: f64,
    }

    /// `sim_metrics`
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct SimMetrics {
        /// Final value the response is expected to settle at
        pub target: f64,
        /// Settling band as a fraction of `target` (default 2 %)
        #[serde(default = "default_tolerance")]
        pub tolerance: f64,
    }

    fn default_tolerance() -> f64 {
        0.02
    }
}

/// Typed response payloads.
pub mod payload {
    use serde::{Deserialize, Serialize};

    /// Single scalar reading.
    #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
    pub struct Scalar {
        /// Value
        pub value: f64,
    }

    /// Acknowledgement of a configure command.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Configured {
        /// Module that was configured
        pub channel: String,
    }

    /// Applied scope decimation.
    #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
    pub struct DecimationSet {
        /// Decimation factor
        pub decimation: u32,
    }

    /// IQ demodulator quadratures.
    #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
    pub struct Quadratures {
        /// In-phase component
        pub i: f64,
        /// Quadrature component
        pub q: f64,
    }

    impl Quadratures {
        /// Magnitude of the demodulated signal.
        pub fn magnitude(&self) -> f64 {
            self.i.hypot(self.q)
        }

        /// Phase in radians.
        pub fn phase(&self) -> f64 {
            self.q.atan2(self.i)
        }
    }

    /// One scope trace.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct ScopeTrace {
        /// Samples in volts
        pub voltage: Vec<f64>,
        /// Sample times in seconds relative to the trigger
        pub time: Vec<f64>,
    }

    impl ScopeTrace {
        /// Sample times for a trace of `len` points at `decimation`, starting
        /// at the trigger.
        pub fn time_axis(decimation: u32, len: usize) -> Vec<f64> {
            let dt = f64::from(decimation) / crate::module::FPGA_CLOCK_HZ;
            (0..len).map(|k| k as f64 * dt).collect()
        }

        /// Number of samples.
        pub fn len(&self) -> usize {
            self.voltage.len()
        }

        /// Whether the trace holds no samples.
        pub fn is_empty(&self) -> bool {
            self.voltage.is_empty()
        }
    }

    /// Instrument identity.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Identity {
        /// Identification string
        pub identity: String,
        /// Backend kind label
        pub backend: String,
    }

    /// Step-response metrics of the simulated plant.
    #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
    pub struct StepMetrics {
        /// Peak overshoot as a fraction of the target (0 when never exceeded)
        pub overshoot: f64,
        /// Time after which the response stays inside the band, if it settled
        pub settling_time: Option<f64>,
        /// Number of history samples evaluated
        pub samples: usize,
    }
}
