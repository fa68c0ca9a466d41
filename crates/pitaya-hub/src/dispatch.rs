//! Command dispatch against a backend.
//!
//! [`Dispatcher`] is the one place where command names turn into driver
//! calls. The worker runs one per backend; direct-mode connections run one
//! behind their lock. Each handler validates its parameters against the
//! instrument limits, resolves the module it needs by name, uses it and lets
//! the handle go before returning.

use crate::teardown::TeardownReport;
use pitaya_core::backend::{Acquisition, Backend, ModuleHandle};
use pitaya_core::module::{
    check_decimation, check_range, ModuleId, ModuleKind, OutputDirect, Register, Signal,
    FULL_SCALE_V, MAX_FREQUENCY_HZ,
};
use pitaya_core::protocol::{commands, params, parse_params, payload, Params};
use pitaya_core::{BackendKind, PitayaError, PitayaResult};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::time::Duration;

/// Executes named commands against an owned backend.
pub struct Dispatcher {
    backend: Box<dyn Backend>,
    active_outputs: BTreeSet<ModuleId>,
    closed: bool,
}

impl Dispatcher {
    /// Take ownership of an initialized backend.
    pub fn new(backend: Box<dyn Backend>) -> Self {
        Self {
            backend,
            active_outputs: BTreeSet::new(),
            closed: false,
        }
    }

    /// Backend implementation kind.
    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    /// Modules currently driving an analog output.
    pub fn active_outputs(&self) -> impl Iterator<Item = &ModuleId> {
        self.active_outputs.iter()
    }

    /// Whether the backend has been closed by a teardown.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Run one command and return its response payload.
    ///
    /// `shutdown` runs [`Dispatcher::teardown`] and returns the report.
    pub async fn execute(&mut self, name: &str, params: &Params) -> PitayaResult<Value> {
        match name {
            commands::PING => return Ok(Value::String("pong".into())),
            commands::SHUTDOWN => return to_value(&self.teardown().await),
            _ => {}
        }
        if self.closed {
            return Err(PitayaError::NotRunning("backend is closed".into()));
        }

        match name {
            commands::IDN => {
                let identity = self.backend.identify().await?;
                to_value(&payload::Identity {
                    identity,
                    backend: self.backend.kind().label().to_string(),
                })
            }
            commands::SCOPE_ACQUIRE => self.scope_acquire(parse_params(name, params)?).await,
            commands::SCOPE_SET_DECIMATION => {
                let p: params::Decimation = parse_params(name, params)?;
                let decimation = check_decimation(p.value)?;
                let mut scope = self.module("scope", ModuleKind::Scope)?;
                scope.set(Register::Decimation, decimation).await?;
                to_value(&payload::DecimationSet { decimation })
            }
            commands::PID_CONFIGURE => self.pid_configure(parse_params(name, params)?).await,
            commands::PID_SET_SETPOINT => {
                let p: params::SetValue = parse_params(name, params)?;
                let value = check_range("setpoint", p.value, -FULL_SCALE_V, FULL_SCALE_V)?;
                let mut pid = self.module(&p.channel, ModuleKind::Pid)?;
                pid.set(Register::Setpoint, value).await?;
                to_value(&payload::Scalar { value })
            }
            commands::PID_GET_SETPOINT => {
                let p: params::Channel = parse_params(name, params)?;
                let mut pid = self.module(&p.channel, ModuleKind::Pid)?;
                let value = pid.get_f64(Register::Setpoint).await?;
                to_value(&payload::Scalar { value })
            }
            commands::ASG_SETUP => self.asg_setup(parse_params(name, params)?).await,
            commands::IQ_SETUP => self.iq_setup(parse_params(name, params)?).await,
            commands::IQ_GET_QUADRATURES => {
                let p: params::Channel = parse_params(name, params)?;
                let mut iq = self.module(&p.channel, ModuleKind::Iq)?;
                to_value(&iq.quadratures().await?)
            }
            commands::SAMPLER_READ => {
                let p: params::Channel = parse_params(name, params)?;
                let signal: Signal = p.channel.parse()?;
                let mut sampler = self.module("sampler", ModuleKind::Sampler)?;
                let value = sampler.sample(signal).await?;
                to_value(&payload::Scalar { value })
            }
            commands::SIM_STEP => {
                let p: params::SimStep = parse_params(name, params)?;
                if !p.controller_output.is_finite() {
                    return Err(PitayaError::invalid_parameter(
                        "controller_output",
                        "must be finite",
                    ));
                }
                if !p.dt.is_finite() || p.dt <= 0.0 {
                    return Err(PitayaError::invalid_parameter("dt", "must be positive"));
                }
                let kind = self.backend.kind();
                let sim = self.backend.simulation().ok_or_else(|| unsupported(name, kind))?;
                let value = sim.step(p.controller_output, p.dt);
                to_value(&payload::Scalar { value })
            }
            commands::SIM_METRICS => {
                let p: params::SimMetrics = parse_params(name, params)?;
                if !p.tolerance.is_finite() || p.tolerance <= 0.0 {
                    return Err(PitayaError::invalid_parameter(
                        "tolerance",
                        "must be positive",
                    ));
                }
                let kind = self.backend.kind();
                let sim = self.backend.simulation().ok_or_else(|| unsupported(name, kind))?;
                to_value(&sim.metrics(p.target, p.tolerance))
            }
            other => Err(PitayaError::UnknownCommand(other.to_string())),
        }
    }

    /// Disable active outputs, then close the backend.
    ///
    /// Every step runs regardless of earlier failures. A second call does
    /// nothing and returns an empty report.
    pub async fn teardown(&mut self) -> TeardownReport {
        let mut report = TeardownReport::new();
        if self.closed {
            return report;
        }

        let outputs: Vec<ModuleId> = std::mem::take(&mut self.active_outputs)
            .into_iter()
            .collect();
        for id in outputs {
            let result = match ModuleHandle::resolve(self.backend.as_mut(), &id.to_string()) {
                Ok(mut module) => module.set(Register::OutputDirect, OutputDirect::Off).await,
                Err(e) => Err(e),
            };
            report.record(format!("disable {id} output"), result);
        }

        let result = self.backend.close().await;
        report.record("close backend", result);
        self.closed = true;
        report
    }

    fn module(&mut self, name: &str, kind: ModuleKind) -> PitayaResult<ModuleHandle<'_>> {
        ModuleHandle::resolve_kind(self.backend.as_mut(), name, kind)
    }

    fn track_output(&mut self, id: ModuleId, routing: OutputDirect) {
        if routing.is_active() {
            self.active_outputs.insert(id);
        } else {
            self.active_outputs.remove(&id);
        }
    }

    async fn scope_acquire(&mut self, p: params::ScopeAcquire) -> PitayaResult<Value> {
        let decimation = check_decimation(p.decimation)?;
        let input: Signal = p.input_channel.parse()?;
        if !p.timeout.is_finite() || p.timeout <= 0.0 {
            return Err(PitayaError::invalid_parameter(
                "timeout",
                format!("{} is not a positive number of seconds", p.timeout),
            ));
        }
        let timeout = Duration::try_from_secs_f64(p.timeout).map_err(|_| {
            PitayaError::invalid_parameter(
                "timeout",
                format!("{} seconds is out of range", p.timeout),
            )
        })?;
        let request = Acquisition {
            decimation,
            trigger: p.trigger_source,
            input,
            timeout,
        };
        let mut scope = self.module("scope", ModuleKind::Scope)?;
        let trace = scope.acquire(&request).await?;
        to_value(&trace)
    }

    async fn pid_configure(&mut self, p: params::PidConfigure) -> PitayaResult<Value> {
        let setpoint = check_range("setpoint", p.setpoint, -FULL_SCALE_V, FULL_SCALE_V)?;
        for (gain, value) in [("p", p.p), ("i", p.i), ("d", p.d)] {
            if !value.is_finite() {
                return Err(PitayaError::invalid_parameter(gain, "must be finite"));
            }
        }
        let input: Signal = p.input.parse()?;

        let mut pid = self.module(&p.channel, ModuleKind::Pid)?;
        pid.set(Register::P, p.p).await?;
        pid.set(Register::I, p.i).await?;
        pid.set(Register::D, p.d).await?;
        pid.set(Register::Input, input).await?;
        pid.set(Register::Setpoint, setpoint).await?;
        pid.set(Register::OutputDirect, p.output_direct).await?;
        let id = pid.id();

        self.track_output(id, p.output_direct);
        to_value(&payload::Configured {
            channel: id.to_string(),
        })
    }

    async fn asg_setup(&mut self, p: params::AsgSetup) -> PitayaResult<Value> {
        let frequency = check_range("frequency", p.frequency, 0.0, MAX_FREQUENCY_HZ)?;
        let amplitude = check_range("amplitude", p.amplitude, 0.0, FULL_SCALE_V)?;
        let offset = check_range("offset", p.offset, -FULL_SCALE_V, FULL_SCALE_V)?;

        let mut asg = self.module(&p.channel, ModuleKind::Asg)?;
        asg.set(Register::Waveform, p.waveform).await?;
        asg.set(Register::Frequency, frequency).await?;
        asg.set(Register::Amplitude, amplitude).await?;
        asg.set(Register::Offset, offset).await?;
        asg.set(Register::OutputDirect, p.output_direct).await?;
        let id = asg.id();

        self.track_output(id, p.output_direct);
        to_value(&payload::Configured {
            channel: id.to_string(),
        })
    }

    async fn iq_setup(&mut self, p: params::IqSetup) -> PitayaResult<Value> {
        let frequency = check_range("frequency", p.frequency, 0.0, MAX_FREQUENCY_HZ)?;
        if !p.bandwidth.is_finite() || p.bandwidth <= 0.0 {
            return Err(PitayaError::invalid_parameter(
                "bandwidth",
                format!("{} must be positive", p.bandwidth),
            ));
        }
        let input: Signal = p.input.parse()?;

        let mut iq = self.module(&p.channel, ModuleKind::Iq)?;
        iq.set(Register::Frequency, frequency).await?;
        iq.set(Register::Bandwidth, p.bandwidth).await?;
        iq.set(Register::Input, input).await?;
        iq.set(Register::OutputDirect, p.output_direct).await?;
        let id = iq.id();

        self.track_output(id, p.output_direct);
        to_value(&payload::Configured {
            channel: id.to_string(),
        })
    }
}

fn to_value<T: Serialize>(value: &T) -> PitayaResult<Value> {
    Ok(serde_json::to_value(value)?)
}

fn unsupported(operation: &str, kind: BackendKind) -> PitayaError {
    PitayaError::Unsupported {
        operation: operation.to_string(),
        backend: kind.label().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pitaya_core::backend::BackendSpec;
    use pitaya_core::config::SimulatorSettings;
    use pitaya_driver_sim::{PlantBank, SimBackend};
    use serde_json::json;

    fn dispatcher() -> Dispatcher {
        let mut spec = BackendSpec::new("sim-dev", "test", true);
        spec.simulator = SimulatorSettings {
            noise_std: 0.0,
            seed: Some(11),
            ..SimulatorSettings::default()
        };
        let backend = SimBackend::open(&spec, &PlantBank::new()).unwrap();
        Dispatcher::new(Box::new(backend))
    }

    fn params(value: Value) -> Params {
        match value {
            Value::Object(map) => map,
            _ => Params::new(),
        }
    }

    #[tokio::test]
    async fn test_ping_does_not_need_backend() {
        let mut d = dispatcher();
        d.teardown().await;
        // Closed backend still answers ping
        assert_eq!(
            d.execute(commands::PING, &Params::new()).await.unwrap(),
            json!("pong")
        );
    }

    #[tokio::test]
    async fn test_setpoint_round_trip() {
        let mut d = dispatcher();
        let set = d
            .execute(
                commands::PID_SET_SETPOINT,
                &params(json!({"channel": "pid0", "value": 0.2})),
            )
            .await
            .unwrap();
        assert_eq!(set, json!({"value": 0.2}));

        let get = d
            .execute(commands::PID_GET_SETPOINT, &params(json!({"channel": "pid0"})))
            .await
            .unwrap();
        assert_eq!(get, json!({"value": 0.2}));
    }

    #[tokio::test]
    async fn test_validation_errors() {
        let mut d = dispatcher();

        let err = d
            .execute(
                commands::PID_SET_SETPOINT,
                &params(json!({"channel": "pid0", "value": 1.5})),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PitayaError::InvalidParameter { .. }));

        let err = d
            .execute(commands::PID_GET_SETPOINT, &params(json!({"channel": "pid7"})))
            .await
            .unwrap_err();
        assert!(matches!(err, PitayaError::UnknownModule(_)));

        let err = d
            .execute(commands::PID_GET_SETPOINT, &params(json!({"channel": "asg0"})))
            .await
            .unwrap_err();
        assert!(matches!(err, PitayaError::InvalidParameter { .. }));

        let err = d
            .execute(commands::SCOPE_SET_DECIMATION, &params(json!({"value": 3})))
            .await
            .unwrap_err();
        assert!(matches!(err, PitayaError::InvalidParameter { .. }));

        let err = d
            .execute(commands::SAMPLER_READ, &params(json!({"channel": "laser"})))
            .await
            .unwrap_err();
        assert!(matches!(err, PitayaError::UnknownSignal(_)));

        let err = d.execute("self_destruct", &Params::new()).await.unwrap_err();
        assert!(matches!(err, PitayaError::UnknownCommand(_)));
    }

    #[tokio::test]
    async fn test_configure_tracks_active_outputs() {
        let mut d = dispatcher();
        d.execute(
            commands::ASG_SETUP,
            &params(json!({
                "channel": "asg0",
                "waveform": "sin",
                "frequency": 1000.0,
                "amplitude": 0.5,
                "output_direct": "out1"
            })),
        )
        .await
        .unwrap();
        d.execute(
            commands::PID_CONFIGURE,
            &params(json!({
                "channel": "pid1",
                "p": 0.1, "i": 100.0, "setpoint": 0.0,
                "input": "in1", "output_direct": "off"
            })),
        )
        .await
        .unwrap();
        let active: Vec<String> = d.active_outputs().map(ToString::to_string).collect();
        assert_eq!(active, vec!["asg0"]);

        let report = d.teardown().await;
        assert!(report.is_clean());
        let names: Vec<&str> = report.steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["disable asg0 output", "close backend"]);
        assert!(d.is_closed());

        let err = d
            .execute(commands::PID_GET_SETPOINT, &params(json!({"channel": "pid0"})))
            .await
            .unwrap_err();
        assert!(matches!(err, PitayaError::NotRunning(_)));
        // Second teardown has nothing left to do
        assert!(d.teardown().await.steps.is_empty());
    }

    #[tokio::test]
    async fn test_sim_commands() {
        let mut d = dispatcher();
        for _ in 0..200 {
            d.execute(
                commands::SIM_STEP,
                &params(json!({"controller_output": 0.5, "dt": 1e-4})),
            )
            .await
            .unwrap();
        }
        let metrics: payload::StepMetrics = serde_json::from_value(
            d.execute(commands::SIM_METRICS, &params(json!({"target": 0.5})))
                .await
                .unwrap(),
        )
        .unwrap();
        assert_eq!(metrics.samples, 200);
        assert!(metrics.settling_time.is_some());

        let err = d
            .execute(
                commands::SIM_STEP,
                &params(json!({"controller_output": 0.5, "dt": 0.0})),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PitayaError::InvalidParameter { .. }));
    }

    #[tokio::test]
    async fn test_scope_acquire_payload_shape() {
        let mut d = dispatcher();
        let data = d
            .execute(
                commands::SCOPE_ACQUIRE,
                &params(json!({"decimation": 8, "input_channel": "in1"})),
            )
            .await
            .unwrap();
        let trace: payload::ScopeTrace = serde_json::from_value(data).unwrap();
        assert_eq!(trace.voltage.len(), trace.time.len());
        assert!(!trace.is_empty());
        assert_eq!(trace.time[1], 8.0 / pitaya_core::module::FPGA_CLOCK_HZ);
    }

    #[tokio::test]
    async fn test_scope_timeout_out_of_range() {
        let mut d = dispatcher();
        for timeout in [1e30, -1.0, 0.0] {
            let err = d
                .execute(
                    commands::SCOPE_ACQUIRE,
                    &params(json!({"decimation": 8, "input_channel": "in1", "timeout": timeout})),
                )
                .await
                .unwrap_err();
            match err {
                PitayaError::InvalidParameter { name, .. } => assert_eq!(name, "timeout"),
                other => panic!("expected invalid timeout for {timeout}, got {other}"),
            }
        }
    }
}
