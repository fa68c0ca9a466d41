//! Simulated instrument backed by a shared FOPDT plant.
//!
//! The simulated board is wired as a closed loop: analog output `out1`
//! drives the plant and the plant's measured output appears on `in1`.
//! `out2` is looped back to `in2`. Module registers are plain memory, so every
//! read returns exactly what was last written.
//!
//! Time only advances when something observes the board:
//! - `read_signal` and `read_quadratures` advance by [`SAMPLER_PERIOD`]
//! - `acquire` advances by one sample interval per trace point
//! - [`Simulation::step`] advances the plant directly, bypassing the modules
//!
//! Every trigger source fires immediately.

use crate::bank::PlantBank;
use crate::plant::SharedPlant;
use crate::rng::NoiseSource;
use async_trait::async_trait;
use pitaya_core::backend::{
    Acquisition, Backend, BackendKind, BackendSpec, RegisterValue, Simulation,
};
use pitaya_core::module::{
    check_decimation, ModuleId, ModuleKind, OutputDirect, Register, Signal, TriggerSource,
    Waveform, FPGA_CLOCK_HZ, FULL_SCALE_V, TRACE_LENGTH,
};
use pitaya_core::payload::{Quadratures, ScopeTrace, StepMetrics};
use pitaya_core::{PitayaError, PitayaResult};
use std::collections::HashMap;
use std::f64::consts::TAU;

/// Simulated time consumed by one sampler or quadrature read, in seconds.
pub const SAMPLER_PERIOD: f64 = 1.0e-4;

#[derive(Debug, Clone, Copy)]
enum Setup {
    Pid {
        setpoint: f64,
        p: f64,
        i: f64,
        d: f64,
        input: Signal,
    },
    Asg {
        waveform: Waveform,
        frequency: f64,
        amplitude: f64,
        offset: f64,
    },
    Iq {
        frequency: f64,
        bandwidth: f64,
        input: Signal,
    },
}

#[derive(Debug, Clone, Copy)]
struct ModuleSetup {
    id: ModuleId,
    routing: OutputDirect,
    setup: Setup,
}

#[derive(Debug, Default, Clone, Copy)]
struct PidState {
    integral: f64,
    previous_error: f64,
}

/// Synthetic Red Pitaya.
pub struct SimBackend {
    address: String,
    plant: SharedPlant,
    registers: HashMap<(ModuleId, Register), RegisterValue>,
    pid_state: HashMap<ModuleId, PidState>,
    iq_state: HashMap<ModuleId, Quadratures>,
    outputs: HashMap<ModuleId, f64>,
    analog_out: [f64; 2],
    measured: f64,
    noise: NoiseSource,
    closed: bool,
}

impl SimBackend {
    /// Simulated board for `spec.address`, stepping the bank's plant for it.
    pub fn open(spec: &BackendSpec, bank: &PlantBank) -> PitayaResult<Self> {
        if spec.address.trim().is_empty() {
            return Err(PitayaError::invalid_parameter(
                "address",
                "simulated device needs a name",
            ));
        }
        let plant = bank.plant(&spec.address, &spec.simulator);
        let measured = plant.lock().process_variable();
        tracing::info!(
            address = %spec.address,
            config = %spec.config_name,
            "Simulated backend ready"
        );
        Ok(Self {
            address: spec.address.clone(),
            plant,
            registers: HashMap::new(),
            pid_state: HashMap::new(),
            iq_state: HashMap::new(),
            outputs: HashMap::new(),
            analog_out: [0.0; 2],
            measured,
            // Waveform noise is independent of the plant's measurement noise
            noise: NoiseSource::new(spec.simulator.seed.map(|s| s.wrapping_add(1))),
            closed: false,
        })
    }

    fn ensure_open(&self) -> PitayaResult<()> {
        if self.closed {
            return Err(PitayaError::Backend(format!(
                "simulated device '{}' is closed",
                self.address
            )));
        }
        Ok(())
    }

    fn register(&self, id: ModuleId, register: Register) -> RegisterValue {
        self.registers
            .get(&(id, register))
            .cloned()
            .unwrap_or_else(|| default_value(register))
    }

    fn number(&self, id: ModuleId, register: Register) -> f64 {
        self.register(id, register).as_f64(register).unwrap_or(0.0)
    }

    fn routing(&self, id: ModuleId) -> OutputDirect {
        self.register(id, Register::OutputDirect)
            .as_text()
            .parse()
            .unwrap_or(OutputDirect::Off)
    }

    fn input(&self, id: ModuleId) -> Signal {
        self.register(id, Register::Input)
            .as_text()
            .parse()
            .unwrap_or(Signal::In1)
    }

    /// Current configuration of every output-capable module.
    fn snapshot(&self) -> Vec<ModuleSetup> {
        ModuleId::all()
            .into_iter()
            .filter(|id| id.kind().has_output())
            .filter_map(|id| {
                let setup = match id.kind() {
                    ModuleKind::Pid => Setup::Pid {
                        setpoint: self.number(id, Register::Setpoint),
                        p: self.number(id, Register::P),
                        i: self.number(id, Register::I),
                        d: self.number(id, Register::D),
                        input: self.input(id),
                    },
                    ModuleKind::Asg => Setup::Asg {
                        waveform: self
                            .register(id, Register::Waveform)
                            .as_text()
                            .parse()
                            .unwrap_or(Waveform::Sin),
                        frequency: self.number(id, Register::Frequency),
                        amplitude: self.number(id, Register::Amplitude),
                        offset: self.number(id, Register::Offset),
                    },
                    ModuleKind::Iq => Setup::Iq {
                        frequency: self.number(id, Register::Frequency),
                        bandwidth: self.number(id, Register::Bandwidth),
                        input: self.input(id),
                    },
                    ModuleKind::Scope | ModuleKind::Sampler => return None,
                };
                Some(ModuleSetup {
                    id,
                    routing: self.routing(id),
                    setup,
                })
            })
            .collect()
    }

    fn signal(&self, signal: Signal) -> f64 {
        match signal {
            Signal::In1 => self.measured,
            Signal::In2 | Signal::Out2 => self.analog_out[1],
            Signal::Out1 => self.analog_out[0],
            Signal::Module(id) => self.outputs.get(&id).copied().unwrap_or(0.0),
        }
    }

    /// Run every module for `dt`, drive the plant with `out1` and sample it.
    fn advance(&mut self, setups: &[ModuleSetup], dt: f64) -> f64 {
        let t = self.plant.lock().time();
        let mut out = [0.0_f64; 2];

        for module in setups {
            let value = match module.setup {
                Setup::Pid {
                    setpoint,
                    p,
                    i,
                    d,
                    input,
                } => {
                    let error = setpoint - self.signal(input);
                    let state = self.pid_state.entry(module.id).or_default();
                    state.integral =
                        (state.integral + i * error * dt).clamp(-FULL_SCALE_V, FULL_SCALE_V);
                    let derivative = d * (error - state.previous_error);
                    state.previous_error = error;
                    (p * error + state.integral + derivative).clamp(-FULL_SCALE_V, FULL_SCALE_V)
                }
                Setup::Asg {
                    waveform,
                    frequency,
                    amplitude,
                    offset,
                } => {
                    let phase = (frequency * t).fract();
                    let shape = match waveform {
                        Waveform::Sin => (TAU * phase).sin(),
                        Waveform::Cos => (TAU * phase).cos(),
                        Waveform::Ramp => 1.0 - 4.0 * (phase - 0.5).abs(),
                        Waveform::HalfRamp => 2.0 * phase - 1.0,
                        Waveform::Square => {
                            if phase < 0.5 {
                                1.0
                            } else {
                                -1.0
                            }
                        }
                        Waveform::Dc => 0.0,
                        Waveform::Noise => self.noise.standard_normal(),
                    };
                    amplitude * shape + offset
                }
                Setup::Iq {
                    frequency,
                    bandwidth,
                    input,
                } => {
                    let x = self.signal(input);
                    let phase = TAU * (frequency * t).fract();
                    let raw = Quadratures {
                        i: x * phase.cos(),
                        q: x * phase.sin(),
                    };
                    let alpha = if bandwidth > 0.0 {
                        1.0 - (-TAU * bandwidth * dt).exp()
                    } else {
                        1.0
                    };
                    let state = self.iq_state.entry(module.id).or_insert(raw);
                    state.i += alpha * (raw.i - state.i);
                    state.q += alpha * (raw.q - state.q);
                    state.i
                }
            };
            self.outputs.insert(module.id, value);
            match module.routing {
                OutputDirect::Off => {}
                OutputDirect::Out1 => out[0] += value,
                OutputDirect::Out2 => out[1] += value,
                OutputDirect::Both => {
                    out[0] += value;
                    out[1] += value;
                }
            }
        }

        self.analog_out = out.map(|v| v.clamp(-FULL_SCALE_V, FULL_SCALE_V));
        self.measured = self.plant.lock().step(self.analog_out[0], dt);
        self.measured
    }

    fn tick(&mut self) {
        let setups = self.snapshot();
        self.advance(&setups, SAMPLER_PERIOD);
    }
}

fn default_value(register: Register) -> RegisterValue {
    match register {
        Register::Input => Signal::In1.into(),
        Register::OutputDirect => OutputDirect::Off.into(),
        Register::Waveform => Waveform::Sin.into(),
        Register::TriggerSource => TriggerSource::Immediately.into(),
        Register::Decimation => 1u32.into(),
        _ => 0.0.into(),
    }
}

/// Check the value type and store names in canonical form.
fn normalize(register: Register, value: RegisterValue) -> PitayaResult<RegisterValue> {
    let text = value.as_text();
    Ok(match register {
        Register::Input => text.parse::<Signal>()?.into(),
        Register::OutputDirect => text.parse::<OutputDirect>()?.into(),
        Register::Waveform => text.parse::<Waveform>()?.into(),
        Register::TriggerSource => text.parse::<TriggerSource>()?.into(),
        Register::Decimation => {
            let raw = value.as_f64(register)?;
            if raw.fract() != 0.0 || raw < 0.0 || raw > f64::from(u32::MAX) {
                return Err(PitayaError::invalid_parameter(
                    "decimation",
                    format!("{raw} is not a whole number"),
                ));
            }
            check_decimation(raw as u32)?.into()
        }
        _ => RegisterValue::Number(value.as_f64(register)?),
    })
}

#[async_trait]
impl Backend for SimBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Simulated
    }

    async fn identify(&mut self) -> PitayaResult<String> {
        self.ensure_open()?;
        Ok(format!("REDPITAYA,FOPDT-SIM,{},0", self.address))
    }

    async fn read_register(
        &mut self,
        module: ModuleId,
        register: Register,
    ) -> PitayaResult<RegisterValue> {
        self.ensure_open()?;
        module.check_register(register)?;
        Ok(self.register(module, register))
    }

    async fn write_register(
        &mut self,
        module: ModuleId,
        register: Register,
        value: RegisterValue,
    ) -> PitayaResult<()> {
        self.ensure_open()?;
        module.check_register(register)?;
        let value = normalize(register, value)?;
        tracing::trace!(module = %module, register = %register, value = %value, "sim write");
        if register == Register::Setpoint || register == Register::P || register == Register::I {
            // Fresh gains start from a clean integrator
            self.pid_state.remove(&module);
        }
        self.registers.insert((module, register), value);
        Ok(())
    }

    async fn read_signal(&mut self, signal: Signal) -> PitayaResult<f64> {
        self.ensure_open()?;
        self.tick();
        Ok(self.signal(signal))
    }

    async fn read_quadratures(&mut self, module: ModuleId) -> PitayaResult<Quadratures> {
        self.ensure_open()?;
        if module.kind() != ModuleKind::Iq {
            return Err(PitayaError::invalid_parameter(
                "channel",
                format!("'{module}' is not an iq module"),
            ));
        }
        self.tick();
        Ok(self
            .iq_state
            .get(&module)
            .copied()
            .unwrap_or(Quadratures { i: 0.0, q: 0.0 }))
    }

    async fn acquire(&mut self, request: &Acquisition) -> PitayaResult<ScopeTrace> {
        self.ensure_open()?;
        let decimation = check_decimation(request.decimation)?;
        self.registers
            .insert((ModuleId::SCOPE, Register::Decimation), decimation.into());
        self.registers.insert(
            (ModuleId::SCOPE, Register::TriggerSource),
            request.trigger.into(),
        );

        let dt = f64::from(decimation) / FPGA_CLOCK_HZ;
        let setups = self.snapshot();
        let mut voltage = Vec::with_capacity(TRACE_LENGTH);
        for _ in 0..TRACE_LENGTH {
            self.advance(&setups, dt);
            voltage.push(self.signal(request.input));
        }
        let time = ScopeTrace::time_axis(decimation, voltage.len());
        Ok(ScopeTrace { voltage, time })
    }

    async fn close(&mut self) -> PitayaResult<()> {
        if !self.closed {
            tracing::info!(address = %self.address, "Closing simulated backend");
            self.closed = true;
        }
        Ok(())
    }

    fn simulation(&mut self) -> Option<&mut dyn Simulation> {
        Some(self)
    }
}

impl Simulation for SimBackend {
    fn step(&mut self, controller_output: f64, dt: f64) -> f64 {
        self.measured = self.plant.lock().step(controller_output, dt);
        self.measured
    }

    fn history(&self) -> Vec<(f64, f64)> {
        self.plant.lock().history()
    }

    fn metrics(&self, target: f64, tolerance: f64) -> StepMetrics {
        self.plant.lock().metrics(target, tolerance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pitaya_core::config::SimulatorSettings;
    use std::time::Duration;

    fn spec(address: &str) -> BackendSpec {
        let mut spec = BackendSpec::new(address, "test", true);
        spec.simulator = SimulatorSettings {
            noise_std: 0.0,
            seed: Some(3),
            ..SimulatorSettings::default()
        };
        spec
    }

    #[tokio::test]
    async fn test_registers_echo_exactly() {
        let bank = PlantBank::new();
        let mut backend = SimBackend::open(&spec("sim-dev"), &bank).unwrap();
        let pid0 = ModuleId::pid(0).unwrap();

        backend
            .write_register(pid0, Register::Setpoint, 0.2.into())
            .await
            .unwrap();
        assert_eq!(
            backend.read_register(pid0, Register::Setpoint).await.unwrap(),
            RegisterValue::Number(0.2)
        );
        assert_eq!(
            backend
                .read_register(pid0, Register::OutputDirect)
                .await
                .unwrap(),
            RegisterValue::Text("off".into())
        );

        // Names are stored canonically
        backend
            .write_register(pid0, Register::Input, RegisterValue::Text("IN2".into()))
            .await
            .unwrap();
        assert_eq!(
            backend.read_register(pid0, Register::Input).await.unwrap(),
            RegisterValue::Text("in2".into())
        );
    }

    #[tokio::test]
    async fn test_write_rejects_bad_values() {
        let bank = PlantBank::new();
        let mut backend = SimBackend::open(&spec("sim-dev"), &bank).unwrap();
        let asg0 = ModuleId::asg(0).unwrap();

        assert!(backend
            .write_register(asg0, Register::Waveform, RegisterValue::Text("zigzag".into()))
            .await
            .is_err());
        assert!(matches!(
            backend
                .write_register(asg0, Register::Setpoint, 0.1.into())
                .await,
            Err(PitayaError::InvalidRegister { .. })
        ));
        assert!(backend
            .write_register(ModuleId::SCOPE, Register::Decimation, 3u32.into())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_pid_loop_tracks_setpoint() {
        let bank = PlantBank::new();
        let mut backend = SimBackend::open(&spec("loop"), &bank).unwrap();
        let pid0 = ModuleId::pid(0).unwrap();
        backend
            .write_register(pid0, Register::I, 2000.0.into())
            .await
            .unwrap();
        backend
            .write_register(pid0, Register::Setpoint, 0.3.into())
            .await
            .unwrap();
        backend
            .write_register(pid0, Register::OutputDirect, OutputDirect::Out1.into())
            .await
            .unwrap();

        let mut value = 0.0;
        for _ in 0..2000 {
            value = backend.read_signal(Signal::In1).await.unwrap();
        }
        assert!((value - 0.3).abs() < 0.01, "in1 settled at {value}");
        assert!(backend.read_signal(Signal::Out1).await.unwrap() > 0.0);
    }

    #[tokio::test]
    async fn test_acquire_trace_shape() {
        let bank = PlantBank::new();
        let mut backend = SimBackend::open(&spec("scope"), &bank).unwrap();
        let asg0 = ModuleId::asg(0).unwrap();
        backend
            .write_register(asg0, Register::Amplitude, 0.5.into())
            .await
            .unwrap();
        backend
            .write_register(asg0, Register::Frequency, 10_000.0.into())
            .await
            .unwrap();
        backend
            .write_register(asg0, Register::OutputDirect, OutputDirect::Out2.into())
            .await
            .unwrap();

        let trace = backend
            .acquire(&Acquisition {
                decimation: 64,
                trigger: TriggerSource::Ch1PositiveEdge,
                input: Signal::In2,
                timeout: Duration::from_secs(1),
            })
            .await
            .unwrap();
        assert_eq!(trace.len(), TRACE_LENGTH);
        assert_eq!(trace.time.len(), TRACE_LENGTH);
        let peak = trace.voltage.iter().copied().fold(f64::MIN, f64::max);
        assert!(peak > 0.45 && peak <= 0.5, "peak {peak}");
        assert_eq!(
            backend
                .read_register(ModuleId::SCOPE, Register::Decimation)
                .await
                .unwrap(),
            RegisterValue::Number(64.0)
        );
    }

    #[tokio::test]
    async fn test_backends_on_same_address_share_plant() {
        let bank = PlantBank::new();
        let mut a = SimBackend::open(&spec("shared"), &bank).unwrap();
        let b = SimBackend::open(&spec("shared"), &bank).unwrap();

        let sim = a.simulation().unwrap();
        for _ in 0..10 {
            sim.step(1.0, 1e-4);
        }
        assert_eq!(b.history().len(), 10);
    }

    #[tokio::test]
    async fn test_quadratures_follow_input() {
        let bank = PlantBank::new();
        let mut backend = SimBackend::open(&spec("iq"), &bank).unwrap();
        let asg0 = ModuleId::asg(0).unwrap();
        let iq0 = ModuleId::iq(0).unwrap();
        backend
            .write_register(asg0, Register::Waveform, Waveform::Dc.into())
            .await
            .unwrap();
        backend
            .write_register(asg0, Register::Offset, 0.4.into())
            .await
            .unwrap();
        backend
            .write_register(asg0, Register::OutputDirect, OutputDirect::Out2.into())
            .await
            .unwrap();
        backend
            .write_register(iq0, Register::Input, Signal::In2.into())
            .await
            .unwrap();

        let mut quad = Quadratures { i: 0.0, q: 0.0 };
        for _ in 0..3 {
            quad = backend.read_quadratures(iq0).await.unwrap();
        }
        assert!((quad.i - 0.4).abs() < 1e-12);
        assert_eq!(quad.q, 0.0);
        assert!(backend
            .read_quadratures(ModuleId::asg(0).unwrap())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_closed_backend_rejects_calls() {
        let bank = PlantBank::new();
        let mut backend = SimBackend::open(&spec("closing"), &bank).unwrap();
        backend.close().await.unwrap();
        assert!(backend.identify().await.is_err());
        // Closing twice is harmless
        backend.close().await.unwrap();
        // The plant outlives the backend
        assert!(bank.get("closing").is_some());
    }
}
