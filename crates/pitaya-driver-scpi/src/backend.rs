//! [`Backend`] implementation for a Red Pitaya running the feedback bitstream.
//!
//! # Register map
//!
//! | Module | Register | SCPI path |
//! |--------|----------|-----------|
//! | `pidN` | setpoint, p, i, d | `PIDN:SETP`, `PIDN:KP`, `PIDN:KI`, `PIDN:KD` |
//! | `pidN` | input, output_direct | `PIDN:INP`, `PIDN:OUT` |
//! | `asgN` | waveform, frequency, amplitude, offset | `ASGN:WAVE`, `ASGN:FREQ`, `ASGN:AMPL`, `ASGN:OFFS` |
//! | `asgN` | output_direct | `ASGN:OUT` |
//! | `iqN` | frequency, bandwidth, input, output_direct | `IQN:FREQ`, `IQN:BW`, `IQN:INP`, `IQN:OUT` |
//! | `scope` | decimation | `ACQ:DEC` |
//!
//! Writes send `PATH VALUE`, reads send `PATH?`. Names travel upper case
//! on the wire and are normalized back to lower case on read.
//!
//! The scope trigger source is armed per acquisition (`ACQ:TRIG`) and has no
//! readable register on the device; the last value written is cached here.

use crate::scpi::ScpiClient;
use async_trait::async_trait;
use pitaya_core::backend::{Acquisition, Backend, BackendKind, BackendSpec, RegisterValue};
use pitaya_core::module::{ModuleId, ModuleKind, Register, Signal, TriggerSource};
use pitaya_core::payload::{Quadratures, ScopeTrace};
use pitaya_core::{PitayaError, PitayaResult};
use std::time::Duration;
use tokio::time::Instant;

/// Interval between trigger status polls.
const TRIGGER_POLL: Duration = Duration::from_millis(5);

/// Real instrument reached over SCPI/TCP.
pub struct ScpiBackend {
    client: ScpiClient,
    trigger: TriggerSource,
    identity: String,
}

impl ScpiBackend {
    /// Connect to the instrument named by `spec` and verify it answers `*IDN?`.
    ///
    /// `spec.address` is either `host` (port from `spec.scpi.port`) or
    /// `host:port`.
    pub async fn open(spec: &BackendSpec) -> PitayaResult<Self> {
        let (host, port) = split_address(&spec.address, spec.scpi.port)?;
        let mut client = ScpiClient::connect(&host, port, &spec.scpi)
            .await
            .map_err(backend_error)?;
        let identity = client.query("*IDN?").await.map_err(backend_error)?;
        if identity.is_empty() {
            return Err(PitayaError::Backend(format!(
                "{} returned an empty identity",
                client.peer()
            )));
        }
        tracing::info!(
            peer = %client.peer(),
            config = %spec.config_name,
            identity = %identity,
            "SCPI backend ready"
        );
        Ok(Self {
            client,
            trigger: TriggerSource::Immediately,
            identity,
        })
    }

    async fn wait_for_trigger(&mut self, limit: Duration) -> PitayaResult<()> {
        let deadline = Instant::now() + limit;
        loop {
            let state = self
                .client
                .query("ACQ:TRIG:STAT?")
                .await
                .map_err(backend_error)?;
            if state.eq_ignore_ascii_case("TD") {
                return Ok(());
            }
            if Instant::now() >= deadline {
                // Leave the scope idle for the next request
                let _ = self.client.write("ACQ:STOP").await;
                return Err(PitayaError::Timeout {
                    command: "scope_acquire".into(),
                    timeout: limit,
                });
            }
            tokio::time::sleep(TRIGGER_POLL).await;
        }
    }
}

#[async_trait]
impl Backend for ScpiBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Scpi
    }

    async fn identify(&mut self) -> PitayaResult<String> {
        Ok(self.identity.clone())
    }

    async fn read_register(
        &mut self,
        module: ModuleId,
        register: Register,
    ) -> PitayaResult<RegisterValue> {
        if module == ModuleId::SCOPE && register == Register::TriggerSource {
            return Ok(self.trigger.into());
        }
        let path = register_path(module, register)?;
        let raw = self
            .client
            .query(&format!("{path}?"))
            .await
            .map_err(backend_error)?;
        decode(register, &raw)
    }

    async fn write_register(
        &mut self,
        module: ModuleId,
        register: Register,
        value: RegisterValue,
    ) -> PitayaResult<()> {
        if module == ModuleId::SCOPE && register == Register::TriggerSource {
            self.trigger = value.as_text().parse()?;
            return Ok(());
        }
        let path = register_path(module, register)?;
        let encoded = encode(register, &value)?;
        self.client
            .write(&format!("{path} {encoded}"))
            .await
            .map_err(backend_error)
    }

    async fn read_signal(&mut self, signal: Signal) -> PitayaResult<f64> {
        let query = format!("SAMP:{}?", signal.to_string().to_ascii_uppercase());
        self.client.query_f64(&query).await.map_err(backend_error)
    }

    async fn read_quadratures(&mut self, module: ModuleId) -> PitayaResult<Quadratures> {
        if module.kind() != ModuleKind::Iq {
            return Err(PitayaError::invalid_parameter(
                "channel",
                format!("'{module}' is not an iq module"),
            ));
        }
        let (i, q) = self
            .client
            .query_pair(&format!("IQ{}:QUAD?", module.index()))
            .await
            .map_err(backend_error)?;
        Ok(Quadratures { i, q })
    }

    async fn acquire(&mut self, request: &Acquisition) -> PitayaResult<ScopeTrace> {
        let source = if request.input == Signal::In2 { 2 } else { 1 };

        let mut setup = vec![
            "ACQ:RST".to_string(),
            format!("ACQ:DEC {}", request.decimation),
        ];
        if !matches!(request.input, Signal::In1 | Signal::In2) {
            setup.push(format!(
                "ACQ:SOUR1:INP {}",
                request.input.to_string().to_ascii_uppercase()
            ));
        }
        setup.push("ACQ:START".to_string());
        setup.push(format!("ACQ:TRIG {}", trigger_code(request.trigger)));
        for line in &setup {
            self.client.write(line).await.map_err(backend_error)?;
        }
        self.trigger = request.trigger;

        self.wait_for_trigger(request.timeout).await?;

        let voltage = self
            .client
            .query_list(&format!("ACQ:SOUR{source}:DATA?"))
            .await
            .map_err(backend_error)?;
        let time = ScopeTrace::time_axis(request.decimation, voltage.len());
        Ok(ScopeTrace { voltage, time })
    }

    async fn close(&mut self) -> PitayaResult<()> {
        tracing::info!(peer = %self.client.peer(), "Closing SCPI backend");
        self.client.shutdown().await.map_err(backend_error)
    }
}

fn backend_error(e: anyhow::Error) -> PitayaError {
    PitayaError::Backend(format!("{e:#}"))
}

/// Split `host[:port]`; bare IPv6 literals keep the default port.
pub fn split_address(address: &str, default_port: u16) -> PitayaResult<(String, u16)> {
    let address = address.trim();
    if address.is_empty() {
        return Err(PitayaError::invalid_parameter("address", "empty address"));
    }
    match address.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            let port = port.parse::<u16>().map_err(|_| {
                PitayaError::invalid_parameter("address", format!("bad port in '{address}'"))
            })?;
            Ok((host.to_string(), port))
        }
        _ => Ok((address.to_string(), default_port)),
    }
}

/// SCPI path of a register.
pub fn register_path(module: ModuleId, register: Register) -> PitayaResult<String> {
    module.check_register(register)?;
    let n = module.index();
    let path = match (module.kind(), register) {
        (ModuleKind::Pid, Register::Setpoint) => format!("PID{n}:SETP"),
        (ModuleKind::Pid, Register::P) => format!("PID{n}:KP"),
        (ModuleKind::Pid, Register::I) => format!("PID{n}:KI"),
        (ModuleKind::Pid, Register::D) => format!("PID{n}:KD"),
        (ModuleKind::Pid, Register::Input) => format!("PID{n}:INP"),
        (ModuleKind::Pid, Register::OutputDirect) => format!("PID{n}:OUT"),
        (ModuleKind::Asg, Register::Waveform) => format!("ASG{n}:WAVE"),
        (ModuleKind::Asg, Register::Frequency) => format!("ASG{n}:FREQ"),
        (ModuleKind::Asg, Register::Amplitude) => format!("ASG{n}:AMPL"),
        (ModuleKind::Asg, Register::Offset) => format!("ASG{n}:OFFS"),
        (ModuleKind::Asg, Register::OutputDirect) => format!("ASG{n}:OUT"),
        (ModuleKind::Iq, Register::Frequency) => format!("IQ{n}:FREQ"),
        (ModuleKind::Iq, Register::Bandwidth) => format!("IQ{n}:BW"),
        (ModuleKind::Iq, Register::Input) => format!("IQ{n}:INP"),
        (ModuleKind::Iq, Register::OutputDirect) => format!("IQ{n}:OUT"),
        (ModuleKind::Scope, Register::Decimation) => "ACQ:DEC".to_string(),
        _ => {
            return Err(PitayaError::Unsupported {
                operation: format!("{module}.{register}"),
                backend: BackendKind::Scpi.label().into(),
            })
        }
    };
    Ok(path)
}

fn encode(register: Register, value: &RegisterValue) -> PitayaResult<String> {
    if register.is_numeric() {
        Ok(value.as_f64(register)?.to_string())
    } else {
        Ok(value.as_text().to_ascii_uppercase())
    }
}

fn decode(register: Register, raw: &str) -> PitayaResult<RegisterValue> {
    if register.is_numeric() {
        raw.trim()
            .parse::<f64>()
            .map(RegisterValue::Number)
            .map_err(|_| {
                PitayaError::Backend(format!("device returned '{raw}' for {register}"))
            })
    } else {
        Ok(RegisterValue::Text(raw.trim().to_ascii_lowercase()))
    }
}

fn trigger_code(source: TriggerSource) -> &'static str {
    match source {
        TriggerSource::Immediately => "NOW",
        TriggerSource::Ch1PositiveEdge => "CH1_PE",
        TriggerSource::Ch1NegativeEdge => "CH1_NE",
        TriggerSource::Ch2PositiveEdge => "CH2_PE",
        TriggerSource::Ch2NegativeEdge => "CH2_NE",
        TriggerSource::ExtPositiveEdge => "EXT_PE",
        TriggerSource::ExtNegativeEdge => "EXT_NE",
        TriggerSource::Asg0 | TriggerSource::Asg1 => "AWG_PE",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackDevice;
    use pitaya_core::module::{OutputDirect, Waveform, TRACE_LENGTH};

    async fn open_loopback(device: &LoopbackDevice) -> ScpiBackend {
        let spec = BackendSpec::new(device.address(), "test", false);
        ScpiBackend::open(&spec).await.unwrap()
    }

    #[test]
    fn test_split_address() {
        assert_eq!(
            split_address("rp-f0a1b2.local", 5000).unwrap(),
            ("rp-f0a1b2.local".to_string(), 5000)
        );
        assert_eq!(
            split_address("10.0.0.7:5025", 5000).unwrap(),
            ("10.0.0.7".to_string(), 5025)
        );
        assert!(split_address("host:notaport", 5000).is_err());
        assert!(split_address("  ", 5000).is_err());
    }

    #[test]
    fn test_register_paths() {
        let pid1 = ModuleId::pid(1).unwrap();
        assert_eq!(register_path(pid1, Register::Setpoint).unwrap(), "PID1:SETP");
        let asg0 = ModuleId::asg(0).unwrap();
        assert_eq!(register_path(asg0, Register::Offset).unwrap(), "ASG0:OFFS");
        assert_eq!(
            register_path(ModuleId::SCOPE, Register::Decimation).unwrap(),
            "ACQ:DEC"
        );
        assert!(matches!(
            register_path(pid1, Register::Bandwidth),
            Err(PitayaError::InvalidRegister { .. })
        ));
    }

    #[tokio::test]
    async fn test_registers_echo_through_device() {
        let device = LoopbackDevice::spawn().await.unwrap();
        let mut backend = open_loopback(&device).await;
        assert!(backend.identify().await.unwrap().contains("LOOPBACK"));

        let pid0 = ModuleId::pid(0).unwrap();
        backend
            .write_register(pid0, Register::Setpoint, 0.2.into())
            .await
            .unwrap();
        backend
            .write_register(pid0, Register::OutputDirect, OutputDirect::Out1.into())
            .await
            .unwrap();
        let asg1 = ModuleId::asg(1).unwrap();
        backend
            .write_register(asg1, Register::Waveform, Waveform::Square.into())
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
            RegisterValue::Text("out1".into())
        );
        assert_eq!(
            backend.read_register(asg1, Register::Waveform).await.unwrap(),
            RegisterValue::Text("square".into())
        );
        assert!(device.writes().await.contains(&"PID0:SETP 0.2".to_string()));
    }

    #[tokio::test]
    async fn test_acquire_and_quadratures() {
        let device = LoopbackDevice::spawn().await.unwrap();
        let mut backend = open_loopback(&device).await;

        let trace = backend
            .acquire(&Acquisition {
                decimation: 64,
                trigger: TriggerSource::Ch1PositiveEdge,
                input: Signal::In2,
                timeout: Duration::from_millis(500),
            })
            .await
            .unwrap();
        assert_eq!(trace.len(), TRACE_LENGTH);
        assert_eq!(trace.time.len(), TRACE_LENGTH);
        assert_eq!(
            backend
                .read_register(ModuleId::SCOPE, Register::TriggerSource)
                .await
                .unwrap(),
            RegisterValue::Text("ch1_positive_edge".into())
        );
        let writes = device.writes().await;
        assert!(writes.contains(&"ACQ:TRIG CH1_PE".to_string()));

        let quad = backend
            .read_quadratures(ModuleId::iq(0).unwrap())
            .await
            .unwrap();
        assert_eq!(quad, Quadratures { i: 0.0, q: 0.0 });
        assert!(backend
            .read_quadratures(ModuleId::pid(0).unwrap())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_acquire_times_out_without_trigger() {
        let device = LoopbackDevice::spawn().await.unwrap();
        device.hold_trigger(true).await;
        let mut backend = open_loopback(&device).await;

        let err = backend
            .acquire(&Acquisition {
                decimation: 8,
                trigger: TriggerSource::ExtPositiveEdge,
                input: Signal::In1,
                timeout: Duration::from_millis(30),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PitayaError::Timeout { .. }));
    }
}
