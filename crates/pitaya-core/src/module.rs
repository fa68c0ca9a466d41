//! Instrument module model.
//!
//! A Red Pitaya running the FPGA feedback bitstream exposes a fixed set of
//! named functional units:
//!
//! | Name | Kind | Count |
//! |------|------|-------|
//! | `pid0`..`pid2` | PID controller | 3 |
//! | `asg0`..`asg1` | Arbitrary signal generator | 2 |
//! | `iq0`..`iq2` | IQ (lock-in) demodulator | 3 |
//! | `scope` | Two-channel oscilloscope | 1 |
//! | `sampler` | Instantaneous signal sampler | 1 |
//!
//! Modules are addressed by name; [`ModuleId`] is the parsed form. Every
//! module has a fixed set of [`Register`]s and the routing network connects
//! [`Signal`]s between them.

use crate::error::{PitayaError, PitayaResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// FPGA sample clock in Hz.
pub const FPGA_CLOCK_HZ: f64 = 125.0e6;
/// Highest frequency the generators and demodulators accept (Nyquist).
pub const MAX_FREQUENCY_HZ: f64 = FPGA_CLOCK_HZ / 2.0;
/// Full-scale analog range in volts (symmetric).
pub const FULL_SCALE_V: f64 = 1.0;
/// Scope decimation factors supported by the FPGA.
pub const DECIMATIONS: [u32; 6] = [1, 8, 64, 1024, 8192, 65536];
/// Samples per scope trace.
pub const TRACE_LENGTH: usize = 16384;

/// Number of PID controllers.
pub const PID_COUNT: u8 = 3;
/// Number of signal generators.
pub const ASG_COUNT: u8 = 2;
/// Number of IQ demodulators.
pub const IQ_COUNT: u8 = 3;

/// Declares a closed set of names with string conversions and serde support.
macro_rules! named_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident => $text:literal ),+ $(,)?
        }
        error = $err:expr;
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl $name {
            /// All values in declaration order.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// Canonical lowercase name.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl FromStr for $name {
            type Err = PitayaError;

            fn from_str(s: &str) -> PitayaResult<Self> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($text => Ok($name::$variant),)+
                    other => Err(($err)(other)),
                }
            }
        }

        impl TryFrom<String> for $name {
            type Error = PitayaError;

            fn try_from(s: String) -> PitayaResult<Self> {
                s.parse()
            }
        }

        impl From<$name> for String {
            fn from(v: $name) -> String {
                v.as_str().to_string()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

named_enum! {
    /// Where a module drives its output.
    pub enum OutputDirect {
        /// Output disabled
        Off => "off",
        /// Analog output 1
        Out1 => "out1",
        /// Analog output 2
        Out2 => "out2",
        /// Both analog outputs
        Both => "both",
    }
    error = |s: &str| PitayaError::invalid_parameter("output_direct", format!("'{s}' is not one of off, out1, out2, both"));
}

impl OutputDirect {
    /// Whether the module currently drives a physical output.
    pub fn is_active(&self) -> bool {
        !matches!(self, OutputDirect::Off)
    }
}

named_enum! {
    /// Signal generator waveform.
    pub enum Waveform {
        /// Sine
        Sin => "sin",
        /// Cosine
        Cos => "cos",
        /// Symmetric ramp
        Ramp => "ramp",
        /// Rising half ramp
        HalfRamp => "halframp",
        /// Square wave
        Square => "square",
        /// Constant level (offset only)
        Dc => "dc",
        /// White noise
        Noise => "noise",
    }
    error = |s: &str| PitayaError::invalid_parameter("waveform", format!("unknown waveform '{s}'"));
}

named_enum! {
    /// Scope trigger source.
    pub enum TriggerSource {
        /// Acquire without waiting for a trigger
        Immediately => "immediately",
        /// Channel 1 rising edge
        Ch1PositiveEdge => "ch1_positive_edge",
        /// Channel 1 falling edge
        Ch1NegativeEdge => "ch1_negative_edge",
        /// Channel 2 rising edge
        Ch2PositiveEdge => "ch2_positive_edge",
        /// Channel 2 falling edge
        Ch2NegativeEdge => "ch2_negative_edge",
        /// External trigger rising edge
        ExtPositiveEdge => "ext_positive_edge",
        /// External trigger falling edge
        ExtNegativeEdge => "ext_negative_edge",
        /// Signal generator 0 period start
        Asg0 => "asg0",
        /// Signal generator 1 period start
        Asg1 => "asg1",
    }
    error = |s: &str| PitayaError::invalid_parameter("trigger_source", format!("unknown trigger source '{s}'"));
}

named_enum! {
    /// Module register addressable through get/set.
    pub enum Register {
        /// PID setpoint (V)
        Setpoint => "setpoint",
        /// Proportional gain
        P => "p",
        /// Integral gain (Hz)
        I => "i",
        /// Derivative gain
        D => "d",
        /// Input signal routing
        Input => "input",
        /// Output routing
        OutputDirect => "output_direct",
        /// Generator waveform
        Waveform => "waveform",
        /// Frequency (Hz)
        Frequency => "frequency",
        /// Amplitude (V)
        Amplitude => "amplitude",
        /// DC offset (V)
        Offset => "offset",
        /// Demodulation bandwidth (Hz)
        Bandwidth => "bandwidth",
        /// Scope decimation factor
        Decimation => "decimation",
        /// Scope trigger source
        TriggerSource => "trigger_source",
    }
    error = |s: &str| PitayaError::InvalidRegister { module: "?".into(), register: s.to_string() };
}

impl Register {
    /// Whether the register holds a number (as opposed to a name).
    pub fn is_numeric(&self) -> bool {
        !matches!(
            self,
            Register::Input | Register::OutputDirect | Register::Waveform | Register::TriggerSource
        )
    }
}

/// Functional unit category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleKind {
    /// PID controller
    Pid,
    /// Arbitrary signal generator
    Asg,
    /// IQ demodulator
    Iq,
    /// Oscilloscope
    Scope,
    /// Signal sampler
    Sampler,
}

impl ModuleKind {
    /// Name prefix (`pid`, `asg`, `iq`, `scope`, `sampler`).
    pub fn prefix(&self) -> &'static str {
        match self {
            ModuleKind::Pid => "pid",
            ModuleKind::Asg => "asg",
            ModuleKind::Iq => "iq",
            ModuleKind::Scope => "scope",
            ModuleKind::Sampler => "sampler",
        }
    }

    /// Number of instances on the FPGA.
    pub fn count(&self) -> u8 {
        match self {
            ModuleKind::Pid => PID_COUNT,
            ModuleKind::Asg => ASG_COUNT,
            ModuleKind::Iq => IQ_COUNT,
            ModuleKind::Scope | ModuleKind::Sampler => 1,
        }
    }

    /// Registers exposed by this kind of module.
    pub fn registers(&self) -> &'static [Register] {
        match self {
            ModuleKind::Pid => &[
                Register::Setpoint,
                Register::P,
                Register::I,
                Register::D,
                Register::Input,
                Register::OutputDirect,
            ],
            ModuleKind::Asg => &[
                Register::Waveform,
                Register::Frequency,
                Register::Amplitude,
                Register::Offset,
                Register::OutputDirect,
            ],
            ModuleKind::Iq => &[
                Register::Frequency,
                Register::Bandwidth,
                Register::Input,
                Register::OutputDirect,
            ],
            ModuleKind::Scope => &[Register::Decimation, Register::TriggerSource],
            ModuleKind::Sampler => &[],
        }
    }

    /// Whether the module can drive an analog output.
    pub fn has_output(&self) -> bool {
        self.registers().contains(&Register::OutputDirect)
    }
}

/// Parsed module name such as `pid0` or `scope`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ModuleId {
    kind: ModuleKind,
    index: u8,
}

impl ModuleId {
    /// Build a module id, checking the index against the FPGA layout.
    pub fn new(kind: ModuleKind, index: u8) -> PitayaResult<Self> {
        if index >= kind.count() {
            return Err(PitayaError::UnknownModule(format!(
                "{}{}",
                kind.prefix(),
                index
            )));
        }
        Ok(Self { kind, index })
    }

    /// PID controller `pidN`.
    pub fn pid(index: u8) -> PitayaResult<Self> {
        Self::new(ModuleKind::Pid, index)
    }

    /// Signal generator `asgN`.
    pub fn asg(index: u8) -> PitayaResult<Self> {
        Self::new(ModuleKind::Asg, index)
    }

    /// IQ demodulator `iqN`.
    pub fn iq(index: u8) -> PitayaResult<Self> {
        Self::new(ModuleKind::Iq, index)
    }

    /// The oscilloscope.
    pub const SCOPE: ModuleId = ModuleId {
        kind: ModuleKind::Scope,
        index: 0,
    };

    /// The sampler.
    pub const SAMPLER: ModuleId = ModuleId {
        kind: ModuleKind::Sampler,
        index: 0,
    };

    /// Module category.
    pub fn kind(&self) -> ModuleKind {
        self.kind
    }

    /// Instance index within its category.
    pub fn index(&self) -> u8 {
        self.index
    }

    /// Parse and require a specific kind (e.g. `pid_*` commands only accept PIDs).
    pub fn parse_kind(name: &str, kind: ModuleKind) -> PitayaResult<Self> {
        let id: ModuleId = name.parse()?;
        if id.kind != kind {
            return Err(PitayaError::invalid_parameter(
                "channel",
                format!("'{name}' is not a {} module", kind.prefix()),
            ));
        }
        Ok(id)
    }

    /// Check that `register` belongs to this module.
    pub fn check_register(&self, register: Register) -> PitayaResult<()> {
        if self.kind.registers().contains(&register) {
            Ok(())
        } else {
            Err(PitayaError::InvalidRegister {
                module: self.to_string(),
                register: register.to_string(),
            })
        }
    }

    /// Every module instance on the FPGA.
    pub fn all() -> Vec<ModuleId> {
        let mut ids = Vec::new();
        for kind in [ModuleKind::Pid, ModuleKind::Asg, ModuleKind::Iq] {
            for index in 0..kind.count() {
                ids.push(ModuleId { kind, index });
            }
        }
        ids.push(Self::SCOPE);
        ids.push(Self::SAMPLER);
        ids
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ModuleKind::Scope | ModuleKind::Sampler => f.write_str(self.kind.prefix()),
            _ => write!(f, "{}{}", self.kind.prefix(), self.index),
        }
    }
}

impl FromStr for ModuleId {
    type Err = PitayaError;

    fn from_str(s: &str) -> PitayaResult<Self> {
        let name = s.trim().to_ascii_lowercase();
        match name.as_str() {
            "scope" => return Ok(Self::SCOPE),
            "sampler" => return Ok(Self::SAMPLER),
            _ => {}
        }
        for kind in [ModuleKind::Pid, ModuleKind::Asg, ModuleKind::Iq] {
            if let Some(rest) = name.strip_prefix(kind.prefix()) {
                if let Ok(index) = rest.parse::<u8>() {
                    return Self::new(kind, index).map_err(|_| PitayaError::UnknownModule(s.into()));
                }
            }
        }
        Err(PitayaError::UnknownModule(s.to_string()))
    }
}

impl TryFrom<String> for ModuleId {
    type Error = PitayaError;

    fn try_from(s: String) -> PitayaResult<Self> {
        s.parse()
    }
}

impl From<ModuleId> for String {
    fn from(id: ModuleId) -> String {
        id.to_string()
    }
}

/// A routable analog signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Signal {
    /// Fast analog input 1
    In1,
    /// Fast analog input 2
    In2,
    /// Fast analog output 1
    Out1,
    /// Fast analog output 2
    Out2,
    /// Output of a module (pid, asg or iq)
    Module(ModuleId),
}

impl Signal {
    /// The module producing this signal, if any.
    pub fn module(&self) -> Option<ModuleId> {
        match self {
            Signal::Module(id) => Some(*id),
            _ => None,
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::In1 => f.write_str("in1"),
            Signal::In2 => f.write_str("in2"),
            Signal::Out1 => f.write_str("out1"),
            Signal::Out2 => f.write_str("out2"),
            Signal::Module(id) => id.fmt(f),
        }
    }
}

impl FromStr for Signal {
    type Err = PitayaError;

    fn from_str(s: &str) -> PitayaResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "in1" => Ok(Signal::In1),
            "in2" => Ok(Signal::In2),
            "out1" => Ok(Signal::Out1),
            "out2" => Ok(Signal::Out2),
            other => match other.parse::<ModuleId>() {
                Ok(id) if id.kind().has_output() => Ok(Signal::Module(id)),
                _ => Err(PitayaError::UnknownSignal(s.to_string())),
            },
        }
    }
}

impl TryFrom<String> for Signal {
    type Error = PitayaError;

    fn try_from(s: String) -> PitayaResult<Self> {
        s.parse()
    }
}

impl From<Signal> for String {
    fn from(s: Signal) -> String {
        s.to_string()
    }
}

/// Reject values outside `[min, max]`.
pub fn check_range(name: &str, value: f64, min: f64, max: f64) -> PitayaResult<f64> {
    if !value.is_finite() || value < min || value > max {
        return Err(PitayaError::invalid_parameter(
            name,
            format!("{value} is outside [{min}, {max}]"),
        ));
    }
    Ok(value)
}

/// Reject decimation factors the FPGA cannot produce.
pub fn check_decimation(value: u32) -> PitayaResult<u32> {
    if DECIMATIONS.contains(&value) {
        Ok(value)
    } else {
        Err(PitayaError::invalid_parameter(
            "decimation",
            format!("{value} is not one of {DECIMATIONS:?}"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_names_round_trip() {
        for id in ModuleId::all() {
            let parsed: ModuleId = id.to_string().parse().unwrap();
            assert_eq!(parsed, id);
        }
        assert_eq!(ModuleId::all().len(), 10);
    }

    #[test]
    fn test_module_parse_rejects_out_of_range() {
        assert!(matches!(
            "pid3".parse::<ModuleId>(),
            Err(PitayaError::UnknownModule(_))
        ));
        assert!("asg2".parse::<ModuleId>().is_err());
        assert!("laser".parse::<ModuleId>().is_err());
        assert_eq!("PID1".parse::<ModuleId>().unwrap(), ModuleId::pid(1).unwrap());
    }

    #[test]
    fn test_parse_kind_requires_matching_category() {
        assert!(ModuleId::parse_kind("pid0", ModuleKind::Pid).is_ok());
        let err = ModuleId::parse_kind("iq0", ModuleKind::Pid).unwrap_err();
        assert!(matches!(err, PitayaError::InvalidParameter { .. }));
    }

    #[test]
    fn test_register_membership() {
        let pid = ModuleId::pid(0).unwrap();
        assert!(pid.check_register(Register::Setpoint).is_ok());
        assert!(pid.check_register(Register::Waveform).is_err());
        assert!(ModuleId::SCOPE.check_register(Register::Decimation).is_ok());
        assert!(!ModuleKind::Scope.has_output());
        assert!(ModuleKind::Iq.has_output());
    }

    #[test]
    fn test_signal_parsing() {
        assert_eq!("in1".parse::<Signal>().unwrap(), Signal::In1);
        assert_eq!(
            "iq2".parse::<Signal>().unwrap(),
            Signal::Module(ModuleId::iq(2).unwrap())
        );
        // The scope does not produce a routable signal
        assert!("scope".parse::<Signal>().is_err());
    }

    #[test]
    fn test_named_enums_serde() {
        let json = serde_json::to_string(&Waveform::HalfRamp).unwrap();
        assert_eq!(json, "\"halframp\"");
        let out: OutputDirect = serde_json::from_str("\"OUT2\"").unwrap();
        assert_eq!(out, OutputDirect::Out2);
        assert!(serde_json::from_str::<TriggerSource>("\"sometimes\"").is_err());
    }

    #[test]
    fn test_limits() {
        assert!(check_range("setpoint", 0.2, -1.0, 1.0).is_ok());
        assert!(check_range("setpoint", 1.5, -1.0, 1.0).is_err());
        assert!(check_range("setpoint", f64::NAN, -1.0, 1.0).is_err());
        assert!(check_decimation(64).is_ok());
        assert!(check_decimation(2).is_err());
    }
}
