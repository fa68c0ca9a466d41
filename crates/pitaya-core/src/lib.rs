//! `pitaya-core`
//!
//! Shared vocabulary for coordinating access to a Red Pitaya FPGA instrument
//! from many concurrent clients.
//!
//! ## Key Types
//!
//! - [`Command`] / [`Response`] / [`WorkerMessage`]: the correlated
//!   request/response protocol spoken between the command broker and the
//!   worker that owns the instrument driver.
//! - [`ModuleId`], [`Register`], [`Signal`]: the instrument's module model
//!   (`pid0`, `asg1`, `iq2`, `scope`, `sampler`).
//! - [`Backend`] / [`BackendFactory`]: the contract implemented by the real
//!   SCPI driver and by the plant simulator.
//! - [`PitayaError`]: error taxonomy (initialization, command, timeout,
//!   liveness).
//! - [`PitayaConfig`]: layered configuration.

pub mod backend;
pub mod config;
pub mod error;
pub mod module;
pub mod protocol;

pub use backend::{
    Acquisition, Backend, BackendFactory, BackendKind, BackendSpec, ModuleHandle, RegisterValue,
    Simulation,
};
pub use config::{PitayaConfig, RetryPolicy, TransportMode, WorkerMode};
pub use error::{PitayaError, PitayaResult};
pub use module::{ModuleId, ModuleKind, OutputDirect, Register, Signal, TriggerSource, Waveform};
pub use protocol::{commands, payload, params, Command, CorrelationId, Params, Response, Status, WorkerMessage};
