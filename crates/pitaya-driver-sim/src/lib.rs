//! Simulated Red Pitaya
//!
//! A synthetic stand-in for the instrument, used whenever a connection is
//! opened with `mock = true`. It implements the same
//! [`pitaya_core::Backend`] contract as the SCPI driver, plus the
//! [`pitaya_core::Simulation`] extension for stepping the plant directly.
//!
//! # Plant model
//!
//! The process under control is a first-order-plus-dead-time system
//! ([`FopdtPlant`]) with gain, time constant, dead time and Gaussian
//! measurement noise taken from [`pitaya_core::config::SimulatorSettings`].
//! Noise is drawn from a seeded ChaCha RNG so runs with a fixed seed are
//! reproducible.
//!
//! # Sharing
//!
//! Plants live in a [`PlantBank`] keyed by device address. Backends opened
//! for the same address step the same plant.

mod backend;
mod bank;
mod plant;
mod rng;

pub use backend::{SimBackend, SAMPLER_PERIOD};
pub use bank::PlantBank;
pub use plant::{FopdtPlant, SharedPlant};
pub use rng::NoiseSource;
