//! Red Pitaya SCPI backend
//!
//! Drives a Red Pitaya STEMlab board running the feedback FPGA bitstream over
//! SCPI/TCP (default port 5000). [`ScpiBackend`] implements
//! [`pitaya_core::Backend`] and is normally created by the hub's backend
//! factory inside the worker that owns it.
//!
//! # Loopback device
//!
//! With the `loopback` feature, [`loopback::LoopbackDevice`] provides an
//! in-process SCPI server that echoes writes, so the real-hardware code path
//! can be exercised without an instrument:
//!
//! ```rust,ignore
//! let device = LoopbackDevice::spawn().await?;
//! let spec = BackendSpec::new(device.address(), "bench", false);
//! let backend = ScpiBackend::open(&spec).await?;
//! ```

mod backend;
#[cfg(any(test, feature = "loopback"))]
pub mod loopback;
mod scpi;

pub use backend::{register_path, split_address, ScpiBackend};
pub use scpi::{parse_list, ScpiClient, DEFAULT_PORT};
