//! `pitaya-hub`
//!
//! Shared, exclusive access to one Red Pitaya for many concurrent callers.
//!
//! ```text
//! caller ─┐                                  ┌─────────── worker ───────────┐
//! caller ─┼─► ConnectionRegistry ─► Connection ─► CommandBroker ─► Dispatcher ─► Backend
//! caller ─┘     (one per key)                 ▲                  │
//!                                             └── ResponseListener ◄┘
//! ```
//!
//! - [`ConnectionRegistry`] hands out [`ConnectionHandle`]s, one shared
//!   [`Connection`] per `(address, config_name)`, reference counted.
//! - A connection talks to its backend through a [`CommandBroker`] (IPC
//!   mode) or owns a [`Dispatcher`] directly (direct mode).
//! - The broker supervises a worker, on a thread ([`ThreadLauncher`]) or in
//!   a child process ([`ProcessLauncher`]), and multiplexes concurrent
//!   commands over it by correlation id.
//!
//! # Example
//!
//! ```rust,no_run
//! use pitaya_core::PitayaConfig;
//! use pitaya_hub::ConnectionRegistry;
//!
//! # async fn demo() -> pitaya_core::PitayaResult<()> {
//! let registry = ConnectionRegistry::new(PitayaConfig::load()?)?;
//! let conn = registry.connect("sim-dev", "lockbox", true).await?;
//! conn.set_pid_setpoint("pid0", 0.2).await?;
//! assert_eq!(conn.get_pid_setpoint("pid0").await?, 0.2);
//! conn.disconnect().await;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod connection;
pub mod dispatch;
pub mod factory;
pub mod launch;
pub mod listener;
pub mod logging;
pub mod pending;
pub mod process;
pub mod registry;
pub mod teardown;
pub mod worker;

pub use broker::{CommandBroker, WorkerLink};
pub use connection::{
    AsgSettings, Connection, ConnectionKey, ConnectionState, IqSettings, PidSettings,
    ScopeSettings,
};
pub use dispatch::Dispatcher;
pub use factory::StandardBackendFactory;
pub use launch::{Liveness, ThreadLauncher, WorkerChannels, WorkerHandle, WorkerLauncher};
pub use listener::ResponseListener;
pub use logging::init_tracing;
pub use pending::{BrokerStats, PendingTable};
pub use process::{default_program, serve_stdio, ProcessLauncher};
pub use registry::{ConnectOptions, ConnectionHandle, ConnectionRegistry};
pub use teardown::{TeardownReport, TeardownStep};
pub use worker::{initialize_backend, run_worker, WorkerConfig};
