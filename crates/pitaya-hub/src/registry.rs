//! Reference-counted connection registry.
//!
//! The registry maps `(address, config_name)` to one shared [`Connection`],
//! so there is only ever one physical link per key no matter how many
//! callers connect. Each `connect` hands out a [`ConnectionHandle`] and bumps
//! the count; the last release tears the connection down and removes it.
//!
//! The registry is a cheap cloneable handle, constructed explicitly and
//! passed to whoever needs it. One lock guards structural changes to the
//! table. A new entry is published in the `Connecting` state before its
//! backend starts and the lock is released for the start itself; callers
//! racing on the same key wait for that entry instead of building a second
//! link, and callers on other keys are not held up at all.
//!
//! Every handle owns one lease. Releasing by key retires the oldest
//! outstanding lease, and a handle whose lease was retired that way does
//! nothing when it is dropped.

use crate::connection::{Connection, ConnectionKey, ConnectionState, Lease};
use crate::factory::StandardBackendFactory;
use crate::launch::{ThreadLauncher, WorkerLauncher};
use crate::process::{default_program, ProcessLauncher};
use crate::teardown::TeardownReport;
use pitaya_core::config::PitayaConfig;
use pitaya_core::{BackendFactory, PitayaError, PitayaResult, TransportMode, WorkerMode};
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Per-call connection options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Use the simulator instead of real hardware
    pub mock: bool,
    /// Transport; the registry default when `None`
    pub transport: Option<TransportMode>,
}

impl ConnectOptions {
    /// Simulated device over the default transport.
    pub fn mock() -> Self {
        Self {
            mock: true,
            transport: None,
        }
    }

    /// Same options with an explicit transport.
    pub fn with_transport(mut self, transport: TransportMode) -> Self {
        self.transport = Some(transport);
        self
    }
}

struct RegistryInner {
    config: PitayaConfig,
    factory: Arc<dyn BackendFactory>,
    launcher: Arc<dyn WorkerLauncher>,
    connections: Mutex<HashMap<ConnectionKey, Arc<Connection>>>,
}

/// Shared table of device connections.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

impl ConnectionRegistry {
    /// Registry using the standard backends and the worker mode from `config`.
    pub fn new(config: PitayaConfig) -> PitayaResult<Self> {
        Self::with_factory(config, Arc::new(StandardBackendFactory::new()))
    }

    /// Registry creating backends through `factory`.
    pub fn with_factory(
        config: PitayaConfig,
        factory: Arc<dyn BackendFactory>,
    ) -> PitayaResult<Self> {
        let capacity = config.broker.channel_capacity;
        let launcher: Arc<dyn WorkerLauncher> = match config.worker.mode {
            WorkerMode::Thread => Arc::new(ThreadLauncher::new(Arc::clone(&factory), capacity)),
            WorkerMode::Process => {
                let program = match &config.worker.program {
                    Some(program) => program.clone(),
                    None => default_program()?,
                };
                Arc::new(ProcessLauncher::new(program, capacity))
            }
        };
        Ok(Self::with_launcher(config, factory, launcher))
    }

    /// Registry with an explicit worker launcher. `factory` is still used
    /// by direct-mode connections.
    pub fn with_launcher(
        config: PitayaConfig,
        factory: Arc<dyn BackendFactory>,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                config,
                factory,
                launcher,
                connections: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Effective configuration.
    pub fn config(&self) -> &PitayaConfig {
        &self.inner.config
    }

    /// Connect to `address` under `config_name` using the default transport.
    pub async fn connect(
        &self,
        address: &str,
        config_name: &str,
        mock: bool,
    ) -> PitayaResult<ConnectionHandle> {
        self.connect_with(
            address,
            config_name,
            ConnectOptions {
                mock,
                transport: None,
            },
        )
        .await
    }

    /// Connect with explicit options.
    ///
    /// An existing connected entry for the key is shared and its count
    /// incremented; the options of the first caller win. A caller that finds
    /// the key still starting waits for that start and shares its outcome.
    /// Entries left in the error state are evicted and rebuilt.
    pub async fn connect_with(
        &self,
        address: &str,
        config_name: &str,
        options: ConnectOptions,
    ) -> PitayaResult<ConnectionHandle> {
        let key = ConnectionKey::new(address, config_name);
        loop {
            let mut table = self.inner.connections.lock().await;
            let existing = table.get(&key).cloned();
            match existing {
                Some(existing) if existing.state() == ConnectionState::Connected => {
                    self.warn_on_mismatch(&existing, options);
                    let lease = existing.acquire();
                    debug!(key = %key, reference_count = existing.reference_count(), "Reusing connection");
                    return Ok(ConnectionHandle::new(self.clone(), existing, lease));
                }
                Some(existing) if existing.state() == ConnectionState::Connecting => {
                    drop(table);
                    debug!(key = %key, "Waiting for connection in progress");
                    if existing.wait_started().await == ConnectionState::Error {
                        if let Some(e) = existing.start_error() {
                            return Err(e);
                        }
                    }
                    continue;
                }
                Some(stale) => {
                    table.remove(&key);
                    drop(table);
                    warn!(key = %key, state = ?stale.state(), "Evicting stale connection");
                    stale.teardown().await;
                    continue;
                }
                None => {}
            }

            let mode = options
                .transport
                .unwrap_or(self.inner.config.registry.default_transport);
            let connection = Arc::new(Connection::new(
                key.clone(),
                options.mock,
                mode,
                &self.inner.config,
                Arc::clone(&self.inner.factory),
                Arc::clone(&self.inner.launcher),
            ));
            connection.set_state(ConnectionState::Connecting);
            // A failed start stays in the table so the error is observable;
            // the next connect evicts it
            table.insert(key.clone(), Arc::clone(&connection));
            drop(table);

            let pending = PendingStart(Some(&connection));
            let started = connection.start().await;
            pending.finish();
            started?;

            let table = self.inner.connections.lock().await;
            let registered = table
                .get(&key)
                .is_some_and(|current| Arc::ptr_eq(current, &connection));
            if !registered {
                drop(table);
                warn!(key = %key, "Connection removed while starting");
                connection.teardown().await;
                return Err(PitayaError::NotRunning(format!(
                    "'{key}' was removed while connecting"
                )));
            }
            let lease = connection.acquire();
            drop(table);
            info!(key = %key, mock = options.mock, transport = ?mode, "Connection created");
            return Ok(ConnectionHandle::new(self.clone(), connection, lease));
        }
    }

    fn warn_on_mismatch(&self, existing: &Connection, options: ConnectOptions) {
        if existing.mock() != options.mock {
            warn!(
                key = %existing.key(),
                existing = existing.mock(),
                requested = options.mock,
                "Mock flag differs from the existing connection; sharing it anyway"
            );
        }
        if options
            .transport
            .is_some_and(|t| t != existing.transport_mode())
        {
            warn!(key = %existing.key(), "Transport differs from the existing connection; sharing it anyway");
        }
    }

    /// Drop one reference to the key; the last one tears the connection down.
    ///
    /// The oldest outstanding handle's lease is the one retired, so that
    /// handle no longer releases anything when dropped. Returns the teardown
    /// report when this call tore the connection down.
    pub async fn disconnect(&self, address: &str, config_name: &str) -> Option<TeardownReport> {
        let key = ConnectionKey::new(address, config_name);
        let connection = {
            let table = self.inner.connections.lock().await;
            table.get(&key).cloned()
        };
        let Some(connection) = connection else {
            warn!(key = %key, "Disconnect for unknown connection");
            return None;
        };
        self.release(&connection, None).await
    }

    /// Remove the key regardless of its reference count.
    pub async fn remove(&self, address: &str, config_name: &str) -> Option<TeardownReport> {
        let key = ConnectionKey::new(address, config_name);
        let connection = self.inner.connections.lock().await.remove(&key)?;
        let holders = connection.clear_references();
        info!(key = %key, holders, "Force-removing connection");
        Some(connection.teardown().await)
    }

    /// Connection for the key, if present.
    pub async fn get(&self, address: &str, config_name: &str) -> Option<Arc<Connection>> {
        let key = ConnectionKey::new(address, config_name);
        self.inner.connections.lock().await.get(&key).cloned()
    }

    /// Number of entries.
    pub async fn len(&self) -> usize {
        self.inner.connections.lock().await.len()
    }

    /// Whether the table is empty.
    pub async fn is_empty(&self) -> bool {
        self.inner.connections.lock().await.is_empty()
    }

    /// Keys in sorted order.
    pub async fn keys(&self) -> Vec<ConnectionKey> {
        let mut keys: Vec<ConnectionKey> =
            self.inner.connections.lock().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Tear down every connection, whatever its count.
    pub async fn shutdown_all(&self) -> Vec<(ConnectionKey, TeardownReport)> {
        let mut entries: Vec<(ConnectionKey, Arc<Connection>)> =
            self.inner.connections.lock().await.drain().collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        let mut reports = Vec::with_capacity(entries.len());
        for (key, connection) in entries {
            connection.clear_references();
            reports.push((key, connection.teardown().await));
        }
        if !reports.is_empty() {
            info!(count = reports.len(), "All connections shut down");
        }
        reports
    }

    /// Retire `lease` (or the oldest one) and tear down on the last.
    async fn release(
        &self,
        connection: &Arc<Connection>,
        lease: Option<&Lease>,
    ) -> Option<TeardownReport> {
        let key = connection.key();
        {
            let mut table = self.inner.connections.lock().await;
            match table.get(key) {
                Some(current) if Arc::ptr_eq(current, connection) => {}
                _ => {
                    debug!(key = %key, "Release for a connection no longer registered");
                    return None;
                }
            }
            match connection.release(lease) {
                None => {
                    debug!(key = %key, "Lease already released");
                    return None;
                }
                Some(remaining) if remaining > 0 => {
                    debug!(key = %key, reference_count = remaining, "Connection still in use");
                    return None;
                }
                Some(_) => {
                    table.remove(key);
                }
            }
        }
        info!(key = %key, "Last reference released, tearing down");
        Some(connection.teardown().await)
    }
}

/// Fails a `Connecting` entry whose starter was dropped mid-start, so
/// callers waiting on it wake up and the next connect evicts it.
struct PendingStart<'a>(Option<&'a Connection>);

impl PendingStart<'_> {
    fn finish(mut self) {
        self.0 = None;
    }
}

impl Drop for PendingStart<'_> {
    fn drop(&mut self) {
        if let Some(connection) = self.0 {
            connection.abandon_start();
        }
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("default_transport", &self.inner.config.registry.default_transport)
            .finish_non_exhaustive()
    }
}

/// A caller's lease on a shared [`Connection`].
///
/// Dereferences to the connection. Release it with
/// [`ConnectionHandle::disconnect`]; a handle dropped without that schedules
/// the release on the current tokio runtime, unless its lease was already
/// retired by [`ConnectionRegistry::disconnect`] or a forced removal.
pub struct ConnectionHandle {
    registry: ConnectionRegistry,
    connection: Arc<Connection>,
    lease: Lease,
}

impl ConnectionHandle {
    fn new(registry: ConnectionRegistry, connection: Arc<Connection>, lease: Lease) -> Self {
        Self {
            registry,
            connection,
            lease,
        }
    }

    /// The shared connection.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Whether this handle no longer counts towards the connection.
    pub fn is_released(&self) -> bool {
        self.lease.is_retired()
    }

    /// Release this lease; returns the teardown report if it was the last.
    pub async fn disconnect(self) -> Option<TeardownReport> {
        self.registry
            .release(&self.connection, Some(&self.lease))
            .await
    }
}

impl Clone for ConnectionHandle {
    fn clone(&self) -> Self {
        let lease = self.connection.acquire();
        Self::new(self.registry.clone(), Arc::clone(&self.connection), lease)
    }
}

impl Deref for ConnectionHandle {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.connection
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        if self.lease.is_retired() {
            return;
        }
        let key = self.connection.key().clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let registry = self.registry.clone();
                let connection = Arc::clone(&self.connection);
                let lease = self.lease.clone();
                debug!(key = %key, "Connection handle dropped, releasing");
                runtime.spawn(async move {
                    registry.release(&connection, Some(&lease)).await;
                });
            }
            Err(_) => warn!(key = %key, "Connection handle dropped outside a runtime; reference leaked"),
        }
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ConnectionHandle")
            .field(&self.connection)
            .finish()
    }
}
