//! Table of in-flight commands keyed by correlation id.
//!
//! Flow:
//! 1. `send_command` creates a [`Command`](pitaya_core::Command) and calls
//!    [`PendingTable::register`] with its id to get a oneshot receiver
//! 2. The command is pushed to the worker
//! 3. The response listener calls [`PendingTable::complete`] with the tagged reply
//! 4. The caller awaits the receiver or gives up; either way the entry is gone
//!    afterwards

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use pitaya_core::{CorrelationId, PitayaError, PitayaResult, Response};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// What the waiting caller receives.
pub type Completion = PitayaResult<Response>;

struct PendingRequest {
    sender: oneshot::Sender<Completion>,
    command: String,
    created_at: Instant,
}

#[derive(Debug, Default)]
struct Counters {
    registered: AtomicU64,
    completed: AtomicU64,
    timed_out: AtomicU64,
    cancelled: AtomicU64,
    unmatched: AtomicU64,
    failed: AtomicU64,
}

/// Snapshot of broker traffic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BrokerStats {
    /// Commands registered
    pub registered: u64,
    /// Responses delivered to their caller
    pub completed: u64,
    /// Callers that gave up waiting
    pub timed_out: u64,
    /// Callers that went away before their response arrived
    pub cancelled: u64,
    /// Responses whose id was not (or no longer) pending
    pub unmatched: u64,
    /// Waiters failed because the worker went away
    pub failed: u64,
    /// Entries currently in flight
    pub in_flight: u64,
}

/// Concurrent map from correlation id to the caller waiting for it.
#[derive(Default)]
pub struct PendingTable {
    pending: DashMap<CorrelationId, PendingRequest>,
    counters: Counters,
}

impl PendingTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `id`.
    ///
    /// Fails if `id` is already pending.
    pub fn register(
        &self,
        id: CorrelationId,
        command: &str,
    ) -> PitayaResult<oneshot::Receiver<Completion>> {
        let (tx, rx) = oneshot::channel();
        match self.pending.entry(id) {
            Entry::Occupied(_) => {
                return Err(PitayaError::Protocol(format!(
                    "correlation id {id} is already pending"
                )))
            }
            Entry::Vacant(slot) => {
                slot.insert(PendingRequest {
                    sender: tx,
                    command: command.to_string(),
                    created_at: Instant::now(),
                });
            }
        }
        self.counters.registered.fetch_add(1, Ordering::Relaxed);
        debug!(correlation_id = %id, command, "Registered pending command");
        Ok(rx)
    }

    /// Deliver `response` to the waiter for `id`.
    ///
    /// Returns false when nobody is waiting: the id is unknown, already timed
    /// out, or the caller is gone.
    pub fn complete(&self, id: CorrelationId, response: Response) -> bool {
        let Some((_, pending)) = self.pending.remove(&id) else {
            self.counters.unmatched.fetch_add(1, Ordering::Relaxed);
            warn!(
                correlation_id = %id,
                status = ?response.status,
                "Dropping response for unknown or expired correlation id"
            );
            return false;
        };

        let elapsed = pending.created_at.elapsed();
        if pending.sender.send(Ok(response)).is_ok() {
            self.counters.completed.fetch_add(1, Ordering::Relaxed);
            debug!(
                correlation_id = %id,
                command = %pending.command,
                elapsed_us = elapsed.as_micros() as u64,
                "Completed pending command"
            );
            true
        } else {
            self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
            debug!(correlation_id = %id, command = %pending.command, "Caller went away before response");
            false
        }
    }

    /// Remove `id` after its caller gave up waiting.
    pub fn record_timeout(&self, id: CorrelationId) -> bool {
        let removed = self.pending.remove(&id);
        if let Some((_, pending)) = &removed {
            self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
            warn!(
                correlation_id = %id,
                command = %pending.command,
                elapsed_ms = pending.created_at.elapsed().as_millis() as u64,
                "Command timed out"
            );
        }
        removed.is_some()
    }

    /// Remove `id` because its caller was cancelled or the send failed.
    pub fn discard(&self, id: CorrelationId) -> bool {
        let removed = self.pending.remove(&id).is_some();
        if removed {
            self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
            debug!(correlation_id = %id, "Discarded pending command");
        }
        removed
    }

    /// Fail every waiter with `error`; returns how many were failed.
    pub fn fail_all(&self, error: &PitayaError) -> usize {
        let ids: Vec<CorrelationId> = self.pending.iter().map(|e| *e.key()).collect();
        let mut failed = 0;
        for id in ids {
            if let Some((_, pending)) = self.pending.remove(&id) {
                // Caller may already be gone; nothing to do then
                let _ = pending.sender.send(Err(error.clone()));
                failed += 1;
            }
        }
        if failed > 0 {
            self.counters
                .failed
                .fetch_add(failed as u64, Ordering::Relaxed);
            warn!(failed, error = %error, "Failed all pending commands");
        }
        failed
    }

    /// Whether `id` is still waiting.
    pub fn contains(&self, id: &CorrelationId) -> bool {
        self.pending.contains_key(id)
    }

    /// Number of commands in flight.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> BrokerStats {
        let c = &self.counters;
        BrokerStats {
            registered: c.registered.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            timed_out: c.timed_out.load(Ordering::Relaxed),
            cancelled: c.cancelled.load(Ordering::Relaxed),
            unmatched: c.unmatched.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            in_flight: self.pending.len() as u64,
        }
    }
}

impl std::fmt::Debug for PendingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingTable")
            .field("in_flight", &self.pending.len())
            .finish()
    }
}
