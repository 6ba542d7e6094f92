//! Structured events emitted at the points spec.md §6 calls out: SQL
//! execution, transaction boundaries, health transitions, replica
//! selection, scatter-gather fan-out, and 2PC state transitions.
//!
//! Events are pure data; this module does not mandate a logging backend.
//! Each `emit` call also fires a `tracing` event at an appropriate level so
//! an embedding application gets both a typed value (for metrics) and a
//! human-readable line (for logs) for free.

use std::time::Duration;

#[derive(Debug, Clone)]
pub enum Event {
    SqlExecuted {
        database: String,
        role: String,
        shard: Option<String>,
        sql: String,
        duration: Duration,
    },
    TransactionBegan {
        adapter: String,
        isolation: Option<String>,
    },
    TransactionCommitted {
        adapter: String,
        depth: usize,
    },
    TransactionRolledBack {
        adapter: String,
        depth: usize,
    },
    HealthChanged {
        adapter: String,
        healthy: bool,
    },
    ReplicaSelected {
        database: String,
        shard: Option<String>,
        adapter: String,
    },
    ScatterGatherFanOut {
        shards: Vec<String>,
    },
    DistributedTxTransition {
        tx_id: String,
        from: String,
        to: String,
    },
}

pub fn emit(event: Event) {
    match &event {
        Event::SqlExecuted {
            database,
            role,
            shard,
            sql,
            duration,
        } => tracing::debug!(
            database,
            role,
            shard = shard.as_deref().unwrap_or("-"),
            sql,
            duration_us = duration.as_micros() as u64,
            "sql executed"
        ),
        Event::TransactionBegan { adapter, isolation } => tracing::debug!(
            adapter,
            isolation = isolation.as_deref().unwrap_or("default"),
            "transaction began"
        ),
        Event::TransactionCommitted { adapter, depth } => {
            tracing::debug!(adapter, depth, "transaction committed")
        }
        Event::TransactionRolledBack { adapter, depth } => {
            tracing::debug!(adapter, depth, "transaction rolled back")
        }
        Event::HealthChanged { adapter, healthy } => {
            tracing::info!(adapter, healthy, "adapter health changed")
        }
        Event::ReplicaSelected {
            database,
            shard,
            adapter,
        } => tracing::trace!(
            database,
            shard = shard.as_deref().unwrap_or("-"),
            adapter,
            "replica selected"
        ),
        Event::ScatterGatherFanOut { shards } => {
            tracing::debug!(shards = ?shards, "scatter-gather fan-out")
        }
        Event::DistributedTxTransition { tx_id, from, to } => {
            tracing::info!(tx_id, from, to, "distributed transaction transition")
        }
    }
}
