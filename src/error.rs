//! Error kinds surfaced across the connection, routing, and transaction core.
//!
//! Every variant here corresponds to one of the error kinds in the runtime
//! design: routing and assembly failures are always surfaced to the caller,
//! while a handful (`ConnectionError` during pool open, `StaleObjectError`
//! under `with_optimistic_retry`) are recovered locally by their caller and
//! only escape once a retry budget is exhausted.

use std::collections::HashMap;

use thiserror::Error;

use crate::distributed_tx::CommitOutcome;

#[derive(Debug, Error, Clone)]
pub enum OrmError {
    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("pool checkout timed out after {waited_ms}ms")]
    PoolTimeout { waited_ms: u64 },

    #[error("no adapter registered for database={database:?} role={role:?} shard={shard:?}")]
    NoAdapter {
        database: String,
        role: String,
        shard: Option<String>,
    },

    #[error("no healthy replica for database={database:?} shard={shard:?}")]
    NoHealthyReplica {
        database: String,
        shard: Option<String>,
    },

    #[error("lock mode {mode:?} unsupported on dialect {dialect}")]
    UnsupportedLockMode { mode: String, dialect: String },

    #[error("isolation level {isolation:?} unsupported on dialect {dialect}")]
    UnsupportedIsolation { isolation: String, dialect: String },

    #[error("integrity error: {0}")]
    IntegrityError(String),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("stale object: {model} pk={pk}")]
    StaleObjectError { model: String, pk: String },

    #[error("write attempted in a read-only scope")]
    ReadOnlyError,

    #[error("missing shard key for model {model}: required columns {columns:?}")]
    MissingShardKeyError { model: String, columns: Vec<String> },

    #[error("no shard registered for value {value} on model {model}")]
    NoShardForValue { model: String, value: String },

    #[error("shard key column {column} may not be mutated on a persisted row")]
    ShardKeyMutationError { column: String },

    #[error("write attempted against a different adapter inside an open transaction")]
    CrossAdapterWriteInTransaction,

    #[error("2PC phase 2 partial commit: {per_shard:?}")]
    PartialCommitError {
        per_shard: HashMap<String, CommitOutcome>,
    },

    #[error("saga failed: {original}, {} compensation failure(s)", compensation_failures.len())]
    SagaFailure {
        original: String,
        compensation_failures: Vec<(usize, String)>,
    },

    #[error("scatter-gather received an unordered result from shard {shard}")]
    UnorderedShardResult { shard: String },

    #[error("scatter-gather plan deadline exceeded")]
    DeadlineExceeded,

    #[error("a shard failed during scatter-gather: shard={shard} cause={cause}")]
    ShardFailure { shard: String, cause: String },

    #[error("Raw predicate terms are not supported under scatter-gather")]
    RawUnsupportedInScatterGather,

    #[error("scatter-gather may not be used for writes unless on_all_shards is explicit")]
    ScatterGatherWrite,

    #[error("pessimistic lock requested outside an open transaction")]
    LockOutsideTransaction,

    #[error("range resolver registration rejected: {0}")]
    ShardRangeConflict(String),

    #[error("range resolver has no range covering value {0}")]
    NoRangeForValue(String),

    #[error("callback chain aborted")]
    Abort,

    #[error("model {0} is not registered with the shard manager")]
    UnknownModel(String),

    /// Explicit rollback signal (spec.md §4.12): a control value, not a
    /// failure. `transaction`/`TransactionHandle::nested` intercept it,
    /// roll back the innermost frame, and return `Ok` to their caller
    /// instead of propagating it as an error.
    #[error("explicit rollback requested")]
    Rollback,
}

pub type OrmResult<T> = Result<T, OrmError>;
