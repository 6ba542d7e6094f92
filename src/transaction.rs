//! Transaction and Savepoint Manager (spec.md §4.12).
//!
//! A [`TransactionHandle`] owns one checked-out connection for its entire
//! life. Nesting is expressed by calling [`TransactionHandle::nested`] on
//! the *same* handle rather than re-deriving a new one from the adapter —
//! that is what lets a nested call push a `SAVEPOINT` on the connection
//! the outer scope already holds, instead of opening a second connection
//! and a second, unrelated `BEGIN`.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::adapter::driver::ExecResult;
use crate::adapter::{Adapter, Isolation};
use crate::context;
use crate::error::{OrmError, OrmResult};
use crate::events::{self, Event};
use crate::pool::PoolGuard;
use crate::value::Value;

static SAVEPOINT_COUNTER: AtomicU64 = AtomicU64::new(0);

enum Frame {
    Root { isolation: Option<Isolation> },
    Savepoint { name: String },
}

pub struct TransactionHandle {
    adapter: Arc<Adapter>,
    guard: PoolGuard,
    frames: Vec<Frame>,
    read_only: bool,
}

impl TransactionHandle {
    async fn open(adapter: Arc<Adapter>, isolation: Option<Isolation>, read_only: bool) -> OrmResult<Self> {
        let mut guard = adapter.pool.checkout().await?;
        let begin_sql = adapter.dialect.begin_sql(isolation)?;
        guard.connection().begin()?;
        guard.connection().execute(&begin_sql, &[])?;
        events::emit(Event::TransactionBegan {
            adapter: adapter.key.clone(),
            isolation: isolation.map(|i| format!("{i:?}")),
        });
        Ok(Self {
            adapter,
            guard,
            frames: vec![Frame::Root { isolation }],
            read_only,
        })
    }

    /// Opens a transaction to be driven by the distributed transaction
    /// coordinator: phase 1 runs the participant's block and then holds
    /// the transaction open rather than committing it immediately.
    pub async fn begin_for_coordinator(adapter: Arc<Adapter>) -> OrmResult<Self> {
        Self::open(adapter, None, false).await
    }

    pub async fn commit_for_coordinator(&mut self) -> OrmResult<()> {
        self.commit_root().await
    }

    pub async fn rollback_for_coordinator(&mut self) -> OrmResult<()> {
        self.rollback_root().await
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Runs a SQL statement on this transaction's connection, raising
    /// `ReadOnlyError` if `is_write` is set on a read-only scope, or under
    /// an enclosing [`context::while_preventing_writes`] scope.
    pub fn execute(&mut self, sql: &str, params: &[Value], is_write: bool) -> OrmResult<ExecResult> {
        if is_write && (self.read_only || context::current().prevent_writes) {
            return Err(OrmError::ReadOnlyError);
        }
        self.guard.connection().execute(sql, params)
    }

    /// Pushes a savepoint, runs `f`, then releases it on success or rolls
    /// back to it on failure — the nested-transaction contract of
    /// spec.md §4.12. `f` returning `Err(OrmError::Rollback)` is the
    /// explicit-rollback control value: it rolls back to this savepoint
    /// the same as any other error, but is then absorbed here rather than
    /// propagated, so the enclosing scope sees a normal `Ok`.
    pub async fn nested<F, Fut, R>(&mut self, f: F) -> OrmResult<R>
    where
        F: FnOnce(&mut TransactionHandle) -> Fut,
        Fut: Future<Output = OrmResult<R>>,
        R: Default,
    {
        let name = format!("sp_{}", SAVEPOINT_COUNTER.fetch_add(1, Ordering::Relaxed));
        self.guard.connection().execute(&format!("SAVEPOINT {name}"), &[])?;
        self.frames.push(Frame::Savepoint { name: name.clone() });

        match f(self).await {
            Ok(value) => {
                self.guard.connection().execute(&format!("RELEASE SAVEPOINT {name}"), &[])?;
                self.frames.pop();
                Ok(value)
            }
            Err(OrmError::Rollback) => {
                self.rollback_innermost()?;
                Ok(R::default())
            }
            Err(err) => {
                self.rollback_innermost()?;
                if matches!(err, OrmError::Abort) {
                    Err(OrmError::Abort)
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Rolls back exactly the innermost frame: `ROLLBACK TO SAVEPOINT` and
    /// a pop if it's a savepoint, a plain `ROLLBACK` if it's the root.
    /// Used by [`TransactionHandle::nested`] and [`transaction`] to act on
    /// an explicit `Err(OrmError::Rollback)` control value.
    pub fn rollback_innermost(&mut self) -> OrmResult<()> {
        match self.frames.last() {
            Some(Frame::Savepoint { name }) => {
                let name = name.clone();
                self.guard.connection().execute(&format!("ROLLBACK TO SAVEPOINT {name}"), &[])?;
                self.frames.pop();
            }
            Some(Frame::Root { .. }) => {
                self.guard.connection().rollback()?;
            }
            None => {}
        }
        Ok(())
    }

    async fn commit_root(&mut self) -> OrmResult<()> {
        self.guard.connection().commit()?;
        events::emit(Event::TransactionCommitted {
            adapter: self.adapter.key.clone(),
            depth: self.frames.len(),
        });
        Ok(())
    }

    async fn rollback_root(&mut self) -> OrmResult<()> {
        self.guard.connection().rollback()?;
        events::emit(Event::TransactionRolledBack {
            adapter: self.adapter.key.clone(),
            depth: self.frames.len(),
        });
        Ok(())
    }
}

/// Runs `f` inside a transaction on `adapter`: outermost call issues
/// `BEGIN`, commits on normal exit, rolls back on any failure. `f`
/// returning `Err(OrmError::Rollback)` rolls back the same as any other
/// error but is absorbed here instead of propagated, per spec.md §4.12's
/// explicit-rollback control value.
pub async fn transaction<F, Fut, R>(adapter: &Arc<Adapter>, isolation: Option<Isolation>, read_only: bool, f: F) -> OrmResult<R>
where
    F: FnOnce(&mut TransactionHandle) -> Fut,
    Fut: Future<Output = OrmResult<R>>,
    R: Default,
{
    let mut handle = TransactionHandle::open(Arc::clone(adapter), isolation, read_only).await?;
    let _scope = context::enter_transaction(adapter.key.clone());
    let result = f(&mut handle).await;
    drop(_scope);

    match result {
        Ok(value) => {
            handle.commit_root().await?;
            Ok(value)
        }
        Err(OrmError::Rollback) => {
            handle.rollback_root().await?;
            Ok(R::default())
        }
        Err(err) => {
            handle.rollback_root().await?;
            Err(err)
        }
    }
}
