//! Connection context (spec.md §4.7): a stack of
//! `{database, role, shard, prevent_writes}` frames. Scopes are LIFO and
//! released on every exit path, including unwinding, because the pop
//! happens in a guard's `Drop`.
//!
//! The stack is `thread_local!`, which only gives correct LIFO semantics
//! across an `.await` under a current-thread Tokio runtime: a task polled
//! by a current-thread runtime never leaves the one OS thread it started
//! on, so the frames pushed before an await are still on that thread's
//! stack when the task resumes. Under a multi-threaded (work-stealing)
//! runtime, a suspended task can resume on a different worker thread —
//! `.await` itself is the concurrency boundary a held [`ScopeGuard`] must
//! not cross, not just `tokio::task::spawn` — so [`enter`] asserts the
//! current runtime (if any) is current-thread. The synchronous forms
//! ([`connected_to`], [`while_preventing_writes`], [`within_transaction`])
//! bracket a plain closure with no suspension point and are unaffected.

use std::cell::RefCell;

use crate::registry::Role;

#[derive(Debug, Clone, Default)]
pub struct ContextFrame {
    pub database: Option<String>,
    pub role: Option<Role>,
    pub shard: Option<String>,
    pub prevent_writes: bool,
    pub sticky_role: Option<Role>,
    /// Key of the adapter with an open transaction frame on this task, if
    /// any. Consulted by `Adapter::execute` to raise
    /// `CrossAdapterWriteInTransaction` (spec.md §4.12).
    pub open_tx_adapter: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ContextOptions {
    pub database: Option<String>,
    pub role: Option<Role>,
    pub shard: Option<String>,
    pub prevent_writes: Option<bool>,
    pub open_tx_adapter: Option<String>,
}

thread_local! {
    static STACK: RefCell<Vec<ContextFrame>> = const { RefCell::new(Vec::new()) };
}

/// Merges the stack with innermost precedence: an unset field in the
/// innermost frame inherits the nearest enclosing frame's value.
pub fn current() -> ContextFrame {
    STACK.with(|stack| {
        let stack = stack.borrow();
        let mut merged = ContextFrame::default();
        for frame in stack.iter() {
            if frame.database.is_some() {
                merged.database = frame.database.clone();
            }
            if frame.role.is_some() {
                merged.role = frame.role;
            }
            if frame.shard.is_some() {
                merged.shard = frame.shard.clone();
            }
            if frame.prevent_writes {
                merged.prevent_writes = true;
            }
            if frame.sticky_role.is_some() {
                merged.sticky_role = frame.sticky_role;
            }
            if frame.open_tx_adapter.is_some() {
                merged.open_tx_adapter = frame.open_tx_adapter.clone();
            }
        }
        merged
    })
}

/// Opaque scope handle; pops its frame on drop, including across an
/// `.await` the caller holds it over (use [`enter`] for that case —
/// `connected_to`'s closure form can't bracket an async body).
pub struct ScopeGuard(());

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        STACK.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

fn frame_from(opts: ContextOptions) -> ContextFrame {
    ContextFrame {
        database: opts.database,
        role: opts.role,
        shard: opts.shard,
        prevent_writes: opts.prevent_writes.unwrap_or(false),
        sticky_role: None,
        open_tx_adapter: opts.open_tx_adapter,
    }
}

fn push(frame: ContextFrame) -> ScopeGuard {
    STACK.with(|stack| stack.borrow_mut().push(frame));
    ScopeGuard(())
}

/// Pushes a frame for the duration of `f`, guaranteeing the pop happens
/// even if `f` panics.
pub fn connected_to<F, R>(opts: ContextOptions, f: F) -> R
where
    F: FnOnce() -> R,
{
    let _guard = push(frame_from(opts));
    f()
}

/// Pushes a frame and returns a guard the caller holds for the scope's
/// duration — the form to use around an `.await`, since the frame must
/// stay pushed while the future is polled, not just while it is built.
///
/// Panics if called from a multi-threaded Tokio runtime (see the module
/// doc): this crate's callers that hold a guard across an `.await` (e.g.
/// `transaction`) require a current-thread runtime.
pub fn enter(opts: ContextOptions) -> ScopeGuard {
    assert_current_thread_runtime();
    push(frame_from(opts))
}

fn assert_current_thread_runtime() {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        assert!(
            handle.runtime_flavor() == tokio::runtime::RuntimeFlavor::CurrentThread,
            "context::enter requires a current-thread Tokio runtime: a multi-threaded \
             runtime can resume a suspended task on a different OS worker thread, \
             stranding the thread_local frame this guard pushed"
        );
    }
}

/// Marks `adapter_key` as having an open transaction frame for the
/// duration of `f`; nested I/O against a different adapter can then be
/// rejected as `CrossAdapterWriteInTransaction`.
pub fn within_transaction<F, R>(adapter_key: impl Into<String>, f: F) -> R
where
    F: FnOnce() -> R,
{
    connected_to(
        ContextOptions {
            open_tx_adapter: Some(adapter_key.into()),
            ..Default::default()
        },
        f,
    )
}

/// Same as [`within_transaction`] but returns a guard to hold across an
/// `.await` instead of taking a synchronous closure.
pub fn enter_transaction(adapter_key: impl Into<String>) -> ScopeGuard {
    enter(ContextOptions {
        open_tx_adapter: Some(adapter_key.into()),
        ..Default::default()
    })
}

pub fn while_preventing_writes<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    connected_to(
        ContextOptions {
            prevent_writes: Some(true),
            ..Default::default()
        },
        f,
    )
}

/// Depth of the stack; used by tests asserting LIFO push/pop symmetry.
pub fn depth() -> usize {
    STACK.with(|stack| stack.borrow().len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic;

    #[test]
    fn nested_scopes_merge_with_innermost_precedence() {
        connected_to(
            ContextOptions {
                database: Some("orders".into()),
                role: Some(Role::Writing),
                ..Default::default()
            },
            || {
                assert_eq!(current().database.as_deref(), Some("orders"));
                connected_to(
                    ContextOptions {
                        shard: Some("s1".into()),
                        ..Default::default()
                    },
                    || {
                        let frame = current();
                        assert_eq!(frame.database.as_deref(), Some("orders"));
                        assert_eq!(frame.shard.as_deref(), Some("s1"));
                        assert_eq!(frame.role, Some(Role::Writing));
                    },
                );
            },
        );
        assert_eq!(depth(), 0);
    }

    #[test]
    fn stack_unwinds_on_panic() {
        let before = depth();
        let result = panic::catch_unwind(|| {
            connected_to(ContextOptions::default(), || {
                panic!("boom");
            });
        });
        assert!(result.is_err());
        assert_eq!(depth(), before);
    }

    #[test]
    fn while_preventing_writes_sets_flag() {
        while_preventing_writes(|| {
            assert!(current().prevent_writes);
        });
        assert!(!current().prevent_writes);
    }
}
