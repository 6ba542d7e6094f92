//! Pessimistic and optimistic locking (spec.md §4.13).

use crate::adapter::LockMode;
use crate::context;
use crate::error::{OrmError, OrmResult};
use crate::transaction::TransactionHandle;
use crate::value::Value;

/// Asserts a pessimistic lock may be taken: only legal inside an open
/// transaction frame. The caller then assembles the query with
/// `QueryState::lock(mode)` and executes it through the transaction.
pub fn require_transaction_for_lock(_mode: LockMode) -> OrmResult<()> {
    if context::current().open_tx_adapter.is_none() {
        return Err(OrmError::LockOutsideTransaction);
    }
    Ok(())
}

/// `with_lock(id) { … }`: opens a transaction, selects-for-update via
/// `select_for_update`, yields to `f`, releases on commit/rollback. The
/// caller supplies `select_for_update` because building the `SELECT …
/// FOR UPDATE` statement needs the model's table name and dialect, which
/// this module does not own.
pub async fn with_lock<Sel, F, Fut, R>(
    adapter: &std::sync::Arc<crate::adapter::Adapter>,
    select_for_update: Sel,
    f: F,
) -> OrmResult<R>
where
    Sel: FnOnce(&mut TransactionHandle) -> OrmResult<()>,
    F: FnOnce(&mut TransactionHandle) -> Fut,
    Fut: std::future::Future<Output = OrmResult<R>>,
    R: Default,
{
    crate::transaction::transaction(adapter, None, false, |tx| async move {
        select_for_update(tx)?;
        f(tx).await
    })
    .await
}

/// Optimistic CAS: returns `Ok(())` if exactly one row matched
/// `WHERE pk = ? AND lock_version = ?`, otherwise `StaleObjectError`.
/// `rows_affected` is what the caller's `UPDATE` reported.
pub fn check_optimistic_update(model: &str, pk: &Value, rows_affected: u64) -> OrmResult<()> {
    if rows_affected == 0 {
        Err(OrmError::StaleObjectError {
            model: model.to_string(),
            pk: pk.to_string(),
        })
    } else {
        Ok(())
    }
}

/// `with_optimistic_retry(n) { … }`: re-runs `attempt` up to `n` times,
/// treating `StaleObjectError` as retryable and anything else as fatal.
/// On exhaustion the last `StaleObjectError` propagates.
pub async fn with_optimistic_retry<F, Fut, R>(n: usize, mut attempt: F) -> OrmResult<R>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = OrmResult<R>>,
{
    let mut last_err = None;
    for _ in 0..=n {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(OrmError::StaleObjectError { model, pk }) => {
                last_err = Some(OrmError::StaleObjectError { model, pk });
            }
            Err(other) => return Err(other),
        }
    }
    Err(last_err.expect("loop runs at least once"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_outside_transaction_is_rejected() {
        assert!(matches!(require_transaction_for_lock(LockMode::Update), Err(OrmError::LockOutsideTransaction)));
    }

    #[test]
    fn lock_inside_transaction_context_is_allowed() {
        context::connected_to(
            context::ContextOptions {
                open_tx_adapter: Some("orders/primary/-".into()),
                ..Default::default()
            },
            || {
                assert!(require_transaction_for_lock(LockMode::Update).is_ok());
            },
        );
    }

    #[test]
    fn optimistic_zero_rows_is_stale() {
        let err = check_optimistic_update("User", &Value::Int(1), 0).unwrap_err();
        assert!(matches!(err, OrmError::StaleObjectError { .. }));
    }

    #[tokio::test]
    async fn retry_exhausts_into_last_stale_error() {
        let result: OrmResult<()> = with_optimistic_retry(2, || async {
            Err(OrmError::StaleObjectError {
                model: "User".into(),
                pk: "1".into(),
            })
        })
        .await;
        assert!(matches!(result, Err(OrmError::StaleObjectError { .. })));
    }

    #[tokio::test]
    async fn retry_succeeds_on_a_later_attempt() {
        let mut calls = 0;
        let result = with_optimistic_retry(3, || {
            calls += 1;
            let succeed = calls == 2;
            async move {
                if succeed {
                    Ok(())
                } else {
                    Err(OrmError::StaleObjectError { model: "User".into(), pk: "1".into() })
                }
            }
        })
        .await;
        assert!(result.is_ok());
    }
}
