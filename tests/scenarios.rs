//! End-to-end scenarios wiring the registry, router, scatter-gather
//! executor, transaction/lock manager, and 2PC coordinator together. Unit
//! tests inside each module cover the pieces in isolation; these cover the
//! seams between them.
//!
//! The lag-window scenario (`replica_read_respects_lag_window`) uses
//! millisecond durations and a real `tokio::time::sleep` rather than an
//! injectable clock: `LagTracker` is `Instant`-based and already has direct
//! unit coverage of its threshold/sticky logic in isolation, so a fake
//! clock would buy determinism this crate doesn't otherwise need.

#![cfg(feature = "testing")]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use orm_runtime_core::adapter::driver::{Connection, Driver, ExecResult, Row};
use orm_runtime_core::adapter::{Adapter, Dialect};
use orm_runtime_core::config::{HealthConfig, PoolConfig};
use orm_runtime_core::distributed_tx::distributed_transaction;
use orm_runtime_core::locking::{check_optimistic_update, with_optimistic_retry};
use orm_runtime_core::pool::Pool;
use orm_runtime_core::query::{OrderDirection, QueryState};
use orm_runtime_core::registry::{ConnectionSpec, Registry, Role};
use orm_runtime_core::scatter_gather::ScatterGatherExecutor;
use orm_runtime_core::testing::MockDriver;
use orm_runtime_core::transaction::transaction;
use orm_runtime_core::value::Value;
use orm_runtime_core::{context, OrmError};

fn spec(database: &str, role: Role, shard: Option<&str>) -> ConnectionSpec {
    ConnectionSpec {
        database: database.to_string(),
        dialect: Dialect::Postgres,
        url: format!("mock://{database}"),
        role,
        shard: shard.map(|s| s.to_string()),
        pool: PoolConfig::default(),
        health: HealthConfig::default(),
    }
}

// S1: a read issued within the replica-lag window is served by the
// writer, and the same read past the window is served by the replica.
#[tokio::test]
async fn replica_read_respects_lag_window() {
    let registry = Registry::new(Arc::new(MockDriver::new()));
    registry.establish_connection(spec("app", Role::Primary, Some("s1"))).unwrap();
    registry.establish_connection(spec("app", Role::Reading, Some("s1"))).unwrap();

    let threshold = Duration::from_millis(30);

    registry.lag.record_write("app", Some("s1"));
    let immediate = registry.adapter_for_read("app", Some("s1"), threshold).unwrap();
    assert!(immediate.key.contains("primary"), "expected primary within the lag window, got {}", immediate.key);

    tokio::time::sleep(Duration::from_millis(40)).await;
    let later = registry.adapter_for_read("app", Some("s1"), threshold).unwrap();
    assert!(later.key.contains("reading"), "expected replica past the lag window, got {}", later.key);
}

// S2: scatter-gather over two shards, each already sorted descending by
// `id`, merges into one globally-descending sequence. A `Registry` opens
// every pool in it from the same `Driver` instance, so the canned rows
// are keyed by the connection URL rather than by a distinct driver per
// shard.
struct CannedRowsDriver {
    by_url: HashMap<String, Vec<Row>>,
}

impl Driver for CannedRowsDriver {
    fn open(&self, url: &str) -> orm_runtime_core::OrmResult<Box<dyn Connection>> {
        let rows = self.by_url.get(url).cloned().unwrap_or_default();
        Ok(Box::new(CannedRowsConnection { rows }))
    }
}

struct CannedRowsConnection {
    rows: Vec<Row>,
}

impl Connection for CannedRowsConnection {
    fn execute(&mut self, sql: &str, _params: &[Value]) -> orm_runtime_core::OrmResult<ExecResult> {
        if sql.trim_start().to_ascii_uppercase().starts_with("SELECT") {
            Ok(ExecResult::Rows(self.rows.clone()))
        } else {
            Ok(ExecResult::RowsAffected(1))
        }
    }
    fn begin(&mut self) -> orm_runtime_core::OrmResult<()> {
        Ok(())
    }
    fn commit(&mut self) -> orm_runtime_core::OrmResult<()> {
        Ok(())
    }
    fn rollback(&mut self) -> orm_runtime_core::OrmResult<()> {
        Ok(())
    }
    fn prepare(&mut self, _sql: &str) -> orm_runtime_core::OrmResult<()> {
        Ok(())
    }
    fn ping(&mut self) -> orm_runtime_core::OrmResult<()> {
        Ok(())
    }
}

fn row(id: i64) -> Row {
    Row(vec![("id".to_string(), Value::Int(id))])
}

#[tokio::test]
async fn scatter_gather_merges_two_sorted_shards_into_one_order() {
    let mut by_url = HashMap::new();
    by_url.insert("canned://s0".to_string(), vec![row(100), row(98), row(96), row(94), row(92)]);
    by_url.insert("canned://s1".to_string(), vec![row(99), row(97), row(95), row(93), row(91)]);
    let registry = Registry::new(Arc::new(CannedRowsDriver { by_url }));

    for shard in ["s0", "s1"] {
        let mut s = spec("orders", Role::Reading, Some(shard));
        s.url = format!("canned://{shard}");
        registry.establish_connection(s).unwrap();
    }

    let query = QueryState::new("Order").order_by("id", OrderDirection::Desc);
    let shards = vec!["s0".to_string(), "s1".to_string()];
    let executor = ScatterGatherExecutor::new(&registry);
    let outcome = executor.execute("orders", &shards, "orders", &query, false, None).await.unwrap();

    let ids: Vec<i64> = outcome.rows.iter().map(|r| r.get("id").unwrap().as_i64().unwrap()).collect();
    assert_eq!(ids, (91..=100).rev().collect::<Vec<_>>());
    assert!(outcome.errors.is_empty());
}

// S3: a 2PC distributed transaction where every participant commits.
fn mock_adapter(key: &str) -> Arc<Adapter> {
    let pool = Pool::new(Arc::new(MockDriver::new()), format!("mock://{key}"), PoolConfig::default()).unwrap();
    Adapter::new(key, Dialect::Postgres, pool)
}

#[tokio::test]
async fn two_phase_commit_happy_path_commits_every_shard() {
    let s0 = mock_adapter("orders/primary/s0");
    let s1 = mock_adapter("orders/primary/s1");

    let result = distributed_transaction(|tx| async move {
        tx.on_shard("s0", &s0, |h| async move { h.execute("UPDATE orders SET amount = amount - 10 WHERE id = 1", &[], true).map(|_| ()) })
            .await?;
        tx.on_shard("s1", &s1, |h| async move { h.execute("UPDATE orders SET amount = amount + 10 WHERE id = 2", &[], true).map(|_| ()) })
            .await?;
        Ok(())
    })
    .await;

    assert!(result.is_ok());
}

// S4: 2PC where one participant's commit fails. The already-committed
// peer is reported as `Committed` (it cannot be undone); the failed one
// is rolled back and reported `RolledBack`.
struct FailingCommitDriver;

impl Driver for FailingCommitDriver {
    fn open(&self, _url: &str) -> orm_runtime_core::OrmResult<Box<dyn Connection>> {
        Ok(Box::new(FailingCommitConnection))
    }
}

struct FailingCommitConnection;

impl Connection for FailingCommitConnection {
    fn execute(&mut self, _sql: &str, _params: &[Value]) -> orm_runtime_core::OrmResult<ExecResult> {
        Ok(ExecResult::RowsAffected(1))
    }
    fn begin(&mut self) -> orm_runtime_core::OrmResult<()> {
        Ok(())
    }
    fn commit(&mut self) -> orm_runtime_core::OrmResult<()> {
        Err(OrmError::ConnectionError("connection reset while committing".to_string()))
    }
    fn rollback(&mut self) -> orm_runtime_core::OrmResult<()> {
        Ok(())
    }
    fn prepare(&mut self, _sql: &str) -> orm_runtime_core::OrmResult<()> {
        Ok(())
    }
    fn ping(&mut self) -> orm_runtime_core::OrmResult<()> {
        Ok(())
    }
}

#[tokio::test]
async fn two_phase_commit_reports_partial_commit_on_participant_failure() {
    let s0 = mock_adapter("orders/primary/s0");
    let pool = Pool::new(Arc::new(FailingCommitDriver), "flaky://s1", PoolConfig::default()).unwrap();
    let s1 = Adapter::new("orders/primary/s1", Dialect::Postgres, pool);

    let result = distributed_transaction(|tx| async move {
        tx.on_shard("s0", &s0, |_h| async { Ok(()) }).await?;
        tx.on_shard("s1", &s1, |_h| async { Ok(()) }).await?;
        Ok(())
    })
    .await;

    let Err(OrmError::PartialCommitError { per_shard }) = result else {
        panic!("expected PartialCommitError, got {result:?}");
    };
    assert_eq!(per_shard.get("s0"), Some(&orm_runtime_core::distributed_tx::CommitOutcome::Committed));
    assert_eq!(per_shard.get("s1"), Some(&orm_runtime_core::distributed_tx::CommitOutcome::RolledBack));
}

// S5: an optimistic write that loses a race on its first attempt (a
// concurrent writer bumps `lock_version` first) converges on retry.
struct StockRow {
    stock: i64,
    lock_version: i64,
}

#[tokio::test]
async fn optimistic_retry_converges_after_a_concurrent_write() {
    let row = Arc::new(Mutex::new(StockRow { stock: 10, lock_version: 6 }));
    let attempts = Arc::new(std::sync::atomic::AtomicU32::new(0));

    let result: orm_runtime_core::OrmResult<(i64, i64)> = with_optimistic_retry(3, || {
        let row = Arc::clone(&row);
        let attempts = Arc::clone(&attempts);
        async move {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            let seen_version = row.lock().unwrap().lock_version;

            if attempt == 0 {
                // A concurrent transaction commits between our read and our
                // write, bumping the version our UPDATE's WHERE clause binds.
                row.lock().unwrap().lock_version += 1;
            }

            let mut guard = row.lock().unwrap();
            if guard.lock_version != seen_version {
                drop(guard);
                check_optimistic_update("StockItem", &Value::Int(1), 0)?;
                unreachable!("check_optimistic_update always errors on 0 rows");
            }
            guard.stock -= 3;
            guard.lock_version += 1;
            check_optimistic_update("StockItem", &Value::Int(1), 1)?;
            Ok((guard.stock, guard.lock_version))
        }
    })
    .await;

    let (stock, lock_version) = result.unwrap();
    assert_eq!(stock, 7);
    assert_eq!(lock_version, 8);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

// S6: a `prevent_writes` scope rejects a write issued through it (inside
// or outside an explicit transaction) while still allowing reads. The
// scope has to stay pushed across the `.await`s below, so it is entered
// with `context::enter` (a `ScopeGuard` held in scope) rather than the
// synchronous-closure `while_preventing_writes` form.
#[tokio::test]
async fn prevent_writes_scope_rejects_create_but_allows_reads() {
    let adapter = mock_adapter("orders/primary/-");

    let scope = context::enter(context::ContextOptions {
        prevent_writes: Some(true),
        ..Default::default()
    });
    let write_result = adapter.execute("INSERT INTO orders (id) VALUES (1)", &[], true).await;
    let read_result = adapter.execute("SELECT 1", &[], false).await;
    drop(scope);

    assert!(matches!(write_result, Err(OrmError::ReadOnlyError)));
    assert!(read_result.is_ok());

    // Inside an explicit (not otherwise read-only) transaction, the
    // ambient `prevent_writes` scope still wins over a write attempt.
    let flag = AtomicBool::new(false);
    let flag_ref = &flag;
    let scope = context::enter(context::ContextOptions {
        prevent_writes: Some(true),
        ..Default::default()
    });
    let tx_result: orm_runtime_core::OrmResult<()> = transaction(&adapter, None, false, |tx| async move {
        flag_ref.store(true, Ordering::SeqCst);
        tx.execute("UPDATE orders SET amount = 1 WHERE id = 1", &[], true).map(|_| ())
    })
    .await;
    drop(scope);

    assert!(flag.load(Ordering::SeqCst));
    assert!(matches!(tx_result, Err(OrmError::ReadOnlyError)));
}
