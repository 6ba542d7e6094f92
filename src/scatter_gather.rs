//! Scatter-Gather Executor (spec.md §4.11): fans a read-only plan out to
//! every targeted shard concurrently, then merges.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::adapter::Adapter;
use crate::adapter::driver::Row;
use crate::error::{OrmError, OrmResult};
use crate::events::{self, Event};
use crate::query::assembler;
use crate::query::state::{Aggregate, OrderDirection, OrderTerm, QueryState};
use crate::registry::{Registry, Role};
use crate::shard::resolver::ShardId;
use crate::value::Value;

pub struct ScatterGatherOutcome {
    pub rows: Vec<Row>,
    /// Populated only when `allow_partial` let some shards fail.
    pub errors: Vec<OrmError>,
}

pub struct ScatterGatherExecutor<'a> {
    registry: &'a Registry,
}

impl<'a> ScatterGatherExecutor<'a> {
    pub fn new(registry: &'a Registry) -> Self {
        Self { registry }
    }

    /// Executes `query` against `table` on every shard in `shards`,
    /// merging the results per spec.md §4.11.
    ///
    /// `deadline`, when set, bounds the whole fan-out (spec.md:280): if the
    /// shards haven't all answered by then, still-running shard tasks are
    /// detached (dropping their `JoinHandle`s, which lets them keep running
    /// to completion in the background without this call waiting on or
    /// using the result) and `DeadlineExceeded` is returned.
    pub async fn execute(
        &self,
        database: &str,
        shards: &[ShardId],
        table: &str,
        query: &QueryState,
        allow_partial: bool,
        deadline: Option<Duration>,
    ) -> OrmResult<ScatterGatherOutcome> {
        events::emit(Event::ScatterGatherFanOut {
            shards: shards.to_vec(),
        });

        let mut tasks = Vec::with_capacity(shards.len());
        for shard in shards {
            let adapter = self.registry.adapter_for(database, Role::Reading, Some(shard))?;
            let shard = shard.clone();
            let table = table.to_string();
            let query = query.clone();
            tasks.push(tokio::spawn(async move { fetch_one_shard(adapter, &shard, &table, &query).await }));
        }

        let collect = async {
            let mut per_shard: Vec<(ShardId, Vec<Row>)> = Vec::with_capacity(tasks.len());
            let mut errors = Vec::new();
            for task in tasks.iter_mut() {
                match task.await {
                    Ok(Ok((shard, rows))) => per_shard.push((shard, rows)),
                    Ok(Err(err)) => errors.push(err),
                    Err(join_err) => errors.push(OrmError::ShardFailure {
                        shard: "unknown".to_string(),
                        cause: join_err.to_string(),
                    }),
                }
            }
            (per_shard, errors)
        };

        let (per_shard, mut errors) = match deadline {
            Some(deadline) => match tokio::time::timeout(deadline, collect).await {
                Ok(result) => result,
                Err(_) => {
                    for task in &tasks {
                        task.abort();
                    }
                    return Err(OrmError::DeadlineExceeded);
                }
            },
            None => collect.await,
        };

        if !errors.is_empty() && !allow_partial {
            return Err(errors.into_iter().next().expect("non-empty"));
        }

        let rows = if let Some(agg) = &query.aggregate {
            merge_aggregate(agg, &query.group_by, per_shard)?
        } else {
            let merged = if !query.order.is_empty() {
                merge_ordered(per_shard, &query.order)?
            } else {
                per_shard.into_iter().flat_map(|(_, rows)| rows).collect()
            };
            apply_limit_offset(merged, query.offset, query.limit)
        };

        Ok(ScatterGatherOutcome { rows, errors })
    }
}

async fn fetch_one_shard(adapter: Arc<Adapter>, shard: &str, table: &str, query: &QueryState) -> OrmResult<(ShardId, Vec<Row>)> {
    let assembled = assembler::assemble_select(query, table, adapter.dialect)?;
    let result = adapter
        .execute(&assembled.sql, &assembled.params, false)
        .await
        .map_err(|cause| OrmError::ShardFailure {
            shard: shard.to_string(),
            cause: cause.to_string(),
        })?;
    Ok((shard.to_string(), result.into_rows()))
}

fn row_cmp(a: &Row, b: &Row, order: &[OrderTerm]) -> Ordering {
    for term in order {
        let av = a.get(&term.column);
        let bv = b.get(&term.column);
        let cmp = match (av, bv) {
            (Some(av), Some(bv)) => av.partial_cmp(bv).unwrap_or(Ordering::Equal),
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
        };
        let cmp = if term.direction == OrderDirection::Desc { cmp.reverse() } else { cmp };
        if cmp != Ordering::Equal {
            return cmp;
        }
    }
    Ordering::Equal
}

fn is_sorted(rows: &[Row], order: &[OrderTerm]) -> bool {
    rows.windows(2).all(|pair| row_cmp(&pair[0], &pair[1], order) != Ordering::Greater)
}

/// k-way merge of per-shard row lists that are each already ordered by
/// `order`. A shard whose rows are not sorted raises `UnorderedShardResult`
/// rather than silently producing a wrong merge.
fn merge_ordered(per_shard: Vec<(ShardId, Vec<Row>)>, order: &[OrderTerm]) -> OrmResult<Vec<Row>> {
    for (shard, rows) in &per_shard {
        if !is_sorted(rows, order) {
            return Err(OrmError::UnorderedShardResult { shard: shard.clone() });
        }
    }

    let mut queues: Vec<std::collections::VecDeque<Row>> = per_shard.into_iter().map(|(_, rows)| rows.into()).collect();
    let total: usize = queues.iter().map(|q| q.len()).sum();
    let mut merged = Vec::with_capacity(total);

    loop {
        let mut best: Option<usize> = None;
        for (idx, queue) in queues.iter().enumerate() {
            let Some(front) = queue.front() else { continue };
            match best {
                None => best = Some(idx),
                Some(b) => {
                    if row_cmp(front, queues[b].front().expect("non-empty"), order) == Ordering::Less {
                        best = Some(idx);
                    }
                }
            }
        }
        match best {
            None => break,
            Some(idx) => merged.push(queues[idx].pop_front().expect("non-empty")),
        }
    }

    Ok(merged)
}

fn apply_limit_offset(rows: Vec<Row>, offset: Option<u64>, limit: Option<u64>) -> Vec<Row> {
    let offset = offset.unwrap_or(0) as usize;
    let mut rows = if offset >= rows.len() { Vec::new() } else { rows[offset..].to_vec() };
    if let Some(limit) = limit {
        rows.truncate(limit as usize);
    }
    rows
}

fn scalar(row: &Row) -> Option<&Value> {
    row.0.first().map(|(_, v)| v)
}

fn value_as_f64(value: &Value) -> f64 {
    match value {
        Value::Int(i) => *i as f64,
        Value::Float(f) => *f,
        _ => 0.0,
    }
}

fn group_key(row: &Row, group_by: &[String]) -> Vec<Value> {
    group_by.iter().map(|c| row.get(c).cloned().unwrap_or(Value::Null)).collect()
}

/// Combines per-shard aggregate rows per spec.md §4.11: `count` sums,
/// `sum`/`avg` combine `Σsum_i` over `Σcount_i`, `min`/`max` reduce,
/// `group_by` merges groups by key before re-reducing.
fn merge_aggregate(agg: &Aggregate, group_by: &[String], per_shard: Vec<(ShardId, Vec<Row>)>) -> OrmResult<Vec<Row>> {
    let all_rows: Vec<Row> = per_shard.into_iter().flat_map(|(_, rows)| rows).collect();

    if group_by.is_empty() {
        return Ok(vec![reduce_group(agg, &all_rows)]);
    }

    let mut groups: HashMap<Vec<Value>, Vec<Row>> = HashMap::new();
    for row in all_rows {
        groups.entry(group_key(&row, group_by)).or_default().push(row);
    }

    let mut output = Vec::with_capacity(groups.len());
    for (key, rows) in groups {
        let mut reduced = reduce_group(agg, &rows);
        for (col, value) in group_by.iter().zip(key) {
            reduced.0.insert(0, (col.clone(), value));
        }
        output.push(reduced);
    }
    Ok(output)
}

fn reduce_group(agg: &Aggregate, rows: &[Row]) -> Row {
    match agg {
        Aggregate::Count => {
            let total: i64 = rows.iter().filter_map(scalar).filter_map(Value::as_i64).sum();
            Row(vec![("count".to_string(), Value::Int(total))])
        }
        Aggregate::Sum(_) => {
            let total: f64 = rows.iter().filter_map(scalar).map(value_as_f64).sum();
            Row(vec![("sum".to_string(), Value::Float(total))])
        }
        Aggregate::Avg(_) => {
            let sum: f64 = rows.iter().filter_map(|r| r.get("sum_value")).map(value_as_f64).sum();
            let count: f64 = rows.iter().filter_map(|r| r.get("count_value")).map(value_as_f64).sum();
            let avg = if count > 0.0 { sum / count } else { 0.0 };
            Row(vec![("avg".to_string(), Value::Float(avg))])
        }
        Aggregate::Min(_) => {
            let min = rows
                .iter()
                .filter_map(scalar)
                .cloned()
                .reduce(|a, b| if b.partial_cmp(&a) == Some(Ordering::Less) { b } else { a })
                .unwrap_or(Value::Null);
            Row(vec![("min".to_string(), min)])
        }
        Aggregate::Max(_) => {
            let max = rows
                .iter()
                .filter_map(scalar)
                .cloned()
                .reduce(|a, b| if b.partial_cmp(&a) == Some(Ordering::Greater) { b } else { a })
                .unwrap_or(Value::Null);
            Row(vec![("max".to_string(), max)])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::Dialect;
    use crate::config::{HealthConfig, PoolConfig};
    use crate::query::state::OrderDirection;
    use crate::registry::ConnectionSpec;
    use crate::testing::MockDriver;

    fn row(id: i64) -> Row {
        Row(vec![("id".to_string(), Value::Int(id))])
    }

    #[tokio::test]
    async fn fan_out_past_deadline_returns_deadline_exceeded() {
        let registry = Registry::new(Arc::new(MockDriver::new()));
        registry
            .establish_connection(ConnectionSpec {
                database: "orders".into(),
                dialect: Dialect::Postgres,
                url: "mock://orders".into(),
                role: Role::Reading,
                shard: Some("s0".into()),
                pool: PoolConfig {
                    max_size: 1,
                    ..PoolConfig::default()
                },
                health: HealthConfig::default(),
            })
            .unwrap();

        let adapter = registry.adapter_for("orders", Role::Reading, Some("s0")).unwrap();
        // Holds the pool's only permit for the test's duration, so the
        // shard fetch this deadline races against genuinely hangs on
        // `pool.checkout().await` rather than racing a synchronous call.
        let _held = adapter.pool.checkout().await.unwrap();

        let executor = ScatterGatherExecutor::new(&registry);
        let query = QueryState::new("Order");
        let result = executor
            .execute("orders", &["s0".to_string()], "orders", &query, false, Some(Duration::from_millis(20)))
            .await;
        assert!(matches!(result, Err(OrmError::DeadlineExceeded)));
    }

    #[test]
    fn merge_ordered_interleaves_sorted_shards() {
        let order = vec![OrderTerm { column: "id".to_string(), direction: OrderDirection::Asc }];
        let per_shard = vec![
            ("s0".to_string(), vec![row(1), row(4), row(7)]),
            ("s1".to_string(), vec![row(2), row(3), row(8)]),
        ];
        let merged = merge_ordered(per_shard, &order).unwrap();
        let ids: Vec<i64> = merged.iter().map(|r| r.get("id").unwrap().as_i64().unwrap()).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 7, 8]);
    }

    #[test]
    fn merge_ordered_rejects_unsorted_shard() {
        let order = vec![OrderTerm { column: "id".to_string(), direction: OrderDirection::Asc }];
        let per_shard = vec![("s0".to_string(), vec![row(9), row(1)])];
        let err = merge_ordered(per_shard, &order).unwrap_err();
        assert!(matches!(err, OrmError::UnorderedShardResult { .. }));
    }

    #[test]
    fn count_sums_across_shards() {
        let per_shard = vec![
            ("s0".to_string(), vec![Row(vec![("count".to_string(), Value::Int(3))])]),
            ("s1".to_string(), vec![Row(vec![("count".to_string(), Value::Int(5))])]),
        ];
        let rows = merge_aggregate(&Aggregate::Count, &[], per_shard).unwrap();
        assert_eq!(rows[0].get("count").unwrap().as_i64(), Some(8));
    }

    #[test]
    fn limit_and_offset_apply_post_merge() {
        let rows = vec![row(1), row(2), row(3), row(4)];
        let limited = apply_limit_offset(rows, Some(1), Some(2));
        let ids: Vec<i64> = limited.iter().map(|r| r.get("id").unwrap().as_i64().unwrap()).collect();
        assert_eq!(ids, vec![2, 3]);
    }
}
