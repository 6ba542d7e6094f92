//! Shard Manager + Query Router (spec.md §4.9): converts a [`QueryState`]
//! into an execution [`Plan`].

use crate::error::{OrmError, OrmResult};
use crate::query::QueryState;
use crate::shard::manager::ShardManager;
use crate::shard::resolver::ShardId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    SingleShard(Option<ShardId>),
    TargetedMultiShard(Vec<ShardId>),
    ScatterGather(Vec<ShardId>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Read,
    Write,
}

pub struct Router<'a> {
    shards: &'a ShardManager,
}

impl<'a> Router<'a> {
    pub fn new(shards: &'a ShardManager) -> Self {
        Self { shards }
    }

    /// Builds a plan for `query` under `intent`, following spec.md §4.9's
    /// algorithm. A write that would scatter must opt in explicitly via
    /// [`Router::on_all_shards`] instead of calling this directly.
    pub fn route(&self, query: &QueryState, intent: Intent) -> OrmResult<Plan> {
        if !self.shards.is_sharded(&query.model) {
            return Ok(Plan::SingleShard(None));
        }

        if query.contains_raw() && self.would_scatter(query)? {
            return Err(OrmError::RawUnsupportedInScatterGather);
        }

        let plan = self.plan_for(query)?;

        if intent == Intent::Write {
            if let Plan::ScatterGather(_) = plan {
                return Err(OrmError::ScatterGatherWrite);
            }
        }

        Ok(plan)
    }

    /// Forces execution on a single named shard, bypassing predicate
    /// analysis entirely — the caller is asserting the binding.
    pub fn on_shard(&self, shard: impl Into<String>) -> Plan {
        Plan::SingleShard(Some(shard.into()))
    }

    pub fn on_shards(&self, shards: Vec<String>) -> Plan {
        let mut shards = shards;
        shards.sort();
        shards.dedup();
        Plan::TargetedMultiShard(shards)
    }

    /// Explicit opt-in for a write that must reach every shard (spec.md
    /// §4.9's only sanctioned path to a scattered write).
    pub fn on_all_shards(&self, model: &str) -> OrmResult<Plan> {
        Ok(Plan::ScatterGather(self.shards.shards_for(model)?))
    }

    fn would_scatter(&self, query: &QueryState) -> OrmResult<bool> {
        Ok(matches!(self.plan_for(query)?, Plan::ScatterGather(_)))
    }

    fn plan_for(&self, query: &QueryState) -> OrmResult<Plan> {
        let required = self.shards.required_columns(&query.model)?;
        let bindings = query.shard_bindings(&required);

        let all_equality_bound = required.iter().all(|c| bindings.equality.contains_key(c));
        if all_equality_bound {
            let shard = self.shards.resolve(&query.model, &bindings.equality)?;
            return Ok(Plan::SingleShard(Some(shard)));
        }

        let all_in_bound = required.iter().all(|c| bindings.equality.contains_key(c) || bindings.in_sets.contains_key(c));
        if all_in_bound && required.iter().any(|c| bindings.in_sets.contains_key(c)) {
            let shards = self.resolve_in_combinations(&query.model, &required, &bindings)?;
            return Ok(Plan::TargetedMultiShard(shards));
        }

        Ok(Plan::ScatterGather(self.shards.shards_for(&query.model)?))
    }

    /// Cartesian product over bound `IN` columns, resolving each
    /// combination to a shard and deduplicating the result.
    fn resolve_in_combinations(
        &self,
        model: &str,
        required: &[String],
        bindings: &crate::query::state::ShardBindings,
    ) -> OrmResult<Vec<ShardId>> {
        let mut combos: Vec<std::collections::HashMap<String, crate::value::Value>> = vec![std::collections::HashMap::new()];
        for column in required {
            let values: Vec<crate::value::Value> = if let Some(v) = bindings.equality.get(column) {
                vec![v.clone()]
            } else {
                bindings.in_sets.get(column).cloned().unwrap_or_default()
            };
            let mut next = Vec::with_capacity(combos.len() * values.len());
            for combo in &combos {
                for value in &values {
                    let mut extended = combo.clone();
                    extended.insert(column.clone(), value.clone());
                    next.push(extended);
                }
            }
            combos = next;
        }

        let mut shards: Vec<ShardId> = combos
            .iter()
            .map(|combo| self.shards.resolve(model, combo))
            .collect::<OrmResult<_>>()?;
        shards.sort();
        shards.dedup();
        Ok(shards)
    }
}
