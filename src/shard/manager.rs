//! Shard manager (spec.md §4.8): the per-model registry of
//! [`ShardResolver`]s the router and scatter-gather planner consult.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{OrmError, OrmResult};
use crate::shard::resolver::{ShardId, ShardResolver};
use crate::value::Value;

/// Registrations are rare (model setup), lookups are frequent but cheap —
/// a single `Mutex<HashMap<_, _>>` held only for the lookup is enough.
pub struct ShardManager {
    resolvers: Mutex<HashMap<String, Arc<dyn ShardResolver>>>,
}

impl ShardManager {
    pub fn new() -> Self {
        Self { resolvers: Mutex::new(HashMap::new()) }
    }

    pub fn register(&self, model: impl Into<String>, resolver: Arc<dyn ShardResolver>) {
        self.resolvers.lock().expect("shard resolver lock poisoned").insert(model.into(), resolver);
    }

    pub fn is_sharded(&self, model: &str) -> bool {
        self.resolvers.lock().expect("shard resolver lock poisoned").contains_key(model)
    }

    pub fn resolve(&self, model: &str, keys: &HashMap<String, Value>) -> OrmResult<ShardId> {
        let resolvers = self.resolvers.lock().expect("shard resolver lock poisoned");
        let resolver = resolvers
            .get(model)
            .ok_or_else(|| OrmError::UnknownModel(model.to_string()))?;
        resolver.resolve(keys)
    }

    /// Every shard `model` could ever resolve to; used by the router to
    /// build a scatter-gather fan-out plan.
    pub fn shards_for(&self, model: &str) -> OrmResult<Vec<ShardId>> {
        let resolvers = self.resolvers.lock().expect("shard resolver lock poisoned");
        let resolver = resolvers
            .get(model)
            .ok_or_else(|| OrmError::UnknownModel(model.to_string()))?;
        Ok(resolver.all_shards())
    }

    pub fn required_columns(&self, model: &str) -> OrmResult<Vec<String>> {
        let resolvers = self.resolvers.lock().expect("shard resolver lock poisoned");
        let resolver = resolvers
            .get(model)
            .ok_or_else(|| OrmError::UnknownModel(model.to_string()))?;
        Ok(resolver.required_columns().to_vec())
    }
}

impl Default for ShardManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::resolver::HashResolver;

    #[test]
    fn resolve_unknown_model_is_an_error() {
        let manager = ShardManager::new();
        let err = manager.resolve("User", &HashMap::new()).unwrap_err();
        assert!(matches!(err, OrmError::UnknownModel(m) if m == "User"));
    }

    #[test]
    fn register_then_resolve_round_trips() {
        let manager = ShardManager::new();
        manager.register("User", Arc::new(HashResolver::new("User", vec!["id".into()], "users", 4)));
        assert!(manager.is_sharded("User"));
        let mut keys = HashMap::new();
        keys.insert("id".to_string(), Value::Int(9));
        let shard = manager.resolve("User", &keys).unwrap();
        assert!(shard.starts_with("users_"));
        assert_eq!(manager.shards_for("User").unwrap().len(), 4);
    }
}
