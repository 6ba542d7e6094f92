//! Connection registry: the namespace of `(database, role, shard) →
//! PooledAdapter` (spec.md §4.3).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::adapter::driver::Driver;
use crate::adapter::{Adapter, Dialect};
use crate::config::{HealthConfig, PoolConfig};
use crate::context;
use crate::error::{OrmError, OrmResult};
use crate::events::{self, Event};
use crate::health::HealthMonitor;
use crate::pool::Pool;
use crate::replica::lag_tracker::LagTracker;
use crate::replica::load_balancer::LoadBalancer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Primary,
    Writing,
    Reading,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Role::Primary => "primary",
            Role::Writing => "writing",
            Role::Reading => "reading",
        };
        write!(f, "{s}")
    }
}

pub type DatabaseName = String;
pub type ShardName = String;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub database: DatabaseName,
    pub role: Role,
    pub shard: Option<ShardName>,
}

impl ConnectionKey {
    pub fn new(database: impl Into<String>, role: Role, shard: Option<String>) -> Self {
        Self {
            database: database.into(),
            role,
            shard,
        }
    }
}

impl std::fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.database,
            self.role,
            self.shard.as_deref().unwrap_or("-")
        )
    }
}

/// An immutable connection spec as handed to `establish`.
#[derive(Clone)]
pub struct ConnectionSpec {
    pub database: DatabaseName,
    pub dialect: Dialect,
    pub url: String,
    pub role: Role,
    pub shard: Option<ShardName>,
    pub pool: PoolConfig,
    pub health: HealthConfig,
}

pub struct PooledAdapter {
    pub adapter: Arc<Adapter>,
    pub health: HealthMonitor,
}

struct ReplicaGroup {
    members: Vec<Arc<PooledAdapter>>,
    lb: LoadBalancer,
}

/// Namespace of `(database, role, shard) → PooledAdapter`, plus replica
/// groups and the lag tracker they consult for read/write splitting.
///
/// The maps are each a plain `Mutex<HashMap<_, _>>`: `establish_connection`
/// and `clear_all` are rare, admin-path operations (spec.md §5), so there is
/// no call for a lock-free or sharded map on the common `adapter_for` path —
/// the lock is held only long enough to clone an `Arc`.
///
/// Tests must obtain a fresh `Registry` per case (spec.md §9); there is no
/// implicit global instance.
pub struct Registry {
    adapters: Mutex<HashMap<ConnectionKey, Arc<PooledAdapter>>>,
    specs: Mutex<HashMap<ConnectionKey, ConnectionSpec>>,
    replica_groups: Mutex<HashMap<(DatabaseName, Option<ShardName>), ReplicaGroup>>,
    driver: Arc<dyn Driver>,
    pub lag: LagTracker,
    closed: AtomicBool,
}

impl Registry {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self {
            adapters: Mutex::new(HashMap::new()),
            specs: Mutex::new(HashMap::new()),
            replica_groups: Mutex::new(HashMap::new()),
            driver,
            lag: LagTracker::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Upsert a connection spec and create its adapter on demand.
    pub fn establish_connection(&self, spec: ConnectionSpec) -> OrmResult<()> {
        let key = ConnectionKey::new(spec.database.clone(), spec.role, spec.shard.clone());
        let pool = Pool::new(Arc::clone(&self.driver), spec.url.clone(), spec.pool.clone())?;
        let adapter = Adapter::new(key.to_string(), spec.dialect, pool);
        let health = HealthMonitor::new(Arc::clone(&adapter), spec.health.clone());
        let pooled = Arc::new(PooledAdapter { adapter, health });

        self.adapters.lock().expect("registry lock poisoned").insert(key.clone(), Arc::clone(&pooled));
        self.specs.lock().expect("registry lock poisoned").insert(key.clone(), spec.clone());

        if spec.role == Role::Reading {
            let group_key = (spec.database.clone(), spec.shard.clone());
            let mut groups = self.replica_groups.lock().expect("registry lock poisoned");
            let group = groups.entry(group_key).or_insert_with(|| ReplicaGroup {
                members: Vec::new(),
                lb: LoadBalancer::new(crate::config::LbStrategy::RoundRobin),
            });
            group.members.push(pooled);
        }
        Ok(())
    }

    pub fn with_lb_strategy(&self, database: &str, shard: Option<&str>, strategy: crate::config::LbStrategy) {
        let key = (database.to_string(), shard.map(|s| s.to_string()));
        if let Some(group) = self.replica_groups.lock().expect("registry lock poisoned").get_mut(&key) {
            group.lb = LoadBalancer::new(strategy);
        }
    }

    /// Resolve the adapter for `(database, role, shard)`, applying the
    /// fallback order of spec.md §4.3 when the exact role is missing. This
    /// does not consult the lag tracker — callers that need lag-aware
    /// read/write splitting (spec.md §4.6) use [`Registry::adapter_for_read`].
    pub fn adapter_for(&self, database: &str, role: Role, shard: Option<&str>) -> OrmResult<Arc<Adapter>> {
        if role == Role::Reading {
            if let Some(adapter) = self.pick_healthy_replica(database, shard) {
                events::emit(Event::ReplicaSelected {
                    database: database.to_string(),
                    shard: shard.map(|s| s.to_string()),
                    adapter: adapter.key.clone(),
                });
                return Ok(adapter);
            }
        }

        self.adapter_for_order(database, role, shard)
    }

    /// Resolve a read adapter for `(database, shard)`, honoring the lag
    /// policy of spec.md §4.6: a read within `lag_threshold` of the last
    /// write (or during a sticky-primary window, or under a context that
    /// has pinned the role to Writing) is served by the writer/primary
    /// instead of a lagging replica.
    pub fn adapter_for_read(&self, database: &str, shard: Option<&str>, lag_threshold: std::time::Duration) -> OrmResult<Arc<Adapter>> {
        let force_writing = context::current().role == Some(Role::Writing);
        if !force_writing && self.lag.may_use_replica(database, shard, lag_threshold, false) {
            if let Some(adapter) = self.pick_healthy_replica(database, shard) {
                events::emit(Event::ReplicaSelected {
                    database: database.to_string(),
                    shard: shard.map(|s| s.to_string()),
                    adapter: adapter.key.clone(),
                });
                return Ok(adapter);
            }
        }

        self.adapter_for_order(database, Role::Primary, shard)
    }

    fn adapter_for_order(&self, database: &str, role: Role, shard: Option<&str>) -> OrmResult<Arc<Adapter>> {
        let order: &[Role] = match role {
            Role::Reading => &[Role::Reading, Role::Primary, Role::Writing],
            Role::Writing => &[Role::Writing, Role::Primary],
            Role::Primary => &[Role::Primary, Role::Writing],
        };

        let adapters = self.adapters.lock().expect("registry lock poisoned");
        for candidate in order {
            let key = ConnectionKey::new(database, *candidate, shard.map(|s| s.to_string()));
            if let Some(pooled) = adapters.get(&key) {
                return Ok(Arc::clone(&pooled.adapter));
            }
        }
        drop(adapters);

        Err(OrmError::NoAdapter {
            database: database.to_string(),
            role: role.to_string(),
            shard: shard.map(|s| s.to_string()),
        })
    }

    /// Picks a replica from the group for `(database, shard)`, but only if
    /// the pick is actually healthy. `LoadBalancer::pick` returns the
    /// stalest member instead of failing when the whole group is unhealthy
    /// (spec.md §4.5), so this is the point that turns "stalest of an
    /// all-down group" back into "no replica available" and lets the caller
    /// fall back to `adapter_for_order` per spec.md §4.3's primary fallback.
    fn pick_healthy_replica(&self, database: &str, shard: Option<&str>) -> Option<Arc<Adapter>> {
        let key = (database.to_string(), shard.map(|s| s.to_string()));
        let groups = self.replica_groups.lock().expect("registry lock poisoned");
        let group = groups.get(&key)?;
        let picked = group.lb.pick(&group.members).ok()?;
        if !picked.adapter_healthy() {
            return None;
        }
        Some(Arc::clone(&picked.adapter))
    }

    pub fn health_status(&self) -> Vec<(String, bool)> {
        self.adapters
            .lock()
            .expect("registry lock poisoned")
            .iter()
            .map(|(key, pooled)| (key.to_string(), pooled.adapter_healthy()))
            .collect()
    }

    /// Tears down every pool and health monitor. After this call the
    /// registry has no adapters, matching spec.md's invariant #1.
    pub fn clear_all(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut adapters = self.adapters.lock().expect("registry lock poisoned");
        for pooled in adapters.values() {
            pooled.health.stop();
        }
        adapters.clear();
        drop(adapters);
        self.specs.lock().expect("registry lock poisoned").clear();
        self.replica_groups.lock().expect("registry lock poisoned").clear();
    }

    pub fn len(&self) -> usize {
        self.adapters.lock().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.lock().expect("registry lock poisoned").is_empty()
    }
}

impl PooledAdapter {
    pub fn adapter_healthy(&self) -> bool {
        self.health.is_healthy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockDriver;

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

    #[test]
    fn establish_is_unique_per_key_and_clear_all_empties_it() {
        let registry = Registry::new(Arc::new(MockDriver::new()));
        registry.establish_connection(spec("orders", Role::Primary, None)).unwrap();
        registry.establish_connection(spec("orders", Role::Primary, None)).unwrap();
        assert_eq!(registry.len(), 1);

        registry.clear_all();
        assert!(registry.is_empty());
    }

    #[test]
    fn reading_falls_back_to_primary_when_no_replica_registered() {
        let registry = Registry::new(Arc::new(MockDriver::new()));
        registry.establish_connection(spec("orders", Role::Primary, None)).unwrap();
        let adapter = registry.adapter_for("orders", Role::Reading, None).unwrap();
        assert!(adapter.key.contains("primary"));
    }

    #[test]
    fn missing_adapter_raises_no_adapter() {
        let registry = Registry::new(Arc::new(MockDriver::new()));
        let err = registry.adapter_for("orders", Role::Writing, None).unwrap_err();
        assert!(matches!(err, OrmError::NoAdapter { .. }));
    }

    #[test]
    fn read_within_lag_window_is_served_by_primary_not_replica() {
        let registry = Registry::new(Arc::new(MockDriver::new()));
        registry.establish_connection(spec("orders", Role::Primary, Some("s1"))).unwrap();
        registry.establish_connection(spec("orders", Role::Reading, Some("s1"))).unwrap();

        registry.lag.record_write("orders", Some("s1"));
        let adapter = registry
            .adapter_for_read("orders", Some("s1"), std::time::Duration::from_secs(2))
            .unwrap();
        assert!(adapter.key.contains("primary"), "expected primary, got {}", adapter.key);
    }

    #[test]
    fn read_past_lag_window_is_served_by_replica() {
        let registry = Registry::new(Arc::new(MockDriver::new()));
        registry.establish_connection(spec("orders", Role::Primary, Some("s1"))).unwrap();
        registry.establish_connection(spec("orders", Role::Reading, Some("s1"))).unwrap();

        registry.lag.record_write("orders", Some("s1"));
        let adapter = registry
            .adapter_for_read("orders", Some("s1"), std::time::Duration::from_millis(0))
            .unwrap();
        assert!(adapter.key.contains("reading"), "expected reading replica, got {}", adapter.key);
    }

    #[tokio::test]
    async fn fully_unhealthy_replica_group_falls_back_to_primary() {
        let registry = Registry::new(Arc::new(crate::testing::PingFailingDriver));
        registry.establish_connection(spec("orders", Role::Primary, Some("s1"))).unwrap();
        registry.establish_connection(spec("orders", Role::Reading, Some("s1"))).unwrap();

        let replica_key = ConnectionKey::new("orders", Role::Reading, Some("s1".to_string()));
        {
            let adapters = registry.adapters.lock().unwrap();
            adapters.get(&replica_key).unwrap().health.check_now().await;
        }

        let adapter = registry.adapter_for("orders", Role::Reading, Some("s1")).unwrap();
        assert!(adapter.key.contains("primary"), "expected fallback to primary, got {}", adapter.key);
    }
}
