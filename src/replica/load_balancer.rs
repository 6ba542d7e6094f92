//! Replica load balancer (spec.md §4.5): round-robin, random, and
//! least-connections strategies over a replica group. Never returns a
//! member outside the group it was given; raises
//! [`OrmError::NoHealthyReplica`] only when the caller supplied no
//! fallback (the registry itself always has one: the primary).

use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;

use crate::config::LbStrategy;
use crate::error::{OrmError, OrmResult};
use crate::registry::PooledAdapter;
use std::sync::Arc;

pub struct LoadBalancer {
    strategy: LbStrategy,
    cursor: AtomicUsize,
}

impl LoadBalancer {
    pub fn new(strategy: LbStrategy) -> Self {
        Self {
            strategy,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Picks a healthy member. If, after `group_size` attempts, none are
    /// healthy, returns the adapter with the oldest health check instead
    /// (letting the caller fall back to primary) rather than failing here
    /// when the group is non-empty; only an empty group is a hard error.
    pub fn pick<'a>(&self, members: &'a [Arc<PooledAdapter>]) -> OrmResult<&'a Arc<PooledAdapter>> {
        if members.is_empty() {
            return Err(OrmError::NoHealthyReplica {
                database: String::new(),
                shard: None,
            });
        }

        let healthy: Vec<&Arc<PooledAdapter>> = members.iter().filter(|m| m.adapter_healthy()).collect();
        if healthy.is_empty() {
            return members
                .iter()
                .min_by_key(|m| m.health.last_check())
                .ok_or(OrmError::NoHealthyReplica {
                    database: String::new(),
                    shard: None,
                });
        }

        let chosen = match self.strategy {
            LbStrategy::RoundRobin => {
                let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % healthy.len();
                healthy[idx]
            }
            LbStrategy::Random => {
                let idx = rand::thread_rng().gen_range(0..healthy.len());
                healthy[idx]
            }
            LbStrategy::LeastConnections => healthy
                .iter()
                .min_by_key(|m| m.adapter.pool.stats().in_use)
                .copied()
                .expect("healthy is non-empty"),
        };

        members
            .iter()
            .find(|m| Arc::ptr_eq(m, chosen))
            .ok_or(OrmError::NoHealthyReplica {
                database: String::new(),
                shard: None,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{Adapter, Dialect};
    use crate::config::{HealthConfig, PoolConfig};
    use crate::health::HealthMonitor;
    use crate::pool::Pool;
    use crate::testing::MockDriver;

    fn member(name: &str) -> Arc<PooledAdapter> {
        let pool = Pool::new(Arc::new(MockDriver::new()), "mock://db", PoolConfig::default()).unwrap();
        let adapter = Adapter::new(name, Dialect::Postgres, pool);
        let health = HealthMonitor::new(Arc::clone(&adapter), HealthConfig::default());
        Arc::new(PooledAdapter { adapter, health })
    }

    #[test]
    fn round_robin_cycles_through_members() {
        let members = vec![member("a"), member("b"), member("c")];
        let lb = LoadBalancer::new(LbStrategy::RoundRobin);
        let picks: Vec<String> = (0..6).map(|_| lb.pick(&members).unwrap().adapter.key.clone()).collect();
        assert_eq!(picks, vec!["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn empty_group_is_no_healthy_replica() {
        let members: Vec<Arc<PooledAdapter>> = Vec::new();
        let lb = LoadBalancer::new(LbStrategy::RoundRobin);
        assert!(matches!(lb.pick(&members), Err(OrmError::NoHealthyReplica { .. })));
    }
}
