//! Health monitor (spec.md §4.4): periodically pings each adapter's
//! underlying connection within `health_check_timeout`, tracking a single
//! atomic `healthy` flag with single-sample hysteresis — no flap damping
//! at this layer, by design.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::adapter::Adapter;
use crate::config::HealthConfig;
use crate::events::{self, Event};

pub struct HealthMonitor {
    healthy: Arc<AtomicBool>,
    last_check: Arc<Mutex<Instant>>,
    adapter: Arc<Adapter>,
    cfg: HealthConfig,
    stop: Arc<Notify>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    /// Starts the probe loop if called from inside a Tokio runtime;
    /// otherwise only `check_now` is available (useful in plain unit
    /// tests that never let the background loop run).
    pub fn new(adapter: Arc<Adapter>, cfg: HealthConfig) -> Self {
        let healthy = Arc::new(AtomicBool::new(true));
        let last_check = Arc::new(Mutex::new(Instant::now()));
        let stop = Arc::new(Notify::new());

        let handle = tokio::runtime::Handle::try_current().ok().map(|rt| {
            let healthy = Arc::clone(&healthy);
            let last_check = Arc::clone(&last_check);
            let adapter = Arc::clone(&adapter);
            let stop = Arc::clone(&stop);
            let interval_dur = cfg.interval();
            let timeout_dur = cfg.timeout();
            rt.spawn(async move {
                let mut ticker = tokio::time::interval(interval_dur);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            probe(&adapter, timeout_dur, &healthy, &last_check).await;
                        }
                        _ = stop.notified() => break,
                    }
                }
            })
        });

        Self {
            healthy,
            last_check,
            adapter,
            cfg,
            stop,
            handle: Mutex::new(handle),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    pub fn last_check(&self) -> Instant {
        *self.last_check.lock().expect("last_check lock poisoned")
    }

    pub async fn check_now(&self) {
        probe(&self.adapter, self.cfg.timeout(), &self.healthy, &self.last_check).await;
    }

    pub fn stop(&self) {
        self.stop.notify_waiters();
        if let Some(handle) = self.handle.lock().expect("handle lock poisoned").take() {
            handle.abort();
        }
    }
}

async fn probe(
    adapter: &Arc<Adapter>,
    timeout: Duration,
    healthy: &Arc<AtomicBool>,
    last_check: &Arc<Mutex<Instant>>,
) {
    let outcome = tokio::time::timeout(timeout, async {
        let mut guard = adapter.pool.checkout().await?;
        guard.connection().ping()
    })
    .await;

    let was_healthy = healthy.load(Ordering::SeqCst);
    let now_healthy = matches!(outcome, Ok(Ok(())));
    healthy.store(now_healthy, Ordering::SeqCst);
    *last_check.lock().expect("last_check lock poisoned") = Instant::now();

    if now_healthy != was_healthy {
        events::emit(Event::HealthChanged {
            adapter: adapter.key.clone(),
            healthy: now_healthy,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::Dialect;
    use crate::config::PoolConfig;
    use crate::pool::Pool;
    use crate::testing::{MockDriver, PingFailingDriver};

    #[tokio::test]
    async fn check_now_marks_healthy_on_success() {
        let pool = Pool::new(Arc::new(MockDriver::new()), "mock://db", PoolConfig::default()).unwrap();
        let adapter = Adapter::new("db/primary", Dialect::Postgres, pool);
        let monitor = HealthMonitor::new(adapter, HealthConfig::default());
        monitor.check_now().await;
        assert!(monitor.is_healthy());
    }

    #[tokio::test]
    async fn check_now_marks_unhealthy_on_ping_failure() {
        let pool = Pool::new(Arc::new(PingFailingDriver), "mock://db", PoolConfig::default()).unwrap();
        let adapter = Adapter::new("db/primary", Dialect::Postgres, pool);
        let monitor = HealthMonitor::new(adapter, HealthConfig::default());
        monitor.check_now().await;
        assert!(!monitor.is_healthy());
    }
}
