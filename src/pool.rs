//! Connection pool wrapper (spec.md §4.2).
//!
//! Checkout policy: return an idle connection immediately if present;
//! otherwise open a new one while under `max_size` (bounded retry on
//! transient failures); otherwise queue on a semaphore up to
//! `checkout_timeout`. Checkin returns the connection to the idle deque or
//! closes it once `max_idle` is exceeded. The idle deque is guarded by a
//! plain `std::sync::Mutex` — checkout only blocks on the semaphore, never
//! while holding that mutex, so no lock is held across I/O.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::adapter::driver::{Connection, Driver};
use crate::config::PoolConfig;
use crate::error::{OrmError, OrmResult};

pub struct Pool {
    driver: Arc<dyn Driver>,
    url: String,
    cfg: PoolConfig,
    idle: Mutex<VecDeque<Box<dyn Connection>>>,
    permits: Arc<Semaphore>,
    total: AtomicUsize,
    in_use: AtomicUsize,
    checkout_us_total: AtomicU64,
    checkout_samples: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    pub in_use: usize,
    pub available: usize,
    pub total: usize,
    pub avg_checkout_us: u64,
}

impl Pool {
    pub fn new(driver: Arc<dyn Driver>, url: impl Into<String>, cfg: PoolConfig) -> OrmResult<Arc<Self>> {
        let pool = Arc::new(Self {
            driver,
            url: url.into(),
            permits: Arc::new(Semaphore::new(cfg.max_size)),
            idle: Mutex::new(VecDeque::new()),
            total: AtomicUsize::new(0),
            in_use: AtomicUsize::new(0),
            checkout_us_total: AtomicU64::new(0),
            checkout_samples: AtomicU64::new(0),
            cfg,
        });
        for _ in 0..pool.cfg.initial_size.min(pool.cfg.max_size) {
            let conn = pool.open_one()?;
            pool.idle.lock().expect("idle lock poisoned").push_back(conn);
        }
        Ok(pool)
    }

    fn open_one(&self) -> OrmResult<Box<dyn Connection>> {
        let mut attempt = 0;
        loop {
            match self.driver.open(&self.url) {
                Ok(conn) => {
                    self.total.fetch_add(1, Ordering::SeqCst);
                    return Ok(conn);
                }
                Err(err) if attempt < self.cfg.retry_attempts => {
                    attempt += 1;
                    std::thread::sleep(self.cfg.retry_delay());
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Acquire a connection for the duration of the returned guard. Blocks
    /// up to `checkout_timeout`; on expiry raises [`OrmError::PoolTimeout`]
    /// without leaking a connection.
    pub async fn checkout(self: &Arc<Self>) -> OrmResult<PoolGuard> {
        let start = Instant::now();
        let permits = Arc::clone(&self.permits);
        let permit = tokio::time::timeout(self.cfg.checkout_timeout(), permits.acquire_owned())
            .await
            .map_err(|_| OrmError::PoolTimeout {
                waited_ms: self.cfg.checkout_timeout_ms,
            })?
            .expect("pool semaphore closed unexpectedly");

        let idle_conn = self.idle.lock().expect("idle lock poisoned").pop_front();
        let conn = match idle_conn {
            Some(conn) => conn,
            None => self.open_one()?,
        };

        self.in_use.fetch_add(1, Ordering::SeqCst);
        let elapsed_us = start.elapsed().as_micros() as u64;
        self.checkout_us_total.fetch_add(elapsed_us, Ordering::Relaxed);
        self.checkout_samples.fetch_add(1, Ordering::Relaxed);

        Ok(PoolGuard {
            pool: Arc::clone(self),
            conn: Some(conn),
            _permit: permit,
        })
    }

    fn checkin(&self, conn: Box<dyn Connection>) {
        self.in_use.fetch_sub(1, Ordering::SeqCst);
        let mut idle = self.idle.lock().expect("idle lock poisoned");
        if idle.len() < self.cfg.max_idle {
            idle.push_back(conn);
        } else {
            self.total.fetch_sub(1, Ordering::SeqCst);
            drop(conn);
        }
    }

    pub fn stats(&self) -> PoolStats {
        let samples = self.checkout_samples.load(Ordering::Relaxed).max(1);
        PoolStats {
            in_use: self.in_use.load(Ordering::SeqCst),
            available: self.idle.lock().expect("idle lock poisoned").len(),
            total: self.total.load(Ordering::SeqCst),
            avg_checkout_us: self.checkout_us_total.load(Ordering::Relaxed) / samples,
        }
    }
}

/// RAII checkout. Returns the connection to the pool (or closes it above
/// `max_idle`) on every exit path, including unwinding.
pub struct PoolGuard {
    pool: Arc<Pool>,
    conn: Option<Box<dyn Connection>>,
    _permit: OwnedSemaphorePermit,
}

impl PoolGuard {
    pub fn connection(&mut self) -> &mut dyn Connection {
        self.conn.as_deref_mut().expect("connection taken from guard")
    }
}

impl Drop for PoolGuard {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.checkin(conn);
        }
    }
}
