//! Pool implementation: bounded acquisition, recycling, health checks.

use std::{
    fmt,
    ops::{Deref, DerefMut},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    connector::Connector,
    error::{PoolError, Result},
};

/// Pool sizing and lifecycle configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connections the maintenance task keeps open at minimum.
    pub min_size: usize,

    /// Hard upper bound on live connections. Callers block once reached.
    pub max_size: usize,

    /// Default wait budget for [`Pool::acquire`].
    pub acquire_timeout: Duration,

    /// Idle connections older than this are destroyed.
    pub idle_timeout: Duration,

    /// Cadence of the maintenance task's health sweep.
    pub health_check_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 2,
            max_size: 10,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(600),
            health_check_interval: Duration::from_secs(30),
        }
    }
}

/// Point-in-time pool utilization counters for metrics gauges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections currently open (idle + handed out).
    pub live: usize,
    /// Connections sitting idle in the pool.
    pub idle: usize,
    /// Connections currently handed out to callers.
    pub in_use: usize,
    /// Acquire calls that timed out since the pool was created.
    pub exhaustions: u64,
}

struct IdleConn<T> {
    conn: T,
    since: Instant,
}

struct Shared<C: Connector> {
    connector: C,
    config: PoolConfig,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<IdleConn<C::Conn>>>,
    live: AtomicUsize,
    exhaustions: AtomicU64,
    closed: AtomicBool,
}

/// Bounded connection pool.
///
/// Acquisition is gated by a semaphore holding `max_size` permits: a caller
/// first wins a permit (or times out), then reuses an idle connection or
/// opens a new one. The permit travels with the [`PoolConn`] guard, so the
/// number of simultaneously handed-out connections can never exceed
/// `max_size`.
pub struct Pool<C: Connector> {
    shared: Arc<Shared<C>>,
}

impl<C: Connector> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl<C: Connector> Pool<C> {
    /// Creates an empty pool; connections are opened lazily on demand.
    pub fn new(connector: C, config: PoolConfig) -> Self {
        let max = config.max_size.max(1);
        Self {
            shared: Arc::new(Shared {
                connector,
                config,
                permits: Arc::new(Semaphore::new(max)),
                idle: Mutex::new(Vec::new()),
                live: AtomicUsize::new(0),
                exhaustions: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Acquires a connection using the configured default timeout.
    pub async fn acquire(&self) -> Result<PoolConn<C>> {
        self.acquire_timeout(self.shared.config.acquire_timeout).await
    }

    /// Acquires a connection, waiting at most `timeout` for capacity.
    ///
    /// Returns [`PoolError::AcquireTimeout`] when the pool stays exhausted
    /// for the full wait budget. Callers propagate that to their own retry
    /// logic rather than retrying the acquire in place.
    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<PoolConn<C>> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed);
        }

        match tokio::time::timeout(timeout, self.acquire_inner()).await {
            Ok(result) => result,
            Err(_) => {
                self.shared.exhaustions.fetch_add(1, Ordering::Relaxed);
                warn!(waited_ms = timeout.as_millis() as u64, "connection pool exhausted");
                Err(PoolError::AcquireTimeout { waited: timeout })
            },
        }
    }

    async fn acquire_inner(&self) -> Result<PoolConn<C>> {
        let permit = self
            .shared
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;

        loop {
            let candidate = self.shared.idle.lock().pop();
            if let Some(entry) = candidate {
                if entry.since.elapsed() >= self.shared.config.idle_timeout {
                    // Expired while idle: destroy and look for another.
                    self.shared.live.fetch_sub(1, Ordering::AcqRel);
                    drop(entry.conn);
                    continue;
                }
                return Ok(PoolConn::reused(entry.conn, permit, Arc::clone(&self.shared)));
            }

            // A new connection may only be opened while a live slot is free.
            // Connections a health sweep holds stay counted in `live`, so
            // callers wait for the sweep to return them instead of opening
            // extras past `max_size`.
            let live = self.shared.live.load(Ordering::Acquire);
            if live < self.shared.config.max_size
                && self
                    .shared
                    .live
                    .compare_exchange(live, live + 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                match self.shared.connector.connect().await {
                    Ok(conn) => {
                        debug!(live = live + 1, "opened connection");
                        return Ok(PoolConn::reused(conn, permit, Arc::clone(&self.shared)));
                    },
                    Err(err) => {
                        self.shared.live.fetch_sub(1, Ordering::AcqRel);
                        return Err(err.into());
                    },
                }
            }

            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    /// Runs one health sweep over idle connections.
    ///
    /// Idle-expired entries are destroyed; remaining entries are pinged and
    /// destroyed on failure. Afterwards the pool is replenished up to
    /// `min_size`. Invoked periodically by [`Pool::spawn_maintenance`] and
    /// directly by tests.
    pub async fn run_health_checks(&self) {
        let entries: Vec<IdleConn<C::Conn>> = std::mem::take(&mut *self.shared.idle.lock());
        let mut healthy = Vec::with_capacity(entries.len());

        for mut entry in entries {
            if entry.since.elapsed() >= self.shared.config.idle_timeout {
                self.shared.live.fetch_sub(1, Ordering::AcqRel);
                debug!("destroyed idle-expired connection");
                continue;
            }
            match self.shared.connector.ping(&mut entry.conn).await {
                Ok(()) => healthy.push(entry),
                Err(error) => {
                    self.shared.live.fetch_sub(1, Ordering::AcqRel);
                    warn!(%error, "destroyed unhealthy connection");
                },
            }
        }

        self.shared.idle.lock().extend(healthy);
        self.replenish().await;
    }

    /// Opens connections until the pool holds `min_size` live connections.
    async fn replenish(&self) {
        loop {
            let live = self.shared.live.load(Ordering::Acquire);
            if live >= self.shared.config.min_size
                || live >= self.shared.config.max_size
                || self.shared.closed.load(Ordering::Acquire)
            {
                break;
            }
            if self
                .shared
                .live
                .compare_exchange(live, live + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            match self.shared.connector.connect().await {
                Ok(conn) => {
                    self.shared.idle.lock().push(IdleConn { conn, since: Instant::now() });
                },
                Err(error) => {
                    self.shared.live.fetch_sub(1, Ordering::AcqRel);
                    warn!(%error, "failed to replenish connection pool");
                    break;
                },
            }
        }
    }

    /// Spawns the periodic maintenance task.
    ///
    /// The task runs health sweeps until the token is cancelled.
    pub fn spawn_maintenance(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(pool.shared.config.health_check_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        debug!("pool maintenance task stopping");
                        break;
                    },
                    _ = interval.tick() => {
                        pool.run_health_checks().await;
                    },
                }
            }
        })
    }

    /// Returns current utilization counters.
    pub fn stats(&self) -> PoolStats {
        let live = self.shared.live.load(Ordering::Acquire);
        let idle = self.shared.idle.lock().len();
        let available = self.shared.permits.available_permits();
        PoolStats {
            live,
            idle,
            in_use: self.shared.config.max_size.saturating_sub(available),
            exhaustions: self.shared.exhaustions.load(Ordering::Relaxed),
        }
    }

    /// Closes the pool: pending and future acquires fail with
    /// [`PoolError::Closed`] and idle connections are dropped.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.permits.close();
        let drained = std::mem::take(&mut *self.shared.idle.lock());
        self.shared.live.fetch_sub(drained.len(), Ordering::AcqRel);
    }
}

impl<C: Connector> fmt::Debug for Pool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.stats();
        f.debug_struct("Pool")
            .field("max_size", &self.shared.config.max_size)
            .field("live", &stats.live)
            .field("idle", &stats.idle)
            .finish_non_exhaustive()
    }
}

/// A pooled connection guard.
///
/// Dereferences to the underlying connection. Dropping the guard returns
/// the connection to the pool; [`PoolConn::invalidate`] destroys it instead
/// (used when the caller observed a connection-level failure).
pub struct PoolConn<C: Connector> {
    conn: Option<C::Conn>,
    shared: Arc<Shared<C>>,
    _permit: OwnedSemaphorePermit,
    recycle: bool,
}

impl<C: Connector> PoolConn<C> {
    fn reused(conn: C::Conn, permit: OwnedSemaphorePermit, shared: Arc<Shared<C>>) -> Self {
        Self { conn: Some(conn), shared, _permit: permit, recycle: true }
    }

    /// Destroys this connection instead of returning it to the pool.
    pub fn invalidate(mut self) {
        self.recycle = false;
    }
}

impl<C: Connector> fmt::Debug for PoolConn<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolConn").field("recycle", &self.recycle).finish_non_exhaustive()
    }
}

impl<C: Connector> Deref for PoolConn<C> {
    type Target = C::Conn;

    fn deref(&self) -> &C::Conn {
        self.conn.as_ref().expect("connection accessed after release")
    }
}

impl<C: Connector> DerefMut for PoolConn<C> {
    fn deref_mut(&mut self) -> &mut C::Conn {
        self.conn.as_mut().expect("connection accessed after release")
    }
}

impl<C: Connector> Drop for PoolConn<C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if self.recycle && !self.shared.closed.load(Ordering::Acquire) {
                self.shared.idle.lock().push(IdleConn { conn, since: Instant::now() });
            } else {
                self.shared.live.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }
}
