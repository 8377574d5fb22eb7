//! Per-domain connection pool.
//!
//! Features:
//! - Bounded by `[min_size, max_size]`; grows lazily, warms up to `min_size`
//! - LIFO reuse of idle connections, one request per connection at a time
//! - Background maintenance: idle eviction, health checks, replenishment
//! - Graceful shutdown that lets in-flight requests drain
//!
//! # Example
//!
//! ```rust,ignore
//! let pool = ConnectionPool::new(DomainType::Model, PoolConfig::default(), launcher, correlator);
//! pool.start().await;
//!
//! let lease = pool.acquire("model.load_model").await?;
//! let reply = lease.request(command, Duration::from_secs(30)).await;
//! lease.release(ReleaseOutcome::for_result(&reply));
//!
//! pool.shutdown().await;
//! ```

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use relay_kernel::DomainType;
use relay_kernel::config::PoolConfig;
use relay_kernel::error::{EngineError, EngineResult};
use relay_kernel::launcher::WorkerLauncher;
use relay_kernel::metrics::{ConnectionPoolMetrics, ConnectionState};
use relay_kernel::wire::ResponseEnvelope;

use crate::connection::Connection;
use crate::correlator::RequestCorrelator;

/// How a leased connection's request ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// A response arrived (worker success or worker failure).
    Completed,
    /// No response before the deadline.
    TimedOut,
    /// The caller gave up mid-request.
    Abandoned,
    /// The stream broke or produced garbage; the connection is retired.
    Failed(String),
}

impl ReleaseOutcome {
    pub fn for_error(error: &EngineError) -> Self {
        match error {
            EngineError::Worker { .. } => ReleaseOutcome::Completed,
            EngineError::Timeout { .. } => ReleaseOutcome::TimedOut,
            other => ReleaseOutcome::Failed(other.to_string()),
        }
    }

    pub fn for_result(result: &EngineResult<ResponseEnvelope>) -> Self {
        match result {
            Ok(_) => ReleaseOutcome::Completed,
            Err(e) => Self::for_error(e),
        }
    }
}

#[derive(Default)]
struct PoolState {
    /// Most recently released last.
    idle: Vec<Arc<Connection>>,
    busy: HashMap<String, Arc<Connection>>,
    /// Released after shutdown began; closed at the end of shutdown.
    drained: Vec<Arc<Connection>>,
}

impl PoolState {
    fn total(&self) -> usize {
        self.idle.len() + self.busy.len()
    }
}

#[derive(Default)]
struct PoolCounters {
    total_requests: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    spawn_failures: AtomicU64,
}

struct PoolInner {
    domain: DomainType,
    config: PoolConfig,
    launcher: Arc<dyn WorkerLauncher>,
    correlator: Arc<RequestCorrelator>,
    permits: Arc<Semaphore>,
    state: Mutex<PoolState>,
    counters: PoolCounters,
    next_id: AtomicU64,
    is_running: AtomicBool,
    closed: AtomicBool,
    wake: Notify,
    maintenance: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Connection pool for one domain.
///
/// Cheaply cloneable; all clones share the same connections.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(
        domain: DomainType,
        config: PoolConfig,
        launcher: Arc<dyn WorkerLauncher>,
        correlator: Arc<RequestCorrelator>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_size));
        Self {
            inner: Arc::new(PoolInner {
                domain,
                config,
                launcher,
                correlator,
                permits,
                state: Mutex::new(PoolState::default()),
                counters: PoolCounters::default(),
                next_id: AtomicU64::new(0),
                is_running: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                wake: Notify::new(),
                maintenance: tokio::sync::Mutex::new(None),
            }),
        }
    }

    pub fn domain(&self) -> DomainType {
        self.inner.domain
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Warm up to `min_size` and start the maintenance task.
    pub async fn start(&self) {
        if self.is_closed() {
            warn!("{} pool is closed and cannot be restarted", self.inner.domain);
            return;
        }
        if self.inner.is_running.swap(true, Ordering::SeqCst) {
            warn!("{} pool is already running", self.inner.domain);
            return;
        }

        info!(
            "{} pool starting (min: {}, max: {}, idle timeout: {:?})",
            self.inner.domain,
            self.inner.config.min_size,
            self.inner.config.max_size,
            self.inner.config.idle_timeout()
        );

        let warmed = self.replenish().await;
        if warmed < self.inner.config.min_size {
            warn!(
                "{} pool warmed {} of {} connections",
                self.inner.domain, warmed, self.inner.config.min_size
            );
        }

        let handle = Self::start_background_tasks(self.clone());
        *self.inner.maintenance.lock().await = Some(handle);
    }

    /// Lease a connection for one request.
    ///
    /// Waits up to `acquire_timeout` for a free slot, then reuses the most
    /// recently released healthy connection or spawns a new one.
    pub async fn acquire(&self, operation: &str) -> EngineResult<PooledConnection> {
        let domain = self.inner.domain;
        if self.is_closed() {
            return Err(EngineError::Closed(domain));
        }

        let started = Instant::now();
        let permit = match tokio::time::timeout(
            self.inner.config.acquire_timeout(),
            Arc::clone(&self.inner.permits).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(EngineError::Closed(domain)),
            Err(_) => {
                warn!(
                    "{} pool exhausted: no connection within {:?}",
                    domain,
                    self.inner.config.acquire_timeout()
                );
                return Err(EngineError::PoolExhausted {
                    domain,
                    waited: started.elapsed(),
                });
            }
        };
        if self.is_closed() {
            return Err(EngineError::Closed(domain));
        }

        let (reused, stale) = {
            let mut state = self.inner.state.lock();
            let mut stale = Vec::new();
            let mut reused = None;
            while let Some(conn) = state.idle.pop() {
                if conn.is_healthy() {
                    conn.begin(operation);
                    state.busy.insert(conn.id().to_string(), Arc::clone(&conn));
                    reused = Some(conn);
                    break;
                }
                stale.push(conn);
            }
            (reused, stale)
        };
        for conn in stale {
            self.retire(conn, "unhealthy while idle");
        }

        let connection = match reused {
            Some(conn) => {
                self.inner.counters.hits.fetch_add(1, Ordering::Relaxed);
                debug!("Reusing {} for {}", conn.id(), operation);
                conn
            }
            None => {
                let conn = match self.open_connection().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        self.inner.counters.spawn_failures.fetch_add(1, Ordering::Relaxed);
                        error!("Failed to open {} connection: {}", domain, e);
                        return Err(e);
                    }
                };
                let mut state = self.inner.state.lock();
                if self.is_closed() {
                    state.drained.push(conn);
                    return Err(EngineError::Closed(domain));
                }
                conn.begin(operation);
                state.busy.insert(conn.id().to_string(), Arc::clone(&conn));
                self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);
                conn
            }
        };

        self.inner.counters.total_requests.fetch_add(1, Ordering::Relaxed);
        Ok(PooledConnection {
            pool: self.clone(),
            connection,
            permit: Some(permit),
        })
    }

    fn release(&self, connection: &Arc<Connection>, outcome: ReleaseOutcome, permit: OwnedSemaphorePermit) {
        // A lease dropped mid-write leaves half a frame on the worker's input.
        let outcome = if connection.has_torn_frame() {
            ReleaseOutcome::Failed("frame write interrupted".to_string())
        } else {
            outcome
        };
        let verdict = match outcome {
            ReleaseOutcome::Completed => {
                connection.record_success();
                None
            }
            ReleaseOutcome::TimedOut | ReleaseOutcome::Abandoned => {
                let count = connection.record_timeout();
                (count >= self.inner.config.max_consecutive_timeouts)
                    .then(|| format!("{count} consecutive timeouts"))
            }
            ReleaseOutcome::Failed(reason) => {
                connection.mark_unhealthy(&reason);
                Some(reason)
            }
        };

        let retire_reason = {
            let mut state = self.inner.state.lock();
            state.busy.remove(connection.id());
            if self.is_closed() {
                connection.set_state(ConnectionState::Draining);
                state.drained.push(Arc::clone(connection));
                None
            } else if let Some(reason) = verdict {
                Some(reason)
            } else if !connection.is_healthy() {
                Some("unhealthy".to_string())
            } else {
                connection.set_state(ConnectionState::Idle);
                state.idle.push(Arc::clone(connection));
                None
            }
        };
        if let Some(reason) = retire_reason {
            self.retire(Arc::clone(connection), &reason);
        }

        // The slot frees only after the connection is back on the idle stack.
        drop(permit);
    }

    /// Evict a connection that is no longer in the idle or busy sets.
    fn retire(&self, connection: Arc<Connection>, reason: &str) {
        self.inner.counters.evictions.fetch_add(1, Ordering::Relaxed);
        info!("Evicting {} from {} pool: {}", connection.id(), self.inner.domain, reason);
        connection.mark_unhealthy(reason);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move { connection.close().await });
        }
    }

    async fn open_connection(&self) -> EngineResult<Arc<Connection>> {
        let domain = self.inner.domain;
        let id = format!(
            "{}-{}",
            domain,
            self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1
        );
        let channel = self
            .inner
            .launcher
            .launch(domain)
            .await
            .map_err(|e| EngineError::Spawn {
                domain,
                reason: e.to_string(),
            })?;
        Connection::establish(
            id,
            domain,
            channel,
            Arc::clone(&self.inner.correlator),
            &self.inner.config,
        )
        .await
    }

    /// One maintenance pass: idle eviction, health checks, replenishment.
    pub async fn run_maintenance(&self) {
        if self.is_closed() {
            return;
        }
        self.evict_idle().await;
        self.check_health().await;
        self.replenish().await;
    }

    /// Close idle connections past `idle_timeout`, never going below
    /// `min_size`. Unhealthy idle connections are always closed.
    pub async fn evict_idle(&self) -> usize {
        let timeout = self.inner.config.idle_timeout();
        let min = self.inner.config.min_size;
        let victims = {
            let mut state = self.inner.state.lock();
            let mut total = state.total();
            let mut victims = Vec::new();
            // Front of the stack is least recently used.
            let mut i = 0;
            while i < state.idle.len() {
                let conn = &state.idle[i];
                let expired = total > min && conn.idle_time() >= timeout;
                if expired || !conn.is_healthy() {
                    victims.push(state.idle.remove(i));
                    total -= 1;
                } else {
                    i += 1;
                }
            }
            victims
        };

        let evicted = victims.len();
        for conn in victims {
            self.inner.counters.evictions.fetch_add(1, Ordering::Relaxed);
            info!(
                "Evicting idle {} after {:?}",
                conn.id(),
                conn.idle_time()
            );
            conn.close().await;
        }
        evicted
    }

    /// Health-check idle connections; failures are evicted.
    pub async fn check_health(&self) {
        let action = self.inner.config.health_check_action.clone();
        let candidates: Vec<Arc<Connection>> = self.inner.state.lock().idle.clone();

        for conn in candidates {
            let Ok(permit) = Arc::clone(&self.inner.permits).try_acquire_owned() else {
                // Every slot is busy; those connections are evidently working.
                break;
            };
            let claimed = {
                let mut state = self.inner.state.lock();
                match state.idle.iter().position(|c| Arc::ptr_eq(c, &conn)) {
                    Some(pos) => {
                        state.idle.remove(pos);
                        conn.begin_health_check(&action);
                        state.busy.insert(conn.id().to_string(), Arc::clone(&conn));
                        true
                    }
                    None => false,
                }
            };
            if !claimed {
                continue;
            }

            let outcome = match conn
                .health_check(&action, self.inner.config.health_check_timeout())
                .await
            {
                Ok(()) => ReleaseOutcome::Completed,
                Err(e) => ReleaseOutcome::Failed(format!("health check failed: {e}")),
            };
            conn.finish_health_check();
            self.release(&conn, outcome, permit);
        }
    }

    /// Spawn connections until the pool holds `min_size`. Returns how many
    /// were added.
    pub async fn replenish(&self) -> usize {
        let min = self.inner.config.min_size;
        let mut spawned = 0;
        loop {
            if self.is_closed() || self.inner.state.lock().total() >= min {
                break;
            }
            let Ok(permit) = Arc::clone(&self.inner.permits).try_acquire_owned() else {
                break;
            };
            match self.open_connection().await {
                Ok(conn) => {
                    let mut state = self.inner.state.lock();
                    if self.is_closed() {
                        state.drained.push(conn);
                        break;
                    }
                    // Fresh connections go to the cold end of the stack.
                    state.idle.insert(0, conn);
                    spawned += 1;
                }
                Err(e) => {
                    self.inner.counters.spawn_failures.fetch_add(1, Ordering::Relaxed);
                    warn!("Failed to replenish {} pool: {}", self.inner.domain, e);
                    break;
                }
            }
            drop(permit);
        }
        if spawned > 0 {
            debug!("{} pool replenished with {} connections", self.inner.domain, spawned);
        }
        spawned
    }

    /// Stop accepting leases, let in-flight requests drain for up to
    /// `shutdown_grace`, then close every connection. Idempotent.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("{} pool shutting down...", self.inner.domain);

        self.inner.wake.notify_one();
        if let Some(handle) = self.inner.maintenance.lock().await.take() {
            let _ = handle.await;
        }

        let idle = {
            let mut state = self.inner.state.lock();
            for conn in state.busy.values() {
                conn.set_state(ConnectionState::Draining);
            }
            std::mem::take(&mut state.idle)
        };
        for conn in idle {
            conn.close().await;
        }

        let slots = u32::try_from(self.inner.config.max_size).unwrap_or(u32::MAX);
        let grace = self.inner.config.shutdown_grace();
        match tokio::time::timeout(grace, self.inner.permits.acquire_many(slots)).await {
            Ok(Ok(_all)) => debug!("{} pool drained", self.inner.domain),
            _ => warn!(
                "{} pool did not drain within {:?}; closing busy connections",
                self.inner.domain, grace
            ),
        }
        self.inner.permits.close();

        let remaining: Vec<Arc<Connection>> = {
            let mut state = self.inner.state.lock();
            let mut all: Vec<Arc<Connection>> = state.busy.drain().map(|(_, c)| c).collect();
            all.append(&mut state.idle);
            all.append(&mut state.drained);
            all
        };
        for conn in remaining {
            conn.close().await;
        }

        self.inner.is_running.store(false, Ordering::SeqCst);
        info!("{} pool shutdown complete", self.inner.domain);
    }

    pub fn metrics(&self) -> ConnectionPoolMetrics {
        let (mut connections, active, idle) = {
            let state = self.inner.state.lock();
            let connections: Vec<_> = state
                .busy
                .values()
                .chain(state.idle.iter())
                .map(|c| c.info())
                .collect();
            (connections, state.busy.len(), state.idle.len())
        };
        connections.sort_by(|a, b| a.id.cmp(&b.id));

        let counters = &self.inner.counters;
        let hits = counters.hits.load(Ordering::Relaxed);
        let misses = counters.misses.load(Ordering::Relaxed);
        let average_connection_age_ms = if connections.is_empty() {
            0.0
        } else {
            connections.iter().map(|c| c.age_ms as f64).sum::<f64>() / connections.len() as f64
        };

        ConnectionPoolMetrics {
            domain: self.inner.domain,
            min_size: self.inner.config.min_size,
            max_size: self.inner.config.max_size,
            total_connections: active + idle,
            active_connections: active,
            idle_connections: idle,
            total_requests: counters.total_requests.load(Ordering::Relaxed),
            pool_hits: hits,
            pool_misses: misses,
            hit_rate: relay_kernel::batch::success_rate(hits as usize, (hits + misses) as usize),
            evictions: counters.evictions.load(Ordering::Relaxed),
            spawn_failures: counters.spawn_failures.load(Ordering::Relaxed),
            average_connection_age_ms,
            connections,
        }
    }

    fn start_background_tasks(pool: ConnectionPool) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pool.inner.config.maintenance_interval());
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = pool.inner.wake.notified() => {}
                }

                if pool.is_closed() {
                    debug!("{} pool maintenance shutting down", pool.inner.domain);
                    break;
                }

                pool.run_maintenance().await;
            }
        })
    }
}

/// A connection leased from a pool.
///
/// Return it with [`release`](Self::release). Dropping it unreleased counts
/// as an abandoned request: the connection may still owe a late reply, so
/// it is treated like a timeout.
pub struct PooledConnection {
    pool: ConnectionPool,
    connection: Arc<Connection>,
    permit: Option<OwnedSemaphorePermit>,
}

impl PooledConnection {
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn release(mut self, outcome: ReleaseOutcome) {
        self.finish(outcome);
    }

    fn finish(&mut self, outcome: ReleaseOutcome) {
        if let Some(permit) = self.permit.take() {
            self.connection.finish();
            self.pool.release(&self.connection, outcome, permit);
        }
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("connection", &self.connection.id())
            .finish_non_exhaustive()
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.connection
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if self.permit.is_some() {
            debug!("Lease on {} dropped without release", self.connection.id());
            self.finish(ReleaseOutcome::Abandoned);
        }
    }
}
