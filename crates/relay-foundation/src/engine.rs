//! The worker engine facade.
//!
//! Owns one [`ConnectionPool`] per domain, the shared request correlator,
//! operation metrics and the capability cache. Callers see four things:
//! `execute`, `execute_batch`, `capabilities`, and the metric snapshots.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::{Value, json};
use tokio::time::Instant;
use tracing::{debug, info};

use relay_kernel::DomainType;
use relay_kernel::batch::{BatchItem, BatchOptions, BatchResult};
use relay_kernel::config::{ConfigResult, EngineConfig};
use relay_kernel::error::{EngineError, EngineResult};
use relay_kernel::executor::RequestExecutor;
use relay_kernel::launcher::WorkerLauncher;
use relay_kernel::metrics::{CapabilityEntryInfo, ConnectionPoolMetrics, OperationMetric};
use relay_kernel::wire::Command;

use crate::batch::{BatchCoordinator, ProgressCallback};
use crate::capability::CapabilityCache;
use crate::correlator::{CorrelatorStats, RequestCorrelator};
use crate::metrics::OperationMetrics;
use crate::pool::{ConnectionPool, ReleaseOutcome};
use crate::process::ProcessLauncher;

struct EngineInner {
    config: EngineConfig,
    pools: HashMap<DomainType, ConnectionPool>,
    correlator: Arc<RequestCorrelator>,
    metrics: OperationMetrics,
    capabilities: CapabilityCache,
    closed: AtomicBool,
}

/// Entry point for talking to domain workers.
///
/// Cheaply cloneable; clones share pools and metrics.
#[derive(Clone)]
pub struct WorkerEngine {
    inner: Arc<EngineInner>,
}

impl WorkerEngine {
    /// Engine that launches worker processes per `config`.
    pub fn new(config: EngineConfig) -> ConfigResult<Self> {
        let launcher = Arc::new(ProcessLauncher::new(&config));
        Self::with_launcher(config, launcher)
    }

    /// Engine with a custom launcher (in-process workers, tests).
    pub fn with_launcher(config: EngineConfig, launcher: Arc<dyn WorkerLauncher>) -> ConfigResult<Self> {
        config.validate()?;

        let correlator = Arc::new(RequestCorrelator::new());
        let pools = DomainType::ALL
            .iter()
            .map(|domain| {
                let pool = ConnectionPool::new(
                    *domain,
                    config.pool_for(*domain),
                    Arc::clone(&launcher),
                    Arc::clone(&correlator),
                );
                (*domain, pool)
            })
            .collect();

        Ok(Self {
            inner: Arc::new(EngineInner {
                capabilities: CapabilityCache::new(config.capability_ttl()),
                config,
                pools,
                correlator,
                metrics: OperationMetrics::new(),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn pool(&self, domain: DomainType) -> EngineResult<&ConnectionPool> {
        self.inner
            .pools
            .get(&domain)
            .ok_or(EngineError::Closed(domain))
    }

    /// Warm every pool up to its `min_size` and start maintenance.
    pub async fn start(&self) {
        info!("Starting worker engine");
        join_all(self.inner.pools.values().map(|pool| pool.start())).await;
    }

    /// Drain and close every pool. Idempotent.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down worker engine...");
        join_all(self.inner.pools.values().map(|pool| pool.shutdown())).await;
        self.inner.capabilities.invalidate_all();
        info!("Worker engine shutdown complete");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Send one action to a `domain` worker and wait for its data.
    ///
    /// `action` is prefixed with the domain tag unless it is already
    /// qualified. `timeout` defaults to `default_timeout_ms`. Every call is
    /// recorded in the operation metrics under the qualified action.
    pub async fn execute(
        &self,
        domain: DomainType,
        action: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> EngineResult<Value> {
        let action = domain.qualify(action);
        let started = Instant::now();
        let result = self.dispatch(domain, &action, payload, timeout).await;
        self.inner
            .metrics
            .record(&action, result.is_ok(), started.elapsed());
        if let Err(e) = &result {
            debug!("{} failed: {}", action, e);
        }
        result
    }

    async fn dispatch(
        &self,
        domain: DomainType,
        action: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> EngineResult<Value> {
        if self.is_closed() {
            return Err(EngineError::Closed(domain));
        }
        let timeout = timeout.unwrap_or_else(|| self.inner.config.default_timeout());

        let lease = self.pool(domain)?.acquire(action).await?;
        let reply = lease.request(Command::new(action, payload), timeout).await;
        lease.release(ReleaseOutcome::for_result(&reply));

        reply?
            .into_result()
            .map_err(|message| EngineError::Worker {
                action: action.to_string(),
                message,
            })
    }

    /// Run `items` through `action` with the batch's concurrency and retry
    /// policy.
    pub async fn execute_batch(
        &self,
        domain: DomainType,
        action: &str,
        items: Vec<BatchItem>,
        options: &BatchOptions,
    ) -> EngineResult<BatchResult> {
        self.batch_coordinator()
            .execute(domain, action, items, options, None)
            .await
    }

    /// Like [`execute_batch`](Self::execute_batch), reporting progress to
    /// `on_progress`.
    pub async fn execute_batch_with_progress(
        &self,
        domain: DomainType,
        action: &str,
        items: Vec<BatchItem>,
        options: &BatchOptions,
        on_progress: ProgressCallback,
    ) -> EngineResult<BatchResult> {
        self.batch_coordinator()
            .execute(domain, action, items, options, Some(on_progress))
            .await
    }

    fn batch_coordinator(&self) -> BatchCoordinator {
        BatchCoordinator::new(Arc::new(self.clone()))
    }

    /// Capability descriptor of `domain`, served from cache while fresh.
    pub async fn capabilities(&self, domain: DomainType) -> EngineResult<Value> {
        let action = self.inner.config.capabilities_action.clone();
        self.inner
            .capabilities
            .get_or_refresh(domain, || {
                self.execute(domain, &action, json!({}), None)
            })
            .await
    }

    pub fn invalidate_capabilities(&self, domain: DomainType) -> bool {
        self.inner.capabilities.invalidate(domain)
    }

    pub fn invalidate_all_capabilities(&self) {
        self.inner.capabilities.invalidate_all();
    }

    pub fn capability_entries(&self) -> Vec<CapabilityEntryInfo> {
        self.inner.capabilities.entries()
    }

    pub fn pool_metrics(&self, domain: DomainType) -> EngineResult<ConnectionPoolMetrics> {
        self.pool(domain).map(ConnectionPool::metrics)
    }

    /// Metrics of every pool, ordered by domain.
    pub fn all_pool_metrics(&self) -> Vec<ConnectionPoolMetrics> {
        DomainType::ALL
            .iter()
            .filter_map(|d| self.inner.pools.get(d))
            .map(ConnectionPool::metrics)
            .collect()
    }

    pub fn operation_metric(&self, operation: &str) -> Option<OperationMetric> {
        self.inner.metrics.get(operation)
    }

    /// Every recorded operation, sorted by name.
    pub fn operation_metrics(&self) -> Vec<OperationMetric> {
        self.inner.metrics.all()
    }

    /// Requests written to a worker and still awaiting a reply.
    pub fn pending_requests(&self) -> usize {
        self.inner.correlator.pending_count()
    }

    pub fn correlator_stats(&self) -> CorrelatorStats {
        self.inner.correlator.stats()
    }
}

#[async_trait]
impl RequestExecutor for WorkerEngine {
    async fn execute(
        &self,
        domain: DomainType,
        action: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> EngineResult<Value> {
        WorkerEngine::execute(self, domain, action, payload, timeout).await
    }
}
