//! Batch coordination.
//!
//! Fans a list of items out to a [`RequestExecutor`] with bounded
//! concurrency. Items start in input order, retry per the batch's
//! [`RetryPolicy`](relay_kernel::RetryPolicy), and always end in a terminal
//! state so the aggregate counts add up.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use relay_kernel::DomainType;
use relay_kernel::batch::{BatchItem, BatchItemResult, BatchOptions, BatchProgress, BatchResult, ItemStatus};
use relay_kernel::error::{EngineError, EngineResult};
use relay_kernel::executor::RequestExecutor;

/// Receives periodic progress events and one final event at 100%.
pub type ProgressCallback = Arc<dyn Fn(BatchProgress) + Send + Sync>;

pub struct BatchCoordinator {
    executor: Arc<dyn RequestExecutor>,
}

/// Shared bookkeeping for one running batch.
struct BatchRun<'a> {
    batch_id: String,
    domain: DomainType,
    action: String,
    options: &'a BatchOptions,
    permits: Semaphore,
    deadline: Option<Instant>,
    started: Instant,
    results: Mutex<Vec<BatchItemResult>>,
    completed: AtomicUsize,
    failed: AtomicUsize,
    cancelled: AtomicUsize,
    aborted: AtomicBool,
}

impl BatchRun<'_> {
    fn set_status(&self, index: usize, status: ItemStatus) {
        self.results.lock()[index].status = status;
    }

    fn progress(&self) -> BatchProgress {
        BatchProgress::compute(
            &self.batch_id,
            self.results.lock().len(),
            self.completed.load(Ordering::SeqCst),
            self.failed.load(Ordering::SeqCst),
            self.cancelled.load(Ordering::SeqCst),
            self.started.elapsed(),
        )
    }

    fn past_deadline(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Per-attempt deadline: the item timeout, clipped to what is left of
    /// the batch budget.
    fn attempt_timeout(&self) -> Option<Duration> {
        let remaining = self.deadline.map(|d| d.saturating_duration_since(Instant::now()));
        match (self.options.item_timeout(), remaining) {
            (Some(item), Some(left)) => Some(item.min(left)),
            (item, left) => item.or(left),
        }
    }
}

impl BatchCoordinator {
    pub fn new(executor: Arc<dyn RequestExecutor>) -> Self {
        Self { executor }
    }

    /// Run every item and return the aggregated result.
    ///
    /// Fails only when the request itself is unusable; individual item
    /// failures are reported inside the result.
    pub async fn execute(
        &self,
        domain: DomainType,
        action: &str,
        items: Vec<BatchItem>,
        options: &BatchOptions,
        on_progress: Option<ProgressCallback>,
    ) -> EngineResult<BatchResult> {
        if options.concurrency_level == 0 {
            return Err(EngineError::InvalidRequest(
                "batch concurrency_level must be at least 1".to_string(),
            ));
        }

        let batch_id = Uuid::new_v4().to_string();
        let action = domain.qualify(action);
        let started_at = Utc::now();
        let started = Instant::now();
        info!(
            "Batch {} started: {} x {} (concurrency: {})",
            batch_id,
            items.len(),
            action,
            options.concurrency_level
        );

        let run = BatchRun {
            batch_id: batch_id.clone(),
            domain,
            action: action.clone(),
            options,
            permits: Semaphore::new(options.concurrency_level),
            deadline: options.batch_timeout().map(|t| started + t),
            started,
            results: Mutex::new(
                items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| BatchItemResult::pending(i, item.item_id.clone()))
                    .collect(),
            ),
            completed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            cancelled: AtomicUsize::new(0),
            aborted: AtomicBool::new(false),
        };

        let work = join_all(
            items
                .into_iter()
                .enumerate()
                .map(|(index, item)| self.run_item(&run, index, item)),
        );

        match (on_progress.as_ref(), options.progress_interval()) {
            (Some(callback), Some(period)) => {
                tokio::pin!(work);
                let mut ticker = tokio::time::interval_at(started + period, period);
                loop {
                    tokio::select! {
                        _ = &mut work => break,
                        _ = ticker.tick() => callback(run.progress()),
                    }
                }
            }
            _ => {
                work.await;
            }
        }

        let results = run.results.into_inner();
        let result = BatchResult::from_items(
            batch_id,
            domain,
            action,
            results,
            started.elapsed(),
            started_at,
        );

        if let Some(callback) = on_progress {
            callback(BatchProgress {
                batch_id: result.batch_id.clone(),
                total: result.total_operations,
                completed: result.successful,
                failed: result.failed,
                cancelled: result.cancelled,
                percent_complete: 100.0,
                estimated_time_remaining_ms: Some(0),
            });
        }

        info!(
            "Batch {} finished: {}/{} succeeded, {} failed, {} cancelled in {}ms",
            result.batch_id,
            result.successful,
            result.total_operations,
            result.failed,
            result.cancelled,
            result.total_execution_time_ms
        );
        Ok(result)
    }

    async fn run_item(&self, run: &BatchRun<'_>, index: usize, item: BatchItem) {
        let Ok(_permit) = run.permits.acquire().await else {
            return;
        };

        if run.aborted.load(Ordering::SeqCst) || run.past_deadline() {
            run.set_status(index, ItemStatus::Cancelled);
            run.cancelled.fetch_add(1, Ordering::SeqCst);
            debug!("Batch {} item {} cancelled before start", run.batch_id, item.item_id);
            return;
        }

        let started = Instant::now();
        let mut attempts: u32 = 0;
        let outcome = loop {
            attempts += 1;
            run.set_status(index, ItemStatus::Processing);

            let result = self
                .executor
                .execute(run.domain, &run.action, item.payload.clone(), run.attempt_timeout())
                .await;

            match result {
                Ok(data) => break Ok(data),
                Err(e) => {
                    let retries_left = attempts <= run.options.max_retry_attempts;
                    if retries_left
                        && e.is_retryable()
                        && !run.aborted.load(Ordering::SeqCst)
                        && !run.past_deadline()
                    {
                        let delay = run.options.retry_policy.delay_for(attempts - 1, index);
                        debug!(
                            "Batch {} item {} attempt {} failed ({}); retrying in {:?}",
                            run.batch_id, item.item_id, attempts, e, delay
                        );
                        run.set_status(index, ItemStatus::Retrying);
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    break Err(e);
                }
            }
        };

        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let mut results = run.results.lock();
        let entry = &mut results[index];
        entry.attempts = attempts;
        entry.execution_time_ms = elapsed_ms;
        match outcome {
            Ok(data) => {
                entry.status = ItemStatus::Completed;
                entry.data = Some(data);
                run.completed.fetch_add(1, Ordering::SeqCst);
            }
            Err(e) => {
                entry.status = ItemStatus::Failed;
                entry.error = Some(e.to_string());
                entry.error_kind = Some(e.kind().to_string());
                run.failed.fetch_add(1, Ordering::SeqCst);
                if run.options.stop_on_first_error && !run.aborted.swap(true, Ordering::SeqCst) {
                    warn!(
                        "Batch {} stopping after item {} failed: {}",
                        run.batch_id, item.item_id, e
                    );
                }
            }
        }
    }
}
