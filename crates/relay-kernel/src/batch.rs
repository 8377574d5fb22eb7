//! Batch request and result types.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::DomainType;
use crate::retry::RetryPolicy;

/// One logically independent request inside a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchItem {
    pub item_id: String,
    #[serde(default)]
    pub payload: Value,
}

impl BatchItem {
    pub fn new(item_id: impl Into<String>, payload: Value) -> Self {
        Self {
            item_id: item_id.into(),
            payload,
        }
    }
}

/// Concurrency, retry and error policy for a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchOptions {
    /// Maximum items in flight at once.
    pub concurrency_level: usize,
    /// Extra attempts after the first failure of an item.
    pub max_retry_attempts: u32,
    pub retry_policy: RetryPolicy,
    /// Cancel items that have not started once any item fails for good.
    pub stop_on_first_error: bool,
    /// Period of progress events; 0 disables periodic events.
    pub progress_reporting_interval_ms: u64,
    /// Deadline for each attempt; `None` uses the executor default.
    pub item_timeout_ms: Option<u64>,
    /// Items not started within this budget are cancelled.
    pub batch_timeout_ms: Option<u64>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            concurrency_level: 4,
            max_retry_attempts: 0,
            retry_policy: RetryPolicy::default(),
            stop_on_first_error: false,
            progress_reporting_interval_ms: 1_000,
            item_timeout_ms: None,
            batch_timeout_ms: None,
        }
    }
}

impl BatchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_concurrency(mut self, level: usize) -> Self {
        self.concurrency_level = level;
        self
    }

    pub fn with_retries(mut self, attempts: u32, policy: RetryPolicy) -> Self {
        self.max_retry_attempts = attempts;
        self.retry_policy = policy;
        self
    }

    pub fn with_stop_on_first_error(mut self, stop: bool) -> Self {
        self.stop_on_first_error = stop;
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_reporting_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_item_timeout(mut self, timeout: Duration) -> Self {
        self.item_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn with_batch_timeout(mut self, timeout: Duration) -> Self {
        self.batch_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn item_timeout(&self) -> Option<Duration> {
        self.item_timeout_ms.map(Duration::from_millis)
    }

    pub fn batch_timeout(&self) -> Option<Duration> {
        self.batch_timeout_ms.map(Duration::from_millis)
    }

    pub fn progress_interval(&self) -> Option<Duration> {
        (self.progress_reporting_interval_ms > 0)
            .then(|| Duration::from_millis(self.progress_reporting_interval_ms))
    }
}

/// Lifecycle of one batch item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Processing,
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

impl ItemStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ItemStatus::Completed | ItemStatus::Failed | ItemStatus::Cancelled
        )
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Processing => "processing",
            ItemStatus::Retrying => "retrying",
            ItemStatus::Completed => "completed",
            ItemStatus::Failed => "failed",
            ItemStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Outcome of one item, at the item's input index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchItemResult {
    pub index: usize,
    pub item_id: String,
    pub status: ItemStatus,
    /// Attempts actually dispatched (0 for cancelled items).
    pub attempts: u32,
    pub data: Option<Value>,
    pub error: Option<String>,
    /// [`EngineError::kind`](crate::error::EngineError::kind) of the last failure.
    pub error_kind: Option<String>,
    pub execution_time_ms: u64,
}

impl BatchItemResult {
    pub fn pending(index: usize, item_id: impl Into<String>) -> Self {
        Self {
            index,
            item_id: item_id.into(),
            status: ItemStatus::Pending,
            attempts: 0,
            data: None,
            error: None,
            error_kind: None,
            execution_time_ms: 0,
        }
    }
}

/// Periodic progress event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchProgress {
    pub batch_id: String,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub percent_complete: f64,
    pub estimated_time_remaining_ms: Option<u64>,
}

impl BatchProgress {
    /// Build an event from counts and elapsed time. The estimate assumes the
    /// remaining items finish at the average pace observed so far.
    pub fn compute(
        batch_id: &str,
        total: usize,
        completed: usize,
        failed: usize,
        cancelled: usize,
        elapsed: Duration,
    ) -> Self {
        let done = completed + failed + cancelled;
        let percent_complete = if total == 0 {
            100.0
        } else {
            done as f64 / total as f64 * 100.0
        };
        let estimated_time_remaining_ms = if done == 0 {
            None
        } else {
            let per_item = elapsed.as_millis() as f64 / done as f64;
            Some((per_item * total.saturating_sub(done) as f64).round() as u64)
        };
        Self {
            batch_id: batch_id.to_string(),
            total,
            completed,
            failed,
            cancelled,
            percent_complete,
            estimated_time_remaining_ms,
        }
    }
}

/// Aggregated outcome of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub batch_id: String,
    pub domain: DomainType,
    pub action: String,
    pub total_operations: usize,
    pub successful: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub success_rate: f64,
    /// One entry per input item, in input order.
    pub results: Vec<BatchItemResult>,
    /// Wall-clock time of the whole batch.
    pub total_execution_time_ms: u64,
    /// Mean time of the items that were dispatched.
    pub average_execution_time_ms: f64,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl BatchResult {
    /// Assemble a result, deriving every aggregate from `results`.
    ///
    /// Items still in a non-terminal state are counted as cancelled so the
    /// counts always add up to `total_operations`.
    pub fn from_items(
        batch_id: String,
        domain: DomainType,
        action: String,
        mut results: Vec<BatchItemResult>,
        elapsed: Duration,
        started_at: DateTime<Utc>,
    ) -> Self {
        for item in results.iter_mut().filter(|r| !r.status.is_terminal()) {
            item.status = ItemStatus::Cancelled;
        }
        let total_operations = results.len();
        let successful = count(&results, ItemStatus::Completed);
        let failed = count(&results, ItemStatus::Failed);
        let cancelled = count(&results, ItemStatus::Cancelled);

        let dispatched: Vec<&BatchItemResult> = results.iter().filter(|r| r.attempts > 0).collect();
        let average_execution_time_ms = if dispatched.is_empty() {
            0.0
        } else {
            dispatched.iter().map(|r| r.execution_time_ms as f64).sum::<f64>()
                / dispatched.len() as f64
        };

        Self {
            batch_id,
            domain,
            action,
            total_operations,
            successful,
            failed,
            cancelled,
            success_rate: success_rate(successful, total_operations),
            results,
            total_execution_time_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            average_execution_time_ms,
            started_at,
            completed_at: Utc::now(),
        }
    }
}

/// `successful / total * 100`, or 0 for an empty batch.
pub fn success_rate(successful: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        successful as f64 / total as f64 * 100.0
    }
}

fn count(results: &[BatchItemResult], status: ItemStatus) -> usize {
    results.iter().filter(|r| r.status == status).count()
}
