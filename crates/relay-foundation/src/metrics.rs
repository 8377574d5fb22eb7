//! Per-operation execution statistics.

use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;

use relay_kernel::metrics::OperationMetric;

/// Thread-safe aggregator keyed by operation name.
///
/// Each update happens under the entry's shard lock, so concurrent records
/// for the same operation never lose increments.
#[derive(Debug, Default)]
pub struct OperationMetrics {
    operations: DashMap<String, OperationMetric>,
}

impl OperationMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one invocation of `operation`.
    pub fn record(&self, operation: &str, success: bool, duration: Duration) {
        let elapsed_ms = duration.as_nanos() as f64 / 1_000_000.0;
        let now = Utc::now();

        let apply = |entry: &mut OperationMetric| {
            entry.total_invocations += 1;
            if success {
                entry.successful_invocations += 1;
            } else {
                entry.failed_invocations += 1;
            }
            entry.total_execution_time_ms += elapsed_ms;
            if entry.total_invocations == 1 {
                entry.min_execution_time_ms = elapsed_ms;
                entry.max_execution_time_ms = elapsed_ms;
                entry.first_invocation = Some(now);
            } else {
                entry.min_execution_time_ms = entry.min_execution_time_ms.min(elapsed_ms);
                entry.max_execution_time_ms = entry.max_execution_time_ms.max(elapsed_ms);
            }
            entry.last_invocation = Some(now);
        };

        if let Some(mut entry) = self.operations.get_mut(operation) {
            apply(entry.value_mut());
            return;
        }
        let mut entry = self
            .operations
            .entry(operation.to_string())
            .or_insert_with(|| empty(operation));
        apply(entry.value_mut());
    }

    pub fn get(&self, operation: &str) -> Option<OperationMetric> {
        self.operations.get(operation).map(|m| m.clone())
    }

    /// Every operation, sorted by name.
    pub fn all(&self) -> Vec<OperationMetric> {
        let mut metrics: Vec<OperationMetric> =
            self.operations.iter().map(|m| m.value().clone()).collect();
        metrics.sort_by(|a, b| a.operation.cmp(&b.operation));
        metrics
    }
}

fn empty(operation: &str) -> OperationMetric {
    OperationMetric {
        operation: operation.to_string(),
        total_invocations: 0,
        successful_invocations: 0,
        failed_invocations: 0,
        min_execution_time_ms: 0.0,
        max_execution_time_ms: 0.0,
        total_execution_time_ms: 0.0,
        first_invocation: None,
        last_invocation: None,
    }
}
