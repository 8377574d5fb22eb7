//! Output formatting for CLI commands

use comfy_table::{ContentArrangement, Table};
use relay_kernel::batch::BatchResult;
use relay_kernel::metrics::ConnectionPoolMetrics;
use serde::Serialize;

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// Pretty JSON for automation
    #[default]
    Json,
    /// Table-formatted output
    Table,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
            Self::Table => write!(f, "table"),
        }
    }
}

/// Render any serializable value as pretty JSON
pub fn to_pretty_json<T: Serialize>(value: &T) -> anyhow::Result<String> {
    Ok(serde_json::to_string_pretty(value)?)
}

/// One row per pool
pub fn pool_table(pools: &[ConnectionPoolMetrics]) -> Table {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        "domain", "min", "max", "total", "busy", "idle", "requests", "hit rate", "evictions",
        "spawn failures",
    ]);
    for pool in pools {
        table.add_row(vec![
            pool.domain.to_string(),
            pool.min_size.to_string(),
            pool.max_size.to_string(),
            pool.total_connections.to_string(),
            pool.active_connections.to_string(),
            pool.idle_connections.to_string(),
            pool.total_requests.to_string(),
            format!("{:.1}%", pool.hit_rate),
            pool.evictions.to_string(),
            pool.spawn_failures.to_string(),
        ]);
    }
    table
}

/// One row per batch item
pub fn batch_table(result: &BatchResult) -> Table {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["#", "item", "status", "attempts", "ms", "error"]);
    for item in &result.results {
        table.add_row(vec![
            item.index.to_string(),
            item.item_id.clone(),
            format!("{:?}", item.status).to_lowercase(),
            item.attempts.to_string(),
            item.execution_time_ms.to_string(),
            item.error.clone().unwrap_or_default(),
        ]);
    }
    table
}

/// Single-line batch summary
pub fn batch_summary(result: &BatchResult) -> String {
    format!(
        "{} {}: {} ok, {} failed, {} cancelled of {} ({:.1}%) in {} ms",
        result.domain,
        result.action,
        result.successful,
        result.failed,
        result.cancelled,
        result.total_operations,
        result.success_rate,
        result.total_execution_time_ms
    )
}
