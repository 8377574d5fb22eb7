use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use colored::Colorize;
use relay_foundation::{ProgressCallback, WorkerEngine};
use relay_kernel::batch::{BatchItem, BatchOptions};
use relay_kernel::{DomainType, RetryPolicy};
use serde_json::Value;
use tracing::info;

use crate::output::{OutputFormat, batch_summary, batch_table, to_pretty_json};

/// Arguments of the `batch` command
pub struct BatchArgs<'a> {
    pub domain: DomainType,
    pub action: &'a str,
    pub items: &'a Path,
    pub concurrency: usize,
    pub retries: u32,
    pub stop_on_first_error: bool,
    pub item_timeout_ms: Option<u64>,
}

/// Execute the `batch` command
pub async fn run(engine: &WorkerEngine, args: BatchArgs<'_>, format: OutputFormat) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(args.items)
        .with_context(|| format!("reading {}", args.items.display()))?;
    let items = parse_items(&content)?;
    info!("Submitting {} items to {}", items.len(), args.domain.qualify(args.action));

    let mut options = BatchOptions::new()
        .with_concurrency(args.concurrency)
        .with_retries(args.retries, RetryPolicy::default())
        .with_stop_on_first_error(args.stop_on_first_error);
    if let Some(ms) = args.item_timeout_ms {
        options = options.with_item_timeout(Duration::from_millis(ms));
    }

    let on_progress: ProgressCallback = Arc::new(|progress| {
        info!(
            "batch {}: {}/{} done, {} failed ({:.1}%)",
            progress.batch_id,
            progress.completed + progress.failed + progress.cancelled,
            progress.total,
            progress.failed,
            progress.percent_complete
        );
    });

    let result = engine
        .execute_batch_with_progress(args.domain, args.action, items, &options, on_progress)
        .await
        .context("batch rejected")?;

    match format {
        OutputFormat::Json => println!("{}", to_pretty_json(&result)?),
        OutputFormat::Table => {
            println!("{}", batch_table(&result));
            println!("{}", batch_summary(&result));
        }
        OutputFormat::Text => {
            let summary = batch_summary(&result);
            if result.failed == 0 && result.cancelled == 0 {
                println!("{} {}", "✓".green(), summary);
            } else {
                println!("{} {}", "✗".red(), summary);
            }
        }
    }
    Ok(())
}

/// Items file: a JSON array whose entries are either `{item_id, payload}`
/// objects or bare payloads (named `item-<index>`).
fn parse_items(content: &str) -> anyhow::Result<Vec<BatchItem>> {
    let value: Value = serde_json::from_str(content).context("items file is not valid JSON")?;
    let Value::Array(entries) = value else {
        bail!("items file must hold a JSON array");
    };

    Ok(entries
        .into_iter()
        .enumerate()
        .map(|(index, entry)| {
            let is_item = entry
                .as_object()
                .is_some_and(|obj| obj.contains_key("item_id") && obj.contains_key("payload"));
            if is_item {
                if let Ok(item) = serde_json::from_value::<BatchItem>(entry.clone()) {
                    return item;
                }
            }
            BatchItem::new(format!("item-{index}"), entry)
        })
        .collect())
}
