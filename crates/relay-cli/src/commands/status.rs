use colored::Colorize;
use relay_foundation::WorkerEngine;

use crate::output::{OutputFormat, pool_table, to_pretty_json};

/// Execute the `status` command
///
/// Warms every pool to its `min_size` first, so the printed metrics show
/// what a freshly started engine holds.
pub async fn run(engine: &WorkerEngine, format: OutputFormat) -> anyhow::Result<()> {
    engine.start().await;
    let pools = engine.all_pool_metrics();

    match format {
        OutputFormat::Json => println!("{}", to_pretty_json(&pools)?),
        OutputFormat::Table => println!("{}", pool_table(&pools)),
        OutputFormat::Text => {
            for pool in &pools {
                let failures = if pool.spawn_failures > 0 {
                    format!("{} spawn failures", pool.spawn_failures).red()
                } else {
                    "no spawn failures".green()
                };
                println!(
                    "{:<15} {} of {} connections ({} idle), {}",
                    pool.domain.to_string().bold(),
                    pool.total_connections,
                    pool.max_size,
                    pool.idle_connections,
                    failures
                );
            }
        }
    }
    Ok(())
}
