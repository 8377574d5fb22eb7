use std::time::Duration;

use anyhow::Context;
use colored::Colorize;
use relay_foundation::WorkerEngine;
use relay_kernel::DomainType;
use serde_json::Value;

use crate::output::{OutputFormat, to_pretty_json};

/// Execute the `exec` command
pub async fn run(
    engine: &WorkerEngine,
    domain: DomainType,
    action: &str,
    data: &str,
    timeout_ms: Option<u64>,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let payload: Value = serde_json::from_str(data).context("--data is not valid JSON")?;
    let timeout = timeout_ms.map(Duration::from_millis);

    let response = engine
        .execute(domain, action, payload, timeout)
        .await
        .with_context(|| format!("{} failed", domain.qualify(action)))?;

    match format {
        OutputFormat::Text => {
            println!("{} {}", "✓".green(), domain.qualify(action).bold());
            println!("{response}");
        }
        OutputFormat::Json | OutputFormat::Table => println!("{}", to_pretty_json(&response)?),
    }
    Ok(())
}
