use anyhow::Context;
use colored::Colorize;
use relay_foundation::WorkerEngine;
use relay_kernel::DomainType;

use crate::output::{OutputFormat, to_pretty_json};

/// Execute the `capabilities` command
pub async fn run(engine: &WorkerEngine, domain: DomainType, format: OutputFormat) -> anyhow::Result<()> {
    let payload = engine
        .capabilities(domain)
        .await
        .with_context(|| format!("fetching {domain} capabilities"))?;

    if format == OutputFormat::Text {
        println!("{} {}", "Capabilities of".bold(), domain.to_string().cyan());
    }
    println!("{}", to_pretty_json(&payload)?);
    Ok(())
}
