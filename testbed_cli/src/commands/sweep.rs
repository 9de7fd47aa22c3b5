//! Sweep command - remove labelled containers left behind by crashed runs.

use std::time::Duration;

use clap::Args;
use container_backends::{CliBackend, CliBackendConfig};
use testbed_shared_types::short_id;

use super::{parse_timeout, Context};
use crate::output;

/// Arguments for the sweep command.
#[derive(Args, Debug)]
pub struct SweepArgs {
    /// Only remove containers older than this
    #[arg(long, default_value = "1h", value_parser = parse_age)]
    pub older_than: Duration,
}

/// Like [`parse_timeout`], plus an `h` suffix.
fn parse_age(value: &str) -> Result<Duration, String> {
    match value.strip_suffix('h').map(str::parse::<u64>) {
        Some(Ok(hours)) => hours
            .checked_mul(3600)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("age {value:?} is too large")),
        _ => parse_timeout(value),
    }
}

/// Execute the sweep command.
pub async fn execute(args: SweepArgs, ctx: &Context) -> anyhow::Result<()> {
    let backend = CliBackend::with_config(CliBackendConfig {
        binary: ctx.settings.runtime_binary.clone(),
        label_prefix: ctx.settings.label_prefix.clone(),
        ..CliBackendConfig::default()
    })
    .await?;

    let removed = backend.sweep_stale(args.older_than).await?;
    for id in &removed {
        output::info(&format!("Removed {}", short_id(id)));
    }
    output::success(&format!("Swept {} container(s)", removed.len()));
    Ok(())
}
