//! Wait command - block until a container started with `--async` is ready.

use std::time::Duration;

use clap::Args;
use testbed_core::wait::wait_until_ready;
use testbed_core::WaitCondition;
use tokio::time::Instant;

use super::{parse_timeout, Context};
use crate::output;
use crate::state::ContainerRecord;

/// Arguments for the wait command.
#[derive(Args, Debug)]
pub struct WaitArgs {
    /// Container name given to `start`
    pub name: String,

    /// How long to wait (default from settings)
    #[arg(value_parser = parse_timeout)]
    pub timeout: Option<Duration>,
}

/// Recorded log pattern if there is one, otherwise "the container accepts exec".
fn readiness(record: &ContainerRecord, timeout: Duration) -> WaitCondition {
    match &record.wait_log {
        Some(pattern) => WaitCondition::log(pattern.clone(), timeout),
        None => WaitCondition::exec(["true"], timeout),
    }
}

/// Execute the wait command.
pub async fn execute(args: WaitArgs, ctx: &Context) -> anyhow::Result<()> {
    let mut state = ctx.load_state()?;
    let record = state.get(&args.name)?.clone();
    if record.ready {
        output::success(&format!("{} is ready", args.name));
        return Ok(());
    }

    let timeout = args.timeout.unwrap_or(ctx.settings.default_wait_timeout);
    let backend = ctx.backend_for(&record).await?;
    let condition = readiness(&record, timeout);
    wait_until_ready(backend.as_ref(), &record.id, &condition, Some(Instant::now() + timeout)).await?;

    state.get_mut(&args.name)?.ready = true;
    ctx.save_state(&state)?;
    output::success(&format!("{} is ready", args.name));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_readiness_prefers_recorded_pattern() {
        let mut record = ContainerRecord {
            id: "abc".to_string(),
            image: "redis:7-alpine".to_string(),
            backend: "docker".to_string(),
            created: Utc::now(),
            ports: Vec::new(),
            wait_log: Some("Ready to accept connections".to_string()),
            ready: false,
        };
        let timeout = Duration::from_secs(3);
        assert_eq!(readiness(&record, timeout).kind(), "log");

        record.wait_log = None;
        let probe = readiness(&record, timeout);
        assert_eq!(probe.kind(), "exec");
        assert_eq!(probe.total_timeout(), timeout);
    }
}
