//! Stop command - remove a named container and forget it.

use clap::Args;

use super::Context;
use crate::output;

/// Arguments for the stop command.
#[derive(Args, Debug)]
pub struct StopArgs {
    /// Container name given to `start`
    pub name: String,
}

/// Execute the stop command.
pub async fn execute(args: StopArgs, ctx: &Context) -> anyhow::Result<()> {
    let mut state = ctx.load_state()?;
    let record = state.get(&args.name)?.clone();
    let backend = ctx.backend_for(&record).await?;

    match backend.remove_container(&record.id).await {
        Ok(()) => output::success(&format!("Removed {}", args.name)),
        Err(e) if e.is_not_found() => {
            output::warn(&format!("{} was already gone", args.name));
        }
        Err(e) => return Err(e.into()),
    }

    state.remove(&args.name)?;
    ctx.save_state(&state)?;
    Ok(())
}
