//! Exec command - run a command inside a named container.

use clap::Args;

use super::Context;
use testbed_shared_types::TestbedError;

/// Arguments for the exec command.
#[derive(Args, Debug)]
pub struct ExecArgs {
    /// Container name given to `start`
    pub name: String,

    /// Command and arguments
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

/// Execute the command and return its exit code.
pub async fn execute(args: ExecArgs, ctx: &Context) -> anyhow::Result<i32> {
    let state = ctx.load_state()?;
    let record = state.get(&args.name)?;
    let backend = ctx.backend_for(record).await?;

    let exec = backend.exec_in_container(&record.id, &args.command);
    let result = match tokio::time::timeout(ctx.settings.exec_timeout, exec).await {
        Ok(result) => result,
        Err(_) => {
            return Err(TestbedError::ExecTimeout {
                command: args.command,
                timeout: ctx.settings.exec_timeout,
            }
            .into())
        }
    };
    let output = result?;
    print!("{}", output.output);
    Ok(output.exit_code)
}
