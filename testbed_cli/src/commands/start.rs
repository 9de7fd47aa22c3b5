//! Start command - create a named container.

use std::time::Duration;

use chrono::Utc;
use clap::Args;
use testbed_core::{options, ContainerOption};
use testbed_shared_types::{normalize_port, short_id};

use super::{parse_env, parse_timeout, Context};
use crate::detached::DetachedScope;
use crate::error::CliError;
use crate::output;
use crate::state::ContainerRecord;

/// Arguments for the start command.
#[derive(Args, Debug)]
pub struct StartArgs {
    /// Name later commands use to refer to the container
    pub name: String,

    /// Image to run
    pub image: String,

    /// Container port to publish on a random host port (e.g. 5432, 53/udp)
    #[arg(short = 'p', long = "port")]
    pub ports: Vec<String>,

    /// Environment variable as KEY=VAL
    #[arg(short = 'e', long = "env", value_parser = parse_env)]
    pub env: Vec<(String, String)>,

    /// Return once the container is started; run `wait` later
    #[arg(long = "async")]
    pub detach: bool,

    /// Log line that marks the container as ready
    #[arg(long)]
    pub wait_log: Option<String>,

    /// Readiness budget (default from settings)
    #[arg(long, value_parser = parse_timeout)]
    pub timeout: Option<Duration>,

    /// Command and arguments replacing the image default
    #[arg(long, num_args = 1.., allow_hyphen_values = true)]
    pub cmd: Vec<String>,
}

impl StartArgs {
    fn container_options(&self, wait_timeout: Duration) -> Vec<ContainerOption> {
        let mut opts: Vec<ContainerOption> = self.ports.iter().map(options::port).collect();
        opts.extend(self.env.iter().map(|(k, v)| options::env(k.clone(), v.clone())));
        if !self.cmd.is_empty() {
            opts.push(options::command(self.cmd.clone()));
        }
        if let (Some(pattern), false) = (&self.wait_log, self.detach) {
            opts.push(options::wait_for_log(pattern.clone(), wait_timeout));
        }
        opts
    }
}

/// Execute the start command.
pub async fn execute(args: StartArgs, ctx: &Context) -> anyhow::Result<()> {
    let mut state = ctx.load_state()?;
    if state.get(&args.name).is_ok() {
        return Err(CliError::AlreadyExists(args.name).into());
    }

    let harness = ctx.harness().await?;
    let wait_timeout = args.timeout.unwrap_or(ctx.settings.default_wait_timeout);
    let scope = DetachedScope::new(args.name.clone());
    let container = harness
        .new_container(&scope, &args.image, args.container_options(wait_timeout))
        .await?;

    let record = ContainerRecord {
        id: container.id().clone(),
        image: args.image.clone(),
        backend: container.backend_name().to_string(),
        created: Utc::now(),
        ports: args.ports.iter().map(|p| normalize_port(p)).collect(),
        wait_log: args.wait_log.clone(),
        ready: !args.detach,
    };
    state.insert(&args.name, record.clone())?;
    ctx.save_state(&state)?;

    if args.detach {
        output::info(&format!("Started {} without waiting; run `testbed wait {}`", args.name, args.name));
    } else {
        output::success(&format!("Started {} ({})", args.name, args.image));
    }
    output::print_value(&record, short_id(&record.id), ctx.format)
}
