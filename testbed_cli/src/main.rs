//! testbed CLI
//!
//! Start, probe and stop named test containers from shell scripts. Names map
//! to container ids through a JSON state file, so each verb is a separate
//! process.

mod commands;
mod detached;
mod error;
mod output;
mod state;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use observability::{try_init_tracing, Level, TracingConfig};
use testbed_core::Settings;

use crate::commands::{endpoint, exec, port, ps, start, stop, sweep, wait, Context};

/// testbed CLI
#[derive(Parser)]
#[command(name = "testbed")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// State file mapping container names to ids
    #[arg(long, global = true, env = "TESTBED_STATE")]
    state: Option<PathBuf>,

    /// Backend to create containers with (overrides settings)
    #[arg(long, global = true)]
    backend: Option<String>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output format
    #[arg(long, global = true, default_value = "table")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, Default, clap::ValueEnum)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
    Yaml,
}

#[derive(Subcommand)]
enum Commands {
    /// Create and start a named container
    Start(start::StartArgs),

    /// Remove a named container
    Stop(stop::StopArgs),

    /// Run a command in a named container, exiting with its status
    Exec(exec::ExecArgs),

    /// Wait until a container started with --async is ready
    Wait(wait::WaitArgs),

    /// Print the host port bound to a container port
    Port(port::PortArgs),

    /// Print host:port for a container port
    Endpoint(port::PortArgs),

    /// List named containers
    Ps(ps::PsArgs),

    /// Remove labelled containers left behind by crashed runs
    Sweep(sweep::SweepArgs),
}

fn context(cli: &Cli) -> anyhow::Result<Context> {
    let mut settings = Settings::load()?;
    if let Some(backend) = &cli.backend {
        settings.backend = backend.clone();
    }
    settings.verbose |= cli.verbose;
    // Containers started here are meant to outlive the process; `sweep` handles leftovers.
    settings.warn_old = false;
    settings.cleanup_old = false;
    Ok(Context {
        state_path: cli.state.clone().unwrap_or_else(state::default_state_path),
        settings,
        format: cli.format,
    })
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let ctx = context(&cli)?;
    match cli.command {
        Commands::Start(args) => start::execute(args, &ctx).await?,
        Commands::Stop(args) => stop::execute(args, &ctx).await?,
        Commands::Exec(args) => return exec::execute(args, &ctx).await,
        Commands::Wait(args) => wait::execute(args, &ctx).await?,
        Commands::Port(args) => port::execute(args, &ctx).await?,
        Commands::Endpoint(args) => endpoint::execute(args, &ctx).await?,
        Commands::Ps(args) => ps::execute(args, &ctx).await?,
        Commands::Sweep(args) => sweep::execute(args, &ctx).await?,
    }
    Ok(0)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::WARN };
    try_init_tracing(TracingConfig::new("testbed").with_level(level));

    match run(cli).await {
        Ok(0) => Ok(()),
        Ok(code) => std::process::exit(code),
        Err(e) => {
            output::error(&format!("{e:#}"));
            std::process::exit(1);
        }
    }
}
