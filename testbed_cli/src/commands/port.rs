//! Port command - print the host port bound to a container port.

use clap::Args;
use testbed_shared_types::{normalize_port, TestbedError};

use super::Context;
use crate::error::Result;
use crate::output;

/// Arguments for the port and endpoint commands.
#[derive(Args, Debug)]
pub struct PortArgs {
    /// Container name given to `start`
    pub name: String,

    /// Container port, e.g. 5432 or 53/udp
    pub port: String,
}

/// Resolve the host port for `args.port` from a fresh inspection.
pub async fn lookup(args: &PortArgs, ctx: &Context) -> Result<u16> {
    let state = ctx.load_state()?;
    let record = state.get(&args.name)?;
    let backend = ctx.backend_for(record).await?;
    let info = backend.inspect_container(&record.id).await?;
    info.host_port(&args.port)
        .ok_or_else(|| TestbedError::PortNotMapped(normalize_port(&args.port)).into())
}

/// Execute the port command.
pub async fn execute(args: PortArgs, ctx: &Context) -> anyhow::Result<()> {
    let port = lookup(&args, ctx).await?;
    output::print_value(&port, &port.to_string(), ctx.format)
}
