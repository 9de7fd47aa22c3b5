//! Endpoint command - print `host:port` for a container port.

use testbed_shared_types::LOCALHOST;

use super::port::{lookup, PortArgs};
use super::Context;
use crate::output;

/// Execute the endpoint command.
pub async fn execute(args: PortArgs, ctx: &Context) -> anyhow::Result<()> {
    let endpoint = format!("{}:{}", LOCALHOST, lookup(&args, ctx).await?);
    output::print_value(&endpoint, &endpoint, ctx.format)
}
