//! Ps command - list recorded containers with their live state.

use clap::Args;
use serde::Serialize;
use tabled::Tabled;
use testbed_shared_types::short_id;

use super::Context;
use crate::output::print_data;
use crate::state::ContainerRecord;

/// Arguments for the ps command.
#[derive(Args, Debug)]
pub struct PsArgs {
    /// Show full container ids
    #[arg(long)]
    no_trunc: bool,
}

/// Display-friendly container row.
#[derive(Debug, Serialize, Tabled)]
pub struct ContainerRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "IMAGE")]
    image: String,
    #[tabled(rename = "BACKEND")]
    backend: String,
    #[tabled(rename = "STATE")]
    state: String,
    #[tabled(rename = "PORTS")]
    ports: String,
    #[tabled(rename = "CREATED")]
    created: String,
}

impl ContainerRow {
    fn new(name: &str, record: &ContainerRecord, state: String, no_trunc: bool) -> Self {
        let id = if no_trunc {
            record.id.clone()
        } else {
            short_id(&record.id).to_string()
        };
        Self {
            name: name.to_string(),
            id,
            image: record.image.clone(),
            backend: record.backend.clone(),
            state,
            ports: record.ports.join(","),
            created: record.created.format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }
}

/// Execute the ps command.
pub async fn execute(args: PsArgs, ctx: &Context) -> anyhow::Result<()> {
    let state = ctx.load_state()?;
    let harness = if state.is_empty() {
        None
    } else {
        Some(ctx.harness().await?)
    };

    let mut rows = Vec::new();
    for (name, record) in state.iter() {
        let live = match harness.as_ref().map(|h| h.registry().get(&record.backend)) {
            Some(Ok(backend)) => match backend.inspect_container(&record.id).await {
                Ok(info) => info.state.to_string(),
                Err(e) if e.is_not_found() => "gone".to_string(),
                Err(_) => "unknown".to_string(),
            },
            _ => "unknown".to_string(),
        };
        rows.push(ContainerRow::new(name, record, live, args.no_trunc));
    }
    print_data(&rows, ctx.format)
}
