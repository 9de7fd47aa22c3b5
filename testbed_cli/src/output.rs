//! Output formatting utilities.

use colored::Colorize;
use serde::Serialize;
use tabled::{Table, Tabled};

use crate::OutputFormat;

/// Print rows in the specified format.
pub fn print_data<T: Serialize + Tabled>(data: &[T], format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Table => {
            if data.is_empty() {
                println!("{}", "No containers.".dimmed());
            } else {
                println!("{}", Table::new(data));
            }
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(data)?),
        OutputFormat::Yaml => println!("{}", serde_yaml_ng::to_string(data)?),
    }
    Ok(())
}

/// Print a single value. Tables fall back to `fallback` so scripts reading
/// stdout get a bare value.
pub fn print_value<T: Serialize>(value: &T, fallback: &str, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Table => println!("{}", fallback),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Yaml => println!("{}", serde_yaml_ng::to_string(value)?),
    }
    Ok(())
}

pub fn success(msg: &str) {
    eprintln!("{} {}", "✓".green().bold(), msg);
}

pub fn info(msg: &str) {
    eprintln!("{} {}", "→".blue(), msg);
}

pub fn warn(msg: &str) {
    eprintln!("{} {}", "!".yellow().bold(), msg);
}

pub fn error(msg: &str) {
    eprintln!("{} {}", "✗".red().bold(), msg);
}
