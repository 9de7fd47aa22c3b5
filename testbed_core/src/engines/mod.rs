//! Presets for common service images.
//!
//! Each preset owns what must be shared between every container of its
//! engine (the DSN creation lock and, where the engine needs one, a startup
//! gate), so a test binary should create one preset and reuse it.

mod mysql;
mod postgres;
mod redis;

pub use mysql::Mysql;
pub use postgres::Postgres;
pub use redis::Redis;

use std::time::Duration;
use testbed_shared_types::ExecOutput;

/// Settle delay applied after admission through an engine's startup gate.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(200);

fn describe_failure(program: &str, output: &ExecOutput) -> String {
    format!(
        "{} exited with code {}: {}",
        program,
        output.exit_code,
        output.output.trim()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_failure() {
        let output = ExecOutput::new(1, "createdb: error: connection refused\n");
        assert_eq!(
            describe_failure("createdb", &output),
            "createdb exited with code 1: createdb: error: connection refused"
        );
    }
}
