use super::{describe_failure, DEFAULT_SETTLE_DELAY};
use crate::container::Container;
use crate::dsn::{CreateOutcome, DsnProvider};
use crate::gate::StartupGate;
use crate::options::{self, ContainerOption};
use crate::wait::WaitCondition;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use testbed_shared_types::{Result, TestbedError};
use tokio::sync::Mutex;

/// PostgreSQL with a database per test.
///
/// ```no_run
/// # async fn demo(harness: &testbed_core::Harness, scope: &testbed_core::TestScope) -> testbed_core::Result<()> {
/// use std::sync::Arc;
/// use testbed_core::engines::Postgres;
///
/// let pg = Arc::new(Postgres::new());
/// let container = harness.new_container(scope, pg.image(), [pg.default_options()]).await?;
/// let dsn = container.dsn(scope).await?;
/// # Ok(())
/// # }
/// ```
pub struct Postgres {
    image: String,
    user: String,
    password: String,
    database: String,
    lock: Mutex<()>,
    gate: StartupGate,
}

impl Postgres {
    pub const DEFAULT_IMAGE: &'static str = "postgres:15-alpine";
    pub const PORT: &'static str = "5432";
    pub const READY_LOG: &'static str = "database system is ready to accept connections";

    pub fn new() -> Self {
        Self {
            image: Self::DEFAULT_IMAGE.to_string(),
            user: "postgres".to_string(),
            password: "test".to_string(),
            database: "test".to_string(),
            lock: Mutex::new(()),
            gate: StartupGate::serial("postgres", DEFAULT_SETTLE_DELAY),
        }
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    pub fn with_gate(mut self, gate: StartupGate) -> Self {
        self.gate = gate;
        self
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// Environment, port, readiness checks, DSN support and the startup gate.
    pub fn default_options(self: &Arc<Self>) -> ContainerOption {
        options::options([
            options::env("POSTGRES_USER", self.user.clone()),
            options::env("POSTGRES_PASSWORD", self.password.clone()),
            options::env("POSTGRES_DB", self.database.clone()),
            options::env("POSTGRES_HOST_AUTH_METHOD", "trust"),
            options::command_args(["-c", "max_connections=100"]),
            options::port(Self::PORT),
            // The init server also logs readiness but only listens on the socket,
            // so the TCP probe is what tells the real server is up.
            options::wait_all(vec![
                WaitCondition::log(Self::READY_LOG, Duration::from_secs(20)),
                WaitCondition::exec(
                    [
                        "pg_isready",
                        "-h",
                        "127.0.0.1",
                        "-U",
                        self.user.as_str(),
                        "-d",
                        self.database.as_str(),
                    ],
                    Duration::from_secs(15),
                ),
            ]),
            options::dsn_provider(self.clone()),
            options::startup_gate(self.gate.clone()),
        ])
    }
}

impl Default for Postgres {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DsnProvider for Postgres {
    fn engine(&self) -> &str {
        "postgres"
    }

    fn creation_lock(&self) -> &Mutex<()> {
        &self.lock
    }

    async fn create_database(&self, container: &Container, database: &str) -> Result<CreateOutcome> {
        let output = container
            .exec(["createdb", "-U", self.user.as_str(), database])
            .await?;
        if output.success() {
            Ok(CreateOutcome::Created)
        } else if output.output.contains("already exists") {
            Ok(CreateOutcome::AlreadyExists)
        } else {
            Ok(CreateOutcome::Transient(describe_failure("createdb", &output)))
        }
    }

    async fn drop_database(&self, container: &Container, database: &str) -> Result<()> {
        let output = container
            .exec(["dropdb", "-U", self.user.as_str(), "--if-exists", database])
            .await?;
        if output.success() {
            Ok(())
        } else {
            Err(TestbedError::backend(describe_failure("dropdb", &output)))
        }
    }

    async fn format_dsn(&self, container: &Container, database: &str) -> Result<String> {
        let endpoint = container.endpoint(Self::PORT).await?;
        Ok(format!(
            "postgresql://{}:{}@{}/{}?sslmode=disable",
            self.user, self.password, endpoint, database
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Config;

    #[test]
    fn test_default_options() {
        let pg = Arc::new(Postgres::new().with_password("secret"));
        let config = Config::build(pg.image(), [pg.default_options()]);

        assert_eq!(config.image(), "postgres:15-alpine");
        assert_eq!(config.spec.env["POSTGRES_PASSWORD"], "secret");
        assert_eq!(config.spec.env["POSTGRES_USER"], "postgres");
        assert_eq!(config.spec.ports, vec!["5432/tcp"]);
        assert_eq!(
            config.spec.command.as_deref(),
            Some(&["-c".to_string(), "max_connections=100".to_string()][..])
        );
        assert!(config.dsn_provider.is_some());
        assert_eq!(config.startup_gate.as_ref().map(StartupGate::name), Some("postgres"));

        match config.wait {
            Some(WaitCondition::All(ref steps)) => {
                assert_eq!(steps.len(), 2);
                assert_eq!(steps[0].kind(), "log");
                assert_eq!(steps[1].kind(), "exec");
            }
            ref other => panic!("expected log then probe, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_containers_of_one_preset_share_the_gate() {
        let pg = Arc::new(Postgres::new());
        let first = Config::build(pg.image(), [pg.default_options()]);
        let second = Config::build(pg.image(), [pg.default_options()]);

        let _held = first.startup_gate.unwrap().admit().await.unwrap();
        assert_eq!(second.startup_gate.unwrap().available(), 0);
    }
}
