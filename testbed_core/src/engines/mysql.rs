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

/// MySQL with a database per test.
pub struct Mysql {
    image: String,
    password: String,
    lock: Mutex<()>,
    gate: StartupGate,
}

impl Mysql {
    pub const DEFAULT_IMAGE: &'static str = "mysql:8.0";
    pub const PORT: &'static str = "3306";
    pub const READY_LOG: &'static str = "ready for connections. Version";

    pub fn new() -> Self {
        Self {
            image: Self::DEFAULT_IMAGE.to_string(),
            password: "test".to_string(),
            lock: Mutex::new(()),
            gate: StartupGate::serial("mysql", DEFAULT_SETTLE_DELAY),
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

    fn client_password_arg(&self) -> String {
        format!("-p{}", self.password)
    }

    /// Server flags tuned for short-lived test instances.
    pub fn default_options(self: &Arc<Self>) -> ContainerOption {
        options::options([
            options::env("MYSQL_ROOT_PASSWORD", self.password.clone()),
            options::env("MYSQL_DATABASE", "test"),
            options::env("MYSQL_ROOT_HOST", "%"),
            options::memory_limit("512m"),
            options::command_args([
                "--character-set-server=utf8mb4",
                "--collation-server=utf8mb4_unicode_ci",
                "--log-error-verbosity=1",
                "--max-connections=200",
                "--innodb-buffer-pool-size=128M",
                "--innodb-log-file-size=64M",
                "--innodb-flush-log-at-trx-commit=2",
            ]),
            options::port(Self::PORT),
            options::wait_all(vec![
                WaitCondition::log(Self::READY_LOG, Duration::from_secs(45)),
                WaitCondition::exec(
                    [
                        "mysqladmin".to_string(),
                        "-uroot".to_string(),
                        self.client_password_arg(),
                        "-h127.0.0.1".to_string(),
                        "ping".to_string(),
                    ],
                    Duration::from_secs(15),
                ),
            ]),
            options::dsn_provider(self.clone()),
            options::startup_gate(self.gate.clone()),
        ])
    }

    async fn sql(&self, container: &Container, statement: String) -> Result<testbed_shared_types::ExecOutput> {
        container
            .exec([
                "mysql".to_string(),
                "-uroot".to_string(),
                self.client_password_arg(),
                "-e".to_string(),
                statement,
            ])
            .await
    }
}

impl Default for Mysql {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DsnProvider for Mysql {
    fn engine(&self) -> &str {
        "mysql"
    }

    fn creation_lock(&self) -> &Mutex<()> {
        &self.lock
    }

    async fn create_database(&self, container: &Container, database: &str) -> Result<CreateOutcome> {
        let output = self
            .sql(container, format!("CREATE DATABASE `{database}`"))
            .await?;
        if output.success() {
            Ok(CreateOutcome::Created)
        } else if output.output.contains("database exists") {
            Ok(CreateOutcome::AlreadyExists)
        } else {
            Ok(CreateOutcome::Transient(describe_failure("mysql", &output)))
        }
    }

    async fn drop_database(&self, container: &Container, database: &str) -> Result<()> {
        let output = self
            .sql(container, format!("DROP DATABASE IF EXISTS `{database}`"))
            .await?;
        if output.success() {
            Ok(())
        } else {
            Err(TestbedError::backend(describe_failure("mysql", &output)))
        }
    }

    async fn format_dsn(&self, container: &Container, database: &str) -> Result<String> {
        let endpoint = container.endpoint(Self::PORT).await?;
        Ok(format!("mysql://root:{}@{}/{}", self.password, endpoint, database))
    }
}
