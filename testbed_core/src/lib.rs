//! Ephemeral containers for tests.
//!
//! A [`Harness`] creates containers through a pluggable
//! [`Backend`](container_backend_interface::Backend), waits until they are
//! ready and ties their removal to a [`Scope`]. Service containers with a
//! [`DsnProvider`] hand every test its own database, so parallel tests can
//! share one server without seeing each other's data.
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use testbed_core::engines::Postgres;
//! use testbed_core::{options, run_test, Harness, TestScope};
//!
//! # async fn demo() -> testbed_core::Result<()> {
//! let harness = Harness::from_env().await?;
//! let pg = Arc::new(Postgres::new());
//!
//! run_test(TestScope::new("TestOrders"), |scope| async move {
//!     let db = harness
//!         .new_container(&scope, pg.image(), [pg.default_options()])
//!         .await?;
//!     let dsn = db.dsn(&scope).await?;
//!
//!     let cache = harness
//!         .new_container(
//!             &scope,
//!             "redis:7-alpine",
//!             [
//!                 options::port("6379"),
//!                 options::wait_for_log("Ready to accept connections", Duration::from_secs(10)),
//!             ],
//!         )
//!         .await?;
//!     let endpoint = cache.endpoint("6379").await?;
//!     println!("{dsn} {endpoint}");
//!     Ok::<(), testbed_core::TestbedError>(())
//! })
//! .await
//! # }
//! ```

pub mod container;
pub mod dsn;
pub mod engines;
pub mod gate;
pub mod harness;
pub mod logs;
pub mod options;
pub mod scope;
pub mod wait;

pub use container::Container;
pub use dsn::{database_name, CreateOutcome, DsnProvider};
pub use gate::{GatePermit, StartupGate};
pub use harness::{Harness, CLI_BACKEND_ALIASES, MOCK_BACKEND};
pub use logs::{LogFilter, LogStreamer};
pub use options::{Config, ContainerOption};
pub use scope::{run_test, CleanupAction, LogSink, Scope, ScopeExit, ScopeExt, TestScope};
pub use wait::WaitCondition;

pub use container_backend_interface::{Backend, BackendRegistry};
pub use testbed_config::Settings;
pub use testbed_shared_types::{ContainerId, ContainerInfo, ContainerSpec, ExecOutput, Result, TestbedError};
