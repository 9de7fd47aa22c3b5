//! Backend implementations for the testbed.
//!
//! - `MockBackend`: in-memory simulation for tests (requires `mock-backend` feature)
//! - `CliBackend`: drives a docker-compatible CLI such as `docker`, `podman`
//!   or `nerdctl` (requires `cli-backend` feature)

#[cfg(feature = "mock-backend")]
pub mod mock;

#[cfg(feature = "cli-backend")]
pub mod cli;

pub use container_backend_interface::{Backend, BackendRegistry, LogStream};

#[cfg(feature = "mock-backend")]
pub use mock::{ExecHandler, MockBackend};

#[cfg(feature = "cli-backend")]
pub use cli::{CliBackend, CliBackendConfig, CliBackendError, StaleContainer};
