//! Settings for the testbed harness.
//!
//! # Configuration Location
//!
//! Settings are read from `~/.config/testbed/settings.toml` (or the file named
//! by `TESTBED_CONFIG`) and overridden by `TESTBED_*` environment variables.
//!
//! # Example
//!
//! ```no_run
//! use testbed_config::Settings;
//!
//! let settings = Settings::load()?;
//! if settings.keep_failed {
//!     println!("containers of failed tests are kept");
//! }
//! # Ok::<(), testbed_config::ConfigError>(())
//! ```

mod error;
pub mod paths;
pub mod settings;

pub use error::{ConfigError, Result};
pub use paths::ConfigPaths;
pub use settings::{format_duration, parse_duration, Settings};

/// Application name used for XDG paths
pub const APP_NAME: &str = "testbed";
