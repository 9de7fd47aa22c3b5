//! Container options.
//!
//! An option is a function applied to a [`Config`] under construction.
//! Options are applied in the order given:
//!
//! * scalar fields (command override, memory and CPU limits, wait condition,
//!   log filter, DSN provider, backend, network, user, working directory,
//!   startup timeout, startup gate, post-start hook) take the value of the
//!   last option that sets them;
//! * list and map fields (ports, mounts, labels, copied files, appended
//!   command arguments) accumulate, and a repeated env or label key keeps its
//!   last value.
//!
//! ```
//! use std::time::Duration;
//! use testbed_core::options::{self, Config};
//!
//! let config = Config::build("redis:7-alpine", [
//!     options::port("6379"),
//!     options::env("A", "1"),
//!     options::env("A", "2"),
//!     options::wait_for_log("Ready to accept connections", Duration::from_secs(10)),
//! ]);
//! assert_eq!(config.spec.env["A"], "2");
//! assert_eq!(config.spec.ports, vec!["6379/tcp"]);
//! ```

use crate::container::Container;
use crate::dsn::DsnProvider;
use crate::gate::StartupGate;
use crate::logs::LogFilter;
use crate::wait::WaitCondition;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use testbed_shared_types::{normalize_port, ContainerSpec, FileCopy, Mount, Result};

/// Runs once the container is ready, before it is handed to the test.
pub type PostStartHook = Arc<dyn Fn(Container) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Everything the harness needs to create one container.
#[derive(Clone)]
pub struct Config {
    /// The backend-facing part of the request.
    pub spec: ContainerSpec,
    pub wait: Option<WaitCondition>,
    /// Overall budget for evaluating `wait`.
    pub startup_timeout: Option<Duration>,
    pub log_filter: LogFilter,
    pub stream_logs: bool,
    pub dsn_provider: Option<Arc<dyn DsnProvider>>,
    /// Registry name; `None` selects the default backend.
    pub backend: Option<String>,
    pub startup_gate: Option<StartupGate>,
    /// Written into the container after start, in order.
    pub files: Vec<FileCopy>,
    pub post_start: Option<PostStartHook>,
}

impl Config {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            spec: ContainerSpec::new(image),
            wait: None,
            startup_timeout: None,
            log_filter: LogFilter::default(),
            stream_logs: false,
            dsn_provider: None,
            backend: None,
            startup_gate: None,
            files: Vec::new(),
            post_start: None,
        }
    }

    /// Fold `options` over a fresh config, in order.
    pub fn build<I>(image: impl Into<String>, options: I) -> Self
    where
        I: IntoIterator<Item = ContainerOption>,
    {
        let mut config = Self::new(image);
        for option in options {
            option.apply(&mut config);
        }
        config
    }

    pub fn image(&self) -> &str {
        &self.spec.image
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("spec", &self.spec)
            .field("wait", &self.wait)
            .field("startup_timeout", &self.startup_timeout)
            .field("stream_logs", &self.stream_logs)
            .field("dsn_provider", &self.dsn_provider.as_ref().map(|p| p.engine()))
            .field("backend", &self.backend)
            .field("startup_gate", &self.startup_gate.as_ref().map(StartupGate::name))
            .field("files", &self.files.iter().map(|f| &f.target).collect::<Vec<_>>())
            .field("post_start", &self.post_start.is_some())
            .finish()
    }
}

/// A single configuration step. Cheap to clone.
#[derive(Clone)]
pub struct ContainerOption(Arc<dyn Fn(&mut Config) + Send + Sync>);

impl ContainerOption {
    pub fn new<F>(apply: F) -> Self
    where
        F: Fn(&mut Config) + Send + Sync + 'static,
    {
        Self(Arc::new(apply))
    }

    pub fn apply(&self, config: &mut Config) {
        (self.0)(config)
    }
}

impl fmt::Debug for ContainerOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ContainerOption(..)")
    }
}

fn strings<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

pub fn env(key: impl Into<String>, value: impl Into<String>) -> ContainerOption {
    let (key, value) = (key.into(), value.into());
    ContainerOption::new(move |c| {
        c.spec.env.insert(key.clone(), value.clone());
    })
}

/// Publish a container port (`"5432"` or `"53/udp"`) on a random host port.
pub fn port(port: impl AsRef<str>) -> ContainerOption {
    let port = normalize_port(port.as_ref());
    ContainerOption::new(move |c| {
        if !c.spec.ports.contains(&port) {
            c.spec.ports.push(port.clone());
        }
    })
}

/// Replace the image's command.
pub fn command<I, S>(argv: I) -> ContainerOption
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let argv = strings(argv);
    ContainerOption::new(move |c| c.spec.command = Some(argv.clone()))
}

/// Append arguments to the command, starting one if none is set.
pub fn command_args<I, S>(args: I) -> ContainerOption
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let args = strings(args);
    ContainerOption::new(move |c| {
        c.spec
            .command
            .get_or_insert_with(Vec::new)
            .extend(args.iter().cloned())
    })
}

pub fn mount(host_path: impl Into<String>, container_path: impl Into<String>) -> ContainerOption {
    mount_with(host_path.into(), container_path.into(), false)
}

pub fn mount_read_only(
    host_path: impl Into<String>,
    container_path: impl Into<String>,
) -> ContainerOption {
    mount_with(host_path.into(), container_path.into(), true)
}

fn mount_with(host_path: String, container_path: String, read_only: bool) -> ContainerOption {
    ContainerOption::new(move |c| {
        c.spec.mounts.push(Mount {
            host_path: host_path.clone(),
            container_path: container_path.clone(),
            read_only,
        })
    })
}

/// Memory limit in the runtime's notation, e.g. `"512m"`.
pub fn memory_limit(limit: impl Into<String>) -> ContainerOption {
    let limit = limit.into();
    ContainerOption::new(move |c| c.spec.memory_limit = Some(limit.clone()))
}

/// CPU limit in the runtime's notation, e.g. `"0.5"`.
pub fn cpus(limit: impl Into<String>) -> ContainerOption {
    let limit = limit.into();
    ContainerOption::new(move |c| c.spec.cpus = Some(limit.clone()))
}

pub fn label(key: impl Into<String>, value: impl Into<String>) -> ContainerOption {
    let (key, value) = (key.into(), value.into());
    ContainerOption::new(move |c| {
        c.spec.labels.insert(key.clone(), value.clone());
    })
}

pub fn network(name: impl Into<String>) -> ContainerOption {
    let name = name.into();
    ContainerOption::new(move |c| c.spec.network = Some(name.clone()))
}

pub fn user(user: impl Into<String>) -> ContainerOption {
    let user = user.into();
    ContainerOption::new(move |c| c.spec.user = Some(user.clone()))
}

pub fn working_dir(dir: impl Into<String>) -> ContainerOption {
    let dir = dir.into();
    ContainerOption::new(move |c| c.spec.working_dir = Some(dir.clone()))
}

pub fn privileged() -> ContainerOption {
    ContainerOption::new(|c| c.spec.privileged = true)
}

pub fn wait(condition: WaitCondition) -> ContainerOption {
    ContainerOption::new(move |c| c.wait = Some(condition.clone()))
}

pub fn wait_for_log(pattern: impl Into<String>, timeout: Duration) -> ContainerOption {
    wait(WaitCondition::log(pattern, timeout))
}

pub fn wait_for_exec<I, S>(command: I, timeout: Duration) -> ContainerOption
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    wait(WaitCondition::exec(command, timeout))
}

/// Wait for every condition in turn.
pub fn wait_all(conditions: Vec<WaitCondition>) -> ContainerOption {
    wait(WaitCondition::All(conditions))
}

pub fn startup_timeout(timeout: Duration) -> ContainerOption {
    ContainerOption::new(move |c| c.startup_timeout = Some(timeout))
}

/// Stream container output, keeping lines accepted by `filter`.
pub fn log_filter(filter: LogFilter) -> ContainerOption {
    ContainerOption::new(move |c| {
        c.log_filter = filter.clone();
        c.stream_logs = true;
    })
}

/// Stream container output into the test log (visible in verbose mode).
pub fn with_logs() -> ContainerOption {
    ContainerOption::new(|c| c.stream_logs = true)
}

pub fn dsn_provider(provider: Arc<dyn DsnProvider>) -> ContainerOption {
    ContainerOption::new(move |c| c.dsn_provider = Some(provider.clone()))
}

/// Create the container through the named backend instead of the default.
pub fn backend(name: impl Into<String>) -> ContainerOption {
    let name = name.into();
    ContainerOption::new(move |c| c.backend = Some(name.clone()))
}

pub fn startup_gate(gate: StartupGate) -> ContainerOption {
    ContainerOption::new(move |c| c.startup_gate = Some(gate.clone()))
}

fn copy(file: FileCopy) -> ContainerOption {
    ContainerOption::new(move |c| c.files.push(file.clone()))
}

/// Copy a host file into the container after it starts, mode 0644.
pub fn copy_file(source: impl Into<PathBuf>, target: impl Into<String>) -> ContainerOption {
    copy(FileCopy::from_path(source, target))
}

pub fn copy_file_with_mode(
    source: impl Into<PathBuf>,
    target: impl Into<String>,
    mode: u32,
) -> ContainerOption {
    copy(FileCopy::from_path(source, target).with_mode(mode))
}

/// Write `content` to `target` inside the container after it starts.
pub fn copy_content(content: impl Into<Vec<u8>>, target: impl Into<String>, mode: u32) -> ContainerOption {
    copy(FileCopy::from_content(content, target, mode))
}

pub fn copy_string(content: impl Into<String>, target: impl Into<String>, mode: u32) -> ContainerOption {
    copy_content(content.into().into_bytes(), target, mode)
}

/// Run `hook` on the ready container. An error fails the creation.
pub fn post_start<F, Fut>(hook: F) -> ContainerOption
where
    F: Fn(Container) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let hook: PostStartHook = Arc::new(move |container| hook(container).boxed());
    ContainerOption::new(move |c| c.post_start = Some(hook.clone()))
}

/// Apply several options as one, in order.
pub fn options<I>(options: I) -> ContainerOption
where
    I: IntoIterator<Item = ContainerOption>,
{
    let options: Vec<ContainerOption> = options.into_iter().collect();
    ContainerOption::new(move |c| {
        for option in &options {
            option.apply(c);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalars_last_writer_wins() {
        let config = Config::build(
            "postgres:15-alpine",
            [
                command(["sleep", "1"]),
                memory_limit("256m"),
                backend("docker"),
                command(["sleep", "infinity"]),
                memory_limit("512m"),
                cpus("0.5"),
                cpus("2"),
                backend("mock"),
                wait_for_log("first", Duration::from_secs(1)),
                wait_for_exec(["true"], Duration::from_secs(2)),
            ],
        );
        assert_eq!(
            config.spec.command,
            Some(vec!["sleep".to_string(), "infinity".to_string()])
        );
        assert_eq!(config.spec.memory_limit.as_deref(), Some("512m"));
        assert_eq!(config.spec.cpus.as_deref(), Some("2"));
        assert_eq!(config.backend.as_deref(), Some("mock"));
        assert_eq!(config.wait, Some(WaitCondition::exec(["true"], Duration::from_secs(2))));
    }

    #[test]
    fn test_lists_append() {
        let config = Config::build(
            "mysql:8.0",
            [
                port("3306"),
                port("33060/tcp"),
                port("3306/tcp"),
                mount("/tmp/a", "/a"),
                mount_read_only("/tmp/b", "/b"),
                command_args(["--max-connections=200"]),
                command_args(["--innodb-flush-log-at-trx-commit=2"]),
                label("team", "db"),
                env("MYSQL_ROOT_PASSWORD", "test"),
            ],
        );
        assert_eq!(config.spec.ports, vec!["3306/tcp", "33060/tcp"]);
        assert_eq!(config.spec.mounts.len(), 2);
        assert!(config.spec.mounts[1].read_only);
        assert_eq!(
            config.spec.command,
            Some(vec![
                "--max-connections=200".to_string(),
                "--innodb-flush-log-at-trx-commit=2".to_string()
            ])
        );
        assert_eq!(config.spec.labels["team"], "db");
        assert_eq!(config.spec.env["MYSQL_ROOT_PASSWORD"], "test");
    }

    #[test]
    fn test_copied_files_accumulate() {
        let config = Config::build(
            "postgres:15-alpine",
            [
                copy_file("schema.sql", "/docker-entrypoint-initdb.d/schema.sql"),
                copy_file_with_mode("run.sh", "/usr/local/bin/run.sh", 0o755),
                copy_string("key=value\n", "/etc/app.conf", 0o600),
            ],
        );
        let targets: Vec<&str> = config.files.iter().map(|f| f.target.as_str()).collect();
        assert_eq!(
            targets,
            vec!["/docker-entrypoint-initdb.d/schema.sql", "/usr/local/bin/run.sh", "/etc/app.conf"]
        );
        assert_eq!(config.files[0].mode, 0o644);
        assert_eq!(config.files[1].mode, 0o755);
        assert_eq!(
            config.files[2],
            FileCopy::from_content(b"key=value\n".to_vec(), "/etc/app.conf", 0o600)
        );
    }

    #[test]
    fn test_post_start_last_writer_wins() {
        let config = Config::new("alpine:3");
        assert!(config.post_start.is_none());
        let config = Config::build(
            "alpine:3",
            [
                post_start(|_| async { Ok(()) }),
                post_start(|c| async move { c.exec(["true"]).await.map(|_| ()) }),
            ],
        );
        assert!(config.post_start.is_some());
    }

    #[test]
    fn test_user_options_override_combined_defaults() {
        let defaults = options([env("POSTGRES_PASSWORD", "test"), port("5432")]);
        let config = Config::build(
            "postgres:15-alpine",
            [defaults, env("POSTGRES_PASSWORD", "secret"), user("postgres")],
        );
        assert_eq!(config.spec.env["POSTGRES_PASSWORD"], "secret");
        assert_eq!(config.spec.ports, vec!["5432/tcp"]);
        assert_eq!(config.spec.user.as_deref(), Some("postgres"));
    }

    #[test]
    fn test_log_options() {
        let config = Config::build("alpine:3", [with_logs()]);
        assert!(config.stream_logs);
        assert!(config.log_filter.keeps("anything"));

        let config = Config::build(
            "alpine:3",
            [log_filter(LogFilter::drop_matching(["noise"]))],
        );
        assert!(config.stream_logs);
        assert!(!config.log_filter.keeps("noise here"));
    }

    #[test]
    fn test_misc_scalars() {
        let gate = StartupGate::serial("pg", Duration::ZERO);
        let config = Config::build(
            "alpine:3",
            [
                network("bridge"),
                working_dir("/work"),
                privileged(),
                startup_timeout(Duration::from_secs(90)),
                startup_gate(gate),
            ],
        );
        assert_eq!(config.image(), "alpine:3");
        assert_eq!(config.spec.network.as_deref(), Some("bridge"));
        assert_eq!(config.spec.working_dir.as_deref(), Some("/work"));
        assert!(config.spec.privileged);
        assert_eq!(config.startup_timeout, Some(Duration::from_secs(90)));
        assert_eq!(config.startup_gate.as_ref().map(|g| g.name()), Some("pg"));
    }
}
