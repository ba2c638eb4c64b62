//! Service configuration loaded from `demps-config.yaml`.
//!
//! Every section and field has a default, so a missing file or an empty
//! document yields a working configuration. A handful of deployment
//! settings can be overridden from the environment after parsing.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::layout::DatasetLayout;
use crate::watcher::WatchOptions;

/// Default configuration file name.
pub const CONFIG_FILE: &str = "demps-config.yaml";

/// Environment variable naming an alternative configuration file.
pub const CONFIG_ENV: &str = "DEMPS_CONFIG";

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse config YAML: {source}")]
    Yaml {
        /// The underlying YAML parse error.
        source: serde_yml::Error,
    },

    /// An environment override holds an unusable value.
    #[error("invalid value `{value}` for {var}: {reason}")]
    InvalidOverride {
        /// Variable name.
        var: &'static str,
        /// The raw value.
        value: String,
        /// Why the value was rejected.
        reason: String,
    },
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

/// Top-level service configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ServiceConfig {
    /// HTTP listener.
    #[serde(default)]
    pub server: ServerConfig,

    /// Simulator launch settings.
    #[serde(default)]
    pub simulator: SimulatorConfig,

    /// Directory watcher backend.
    #[serde(default)]
    pub watcher: WatcherConfig,

    /// Event stream behaviour.
    #[serde(default)]
    pub stream: StreamConfig,

    /// Per-dataset line layouts.
    #[serde(default)]
    pub datasets: DatasetsConfig,

    /// Directory browsing endpoints.
    #[serde(default)]
    pub files: FilesConfig,

    /// Logging output.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ServiceConfig {
    /// Load configuration from a YAML file, applying environment overrides.
    ///
    /// A missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if an existing file cannot be read,
    /// [`ConfigError::Yaml`] if its content is not valid, or
    /// [`ConfigError::InvalidOverride`] for a bad environment value.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = match std::fs::read_to_string(path) {
            Ok(contents) => Self::parse(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => return Err(e.into()),
        };
        config.apply_env_overrides(|var| std::env::var(var).ok())?;
        Ok(config)
    }

    /// Parse configuration from a YAML string. No overrides are applied.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if the string is not valid YAML.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yml::from_str(yaml)?)
    }

    /// Configuration file path: `DEMPS_CONFIG` if set, else
    /// `demps-config.yaml` in the working directory.
    pub fn default_path() -> PathBuf {
        std::env::var_os(CONFIG_ENV).map_or_else(|| PathBuf::from(CONFIG_FILE), PathBuf::from)
    }

    /// Apply `DEMPS_*` overrides, reading variables through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidOverride`] when `DEMPS_PORT` is not a
    /// port number.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("DEMPS_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("DEMPS_PORT") {
            self.server.port = match port.parse() {
                Ok(port) => port,
                Err(e) => {
                    return Err(ConfigError::InvalidOverride {
                        var: "DEMPS_PORT",
                        reason: e.to_string(),
                        value: port,
                    });
                }
            };
        }
        if let Some(directives) = lookup("DEMPS_DIRECTIVES") {
            self.simulator.directives = PathBuf::from(directives);
        }
        if let Some(executable) = lookup("DEMPS_EXEC_CMD") {
            self.simulator.executable = PathBuf::from(executable);
        }
        if let Some(root) = lookup("DEMPS_FILES_ROOT") {
            self.files.root = Some(PathBuf::from(root));
        }
        Ok(())
    }

    /// Root directory the directory endpoints may touch.
    ///
    /// Defaults to the directory containing the directives file.
    pub fn files_root(&self) -> PathBuf {
        self.files.root.clone().unwrap_or_else(|| {
            self.simulator
                .directives
                .parent()
                .filter(|parent| !parent.as_os_str().is_empty())
                .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
        })
    }
}

/// HTTP listener configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerConfig {
    /// Bind address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Simulator launch configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SimulatorConfig {
    /// Path of the run directives file.
    #[serde(default = "default_directives")]
    pub directives: PathBuf,

    /// Executable used when the directives carry no `execCmd`.
    #[serde(default = "default_executable")]
    pub executable: PathBuf,

    /// Wait between `SIGTERM` and `SIGKILL`, in milliseconds.
    #[serde(default = "default_kill_timeout_ms")]
    pub kill_timeout_ms: u64,
}

impl SimulatorConfig {
    /// Kill timeout as a [`Duration`].
    pub const fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms)
    }
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            directives: default_directives(),
            executable: default_executable(),
            kill_timeout_ms: default_kill_timeout_ms(),
        }
    }
}

/// Directory watcher configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WatcherConfig {
    /// Use the stat-polling backend (network or container filesystems).
    #[serde(default)]
    pub use_polling: bool,

    /// Poll period in milliseconds. Raised to the watcher minimum when
    /// lower.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Quiet period in milliseconds before a listed, recently modified
    /// file is reported without a close event. Zero disables it.
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
}

impl WatcherConfig {
    /// Watch options for the root watcher, which ignores existing entries.
    pub fn root_options(&self) -> WatchOptions {
        WatchOptions {
            use_polling: self.use_polling,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            settle: Duration::from_millis(self.settle_ms),
            ignore_initial: true,
            recursive: true,
        }
    }

    /// Watch options for a dataset watcher.
    pub fn dataset_options(&self, ignore_initial: bool) -> WatchOptions {
        WatchOptions {
            ignore_initial,
            ..self.root_options()
        }
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            use_polling: false,
            poll_interval_ms: default_poll_interval_ms(),
            settle_ms: default_settle_ms(),
        }
    }
}

/// Event stream configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StreamConfig {
    /// SSE keep-alive period in seconds.
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,

    /// How long dataset pipelines stay up after a successful exit, in
    /// milliseconds.
    #[serde(default = "default_drain_grace_ms")]
    pub drain_grace_ms: u64,
}

impl StreamConfig {
    /// Keep-alive period as a [`Duration`].
    pub const fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    /// Drain grace as a [`Duration`].
    pub const fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            keep_alive_secs: default_keep_alive_secs(),
            drain_grace_ms: default_drain_grace_ms(),
        }
    }
}

/// Line layouts of the streamed datasets.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DatasetsConfig {
    /// Agent snapshot layout.
    #[serde(default = "DatasetLayout::agents")]
    pub agents: DatasetLayout,

    /// Flood state layout.
    #[serde(default = "DatasetLayout::flood")]
    pub flood: DatasetLayout,
}

impl Default for DatasetsConfig {
    fn default() -> Self {
        Self {
            agents: DatasetLayout::agents(),
            flood: DatasetLayout::flood(),
        }
    }
}

/// Directory endpoint configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct FilesConfig {
    /// Root the directory endpoints are confined to.
    #[serde(default)]
    pub root: Option<PathBuf>,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format.
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_host() -> String {
    String::from("0.0.0.0")
}

const fn default_port() -> u16 {
    5173
}

fn default_directives() -> PathBuf {
    PathBuf::from("sim.ini")
}

fn default_executable() -> PathBuf {
    PathBuf::from("./run.sh")
}

const fn default_kill_timeout_ms() -> u64 {
    2000
}

const fn default_poll_interval_ms() -> u64 {
    500
}

const fn default_settle_ms() -> u64 {
    1000
}

const fn default_keep_alive_secs() -> u64 {
    10
}

const fn default_drain_grace_ms() -> u64 {
    2000
}

fn default_log_level() -> String {
    String::from("info")
}
