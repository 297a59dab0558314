use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the config file picked up from the working directory when
/// `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "reforge.toml";

/// Top-level configuration loaded from reforge.toml.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ReforgeConfig {
    pub build: BuildConfig,
    pub run: RunConfig,
    pub watch: WatchConfig,
    pub debugger: DebuggerConfig,
    pub shutdown: ShutdownConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct BuildConfig {
    /// Compiler executable.
    pub command: String,
    /// Arguments placed right after the command (e.g. `build`).
    pub subcommand: Vec<String>,
    /// Source path handed to the compiler. Falls back to `watch.root`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,
    /// Where the compiled binary is written.
    pub output: PathBuf,
    /// Extra compiler arguments.
    pub args: Vec<String>,
    /// Flags added in debug mode to keep symbols debuggable.
    pub debug_flags: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RunConfig {
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum WatchStrategy {
    /// Native filesystem notifications.
    Notify,
    /// Periodic rescans comparing modification times.
    Poll,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct WatchConfig {
    pub root: PathBuf,
    pub extensions: Vec<String>,
    pub exclude_dirs: Vec<String>,
    pub strategy: WatchStrategy,
    pub delay_ms: u64,
    pub poll_interval_ms: u64,
    pub show_watched_files: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct DebuggerConfig {
    pub enabled: bool,
    pub command: String,
    pub listen: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ShutdownConfig {
    /// How long a stopped process gets between the soft and the hard kill.
    pub grace_ms: u64,
}

/// Errors from loading or validating the configuration.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
            ConfigError::Invalid(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid(_) => None,
        }
    }
}

/// Load the config file.
///
/// An explicitly requested file must exist. Without one, `reforge.toml` in
/// the working directory is used when present, and defaults otherwise.
pub fn load_config(explicit: Option<&Path>) -> Result<ReforgeConfig, ConfigError> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => {
            let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
            if !default_path.exists() {
                tracing::debug!("no {DEFAULT_CONFIG_FILE} found, using defaults");
                return Ok(ReforgeConfig::default());
            }
            default_path
        }
    };

    let contents = std::fs::read_to_string(&path).map_err(|e| ConfigError::Read {
        path: path.clone(),
        source: e,
    })?;
    let config = toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.clone(),
        source: e,
    })?;
    tracing::debug!(path = %path.display(), "loaded config");
    Ok(config)
}

impl ReforgeConfig {
    /// Reject settings the watch/build loop cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.build.command.trim().is_empty() {
            return Err(ConfigError::Invalid("build.command is empty".to_string()));
        }
        if crate::watcher::rules::normalize_extensions(&self.watch.extensions).is_empty() {
            return Err(ConfigError::Invalid(
                "watch.extensions must name at least one extension".to_string(),
            ));
        }
        if self.watch.delay_ms == 0 {
            return Err(ConfigError::Invalid(
                "watch.delay_ms must be greater than zero".to_string(),
            ));
        }
        if self.watch.strategy == WatchStrategy::Poll && self.watch.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "watch.poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.debugger.enabled && self.debugger.command.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "debugger.command is empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Path the compiler builds from.
    pub fn build_source(&self) -> &Path {
        self.build.source.as_deref().unwrap_or(&self.watch.root)
    }
}

impl WatchConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl ShutdownConfig {
    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }
}

// --- Default implementations ---

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            command: "go".to_string(),
            subcommand: vec!["build".to_string()],
            source: None,
            output: PathBuf::from("./bin/reforge-app"),
            args: Vec::new(),
            debug_flags: vec!["-gcflags=all=-N -l".to_string()],
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            extensions: vec![".go".to_string()],
            exclude_dirs: vec![
                "bin".to_string(),
                ".git".to_string(),
                "node_modules".to_string(),
            ],
            strategy: WatchStrategy::Notify,
            delay_ms: 200,
            poll_interval_ms: 500,
            show_watched_files: false,
        }
    }
}

impl Default for DebuggerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            command: "dlv".to_string(),
            listen: ":2345".to_string(),
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self { grace_ms: 3000 }
    }
}
