use crate::signals::parse_signal;
use nix::sys::signal::Signal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::path::{Path, PathBuf};

pub const DEFAULT_LOG_LEVEL: LogLevel = LogLevel::Info;
pub const DEFAULT_RELOAD_SIGNAL: Signal = Signal::SIGHUP;
pub const DEFAULT_KILL_SIGNAL: Signal = Signal::SIGINT;

/// Environment variable consulted for the default log level.
pub const LOG_LEVEL_ENV: &str = "LOG_LEVEL";

/// Log verbosity accepted on the command line, in config files and in `LOG_LEVEL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARN" | "WARNING" => Ok(LogLevel::Warn),
            "ERROR" | "ERR" => Ok(LogLevel::Error),
            _ => Err(format!(
                "invalid log level {:?} (expected DEBUG, INFO, WARN or ERROR)",
                s
            )),
        }
    }
}

impl Serialize for LogLevel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for LogLevel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Supervisor configuration.
///
/// Every field is optional until [`Config::finalize`] fills the gaps with
/// defaults. An unset field means "not specified by this layer", which is
/// what lets [`Config::merge`] stack defaults, config files and command-line
/// flags on top of each other.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub log_level: Option<LogLevel>,
    /// Empty path disables the PID file.
    pub pid_file: Option<PathBuf>,
    #[serde(
        serialize_with = "serialize_signal",
        deserialize_with = "deserialize_signal"
    )]
    pub reload_signal: Option<Signal>,
    #[serde(
        serialize_with = "serialize_signal",
        deserialize_with = "deserialize_signal"
    )]
    pub kill_signal: Option<Signal>,
    /// Config files layered under the command line, in order.
    #[serde(skip)]
    pub config_paths: Vec<PathBuf>,
}

/// Errors raised while resolving a configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// A config file could not be read.
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    /// A config file is not valid TOML for [`Config`].
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    /// The logging filter could not be swapped.
    Logging {
        source: tracing_subscriber::reload::Error,
    },
    /// A configured signal could not be registered.
    Signals { source: std::io::Error },
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
            ConfigError::Logging { source } => {
                write!(f, "failed to reconfigure logging: {}", source)
            }
            ConfigError::Signals { source } => {
                write!(f, "failed to register signal handlers: {}", source)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Logging { source } => Some(source),
            ConfigError::Signals { source } => Some(source),
        }
    }
}

impl Config {
    /// A configuration with only the log level populated, taken from
    /// `LOG_LEVEL` when set and otherwise [`DEFAULT_LOG_LEVEL`].
    pub fn with_env_defaults() -> Self {
        Self {
            log_level: Some(log_level_from_env(std::env::var(LOG_LEVEL_ENV).ok())),
            ..Default::default()
        }
    }

    /// Fill every unset field with its default. Calling it again is a no-op.
    pub fn finalize(&mut self) {
        if self.kill_signal.is_none() {
            self.kill_signal = Some(DEFAULT_KILL_SIGNAL);
        }
        if self.log_level.is_none() {
            self.log_level = Some(log_level_from_env(std::env::var(LOG_LEVEL_ENV).ok()));
        }
        if self.pid_file.is_none() {
            self.pid_file = Some(PathBuf::new());
        }
        if self.reload_signal.is_none() {
            self.reload_signal = Some(DEFAULT_RELOAD_SIGNAL);
        }
    }

    /// Right-biased merge: fields set in `other` win, unset ones fall back to `self`.
    pub fn merge(&self, other: &Config) -> Config {
        let mut merged = self.clone();
        if other.log_level.is_some() {
            merged.log_level = other.log_level;
        }
        if other.pid_file.is_some() {
            merged.pid_file = other.pid_file.clone();
        }
        if other.reload_signal.is_some() {
            merged.reload_signal = other.reload_signal;
        }
        if other.kill_signal.is_some() {
            merged.kill_signal = other.kill_signal;
        }
        if !other.config_paths.is_empty() {
            merged.config_paths = other.config_paths.clone();
        }
        merged
    }

    /// [`Config::merge`] over possibly absent configurations.
    #[allow(dead_code)]
    pub fn merge_optional(base: Option<&Config>, other: Option<&Config>) -> Option<Config> {
        match (base, other) {
            (None, None) => None,
            (None, Some(other)) => Some(other.clone()),
            (Some(base), None) => Some(base.clone()),
            (Some(base), Some(other)) => Some(base.merge(other)),
        }
    }

    /// Read a TOML config file.
    pub fn from_file(path: &Path) -> Result<Config, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    pub fn log_level(&self) -> LogLevel {
        self.log_level.unwrap_or(DEFAULT_LOG_LEVEL)
    }

    /// The PID file path, or `None` when disabled.
    pub fn pid_file(&self) -> Option<&Path> {
        self.pid_file
            .as_deref()
            .filter(|path| !path.as_os_str().is_empty())
    }

    pub fn reload_signal(&self) -> Signal {
        self.reload_signal.unwrap_or(DEFAULT_RELOAD_SIGNAL)
    }

    pub fn kill_signal(&self) -> Signal {
        self.kill_signal.unwrap_or(DEFAULT_KILL_SIGNAL)
    }
}

/// Resolve the effective configuration for one (re)start.
///
/// Layers, lowest first: environment defaults, each config file named in
/// `base.config_paths`, then `base` itself. The result is finalized. Files
/// are read again on every call.
pub fn resolve(base: &Config) -> Result<Config, ConfigError> {
    let mut resolved = Config::with_env_defaults();
    for path in &base.config_paths {
        let layer = Config::from_file(path)?;
        tracing::debug!(path = %path.display(), "loaded config file");
        resolved = resolved.merge(&layer);
    }
    let mut resolved = resolved.merge(base);
    resolved.finalize();
    Ok(resolved)
}

fn log_level_from_env(value: Option<String>) -> LogLevel {
    match value {
        Some(raw) if !raw.trim().is_empty() => raw.parse().unwrap_or(DEFAULT_LOG_LEVEL),
        _ => DEFAULT_LOG_LEVEL,
    }
}

fn serialize_signal<S: Serializer>(
    signal: &Option<Signal>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match signal {
        Some(signal) => serializer.serialize_some(signal.as_str()),
        None => serializer.serialize_none(),
    }
}

fn deserialize_signal<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Signal>, D::Error> {
    let raw = Option::<String>::deserialize(deserializer)?;
    raw.map(|name| parse_signal(&name).map_err(serde::de::Error::custom))
        .transpose()
}
