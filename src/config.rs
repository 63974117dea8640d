use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from lifecycle.toml.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct LifecycleConfig {
    pub storage: StorageConfig,
    pub shutdown: ShutdownConfig,
    pub recovery: RecoveryConfig,
    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    /// Record file name, relative to `data_dir` unless absolute.
    pub state_file: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    pub timeout_secs: f64,
    /// Bound on each collaborator call. Unset means only the overall deadline applies.
    pub step_timeout_secs: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub recent_window_secs: u64,
    pub arm_crash_marker: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub tick_interval_secs: u64,
}

// --- Default implementations ---

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".agent"),
            state_file: PathBuf::from("shutdown_state.json"),
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30.0,
            step_timeout_secs: None,
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            recent_window_secs: 300,
            arm_crash_marker: true,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 5,
        }
    }
}

impl ShutdownConfig {
    /// Overall deadline. Out-of-range values saturate; `validate` rejects them.
    pub fn timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.timeout_secs).unwrap_or(Duration::MAX)
    }

    pub fn step_timeout(&self) -> Option<Duration> {
        self.step_timeout_secs
            .map(|secs| Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX))
    }
}

impl RecoveryConfig {
    pub fn recent_window(&self) -> Duration {
        Duration::from_secs(self.recent_window_secs)
    }
}

impl AgentConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }
}

impl LifecycleConfig {
    /// Resolved location of the shutdown record.
    pub fn state_path(&self) -> PathBuf {
        if self.storage.state_file.is_absolute() {
            self.storage.state_file.clone()
        } else {
            self.storage.data_dir.join(&self.storage.state_file)
        }
    }

    /// Reject values that would make the shutdown sequence meaningless.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let timeout = self.shutdown.timeout_secs;
        if timeout <= 0.0 || Duration::try_from_secs_f64(timeout).is_err() {
            return Err(ConfigError::Invalid(format!(
                "shutdown.timeout_secs must be a positive number of seconds, got {timeout}"
            )));
        }
        if let Some(step) = self.shutdown.step_timeout_secs {
            if step <= 0.0 || Duration::try_from_secs_f64(step).is_err() {
                return Err(ConfigError::Invalid(format!(
                    "shutdown.step_timeout_secs must be a positive number of seconds, got {step}"
                )));
            }
            if step >= timeout {
                return Err(ConfigError::Invalid(format!(
                    "shutdown.step_timeout_secs ({step}) must be below shutdown.timeout_secs ({timeout})"
                )));
            }
        }
        if self.storage.state_file.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(
                "storage.state_file must not be empty".to_string(),
            ));
        }
        if self.agent.tick_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "agent.tick_interval_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Load config from `path`. A missing file yields the defaults.
pub fn load(path: &Path) -> Result<LifecycleConfig, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(LifecycleConfig::default());
        }
        Err(e) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };

    let config: LifecycleConfig = toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })?;
    config.validate()?;
    Ok(config)
}

/// Errors from loading or validating the config file.
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
                write!(f, "failed to read config {}: {source}", path.display())
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {source}", path.display())
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
