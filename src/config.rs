use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// System-wide config location selected by `--system`.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/portkeeper/portkeeper.toml";

const APP_DIR: &str = "portkeeper";
const FALLBACK_DIR: &str = "/tmp/portkeeper";

/// What to do with a child that was spawned but never bound its port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum OrphanPolicy {
    /// Leave it running and keep the pid record so `stop` can find it.
    #[default]
    LeaveRunning,
    /// Terminate it and clear the record.
    Terminate,
}

/// Opaque command the supervisor launches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            working_dir: None,
            env: HashMap::new(),
        }
    }

    /// Shell-like rendering for log lines.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// On-disk TOML description of the managed process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_kill_confirm_ms")]
    pub kill_confirm_ms: u64,
    #[serde(default = "default_health_timeout_ms")]
    pub health_timeout_ms: u64,
    #[serde(default = "default_health_poll_interval_ms")]
    pub health_poll_interval_ms: u64,
    #[serde(default = "default_settle_timeout_ms")]
    pub settle_timeout_ms: u64,
    #[serde(default)]
    pub on_health_timeout: OrphanPolicy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid_path: Option<PathBuf>,
    pub command: CommandSpec,
}

fn default_name() -> String {
    "app".to_string()
}

fn default_port() -> u16 {
    7080
}

fn default_grace_period_ms() -> u64 {
    5_000
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_kill_confirm_ms() -> u64 {
    2_000
}

fn default_health_timeout_ms() -> u64 {
    15_000
}

fn default_health_poll_interval_ms() -> u64 {
    250
}

fn default_settle_timeout_ms() -> u64 {
    5_000
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        let port = default_port();
        Self {
            name: default_name(),
            port,
            command: CommandSpec::new(
                "uvicorn",
                [
                    "app.main:app".to_string(),
                    "--host".to_string(),
                    "0.0.0.0".to_string(),
                    "--port".to_string(),
                    port.to_string(),
                ],
            ),
            log_path: None,
            pid_path: None,
            grace_period_ms: default_grace_period_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            kill_confirm_ms: default_kill_confirm_ms(),
            health_timeout_ms: default_health_timeout_ms(),
            health_poll_interval_ms: default_health_poll_interval_ms(),
            settle_timeout_ms: default_settle_timeout_ms(),
            on_health_timeout: OrphanPolicy::default(),
        }
    }
}

impl SupervisorConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn kill_confirm(&self) -> Duration {
        Duration::from_millis(self.kill_confirm_ms)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    pub fn health_poll_interval(&self) -> Duration {
        Duration::from_millis(self.health_poll_interval_ms)
    }

    pub fn settle_timeout(&self) -> Duration {
        Duration::from_millis(self.settle_timeout_ms)
    }

    /// Log file path, explicit or `<data dir>/portkeeper/<name>.log`.
    pub fn log_path(&self) -> PathBuf {
        self.log_path.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .map(|d| d.join(APP_DIR))
                .unwrap_or_else(|| PathBuf::from(FALLBACK_DIR))
                .join(format!("{}.log", self.name))
        })
    }

    /// PID record path, explicit or `<runtime dir>/portkeeper/<name>.pid`.
    pub fn pid_path(&self) -> PathBuf {
        self.pid_path.clone().unwrap_or_else(|| {
            dirs::runtime_dir()
                .or_else(dirs::data_local_dir)
                .map(|d| d.join(APP_DIR))
                .unwrap_or_else(|| PathBuf::from(FALLBACK_DIR))
                .join(format!("{}.pid", self.name))
        })
    }

    /// Watch `port` instead of the configured one, rewriting command
    /// arguments that name the configured port so the child binds the
    /// port being watched.
    pub fn override_port(&mut self, port: u16) {
        let old = self.port.to_string();
        let new = port.to_string();
        for arg in &mut self.command.args {
            let rewritten = if *arg == old {
                Some(new.clone())
            } else {
                arg.strip_suffix(old.as_str())
                    .filter(|prefix| prefix.ends_with(['=', ':']))
                    .map(|prefix| format!("{prefix}{new}"))
            };
            if let Some(rewritten) = rewritten {
                log::info!("rewriting command argument `{arg}` to `{rewritten}`");
                *arg = rewritten;
            }
        }
        self.port = port;
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.command.program.trim().is_empty() {
            return Err(ConfigError::Invalid("`program` must not be empty".into()));
        }
        if self.port == 0 {
            return Err(ConfigError::Invalid("`port` must be non-zero".into()));
        }
        if self.poll_interval_ms == 0 || self.health_poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("poll intervals must be non-zero".into()));
        }
        if self.health_poll_interval_ms > self.health_timeout_ms {
            return Err(ConfigError::Invalid(format!(
                "health_poll_interval_ms ({}) exceeds health_timeout_ms ({})",
                self.health_poll_interval_ms, self.health_timeout_ms
            )));
        }
        if self.poll_interval_ms > self.grace_period_ms.max(self.kill_confirm_ms) {
            return Err(ConfigError::Invalid(format!(
                "poll_interval_ms ({}) exceeds both grace_period_ms and kill_confirm_ms",
                self.poll_interval_ms
            )));
        }
        Ok(())
    }
}

/// Determine config path based on CLI arguments.
pub fn resolve_config_path(explicit: Option<&Path>, use_system: bool) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    if use_system {
        return Ok(PathBuf::from(SYSTEM_CONFIG_PATH));
    }
    let config_dir = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
    Ok(config_dir.join(APP_DIR).join("portkeeper.toml"))
}

/// Load the config at `path`, writing the defaults there first if missing.
pub fn load_or_init(path: &Path) -> Result<SupervisorConfig, ConfigError> {
    if !path.exists() {
        log::info!("Config not found at {}, creating default configuration", path.display());
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let default_toml = toml::to_string_pretty(&SupervisorConfig::default())?;
        fs::write(path, default_toml).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })?;
    }

    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let cfg: SupervisorConfig = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    cfg.validate()?;
    log::debug!("Using config from: {}", path.display());
    Ok(cfg)
}
