use std::{env, fmt, fs, path, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::database::models::Tenant;

const MIN_TTL_MINUTES: u64 = 1;
const MAX_TTL_MINUTES: u64 = 525_600;
const MIN_SWEEP_INTERVAL: u64 = 10;
const MAX_SWEEP_INTERVAL: u64 = 86_400;
const MIN_CHANNEL_TIMEOUT: u64 = 1;
const MAX_CHANNEL_TIMEOUT: u64 = 300;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    ReadFailed { path: path::PathBuf, source: std::io::Error },
    #[error("failed to write config {path}: {source}")]
    WriteFailed { path: path::PathBuf, source: std::io::Error },
    #[error("failed to parse config: {0}")]
    ParseFailed(#[from] toml::de::Error),
    #[error("failed to serialize config: {0}")]
    SerializeFailed(#[from] toml::ser::Error),
    #[error("no config directory available (set XDG_CONFIG_HOME or HOME)")]
    ConfigPathUnavailable,
    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub trust: TrustConfig,
    pub sweeper: SweeperConfig,
    pub channel: ChannelConfig,
    /// Enforcement target used for callers without an account.
    pub default_tenant: Option<DefaultTenant>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustConfig {
    pub ttl_minutes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweeperConfig {
    pub interval_seconds: u64,
    /// Keep rows whose remote untrust failed so the next run retries them.
    pub retain_failed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub ssh_binary: String,
    pub timeout_seconds: u64,
    pub command_prefix: String,
    pub success_marker: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultTenant {
    pub name: String,
    pub host: String,
    pub channel_user: String,
    pub credential_reference: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: "trustgate.db".into() }
    }
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self { ttl_minutes: 120 }
    }
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self { interval_seconds: 600, retain_failed: true }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            ssh_binary: "ssh".into(),
            timeout_seconds: 20,
            command_prefix: "fwconsole".into(),
            success_marker: "Success".into(),
        }
    }
}

impl TrustConfig {
    /// Trust lifetime, clamped to the range `validate()` accepts.
    pub fn ttl(&self) -> chrono::Duration {
        let minutes = self.ttl_minutes.clamp(MIN_TTL_MINUTES, MAX_TTL_MINUTES);
        i64::try_from(minutes)
            .ok()
            .and_then(chrono::Duration::try_minutes)
            .unwrap_or_else(|| chrono::Duration::days(365))
    }
}

impl SweeperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }
}

impl ChannelConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

impl DefaultTenant {
    pub fn to_tenant(&self) -> Tenant {
        Tenant {
            id: None,
            name: self.name.clone(),
            host: self.host.clone(),
            channel_user: self.channel_user.clone(),
            credential_reference: self.credential_reference.clone(),
        }
    }
}

/// Used to ensure we are actually reading a toml file
fn normalize_toml_path(path: &path::Path) -> path::PathBuf {
    let mut path = path.to_path_buf();
    if path.extension().map(|ext| ext != "toml").unwrap_or(true) {
        path.set_extension("toml");
    }
    path
}

/// Get default config path ($XDG_CONFIG_HOME/trustgate/config.toml or
/// $HOME/.config/...)
fn default_config_path() -> Result<path::PathBuf, ConfigError> {
    let path = if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
        path::PathBuf::from(config_home)
    } else if let Some(home_dir) = env::home_dir() {
        home_dir.join(".config")
    } else {
        return Err(ConfigError::ConfigPathUnavailable);
    };

    Ok(path.join("trustgate/config.toml"))
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let write_indented = |level: usize| {
            move |f: &mut fmt::Formatter<'_>, label: &str, value: &dyn fmt::Display| {
                writeln!(f, "  {:indent$}{}: {}", "", label, value, indent = level * 2)
            }
        };
        let write_title_indented = |level: usize| {
            move |f: &mut fmt::Formatter<'_>, label: &str| {
                writeln!(f, "{:indent$}{}", "", label, indent = level * 2)
            }
        };

        let write_title_1 = write_title_indented(1);
        let write_1 = write_indented(1);

        writeln!(f, "Current Internal Configuration State:")?;
        write_title_1(f, "Database")?;
        write_1(f, "Path", &self.database.path)?;
        write_title_1(f, "Trust")?;
        write_1(f, "TTL (minutes)", &self.trust.ttl_minutes)?;
        write_title_1(f, "Sweeper")?;
        write_1(f, "Interval (seconds)", &self.sweeper.interval_seconds)?;
        write_1(f, "Retain Failed", &self.sweeper.retain_failed)?;
        write_title_1(f, "Channel")?;
        write_1(f, "SSH Binary", &self.channel.ssh_binary)?;
        write_1(f, "Timeout (seconds)", &self.channel.timeout_seconds)?;
        write_1(f, "Command Prefix", &self.channel.command_prefix)?;
        write_1(f, "Success Marker", &self.channel.success_marker)?;
        write_title_1(f, "Default Tenant")?;
        match &self.default_tenant {
            Some(tenant) => {
                write_1(f, "Name", &tenant.name)?;
                write_1(f, "Host", &tenant.host)?;
                write_1(f, "User", &tenant.channel_user)?;
            }
            None => write_1(f, "Name", &"<none>")?,
        }

        Ok(())
    }
}

impl Config {
    /// Generate Config structure from file
    ///
    /// Creates a default config in ~/.config/trustgate/config.toml
    ///  or the specified path, with the name config.toml if one does not exist
    ///
    /// ```rust,ignore
    /// let cfg = config::Config::from_config(None::<&path::Path>)?;
    /// println!("{}", cfg);
    /// ```
    pub fn from_config(optional_path: Option<impl AsRef<path::Path>>) -> Result<Self, ConfigError> {
        let config_path: path::PathBuf = if let Some(path) = optional_path {
            normalize_toml_path(path.as_ref())
        } else {
            default_config_path()?
        };

        let config = if config_path.exists() {
            let raw_string = fs::read_to_string(&config_path)
                .map_err(|source| ConfigError::ReadFailed { path: config_path.clone(), source })?;
            toml::from_str(raw_string.as_str())?
        } else {
            let config = Self::default();
            config.write_config(&config_path)?;
            config
        };

        config.validate()?;
        Ok(config)
    }

    /// Serialize and write a config to a file
    pub fn write_config(&self, path: &path::Path) -> Result<(), ConfigError> {
        let config_str: String = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|source| ConfigError::WriteFailed { path: parent.to_path_buf(), source })?;
        }

        fs::write(path, config_str)
            .map_err(|source| ConfigError::WriteFailed { path: path.to_path_buf(), source })
    }

    /// Reject values the service cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let ttl = self.trust.ttl_minutes;
        if !(MIN_TTL_MINUTES..=MAX_TTL_MINUTES).contains(&ttl) {
            return Err(ConfigError::Invalid {
                field: "trust.ttl_minutes",
                reason: format!("{ttl} is outside {MIN_TTL_MINUTES}..={MAX_TTL_MINUTES}"),
            });
        }

        let interval = self.sweeper.interval_seconds;
        if !(MIN_SWEEP_INTERVAL..=MAX_SWEEP_INTERVAL).contains(&interval) {
            return Err(ConfigError::Invalid {
                field: "sweeper.interval_seconds",
                reason: format!(
                    "{interval} is outside {MIN_SWEEP_INTERVAL}..={MAX_SWEEP_INTERVAL}"
                ),
            });
        }

        let timeout = self.channel.timeout_seconds;
        if !(MIN_CHANNEL_TIMEOUT..=MAX_CHANNEL_TIMEOUT).contains(&timeout) {
            return Err(ConfigError::Invalid {
                field: "channel.timeout_seconds",
                reason: format!(
                    "{timeout} is outside {MIN_CHANNEL_TIMEOUT}..={MAX_CHANNEL_TIMEOUT}"
                ),
            });
        }

        if self.channel.success_marker.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "channel.success_marker",
                reason: "must not be empty".into(),
            });
        }

        if let Some(tenant) = &self.default_tenant {
            if tenant.host.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    field: "default_tenant.host",
                    reason: "must not be empty".into(),
                });
            }
        }

        Ok(())
    }
}
