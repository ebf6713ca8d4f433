//! Configuration file for obexd.

use obex_core::config::{AuthConfig, NotifyConfig};
use obex_core::{EngineConfig, InstanceConfig, InstanceId, Profile};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// obexd configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Engine configuration
    #[serde(default)]
    pub engine: EngineSection,
    /// OBEX authentication
    #[serde(default)]
    pub auth: AuthSection,
    /// Notification client
    #[serde(default)]
    pub notify: NotifySection,
    /// Storage provider
    #[serde(default)]
    pub storage: StorageSection,
    /// Published service instances
    #[serde(default = "default_instances")]
    pub instances: Vec<InstanceSection>,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSection {
    /// Largest packet accepted from a client
    #[serde(default = "default_max_packet_len")]
    pub max_packet_len: u16,
    /// Seconds the application may take to answer an access request (0 waits forever)
    #[serde(default = "default_access_timeout")]
    pub access_timeout_secs: u64,
    /// Depth of the engine input queue
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

/// Authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthSection {
    /// Challenge every client
    #[serde(default)]
    pub required: bool,
    /// Client must send a user id
    #[serde(default)]
    pub user_id_required: bool,
    /// Realm shown to the user
    #[serde(skip_serializing_if = "Option::is_none")]
    pub realm: Option<String>,
    /// Shared password used to answer authentication requests
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Notification client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifySection {
    /// Seconds to wait for the notification server
    #[serde(default = "default_notify_timeout")]
    pub response_timeout_secs: u64,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSection {
    /// Directory holding suspend records
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

/// One service instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSection {
    /// Instance id (MAS instance id for message access)
    pub id: u8,
    /// `file-transfer` or `message-access`
    pub profile: Profile,
    /// Root folder
    pub root: PathBuf,
    /// Concurrent sessions
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Service name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_max_packet_len() -> u16 {
    0x7FFF
}

fn default_access_timeout() -> u64 {
    30
}

fn default_queue_depth() -> usize {
    obex_core::server::DEFAULT_QUEUE_DEPTH
}

fn default_notify_timeout() -> u64 {
    10
}

fn default_state_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("obexd/sessions")
}

fn default_max_sessions() -> usize {
    1
}

fn default_instances() -> Vec<InstanceSection> {
    vec![InstanceSection {
        id: 0,
        profile: Profile::FileTransfer,
        root: dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("obex"),
        max_sessions: 1,
        name: None,
    }]
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine: EngineSection::default(),
            auth: AuthSection::default(),
            notify: NotifySection::default(),
            storage: StorageSection::default(),
            instances: default_instances(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_packet_len: default_max_packet_len(),
            access_timeout_secs: default_access_timeout(),
            queue_depth: default_queue_depth(),
        }
    }
}

impl Default for NotifySection {
    fn default() -> Self {
        Self {
            response_timeout_secs: default_notify_timeout(),
        }
    }
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("obexd/config.toml")
    }

    /// Engine configuration derived from this file
    #[must_use]
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_packet_len: self.engine.max_packet_len,
            access_timeout: (self.engine.access_timeout_secs > 0)
                .then(|| Duration::from_secs(self.engine.access_timeout_secs)),
            auth: AuthConfig {
                required: self.auth.required,
                user_id_required: self.auth.user_id_required,
                realm: self.auth.realm.clone(),
            },
            notify: NotifyConfig {
                response_timeout: Duration::from_secs(self.notify.response_timeout_secs),
                ..NotifyConfig::default()
            },
        }
    }

    /// Instance configurations, with `root` replacing every configured root
    #[must_use]
    pub fn instance_configs(&self, root: Option<&Path>) -> Vec<InstanceConfig> {
        self.instances
            .iter()
            .map(|section| {
                let root = root.map_or_else(|| section.root.clone(), Path::to_path_buf);
                let mut config = match section.profile {
                    Profile::FileTransfer => InstanceConfig::file_transfer(root),
                    Profile::MessageAccess => {
                        InstanceConfig::message_access(section.id, root, section.max_sessions)
                    }
                };
                config.id = InstanceId(section.id);
                config.max_sessions = section.max_sessions;
                if let Some(name) = &section.name {
                    config.name.clone_from(name);
                }
                config
            })
            .collect()
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.engine_config().validate()?;

        if self.engine.queue_depth == 0 {
            anyhow::bail!("Engine queue depth must be at least 1");
        }

        if self.auth.required && self.auth.password.is_none() {
            anyhow::bail!("Authentication required but no password configured");
        }

        if self.instances.is_empty() {
            anyhow::bail!("At least one service instance must be configured");
        }

        let mut ids = HashSet::new();
        for instance in self.instance_configs(None) {
            if !ids.insert(instance.id) {
                anyhow::bail!("Duplicate instance id {}", instance.id.0);
            }
            instance.validate()?;
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }
}
