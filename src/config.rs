use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, info};

/// Application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Environment (dev, staging, prod)
    #[serde(default = "default_environment")]
    pub environment: String,

    /// CORS allowed origins
    pub cors_origins: Option<String>,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    // Cloud service identifiers
    #[serde(default = "default_service_name")]
    pub cloud_service_name: String,
    pub cloud_pod: Option<String>,

    /// JWT secret key
    pub cloud_auth_jwt_secret: Option<String>,

    /// Database URL
    pub db_url: Option<String>,

    /// Base URL of the notification service, if any
    pub notifier_base_url: Option<String>,

    /// Seconds without a heartbeat before a session counts as offline
    #[serde(default = "default_offline_threshold_secs")]
    pub offline_threshold_secs: u64,

    /// Seconds without interaction before an online session is marked away
    #[serde(default = "default_away_threshold_secs")]
    pub away_threshold_secs: u64,

    /// Interval of the presence cleanup task
    #[serde(default = "default_presence_cleanup_interval_secs")]
    pub presence_cleanup_interval_secs: u64,

    /// Seconds a silent presence record is retained before removal
    #[serde(default = "default_presence_retention_secs")]
    pub presence_retention_secs: u64,

    /// Seconds a room must sit empty and idle before it is destroyed
    #[serde(default = "default_eviction_window_secs")]
    pub eviction_window_secs: u64,

    /// Grace delay between a room becoming empty and its eviction check
    #[serde(default = "default_eviction_grace_secs")]
    pub eviction_grace_secs: u64,

    /// Interval of the registry eviction sweep
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Debounce window for persisting dirty rooms
    #[serde(default = "default_save_debounce_secs")]
    pub save_debounce_secs: u64,

    /// Seconds a fresh connection gets to authenticate
    #[serde(default = "default_auth_timeout_secs")]
    pub auth_timeout_secs: u64,

    /// Capacity of each room's broadcast channel
    #[serde(default = "default_broadcast_buffer")]
    pub broadcast_buffer: usize,
}

impl Config {
    /// Load configuration from environment variables or app.env file
    pub fn load() -> Result<Self, ConfigError> {
        // Try to load from app.env file first
        if std::path::Path::new("app.env").exists() {
            dotenvy::from_filename("app.env").ok();
        } else {
            // Fallback to .env file
            dotenvy::dotenv().ok();
        }

        // Load from environment variables using envy
        match envy::from_env::<Config>() {
            Ok(config) => {
                info!("✅ Configuration loaded successfully");
                Ok(config)
            }
            Err(e) => {
                error!("❌ Failed to load configuration: {}", e);
                Err(ConfigError::EnvError(e))
            }
        }
    }

    /// Get the full server address
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if running in development mode
    pub fn is_development(&self) -> bool {
        self.environment.to_lowercase() == "dev" || self.environment.to_lowercase() == "development"
    }

    /// Check if running in production mode
    pub fn is_production(&self) -> bool {
        self.environment.to_lowercase() == "prod" || self.environment.to_lowercase() == "production"
    }

    pub fn offline_threshold(&self) -> Duration {
        Duration::from_secs(self.offline_threshold_secs)
    }

    pub fn away_threshold(&self) -> Duration {
        Duration::from_secs(self.away_threshold_secs)
    }

    pub fn presence_cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.presence_cleanup_interval_secs)
    }

    pub fn presence_retention(&self) -> Duration {
        Duration::from_secs(self.presence_retention_secs)
    }

    pub fn eviction_window(&self) -> Duration {
        Duration::from_secs(self.eviction_window_secs)
    }

    pub fn eviction_grace(&self) -> Duration {
        Duration::from_secs(self.eviction_grace_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn save_debounce(&self) -> Duration {
        Duration::from_secs(self.save_debounce_secs)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            environment: default_environment(),
            log_level: default_log_level(),
            cors_origins: None,
            cloud_service_name: default_service_name(),
            cloud_pod: None,
            cloud_auth_jwt_secret: None,
            db_url: None,
            notifier_base_url: None,
            offline_threshold_secs: default_offline_threshold_secs(),
            away_threshold_secs: default_away_threshold_secs(),
            presence_cleanup_interval_secs: default_presence_cleanup_interval_secs(),
            presence_retention_secs: default_presence_retention_secs(),
            eviction_window_secs: default_eviction_window_secs(),
            eviction_grace_secs: default_eviction_grace_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            save_debounce_secs: default_save_debounce_secs(),
            auth_timeout_secs: default_auth_timeout_secs(),
            broadcast_buffer: default_broadcast_buffer(),
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    EnvError(envy::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::EnvError(e) => write!(f, "Environment variable error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_service_name() -> String {
    "colabri-sync".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_offline_threshold_secs() -> u64 {
    60
}

fn default_away_threshold_secs() -> u64 {
    300
}

fn default_presence_cleanup_interval_secs() -> u64 {
    300
}

fn default_presence_retention_secs() -> u64 {
    3600
}

fn default_eviction_window_secs() -> u64 {
    1800
}

fn default_eviction_grace_secs() -> u64 {
    300
}

fn default_sweep_interval_secs() -> u64 {
    600
}

fn default_save_debounce_secs() -> u64 {
    30
}

fn default_auth_timeout_secs() -> u64 {
    10
}

fn default_broadcast_buffer() -> usize {
    256
}
