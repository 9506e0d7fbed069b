// Configuration management with layered configuration (file, env)

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database: DatabaseConfig,
    pub store: StoreConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout_seconds: u64,
    pub connect_timeout_seconds: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost/postgres".to_string(),
            max_connections: 3,
            acquire_timeout_seconds: 30,
            connect_timeout_seconds: 5,
        }
    }
}

/// Key-value store connection, pool, retry and timeout settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub host: String,
    pub port: u16,
    pub db: i64,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls: bool,
    /// Verify the server certificate when `tls` is on
    pub tls_verify: bool,

    // Connection pool settings
    pub max_connections: u32,

    // Retry settings
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub backoff_factor: f64,
    pub retry_jitter: f64,
    pub retry_on_timeout: bool,

    // Timeout settings
    pub socket_timeout_ms: u64,
    pub socket_connect_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            db: 0,
            username: None,
            password: None,
            tls: false,
            tls_verify: true,
            max_connections: 10,
            max_retries: 3,
            retry_delay_ms: 100,
            backoff_factor: 2.0,
            retry_jitter: 0.0,
            retry_on_timeout: true,
            socket_timeout_ms: 5_000,
            socket_connect_timeout_ms: 5_000,
        }
    }
}

impl StoreConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn socket_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_timeout_ms)
    }

    pub fn socket_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_connect_timeout_ms)
    }

    /// Connection URL without credentials; those are applied separately so
    /// they never need escaping.
    pub fn url(&self) -> String {
        let scheme = if self.tls { "rediss" } else { "redis" };
        let mut url = format!("{}://{}:{}/{}", scheme, self.host, self.port, self.db);
        if self.tls && !self.tls_verify {
            url.push_str("#insecure");
        }
        url
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.host.is_empty() {
            return Err("Store host cannot be empty".to_string());
        }
        if self.port == 0 {
            return Err("Store port must be greater than 0".to_string());
        }
        if self.db < 0 {
            return Err("Store database index cannot be negative".to_string());
        }
        if self.max_connections == 0 {
            return Err("Store max_connections must be greater than 0".to_string());
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err("Store backoff_factor must be a finite number >= 1.0".to_string());
        }
        if !(0.0..=1.0).contains(&self.retry_jitter) {
            return Err("Store retry_jitter must be between 0.0 and 1.0".to_string());
        }
        if self.socket_timeout_ms == 0 || self.socket_connect_timeout_ms == 0 {
            return Err("Store socket timeouts must be greater than 0".to_string());
        }
        if self.password.as_deref() == Some("") {
            return Err("Store password cannot be an empty string".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: true,
        }
    }
}

impl Settings {
    /// Load configuration with layered precedence: defaults → file → env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Add local configuration (not committed to git)
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), String> {
        if self.database.url.is_empty() {
            return Err("Database URL cannot be empty".to_string());
        }
        if self.database.max_connections == 0 {
            return Err("Database max_connections must be greater than 0".to_string());
        }
        if self.database.acquire_timeout_seconds == 0 {
            return Err("Database acquire_timeout_seconds must be greater than 0".to_string());
        }

        self.store.validate()?;

        if self.observability.log_level.is_empty() {
            return Err("Log level cannot be empty".to_string());
        }

        Ok(())
    }
}
