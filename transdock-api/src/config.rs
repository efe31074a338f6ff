//! Configuration management for the TransDock API
//!
//! Settings are resolved from three sources:
//! 1. Environment variables (highest priority)
//! 2. Configuration file (TOML format)
//! 3. Default values (lowest priority)

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration struct for TransDock
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransdockConfig {
    /// Server configuration
    pub server: ServerConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Authentication configuration
    pub auth: AuthConfig,
    /// Command executor configuration
    pub executor: ExecutorConfig,
    /// Migration safety toggles
    pub safety: SafetyConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// CORS configuration
    pub cors: CorsConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Debug mode
    pub debug: bool,
    /// Testing mode
    pub testing: bool,
    /// Serve API docs
    pub enable_docs: bool,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database URL (e.g., "sqlite:///var/lib/transdock/transdock.db")
    pub url: String,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
}

/// Authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub jwt_secret_key: String,
    pub jwt_algorithm: String,
    pub access_token_expire_minutes: i64,
    pub refresh_token_expire_days: i64,
    /// Seed credentials; hashed at startup
    pub admin_password: String,
    pub user_password: String,
}

/// Command executor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Per-command timeout in seconds
    pub command_timeout_secs: u64,
    /// known_hosts file managed by the executor
    pub known_hosts_file: PathBuf,
}

/// Migration safety toggles
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    pub mandatory_pre_migration_snapshots: bool,
    pub require_rollback_capability: bool,
    pub enable_atomic_operations: bool,
    pub validate_checksum_integrity: bool,
    pub require_dry_run_before_transfer: bool,
    pub max_migration_timeout_hours: u64,
    pub require_disk_health_check: bool,
    pub validate_network_stability: bool,
    pub backup_retention_days: i64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Optional directory for log files
    pub log_dir: Option<PathBuf>,
}

/// CORS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    /// Allowed origins; "*" means any
    pub origins: Vec<String>,
}

impl Default for TransdockConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            auth: AuthConfig::default(),
            executor: ExecutorConfig::default(),
            safety: SafetyConfig::default(),
            logging: LoggingConfig::default(),
            cors: CorsConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            debug: false,
            testing: false,
            enable_docs: false,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:///var/lib/transdock/transdock.db".to_string(),
            max_connections: 10,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret_key: String::new(),
            jwt_algorithm: "HS256".to_string(),
            access_token_expire_minutes: 30,
            refresh_token_expire_days: 7,
            admin_password: "admin".to_string(),
            user_password: "user".to_string(),
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/root".to_string());
        Self {
            command_timeout_secs: 30,
            known_hosts_file: PathBuf::from(home).join(".ssh/known_hosts"),
        }
    }
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            mandatory_pre_migration_snapshots: true,
            require_rollback_capability: true,
            enable_atomic_operations: true,
            validate_checksum_integrity: true,
            require_dry_run_before_transfer: true,
            max_migration_timeout_hours: 12,
            require_disk_health_check: true,
            validate_network_stability: true,
            backup_retention_days: 30,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_dir: None,
        }
    }
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            origins: vec!["*".to_string()],
        }
    }
}

impl TransdockConfig {
    /// Load configuration from environment variables and optional config file
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(config_path) = Self::find_config_file() {
            match Self::load_from_file(&config_path) {
                Ok(file_config) => config = file_config,
                Err(e) => tracing::warn!("Ignoring config file {:?}: {}", config_path, e),
            }
        }

        config.apply_env_overrides();
        config
    }

    /// Load configuration from a specific file path
    pub fn load_from_file(path: &PathBuf) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(path.clone(), e.to_string()))?;

        toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Find configuration file in standard locations
    fn find_config_file() -> Option<PathBuf> {
        let paths = [
            std::env::var("TRANSDOCK_CONFIG").ok().map(PathBuf::from),
            Some(PathBuf::from("/etc/transdock/config.toml")),
            Some(PathBuf::from("./transdock.toml")),
        ];

        paths.into_iter().flatten().find(|p| p.exists())
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        // Server
        if let Ok(host) = std::env::var("HOST") {
            self.server.host = host;
        }
        if let Ok(port) = std::env::var("PORT") {
            if let Ok(port) = port.parse() {
                self.server.port = port;
            }
        }
        if let Ok(v) = std::env::var("DEBUG") {
            self.server.debug = parse_bool(&v, self.server.debug);
        }
        if let Ok(v) = std::env::var("TESTING") {
            self.server.testing = parse_bool(&v, self.server.testing);
        }
        if let Ok(v) = std::env::var("ENABLE_DOCS") {
            self.server.enable_docs = parse_bool(&v, self.server.enable_docs);
        }

        // Logging
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            self.logging.level = level.to_lowercase();
        }

        // Database
        if let Ok(url) = std::env::var("DATABASE_URL") {
            self.database.url = url;
        }

        // Auth
        if let Ok(secret) = std::env::var("JWT_SECRET_KEY") {
            self.auth.jwt_secret_key = secret;
        }
        if let Ok(alg) = std::env::var("JWT_ALGORITHM") {
            self.auth.jwt_algorithm = alg;
        }
        if let Ok(v) = std::env::var("ACCESS_TOKEN_EXPIRE_MINUTES") {
            if let Ok(v) = v.parse() {
                self.auth.access_token_expire_minutes = v;
            }
        }
        if let Ok(v) = std::env::var("REFRESH_TOKEN_EXPIRE_DAYS") {
            if let Ok(v) = v.parse() {
                self.auth.refresh_token_expire_days = v;
            }
        }
        if let Ok(v) = std::env::var("ADMIN_PASSWORD") {
            self.auth.admin_password = v;
        }
        if let Ok(v) = std::env::var("USER_PASSWORD") {
            self.auth.user_password = v;
        }

        // Executor
        if let Ok(v) = std::env::var("TRANSDOCK_COMMAND_TIMEOUT_SECS") {
            if let Ok(v) = v.parse() {
                self.executor.command_timeout_secs = v;
            }
        }
        if let Ok(path) = std::env::var("TRANSDOCK_KNOWN_HOSTS") {
            self.executor.known_hosts_file = PathBuf::from(path);
        }

        // Safety toggles
        if let Ok(v) = std::env::var("MANDATORY_PRE_MIGRATION_SNAPSHOTS") {
            self.safety.mandatory_pre_migration_snapshots =
                parse_bool(&v, self.safety.mandatory_pre_migration_snapshots);
        }
        if let Ok(v) = std::env::var("REQUIRE_ROLLBACK_CAPABILITY") {
            self.safety.require_rollback_capability =
                parse_bool(&v, self.safety.require_rollback_capability);
        }
        if let Ok(v) = std::env::var("ENABLE_ATOMIC_OPERATIONS") {
            self.safety.enable_atomic_operations =
                parse_bool(&v, self.safety.enable_atomic_operations);
        }
        if let Ok(v) = std::env::var("VALIDATE_CHECKSUM_INTEGRITY") {
            self.safety.validate_checksum_integrity =
                parse_bool(&v, self.safety.validate_checksum_integrity);
        }
        if let Ok(v) = std::env::var("REQUIRE_DRY_RUN_BEFORE_TRANSFER") {
            self.safety.require_dry_run_before_transfer =
                parse_bool(&v, self.safety.require_dry_run_before_transfer);
        }
        if let Ok(v) = std::env::var("MAX_MIGRATION_TIMEOUT_HOURS") {
            if let Ok(v) = v.parse() {
                self.safety.max_migration_timeout_hours = v;
            }
        }
        if let Ok(v) = std::env::var("REQUIRE_DISK_HEALTH_CHECK") {
            self.safety.require_disk_health_check =
                parse_bool(&v, self.safety.require_disk_health_check);
        }
        if let Ok(v) = std::env::var("VALIDATE_NETWORK_STABILITY") {
            self.safety.validate_network_stability =
                parse_bool(&v, self.safety.validate_network_stability);
        }
        if let Ok(v) = std::env::var("BACKUP_RETENTION_DAYS") {
            if let Ok(v) = v.parse() {
                self.safety.backup_retention_days = v;
            }
        }

        // CORS
        if let Ok(origins) = std::env::var("CORS_ORIGINS") {
            self.cors.origins = origins
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
    }

    /// Validate the configuration; startup fails on errors here.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::Validation("Port cannot be 0".to_string()));
        }

        if self.database.url.is_empty() {
            return Err(ConfigError::Validation(
                "Database URL cannot be empty".to_string(),
            ));
        }

        if self.auth.jwt_secret_key.is_empty() && !self.server.testing {
            return Err(ConfigError::Validation(
                "JWT_SECRET_KEY must be set outside testing mode".to_string(),
            ));
        }

        if self.safety.max_migration_timeout_hours == 0 {
            return Err(ConfigError::Validation(
                "MAX_MIGRATION_TIMEOUT_HOURS must be at least 1".to_string(),
            ));
        }

        match self.auth.jwt_algorithm.as_str() {
            "HS256" | "HS384" | "HS512" => {}
            other => {
                return Err(ConfigError::Validation(format!(
                    "Unsupported JWT algorithm: {}",
                    other
                )))
            }
        }

        Ok(())
    }

    /// Generate a sample configuration file
    pub fn generate_sample() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

/// Configuration errors
#[derive(Debug, Clone)]
pub enum ConfigError {
    /// Failed to read configuration file
    FileRead(PathBuf, String),
    /// Failed to parse configuration
    Parse(String),
    /// Configuration validation failed
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, err) => {
                write!(f, "Failed to read config file {:?}: {}", path, err)
            }
            ConfigError::Parse(err) => write!(f, "Failed to parse config: {}", err),
            ConfigError::Validation(err) => write!(f, "Config validation failed: {}", err),
        }
    }
}

impl std::error::Error for ConfigError {}

fn parse_bool(value: &str, default: bool) -> bool {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => default,
    }
}
