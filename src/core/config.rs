//! Configuration management

use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use config::{
    builder::DefaultState, Config as ConfigBuilder, ConfigBuilder as Builder,
    ConfigError as BuilderError, Environment, File,
};
use clap::Parser;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid server configuration: {0}")]
    InvalidServer(String),

    #[error("Invalid database configuration: {0}")]
    InvalidDatabase(String),

    #[error("Invalid extension configuration: {0}")]
    InvalidExtensions(String),

    #[error("Invalid cache configuration: {0}")]
    InvalidCache(String),

    #[error("Invalid logging configuration: {0}")]
    InvalidLogging(String),

    #[error("Failed to load configuration: {0}")]
    LoadError(String),

    #[error("Configuration file not found: {0}")]
    FileNotFound(String),
}

impl From<BuilderError> for ConfigError {
    fn from(err: BuilderError) -> Self {
        ConfigError::LoadError(err.to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub extensions: ExtensionsConfig,
    pub cache: CacheConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration with precedence: CLI args > Environment variables > Config file > Defaults
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_args(CliArgs::parse())
    }

    /// Load configuration using already parsed command-line arguments
    pub fn load_from_args(cli_args: CliArgs) -> Result<Self, ConfigError> {
        // 1. Start with defaults (lowest priority)
        let mut builder = with_defaults(ConfigBuilder::builder())?;

        // 2. Load from config file if specified (medium priority)
        if let Some(config_path) = &cli_args.config {
            if !config_path.exists() {
                return Err(ConfigError::FileNotFound(
                    config_path.display().to_string()
                ));
            }
            builder = builder.add_source(File::from(config_path.as_path()));
        }

        // 3. Override with environment variables (higher priority)
        // Example: EXTHOST_SERVER__PORT=8080
        builder = builder.add_source(
            Environment::with_prefix("EXTHOST")
                .separator("__")
                .try_parsing(true)
        );

        // 4. Override with CLI arguments (highest priority)
        if let Some(host) = &cli_args.host {
            builder = builder.set_override("server.host", host.clone())?;
        }
        if let Some(port) = cli_args.port {
            builder = builder.set_override("server.port", port)?;
        }
        if let Some(db_path) = &cli_args.database {
            builder = builder.set_override("database.path", db_path.display().to_string())?;
        }
        if let Some(extension_dir) = &cli_args.extension_dir {
            builder = builder.set_override("extensions.extension_dir", extension_dir.display().to_string())?;
        }
        if let Some(profile) = &cli_args.profile {
            builder = builder.set_override("extensions.profile", profile.clone())?;
        }
        if let Some(log_level) = &cli_args.log_level {
            builder = builder.set_override("logging.level", log_level.clone())?;
        }

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a specific file path, layered over the defaults
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let config: Config = with_defaults(ConfigBuilder::builder())?
            .add_source(File::from(path))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Built-in defaults only
    pub fn defaults() -> Result<Self, ConfigError> {
        let config: Config = with_defaults(ConfigBuilder::builder())?
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()?;
        self.database.validate()?;
        self.extensions.validate()?;
        self.cache.validate()?;
        self.logging.validate()?;
        Ok(())
    }
}

fn with_defaults(builder: Builder<DefaultState>) -> Result<Builder<DefaultState>, ConfigError> {
    Ok(builder
        .set_default("server.host", "127.0.0.1")?
        .set_default("server.port", 7420)?
        .set_default("database.path", "./data/extension-host.db")?
        .set_default("database.connection_pool_size", 4)?
        .set_default("database.busy_timeout", 5000)?
        .set_default("extensions.extension_dir", "./extensions")?
        .set_default("extensions.profile", "default")?
        .set_default("extensions.default_rate_limit_ms", 250)?
        .set_default("extensions.call_timeout_secs", 30)?
        .set_default("extensions.max_wasm_memory_bytes", 16777216)? // 256 pages
        .set_default("extensions.storage_quota_bytes", 5242880)? // 5 MB
        .set_default("extensions.load_builtin", true)?
        .set_default("cache.stream_ttl_secs", 600)?
        .set_default("cache.listing_ttl_secs", 3600)?
        .set_default("cache.hoster_info_ttl_secs", 86400)?
        .set_default("logging.level", "info")?
        .set_default("logging.format", "text")?
        .set_default("logging.output", "stdout")?
        .set_default("logging.max_file_size", 10485760)? // 10 MB
        .set_default("logging.max_backups", 5)?)
}

/// Command-line arguments for configuration override
#[derive(Debug, Default, Parser)]
#[command(name = "extension-host")]
#[command(about = "Extension runtime host with a JSON control API", long_about = None)]
pub struct CliArgs {
    /// Path to configuration file (TOML format)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Control API host address
    #[arg(long, value_name = "HOST")]
    pub host: Option<String>,

    /// Control API port
    #[arg(short, long, value_name = "PORT")]
    pub port: Option<u16>,

    /// Database file path
    #[arg(short, long, value_name = "PATH")]
    pub database: Option<PathBuf>,

    /// Extension directory path
    #[arg(long, value_name = "DIR")]
    pub extension_dir: Option<PathBuf>,

    /// Host profile whose extension list is restored at startup
    #[arg(long, value_name = "NAME")]
    pub profile: Option<String>,

    /// Log level (debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// CORS origins of the control API; `*` allows any
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
}

fn default_allowed_origins() -> Vec<String> {
    vec!["*".to_string()]
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::InvalidServer("host cannot be empty".to_string()));
        }

        if self.port == 0 {
            return Err(ConfigError::InvalidServer("port must be greater than 0".to_string()));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub connection_pool_size: u32,
    pub busy_timeout: u64, // milliseconds
}

impl DatabaseConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.path.as_os_str().is_empty() {
            return Err(ConfigError::InvalidDatabase("path cannot be empty".to_string()));
        }

        if self.connection_pool_size == 0 {
            return Err(ConfigError::InvalidDatabase("connection_pool_size must be greater than 0".to_string()));
        }

        if self.busy_timeout == 0 {
            return Err(ConfigError::InvalidDatabase("busy_timeout must be greater than 0".to_string()));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExtensionsConfig {
    pub extension_dir: PathBuf,
    pub profile: String,
    /// Used when a manifest does not declare `rateLimitMs`; 0 disables throttling
    pub default_rate_limit_ms: u64,
    pub call_timeout_secs: u64,
    pub max_wasm_memory_bytes: usize,
    pub storage_quota_bytes: u64,
    pub load_builtin: bool,
}

impl ExtensionsConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.extension_dir.as_os_str().is_empty() {
            return Err(ConfigError::InvalidExtensions("extension_dir cannot be empty".to_string()));
        }

        if self.profile.trim().is_empty() {
            return Err(ConfigError::InvalidExtensions("profile cannot be empty".to_string()));
        }

        if self.call_timeout_secs == 0 {
            return Err(ConfigError::InvalidExtensions("call_timeout_secs must be greater than 0".to_string()));
        }

        // One wasm page is 64 KiB
        if self.max_wasm_memory_bytes < 65536 {
            return Err(ConfigError::InvalidExtensions("max_wasm_memory_bytes must allow at least one page".to_string()));
        }

        if self.storage_quota_bytes == 0 {
            return Err(ConfigError::InvalidExtensions("storage_quota_bytes must be greater than 0".to_string()));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    pub stream_ttl_secs: u64,
    pub listing_ttl_secs: u64,
    pub hoster_info_ttl_secs: u64,
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stream_ttl_secs > self.listing_ttl_secs {
            return Err(ConfigError::InvalidCache(
                "stream_ttl_secs must not exceed listing_ttl_secs".to_string()
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    /// Level for records written by extensions; defaults to `level`
    #[serde(default)]
    pub extension_level: Option<String>,
    pub format: String,
    pub output: String,
    pub log_file: Option<PathBuf>,
    pub max_file_size: usize, // bytes
    pub max_backups: usize,
}

impl LoggingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.level.as_str()) {
            return Err(ConfigError::InvalidLogging(
                format!("level must be one of: {:?}", valid_levels)
            ));
        }

        if let Some(level) = &self.extension_level {
            let valid_extension_levels = ["trace", "debug", "info", "warn", "error", "off"];
            if !valid_extension_levels.contains(&level.as_str()) {
                return Err(ConfigError::InvalidLogging(format!(
                    "extension_level must be one of: {:?}",
                    valid_extension_levels
                )));
            }
        }

        let valid_formats = ["json", "text"];
        if !valid_formats.contains(&self.format.as_str()) {
            return Err(ConfigError::InvalidLogging(
                format!("format must be one of: {:?}", valid_formats)
            ));
        }

        let valid_outputs = ["stdout", "file"];
        if !valid_outputs.contains(&self.output.as_str()) {
            return Err(ConfigError::InvalidLogging(
                format!("output must be one of: {:?}", valid_outputs)
            ));
        }

        if self.output == "file" && self.log_file.is_none() {
            return Err(ConfigError::InvalidLogging(
                "log_file must be specified when output is 'file'".to_string()
            ));
        }

        if self.max_file_size == 0 {
            return Err(ConfigError::InvalidLogging("max_file_size must be greater than 0".to_string()));
        }

        if self.max_backups == 0 {
            return Err(ConfigError::InvalidLogging("max_backups must be greater than 0".to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::defaults().unwrap();
        assert_eq!(config.server.port, 7420);
        assert_eq!(config.extensions.profile, "default");
        assert_eq!(config.cache.stream_ttl_secs, 600);
        assert_eq!(config.cache.listing_ttl_secs, 3600);
        assert!(config.extensions.load_builtin);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[server]\nport = 9000\n\n[extensions]\nprofile = \"kiosk\"\ndefault_rate_limit_ms = 0"
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.extensions.profile, "kiosk");
        assert_eq!(config.extensions.default_rate_limit_ms, 0);
    }

    #[test]
    fn test_missing_file() {
        let result = Config::from_file(Path::new("/nonexistent/extension-host.toml"));
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_logging_validation() {
        let mut logging = Config::defaults().unwrap().logging;
        logging.output = "file".to_string();
        logging.log_file = None;
        assert!(logging.validate().is_err());

        logging.log_file = Some(PathBuf::from("./logs/host.log"));
        assert!(logging.validate().is_ok());

        logging.extension_level = Some("off".to_string());
        assert!(logging.validate().is_ok());
        logging.extension_level = Some("noisy".to_string());
        assert!(logging.validate().is_err());

        logging.extension_level = None;
        logging.level = "verbose".to_string();
        assert!(logging.validate().is_err());
    }

    #[test]
    fn test_extension_validation() {
        let mut extensions = Config::defaults().unwrap().extensions;
        extensions.max_wasm_memory_bytes = 1024;
        assert!(matches!(
            extensions.validate(),
            Err(ConfigError::InvalidExtensions(_))
        ));
    }
}
