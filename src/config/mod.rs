//! Application configuration.
//!
//! Aggregates configuration from all modules into a single Config struct
//! that can be loaded from YAML files or environment variables.

mod discovery;
mod plugins;
mod server;
mod storage;

pub use discovery::{
    ContainerConfig, CustomConfig, DiscoveryConfig, JdpConfig, KubernetesConfig,
    XDG_RUNTIME_DIR_ENV_VAR,
};
pub use plugins::PluginsConfig;
pub use server::{ConnectionConfig, ServerConfig};
pub use storage::StorageConfig;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "DISCOVERY_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "DISCOVERY";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "DISCOVERY_LOG";

/// Environment variable for Kubernetes namespace.
pub const NAMESPACE_ENV_VAR: &str = "NAMESPACE";
/// Alternative environment variable for Kubernetes namespace (downward API).
pub const POD_NAMESPACE_ENV_VAR: &str = "POD_NAMESPACE";

use serde::Deserialize;

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub discovery: DiscoveryConfig,
    pub plugins: PluginsConfig,
    pub connection: ConnectionConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, Box<dyn std::error::Error>> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("discovery.kubernetes.namespaces")
                    .with_list_parse_key("discovery.kubernetes.port_names")
                    .with_list_parse_key("discovery.kubernetes.port_numbers")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        Ok(config)
    }

    /// Parse configuration from a YAML document, without consulting the
    /// environment.
    pub fn from_yaml(yaml: &str) -> Result<Self, Box<dyn std::error::Error>> {
        use ::config::{Config as ConfigLib, File, FileFormat};

        let config = ConfigLib::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()?;
        Ok(config.try_deserialize()?)
    }

    /// Create config for testing: in-memory storage, no environment backends.
    pub fn for_test() -> Self {
        Self {
            storage: StorageConfig::memory(),
            ..Self::default()
        }
    }
}
