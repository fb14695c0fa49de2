use minicloud_core::{MiniCloudError, ObjectServiceOptions, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub service: ServiceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_max_body_bytes() -> usize {
    64 * 1024 * 1024
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Fs,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub metadata_db: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            data_dir: default_data_dir(),
            metadata_db: None,
        }
    }
}

impl StorageConfig {
    pub fn metadata_db_path(&self) -> PathBuf {
        self.metadata_db
            .clone()
            .unwrap_or_else(|| self.data_dir.join("meta.db"))
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_serialize_same_key")]
    pub serialize_same_key: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            serialize_same_key: default_serialize_same_key(),
        }
    }
}

fn default_serialize_same_key() -> bool {
    true
}

impl ServiceConfig {
    pub fn options(&self) -> ObjectServiceOptions {
        ObjectServiceOptions {
            serialize_same_key: self.serialize_same_key,
        }
    }
}

impl Config {
    /// Load `path` (optional) layered under `MINICLOUD__SECTION__FIELD` variables.
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path).required(false))
            .add_source(
                ::config::Environment::with_prefix("MINICLOUD")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| MiniCloudError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| MiniCloudError::Config(e.to_string()))?;

        if config.server.bind_addr.trim().is_empty() {
            return Err(MiniCloudError::Config(
                "server.bind_addr cannot be empty".to_string(),
            ));
        }

        Ok(config)
    }
}
