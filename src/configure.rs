use config::{Config, ConfigError, File};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Key prefix isolating this queue in the shared store
    pub namespace: String,
    /// TTL applied to every write
    pub cache_ttl_secs: u64,
    pub db_path: String,
    pub log_level: String,
    pub log_to_file: bool,
    pub log_file: String,
}

pub fn load_config() -> Result<AppConfig, ConfigError> {
    load_config_from("config/config.yaml")
}

pub fn load_config_from(path: &str) -> Result<AppConfig, ConfigError> {
    let s = Config::builder()
        // Set defaults
        .set_default("namespace", "transfers")?
        .set_default("cache_ttl_secs", 86_400)?
        .set_default("db_path", "config_db/transfer_queue")?
        .set_default("log_level", "info")?
        .set_default("log_to_file", false)?
        .set_default("log_file", "log/transfer_queue.log")?
        // Add configuration from a file
        .add_source(File::with_name(path).required(false))
        // Add configuration from environment variables
        .add_source(config::Environment::with_prefix("APP"))
        .build()?;

    s.try_deserialize()
}
