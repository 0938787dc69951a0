use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::errors::{AppError, AppResult};

pub const DEFAULT_EXTERNAL_BASE_URL: &str =
    "https://api.facepunch.com/api/public/rust-map-upload/";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub listen_addr: String,
    pub relay_url: String,
    pub external_base_url: String,
    pub upload_dir: PathBuf,
    pub chunk_size_bytes: u64,
    pub max_retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_step_ms: u64,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:3000".to_string(),
            relay_url: "http://127.0.0.1:3000/api/upload".to_string(),
            external_base_url: DEFAULT_EXTERNAL_BASE_URL.to_string(),
            upload_dir: std::env::temp_dir().join("map-relay-uploads"),
            chunk_size_bytes: 512 * 1024,
            max_retry_attempts: 10,
            retry_base_delay_ms: 1000,
            retry_step_ms: 5000,
            log_level: "info".to_string(),
        }
    }
}

fn get_config_path() -> AppResult<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| AppError::Config("Could not find config directory".to_string()))?
        .join("map-relay");

    fs::create_dir_all(&config_dir)?;
    Ok(config_dir.join("config.json"))
}

pub fn load_config() -> AppResult<Config> {
    let config_path = get_config_path()?;

    if config_path.exists() {
        let config_str = fs::read_to_string(&config_path)?;
        let config: Config = serde_json::from_str(&config_str).unwrap_or_else(|e| {
            log::warn!("Failed to parse config file: {}. Using defaults.", e);
            Config::default()
        });

        validate_config(&config)?;

        Ok(config)
    } else {
        // Create default config
        let default_config = Config::default();
        save_config(&default_config)?;
        Ok(default_config)
    }
}

pub fn save_config(config: &Config) -> AppResult<()> {
    validate_config(config)?;

    let config_path = get_config_path()?;

    // Create backup of existing config
    if config_path.exists() {
        let backup_path = config_path.with_extension("json.bak");
        if let Err(e) = fs::copy(&config_path, &backup_path) {
            log::warn!("Failed to create config backup: {}", e);
        }
    }

    let config_str = serde_json::to_string_pretty(config)?;
    fs::write(&config_path, config_str)?;

    log::info!("Configuration saved successfully");
    Ok(())
}

pub fn validate_config(config: &Config) -> AppResult<()> {
    if config.listen_addr.parse::<SocketAddr>().is_err() {
        return Err(AppError::validation(
            "listen_addr",
            "Must be a socket address such as 127.0.0.1:3000",
        ));
    }

    if !config.relay_url.starts_with("http") {
        return Err(AppError::validation("relay_url", "Must be an http(s) URL"));
    }

    if !config.external_base_url.starts_with("http") || !config.external_base_url.ends_with('/') {
        return Err(AppError::validation(
            "external_base_url",
            "Must be an http(s) URL ending with a slash",
        ));
    }

    if config.chunk_size_bytes == 0 {
        return Err(AppError::validation(
            "chunk_size_bytes",
            "Must be greater than 0",
        ));
    }

    if config.max_retry_attempts == 0 || config.max_retry_attempts > 10 {
        return Err(AppError::validation(
            "max_retry_attempts",
            "Must be between 1 and 10",
        ));
    }

    // Validate log level
    let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
    if !valid_log_levels.contains(&config.log_level.as_str()) {
        return Err(AppError::validation("log_level", "Must be a valid log level"));
    }

    Ok(())
}

/// Resolve the relay's working directory for chunk accumulation and spooled
/// uploads, creating it if needed.
pub fn get_upload_dir(config: &Config) -> AppResult<PathBuf> {
    fs::create_dir_all(&config.upload_dir)?;
    Ok(config.upload_dir.clone())
}

pub fn get_data_directory() -> AppResult<PathBuf> {
    let data_dir = dirs::data_dir()
        .ok_or_else(|| AppError::Config("Could not find data directory".to_string()))?
        .join("map-relay");

    fs::create_dir_all(&data_dir)?;
    Ok(data_dir)
}
