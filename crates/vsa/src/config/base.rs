use etcetera::{choose_app_strategy, AppStrategy, AppStrategyArgs};
use fs2::FileExt;
use once_cell::sync::{Lazy, OnceCell};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::env;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub static APP_STRATEGY: Lazy<AppStrategyArgs> = Lazy::new(|| AppStrategyArgs {
    top_level_domain: "dev".to_string(),
    author: "vsa".to_string(),
    app_name: "vsa".to_string(),
});

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration value not found: {0}")]
    NotFound(String),
    #[error("Failed to deserialize value: {0}")]
    DeserializeError(String),
    #[error("Failed to read config file: {0}")]
    FileError(#[from] std::io::Error),
    #[error("Failed to create config directory: {0}")]
    DirectoryError(String),
    #[error("Failed to acquire file lock: {0}")]
    LockError(String),
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        ConfigError::DeserializeError(err.to_string())
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        ConfigError::DeserializeError(err.to_string())
    }
}

/// Configuration for the realtime engine.
///
/// Values are loaded with the following precedence:
/// 1. Environment variables (key converted to UPPERCASE)
/// 2. Configuration file (~/.config/vsa/config.yaml by default)
///
/// Secrets (API keys for tool backends and the realtime service) follow the
/// same precedence, falling back to a separate secrets file
/// (~/.config/vsa/secrets.yaml by default).
///
/// Environment values are parsed as JSON when possible, so
/// `TOOL_RESULT_MAX_CHARS=2000` yields a number and `BACKENDS='[...]'` a list.
pub struct Config {
    config_path: PathBuf,
    secrets_path: PathBuf,
}

static GLOBAL_CONFIG: OnceCell<Config> = OnceCell::new();

impl Config {
    /// Process-wide configuration rooted in the platform config directory.
    pub fn global() -> &'static Config {
        GLOBAL_CONFIG.get_or_init(|| {
            // choose_app_strategy().config_dir()
            // - macOS/Linux: ~/.config/vsa/
            // - Windows:     ~\AppData\Roaming\vsa\vsa\config\
            let config_dir = choose_app_strategy(APP_STRATEGY.clone())
                .map(|strategy| strategy.config_dir())
                .unwrap_or_else(|_| PathBuf::from(".vsa"));
            Config {
                config_path: config_dir.join("config.yaml"),
                secrets_path: config_dir.join("secrets.yaml"),
            }
        })
    }

    pub fn new<P1: AsRef<Path>, P2: AsRef<Path>>(config_path: P1, secrets_path: P2) -> Self {
        Config {
            config_path: config_path.as_ref().to_path_buf(),
            secrets_path: secrets_path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> String {
        self.config_path.to_string_lossy().to_string()
    }

    pub fn load_values(&self) -> Result<HashMap<String, Value>, ConfigError> {
        load_yaml_map(&self.config_path)
    }

    pub fn load_secrets(&self) -> Result<HashMap<String, Value>, ConfigError> {
        load_yaml_map(&self.secrets_path)
    }

    pub fn get_param<T: for<'de> Deserialize<'de>>(&self, key: &str) -> Result<T, ConfigError> {
        if let Some(value) = env_override(key) {
            return Ok(serde_json::from_value(value)?);
        }

        self.load_values()?
            .remove(key)
            .ok_or_else(|| ConfigError::NotFound(key.to_string()))
            .and_then(|v| Ok(serde_json::from_value(v)?))
    }

    /// Like [`Config::get_param`] but a missing key yields `default`.
    pub fn get_param_or<T: for<'de> Deserialize<'de>>(
        &self,
        key: &str,
        default: T,
    ) -> Result<T, ConfigError> {
        match self.get_param(key) {
            Err(ConfigError::NotFound(_)) => Ok(default),
            other => other,
        }
    }

    pub fn get_secret<T: for<'de> Deserialize<'de>>(&self, key: &str) -> Result<T, ConfigError> {
        if let Some(value) = env_override(key) {
            return Ok(serde_json::from_value(value)?);
        }

        self.load_secrets()?
            .remove(key)
            .ok_or_else(|| ConfigError::NotFound(key.to_string()))
            .and_then(|v| Ok(serde_json::from_value(v)?))
    }

    pub fn set_param(&self, key: &str, value: Value) -> Result<(), ConfigError> {
        update_yaml_map(&self.config_path, |values| {
            values.insert(key.to_string(), value);
        })
    }

    pub fn delete(&self, key: &str) -> Result<(), ConfigError> {
        update_yaml_map(&self.config_path, |values| {
            values.remove(key);
        })
    }

    pub fn set_secret(&self, key: &str, value: Value) -> Result<(), ConfigError> {
        update_yaml_map(&self.secrets_path, |values| {
            values.insert(key.to_string(), value);
        })
    }
}

fn env_override(key: &str) -> Option<Value> {
    let val = env::var(key.to_uppercase()).ok()?;
    Some(serde_json::from_str(&val).unwrap_or(Value::String(val)))
}

fn load_yaml_map(path: &Path) -> Result<HashMap<String, Value>, ConfigError> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let content = std::fs::read_to_string(path)?;
    if content.trim().is_empty() {
        return Ok(HashMap::new());
    }

    let yaml_value: serde_yaml::Value = serde_yaml::from_str(&content)?;
    let json_value: Value = serde_json::to_value(yaml_value)?;
    match json_value {
        Value::Object(map) => Ok(map.into_iter().collect()),
        _ => Ok(HashMap::new()),
    }
}

/// Read, modify and rewrite a YAML map while holding an exclusive lock on
/// `<name>.lock`, so concurrent writers never lose each other's keys.
fn update_yaml_map<F>(path: &Path, update: F) -> Result<(), ConfigError>
where
    F: FnOnce(&mut HashMap<String, Value>),
{
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ConfigError::DirectoryError(e.to_string()))?;
    }

    let lock = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path.with_extension("lock"))?;
    lock.lock_exclusive()
        .map_err(|e| ConfigError::LockError(e.to_string()))?;

    let mut values = load_yaml_map(path)?;
    update(&mut values);

    // Unlock is handled when `lock` drops
    save_yaml_map(path, &values)
}

fn save_yaml_map(path: &Path, values: &HashMap<String, Value>) -> Result<(), ConfigError> {
    let yaml_value = serde_yaml::to_string(values)?;

    // Write to a temporary file first so readers never see a partial file
    let temp_path = path.with_extension("tmp");
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)?;
        file.write_all(yaml_value.as_bytes())?;
        file.sync_all()?;
    }
    std::fs::rename(&temp_path, path)?;
    Ok(())
}
