use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::owldb::{ClientConfig, DEFAULT_BASE_URL};

const DEFAULT_ENV_PREFIX: &str = "OWLCHAT";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_auth_path")]
    pub auth_path: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            database_path: default_database_path(),
            auth_path: default_auth_path(),
            user_agent: default_user_agent(),
            timeout: default_timeout(),
        }
    }
}

impl StoreConfig {
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            base_url: self.host.clone(),
            database_path: self.database_path.clone(),
            auth_path: self.auth_path.clone(),
            user_agent: self.user_agent.clone(),
            timeout: self.timeout,
            ..ClientConfig::default()
        }
    }
}

fn default_host() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_database_path() -> String {
    "/v1/owlchat".into()
}

fn default_auth_path() -> String {
    "/auth".into()
}

fn default_user_agent() -> String {
    format!("owlchat/{}", crate::VERSION)
}

fn default_timeout() -> Duration {
    Duration::from_secs(20)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SessionConfig {
    #[serde(default)]
    pub username: String,
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub config_file: Option<PathBuf>,
    pub env_prefix: Option<String>,
}

pub fn load(options: LoadOptions) -> Result<Config> {
    let mut cfg = Config::default();

    if let Some(path) = options.config_file.as_ref() {
        if path.exists() {
            let from_file = read_config_file(path)?;
            cfg = merge_config(cfg, from_file);
        }
    } else if let Some(default_path) = default_config_path() {
        if default_path.exists() {
            let from_file = read_config_file(&default_path)?;
            cfg = merge_config(cfg, from_file);
        }
    }

    let prefix = options.env_prefix.as_deref().unwrap_or(DEFAULT_ENV_PREFIX);
    cfg = merge_config(cfg, load_env(prefix));

    Ok(cfg)
}

fn read_config_file(path: &Path) -> Result<Config> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&data)
        .with_context(|| format!("Failed to parse config file at {}", path.display()))?;
    Ok(config)
}

fn merge_config(mut base: Config, other: Config) -> Config {
    let defaults = StoreConfig::default();

    if !other.store.host.is_empty() && other.store.host != defaults.host {
        base.store.host = other.store.host;
    }
    if !other.store.database_path.is_empty() && other.store.database_path != defaults.database_path
    {
        base.store.database_path = other.store.database_path;
    }
    if !other.store.auth_path.is_empty() && other.store.auth_path != defaults.auth_path {
        base.store.auth_path = other.store.auth_path;
    }
    if !other.store.user_agent.is_empty() && other.store.user_agent != defaults.user_agent {
        base.store.user_agent = other.store.user_agent;
    }
    if !other.store.timeout.is_zero() && other.store.timeout != defaults.timeout {
        base.store.timeout = other.store.timeout;
    }

    if !other.session.username.trim().is_empty() {
        base.session.username = other.session.username.trim().to_string();
    }

    base
}

fn load_env(prefix: &str) -> Config {
    let upper_prefix = format!("{}_", prefix.to_uppercase());
    let map: HashMap<String, String> = env::vars()
        .filter_map(|(key, value)| {
            key.strip_prefix(&upper_prefix)
                .map(|stripped| (stripped.to_ascii_lowercase().replace("__", "."), value))
        })
        .collect();

    let mut cfg = Config::default();
    for (key, value) in map {
        apply_env_value(&mut cfg, &key, value);
    }
    cfg
}

fn apply_env_value(cfg: &mut Config, key: &str, value: String) {
    match key {
        "store.host" => cfg.store.host = value,
        "store.database_path" => cfg.store.database_path = value,
        "store.auth_path" => cfg.store.auth_path = value,
        "store.user_agent" => cfg.store.user_agent = value,
        "store.timeout" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.store.timeout = duration;
            }
        }
        "session.username" => cfg.session.username = value,
        _ => {}
    }
}

pub fn default_path() -> Option<PathBuf> {
    default_config_path()
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("owlchat").join("config.yaml"))
}
