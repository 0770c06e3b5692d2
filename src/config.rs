//! Runner configuration: `config.json` (tunables) and `credentials.json`
//! (secrets), both read from one directory at startup.

use serde::{de::DeserializeOwned, Deserialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::backend::portainer::DEFAULT_ENVIRONMENT_ID;
use crate::balancer::BalanceStrategy;
use crate::engine::EngineSettings;

pub const CONFIG_FILE: &str = "config.json";
pub const CREDENTIALS_FILE: &str = "credentials.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

fn default_retry_attempts() -> u32 {
    5
}
fn default_error_wait() -> u64 {
    5
}
fn default_reclaim_interval() -> u64 {
    10
}
fn default_reclaim_retry() -> u64 {
    30
}
fn default_queue_capacity() -> usize {
    256
}
fn default_task_workers() -> usize {
    16
}
fn default_environment_id() -> u32 {
    DEFAULT_ENVIRONMENT_ID
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(rename = "Runner_Port")]
    pub runner_port: u16,
    #[serde(rename = "Max_Instance_Count")]
    pub max_instance_count: usize,
    #[serde(rename = "Portainer_JWT_Seconds_Per_Refresh")]
    pub jwt_seconds_per_refresh: u64,
    #[serde(rename = "Default_Seconds_Per_Instance")]
    pub default_seconds_per_instance: u64,
    #[serde(rename = "Max_Seconds_Left_Before_Extend_Allowed")]
    pub max_seconds_left_before_extend: u64,
    #[serde(rename = "Reserved_Ports", default)]
    pub reserved_ports: Vec<u16>,
    #[serde(rename = "Database_Max_Retry_Attempts", default = "default_retry_attempts")]
    pub database_max_retry_attempts: u32,
    #[serde(rename = "Database_Error_Wait_Seconds", default = "default_error_wait")]
    pub database_error_wait_seconds: u64,
    #[serde(rename = "Portainer_Balance_Strategy", default)]
    pub balance_strategy: BalanceStrategy,

    #[serde(rename = "Reclaim_Interval_Seconds", default = "default_reclaim_interval")]
    pub reclaim_interval_seconds: u64,
    #[serde(rename = "Reclaim_Retry_Seconds", default = "default_reclaim_retry")]
    pub reclaim_retry_seconds: u64,
    #[serde(rename = "Task_Queue_Capacity", default = "default_queue_capacity")]
    pub task_queue_capacity: usize,
    #[serde(rename = "Task_Workers", default = "default_task_workers")]
    pub task_workers: usize,
    #[serde(rename = "Portainer_Environment_Id", default = "default_environment_id")]
    pub portainer_environment_id: u32,
    #[serde(rename = "Portainer_Accept_Invalid_Certs", default)]
    pub portainer_accept_invalid_certs: bool,
}

impl Config {
    fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("Max_Instance_Count", self.max_instance_count as u64),
            ("Portainer_JWT_Seconds_Per_Refresh", self.jwt_seconds_per_refresh),
            ("Default_Seconds_Per_Instance", self.default_seconds_per_instance),
            ("Reclaim_Interval_Seconds", self.reclaim_interval_seconds),
            ("Reclaim_Retry_Seconds", self.reclaim_retry_seconds),
            ("Task_Queue_Capacity", self.task_queue_capacity as u64),
            ("Task_Workers", self.task_workers as u64),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be positive")));
            }
        }
        Ok(())
    }

    /// Ports never handed to instances. Always includes the runner's own.
    pub fn reserved_ports(&self) -> Vec<u16> {
        let mut ports = self.reserved_ports.clone();
        if !ports.contains(&self.runner_port) {
            ports.push(self.runner_port);
        }
        ports
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            max_instances: self.max_instance_count,
            instance_duration: Duration::from_secs(self.default_seconds_per_instance),
            extend_threshold: Duration::from_secs(self.max_seconds_left_before_extend),
            reclaim_retry: Duration::from_secs(self.reclaim_retry_seconds),
        }
    }

    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_secs(self.reclaim_interval_seconds)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.jwt_seconds_per_refresh)
    }

    pub fn database_error_wait(&self) -> Duration {
        Duration::from_secs(self.database_error_wait_seconds)
    }
}

#[derive(Clone, Deserialize)]
pub struct PortainerCredential {
    #[serde(rename = "Url")]
    pub url: String,
    #[serde(rename = "Username")]
    pub username: String,
    #[serde(rename = "Password")]
    pub password: String,
}

impl fmt::Debug for PortainerCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortainerCredential")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Clone, Deserialize)]
pub struct Credentials {
    #[serde(rename = "Database_Url")]
    pub database_url: String,
    #[serde(rename = "Portainer_Credentials")]
    pub portainer_credentials: Vec<PortainerCredential>,
    #[serde(rename = "Api_Authorization")]
    pub api_authorization: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("database_url", &self.database_url)
            .field("portainer_credentials", &self.portainer_credentials)
            .field("api_authorization", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.database_url.trim().is_empty() {
            return Err(ConfigError::Invalid("Database_Url is empty".into()));
        }
        if self.portainer_credentials.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one Portainer_Credentials entry is required".into(),
            ));
        }
        for credential in &self.portainer_credentials {
            url::Url::parse(&credential.url).map_err(|e| {
                ConfigError::Invalid(format!("bad Portainer url {:?}: {e}", credential.url))
            })?;
        }
        if self.api_authorization.trim().is_empty() {
            return Err(ConfigError::Invalid("Api_Authorization is empty".into()));
        }
        Ok(())
    }

    /// Backend endpoints, in configuration order, without duplicates.
    pub fn endpoints(&self) -> Vec<String> {
        let mut endpoints: Vec<String> = Vec::new();
        for credential in &self.portainer_credentials {
            if !endpoints.contains(&credential.url) {
                endpoints.push(credential.url.clone());
            }
        }
        endpoints
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ConfigError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Load and validate both files from `dir`.
pub fn load(dir: &Path) -> Result<(Config, Credentials), ConfigError> {
    let config: Config = read_json(&dir.join(CONFIG_FILE))?;
    config.validate()?;
    let credentials: Credentials = read_json(&dir.join(CREDENTIALS_FILE))?;
    credentials.validate()?;
    Ok((config, credentials))
}
