use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::tracker::Metric;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    #[serde(default)]
    pub users: UserDefaultsConfig,
    /// Per-user overrides keyed by username. A zero field falls back to
    /// the `users` defaults.
    #[serde(default)]
    pub user_thresholds: HashMap<String, UserThreshold>,
    #[serde(default)]
    pub user_filtering: UserFilteringConfig,
    #[serde(default)]
    pub email: EmailConfig,
    #[serde(default)]
    pub reporting: ReportingConfig,
    #[serde(default)]
    pub websocket: WebsocketConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitoringConfig {
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    #[serde(default = "default_threshold_percent")]
    pub cpu_threshold: f64,
    #[serde(default = "default_threshold_percent")]
    pub memory_threshold: f64,
    /// Minutes a breach must hold before the system itself counts as
    /// persistently loaded.
    #[serde(default = "default_persistent_time_mins")]
    pub persistent_time_mins: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UserDefaultsConfig {
    #[serde(default = "default_threshold_percent")]
    pub cpu_threshold: f64,
    #[serde(default = "default_threshold_percent")]
    pub memory_threshold: f64,
    #[serde(default = "default_persistent_time_mins")]
    pub persistent_time_mins: u64,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct UserThreshold {
    #[serde(default)]
    pub cpu_threshold: f64,
    #[serde(default)]
    pub memory_threshold: f64,
    #[serde(default)]
    pub persistent_time_mins: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UserFilteringConfig {
    /// Always tracked, no further questions asked.
    #[serde(default)]
    pub included_users: Vec<String>,
    /// Never tracked.
    #[serde(default)]
    pub excluded_users: Vec<String>,
    #[serde(default = "default_min_uid")]
    pub min_uid_for_real_users: u32,
    #[serde(default = "default_ignore_system_users")]
    pub ignore_system_users: bool,
    #[serde(default = "default_min_activity_percent")]
    pub min_cpu_percent: f64,
    #[serde(default = "default_min_activity_percent")]
    pub min_memory_percent: f64,
    #[serde(default = "default_min_process_count")]
    pub min_process_count: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmailConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: Vec<String>,
    #[serde(default = "default_smtp_tls")]
    pub tls: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportingConfig {
    #[serde(default = "default_retain_days")]
    pub retain_days: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebsocketConfig {
    /// How often system_update frames are pushed to connected clients.
    #[serde(default = "default_push_interval_secs")]
    pub push_interval_secs: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval_secs(),
            cpu_threshold: default_threshold_percent(),
            memory_threshold: default_threshold_percent(),
            persistent_time_mins: default_persistent_time_mins(),
        }
    }
}

impl Default for UserDefaultsConfig {
    fn default() -> Self {
        Self {
            cpu_threshold: default_threshold_percent(),
            memory_threshold: default_threshold_percent(),
            persistent_time_mins: default_persistent_time_mins(),
        }
    }
}

impl Default for UserFilteringConfig {
    fn default() -> Self {
        Self {
            included_users: Vec::new(),
            excluded_users: Vec::new(),
            min_uid_for_real_users: default_min_uid(),
            ignore_system_users: default_ignore_system_users(),
            min_cpu_percent: default_min_activity_percent(),
            min_memory_percent: default_min_activity_percent(),
            min_process_count: default_min_process_count(),
        }
    }
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            smtp_host: String::new(),
            smtp_port: default_smtp_port(),
            username: String::new(),
            password: String::new(),
            from: String::new(),
            to: Vec::new(),
            tls: default_smtp_tls(),
        }
    }
}

impl Default for ReportingConfig {
    fn default() -> Self {
        Self {
            retain_days: default_retain_days(),
        }
    }
}

impl Default for WebsocketConfig {
    fn default() -> Self {
        Self {
            push_interval_secs: default_push_interval_secs(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            data_dir: default_data_dir(),
            monitoring: MonitoringConfig::default(),
            users: UserDefaultsConfig::default(),
            user_thresholds: HashMap::new(),
            user_filtering: UserFilteringConfig::default(),
            email: EmailConfig::default(),
            reporting: ReportingConfig::default(),
            websocket: WebsocketConfig::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to write config file {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse YAML in {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] serde_yaml::Error),
    #[error("config validation error: {0}")]
    Validation(String),
    #[error("unknown config key '{0}'")]
    UnknownKey(String),
}

impl Config {
    /// Loads the YAML config, falling back to defaults when the file does
    /// not exist yet.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        if !path_ref.exists() {
            return Ok(Config::default());
        }
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        if let Some(parent) = path_ref.parent() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                path: path_display.clone(),
                source,
            })?;
        }
        let text = serde_yaml::to_string(self)?;
        fs::write(path_ref, text).map_err(|source| ConfigError::Write {
            path: path_display,
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.trim().is_empty() {
            return Err(ConfigError::Validation("listen is required".to_string()));
        }
        if SocketAddr::from_str(&self.listen).is_err() {
            return Err(ConfigError::Validation(
                "listen must be a valid host:port address".to_string(),
            ));
        }
        if self.monitoring.check_interval_secs < 1 {
            return Err(ConfigError::Validation(
                "monitoring.check_interval_secs must be >= 1".to_string(),
            ));
        }
        if self.monitoring.persistent_time_mins < 1 {
            return Err(ConfigError::Validation(
                "monitoring.persistent_time_mins must be >= 1".to_string(),
            ));
        }
        validate_percent("monitoring.cpu_threshold", self.monitoring.cpu_threshold)?;
        validate_percent(
            "monitoring.memory_threshold",
            self.monitoring.memory_threshold,
        )?;
        if self.users.persistent_time_mins < 1 {
            return Err(ConfigError::Validation(
                "users.persistent_time_mins must be >= 1".to_string(),
            ));
        }
        validate_percent("users.cpu_threshold", self.users.cpu_threshold)?;
        validate_percent("users.memory_threshold", self.users.memory_threshold)?;
        for (name, t) in &self.user_thresholds {
            if name.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "user_thresholds keys must be non-empty usernames".to_string(),
                ));
            }
            validate_percent(
                &format!("user_thresholds.{name}.cpu_threshold"),
                t.cpu_threshold,
            )?;
            validate_percent(
                &format!("user_thresholds.{name}.memory_threshold"),
                t.memory_threshold,
            )?;
        }
        validate_percent(
            "user_filtering.min_cpu_percent",
            self.user_filtering.min_cpu_percent,
        )?;
        validate_percent(
            "user_filtering.min_memory_percent",
            self.user_filtering.min_memory_percent,
        )?;
        if self.reporting.retain_days < 1 {
            return Err(ConfigError::Validation(
                "reporting.retain_days must be >= 1".to_string(),
            ));
        }
        if self.websocket.push_interval_secs < 1 {
            return Err(ConfigError::Validation(
                "websocket.push_interval_secs must be >= 1".to_string(),
            ));
        }
        if self.email.enabled && self.email.smtp_host.trim().is_empty() {
            return Err(ConfigError::Validation(
                "email.smtp_host is required when email.enabled is true".to_string(),
            ));
        }

        Ok(())
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.monitoring.check_interval_secs)
    }

    pub fn retain_period(&self) -> Duration {
        Duration::from_secs(u64::from(self.reporting.retain_days) * 24 * 3600)
    }

    pub fn push_interval(&self) -> Duration {
        Duration::from_secs(self.websocket.push_interval_secs)
    }

    /// Effective threshold for a user metric: the per-user override when it
    /// is non-zero, the global user default otherwise.
    pub fn user_threshold(&self, username: &str, metric: Metric) -> f64 {
        let override_value = self.user_thresholds.get(username).map(|t| match metric {
            Metric::Cpu => t.cpu_threshold,
            Metric::Memory => t.memory_threshold,
        });
        match override_value {
            Some(v) if v > 0.0 => v,
            _ => match metric {
                Metric::Cpu => self.users.cpu_threshold,
                Metric::Memory => self.users.memory_threshold,
            },
        }
    }

    pub fn user_persistent_secs(&self, username: &str) -> u64 {
        let mins = self
            .user_thresholds
            .get(username)
            .map(|t| t.persistent_time_mins)
            .filter(|&m| m > 0)
            .unwrap_or(self.users.persistent_time_mins);
        mins * 60
    }

    pub fn is_email_enabled(&self) -> bool {
        self.email.enabled && !self.email.smtp_host.trim().is_empty() && !self.email.to.is_empty()
    }

    /// Runtime update of one system-level knob. Unknown keys are rejected
    /// rather than silently ignored.
    pub fn set_system_threshold(&mut self, key: &str, value: f64) -> Result<(), ConfigError> {
        match key {
            "cpu_threshold" => {
                validate_percent("monitoring.cpu_threshold", value)?;
                self.monitoring.cpu_threshold = value;
            }
            "memory_threshold" => {
                validate_percent("monitoring.memory_threshold", value)?;
                self.monitoring.memory_threshold = value;
            }
            "persistent_time_mins" => {
                if value < 1.0 {
                    return Err(ConfigError::Validation(
                        "monitoring.persistent_time_mins must be >= 1".to_string(),
                    ));
                }
                self.monitoring.persistent_time_mins = value as u64;
            }
            "check_interval_secs" => {
                if value < 1.0 {
                    return Err(ConfigError::Validation(
                        "monitoring.check_interval_secs must be >= 1".to_string(),
                    ));
                }
                self.monitoring.check_interval_secs = value as u64;
            }
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        Ok(())
    }

    pub fn set_user_threshold(
        &mut self,
        username: &str,
        key: &str,
        value: f64,
    ) -> Result<(), ConfigError> {
        let entry = self.user_thresholds.entry(username.to_string()).or_default();
        match key {
            "cpu_threshold" => {
                validate_percent("cpu_threshold", value)?;
                entry.cpu_threshold = value;
            }
            "memory_threshold" => {
                validate_percent("memory_threshold", value)?;
                entry.memory_threshold = value;
            }
            "persistent_time_mins" => {
                entry.persistent_time_mins = value.max(0.0) as u64;
            }
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        Ok(())
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

fn validate_percent(field: &str, value: f64) -> Result<(), ConfigError> {
    if !(0.0..=100.0).contains(&value) {
        return Err(ConfigError::Validation(format!(
            "{field} must be in range 0..100"
        )));
    }
    Ok(())
}

fn default_listen() -> String {
    "127.0.0.1:9109".to_string()
}

fn default_data_dir() -> String {
    "/var/lib/usagemon".to_string()
}

const fn default_check_interval_secs() -> u64 {
    60
}

const fn default_threshold_percent() -> f64 {
    80.0
}

const fn default_persistent_time_mins() -> u64 {
    60
}

const fn default_min_uid() -> u32 {
    1000
}

const fn default_ignore_system_users() -> bool {
    true
}

const fn default_min_activity_percent() -> f64 {
    5.0
}

const fn default_min_process_count() -> usize {
    3
}

const fn default_smtp_port() -> u16 {
    587
}

const fn default_smtp_tls() -> bool {
    true
}

const fn default_retain_days() -> u32 {
    30
}

const fn default_push_interval_secs() -> u64 {
    5
}
