use crate::core::doctor::UptimePolicy;
use crate::core::error::ConfigError;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

#[derive(Serialize, Deserialize, Debug)]
pub struct Profiles {
    pub active: String,
}
// application.yml only names the active profile
#[derive(Serialize, Deserialize, Debug)]
pub struct EnvConfig {
    pub profiles: Profiles,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct Bootstrap {
    #[serde(default)]
    pub server: Server,
    /// Absent means the in-memory store is used.
    #[serde(default)]
    pub store: Option<StoreConfig>,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub alarm: Option<AlarmConfig>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct Server {
    #[serde(default = "default_addr")]
    pub addr: String,
}

impl Default for Server {
    fn default() -> Self {
        Server {
            addr: default_addr(),
        }
    }
}

/// PostgREST endpoint holding the device and unit tables.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StoreConfig {
    pub url: String,
    pub api_key: String,
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default = "default_units_table")]
    pub units_table: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    #[default]
    Tcp,
    Icmp,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct MonitorConfig {
    pub interval_secs: u64,
    pub probe_timeout_ms: u64,
    pub probe: ProbeKind,
    /// Ports tried in order by the tcp prober.
    pub ports: Vec<u16>,
    pub refused_is_reachable: bool,
    pub success_step: f64,
    pub max_success_step: f64,
    pub failure_step: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        let policy = UptimePolicy::default();
        MonitorConfig {
            interval_secs: 120,
            probe_timeout_ms: 1500,
            probe: ProbeKind::Tcp,
            ports: vec![80, 443, 22],
            refused_is_reachable: true,
            success_step: policy.success_step,
            max_success_step: policy.max_success_step,
            failure_step: policy.failure_step,
        }
    }
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn uptime_policy(&self) -> UptimePolicy {
        UptimePolicy {
            success_step: self.success_step,
            max_success_step: self.max_success_step,
            failure_step: self.failure_step,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "monitor.interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.probe_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "monitor.probe_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.probe == ProbeKind::Tcp && self.ports.is_empty() {
            return Err(ConfigError::Invalid(
                "monitor.ports must not be empty for the tcp prober".to_string(),
            ));
        }
        let steps = [self.success_step, self.max_success_step, self.failure_step];
        if steps.iter().any(|s| !s.is_finite() || *s < 0.0) {
            return Err(ConfigError::Invalid(
                "monitor uptime steps must be finite and non-negative".to_string(),
            ));
        }
        if self.max_success_step >= 100.0 {
            return Err(ConfigError::Invalid(
                "monitor.max_success_step must stay below 100".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AlarmConfig {
    pub from: String,
    pub to: String,
    pub smtp_username: String,
    pub smtp_password: String,
    pub domain: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
}

fn default_addr() -> String {
    "127.0.0.1:3000".to_string()
}

fn default_table() -> String {
    "network_monitoring".to_string()
}

fn default_units_table() -> String {
    "units".to_string()
}

fn default_smtp_port() -> u16 {
    587
}

// 加载指定配置文件
fn load_config<T>(path: &Path) -> Result<T, ConfigError>
where
    T: DeserializeOwned,
{
    let display = path.display().to_string();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: display.clone(),
        source,
    })?;
    serde_yaml::from_str::<T>(&content).map_err(|source| ConfigError::Parse {
        path: display,
        source,
    })
}

// 加载目标文件application.yml
fn load_env_config(dir: &Path) -> Result<EnvConfig, ConfigError> {
    load_config::<EnvConfig>(&dir.join("application.yml"))
}
// 根据环境加载application-{}.yml文件
fn load_bootstrap_config_from_env(dir: &Path, active: &str) -> Result<Bootstrap, ConfigError> {
    load_config::<Bootstrap>(&dir.join(format!("application-{}.yml", active)))
}

fn config_dir() -> PathBuf {
    std::env::var_os("MONITOR_CONFIG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Loads `application.yml` from `MONITOR_CONFIG_DIR` (or the working
/// directory), then the `application-{active}.yml` profile it names.
pub fn load_bootstrap_config() -> Result<Bootstrap, ConfigError> {
    load_bootstrap_config_from(&config_dir())
}

pub fn load_bootstrap_config_from(dir: &Path) -> Result<Bootstrap, ConfigError> {
    let env_config = load_env_config(dir)?;
    info!(profile = %env_config.profiles.active, "loading configuration profile");
    let bootstrap = load_bootstrap_config_from_env(dir, &env_config.profiles.active)?;
    bootstrap.monitor.validate()?;
    Ok(bootstrap)
}
