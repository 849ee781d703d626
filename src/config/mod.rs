//! Service configuration.
//!
//! Loads from a YAML file (`BATCHGATE_CONFIG_PATH`), inline YAML
//! (`BATCHGATE_CONFIG_YAML`) or environment variables, then validates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Built-in job frameworks that can be enabled under `integrations`.
pub const KNOWN_FRAMEWORKS: &[&str] = &["batch/job", "mpi/job"];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Pacing of outbound object-store traffic.
    #[serde(default)]
    pub client_connection: ClientConnectionConfig,

    /// Gate successor admissions within a ClusterQueue on prior admissions
    /// reaching PodsReady.
    #[serde(default)]
    pub wait_for_pods_ready: WaitForPodsReadyConfig,

    /// Whether jobs without an explicit queue name are managed.
    #[serde(default)]
    pub manage_jobs_without_queue_name: bool,

    /// Enabled job adapters.
    #[serde(default)]
    pub integrations: IntegrationsConfig,

    /// Admission cycle tuning.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Recognized for completeness; certificate rotation happens outside the
    /// admission core.
    #[serde(default)]
    pub internal_cert_management: InternalCertManagementConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConnectionConfig {
    pub qps: f64,
    pub burst: u32,
}

impl Default for ClientConnectionConfig {
    fn default() -> Self {
        Self { qps: 20.0, burst: 30 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WaitForPodsReadyConfig {
    #[serde(default)]
    pub enable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationsConfig {
    pub frameworks: Vec<String>,
}

impl Default for IntegrationsConfig {
    fn default() -> Self {
        Self {
            frameworks: vec!["batch/job".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Grace horizon for assumed admissions awaiting their observed event.
    pub assume_ttl_secs: u64,
    /// Minimum pause between scheduling cycles.
    pub min_backoff_ms: u64,
    /// Maximum idle interval before a cycle runs anyway.
    pub max_idle_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            assume_ttl_secs: 30,
            min_backoff_ms: 50,
            max_idle_secs: 60,
        }
    }
}

impl SchedulerConfig {
    pub fn assume_ttl(&self) -> Duration {
        Duration::from_secs(self.assume_ttl_secs)
    }

    pub fn min_backoff(&self) -> Duration {
        Duration::from_millis(self.min_backoff_ms)
    }

    pub fn max_idle(&self) -> Duration {
        Duration::from_secs(self.max_idle_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InternalCertManagementConfig {
    #[serde(default)]
    pub enable: bool,
}

impl Config {
    /// Load configuration from environment or file.
    pub fn load() -> Result<Self> {
        let config = match (
            std::env::var("BATCHGATE_CONFIG_PATH").ok(),
            std::env::var("BATCHGATE_CONFIG_YAML").ok(),
        ) {
            (Some(path), None) => {
                let path = PathBuf::from(path);
                if !path.exists() {
                    return Err(ConfigError::FileNotFound(path));
                }
                let content = std::fs::read_to_string(&path).map_err(ConfigError::FileRead)?;
                serde_yaml::from_str(&content).map_err(ConfigError::ParseYaml)?
            }
            (None, Some(yaml)) => serde_yaml::from_str(&yaml).map_err(ConfigError::ParseYaml)?,
            _ => Self::from_env()?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();

        if let Ok(qps) = std::env::var("BATCHGATE_CLIENT_QPS") {
            config.client_connection.qps = qps
                .parse()
                .map_err(|_| ConfigError::InvalidValue(format!("client qps: {qps}")))?;
        }
        if let Ok(burst) = std::env::var("BATCHGATE_CLIENT_BURST") {
            config.client_connection.burst = burst
                .parse()
                .map_err(|_| ConfigError::InvalidValue(format!("client burst: {burst}")))?;
        }
        if let Ok(enable) = std::env::var("BATCHGATE_WAIT_FOR_PODS_READY") {
            config.wait_for_pods_ready.enable = parse_bool(&enable)?;
        }
        if let Ok(manage) = std::env::var("BATCHGATE_MANAGE_JOBS_WITHOUT_QUEUE_NAME") {
            config.manage_jobs_without_queue_name = parse_bool(&manage)?;
        }
        if let Ok(frameworks) = std::env::var("BATCHGATE_FRAMEWORKS") {
            config.integrations.frameworks = frameworks
                .split(',')
                .map(|f| f.trim().to_string())
                .filter(|f| !f.is_empty())
                .collect();
        }
        if let Ok(ttl) = std::env::var("BATCHGATE_ASSUME_TTL_SECS") {
            config.scheduler.assume_ttl_secs = ttl
                .parse()
                .map_err(|_| ConfigError::InvalidValue(format!("assume ttl: {ttl}")))?;
        }

        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.client_connection.qps <= 0.0 {
            return Err(ConfigError::InvalidValue(
                "client_connection.qps must be positive".to_string(),
            ));
        }
        if self.client_connection.burst == 0 {
            return Err(ConfigError::InvalidValue(
                "client_connection.burst must be at least 1".to_string(),
            ));
        }
        if self.scheduler.assume_ttl_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "scheduler.assume_ttl_secs must be at least 1".to_string(),
            ));
        }
        for framework in &self.integrations.frameworks {
            if !KNOWN_FRAMEWORKS.contains(&framework.as_str()) {
                return Err(ConfigError::UnknownFramework(framework.clone()));
            }
        }

        Ok(())
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(ConfigError::InvalidValue(format!("not a boolean: {value}"))),
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("failed to read configuration file: {0}")]
    FileRead(std::io::Error),

    #[error("failed to parse YAML configuration: {0}")]
    ParseYaml(serde_yaml::Error),

    #[error("invalid configuration value: {0}")]
    InvalidValue(String),

    #[error("unknown job framework: {0}")]
    UnknownFramework(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.client_connection.burst, 30);
        assert_eq!(config.integrations.frameworks, vec!["batch/job"]);
    }

    #[test]
    fn yaml_round_trip() {
        let yaml = r#"
client_connection:
  qps: 50.0
  burst: 100
wait_for_pods_ready:
  enable: true
integrations:
  frameworks: ["batch/job", "mpi/job"]
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.client_connection.burst, 100);
        assert!(config.wait_for_pods_ready.enable);
        assert_eq!(config.integrations.frameworks.len(), 2);
    }

    #[test]
    fn unknown_framework_rejected() {
        let mut config = Config::default();
        config.integrations.frameworks.push("ray/cluster".to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownFramework(_))
        ));
    }

    #[test]
    fn zero_qps_rejected() {
        let mut config = Config::default();
        config.client_connection.qps = 0.0;
        assert!(config.validate().is_err());
    }
}
