//! YAML configuration loading and validation.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::instance::StopSignal;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub port_range: PortRangeConfig,

    #[serde(default)]
    pub apps: Vec<RawAppConfig>,

    #[serde(default)]
    pub rpc: RpcConfig,
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct PortRangeConfig {
    pub from: u16,
    pub to: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RawAppConfig {
    pub name: String,
    pub command: String,

    #[serde(default = "default_healthcheck")]
    pub healthcheck: String,

    #[serde(default = "default_stop_signal")]
    pub stop_signal: String,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_start_timeout")]
    pub start_timeout: u64,

    #[serde(default = "default_stop_timeout")]
    pub stop_timeout: u64,

    #[serde(default = "default_internal_host")]
    pub internal_host: String,

    #[serde(default = "default_external_host")]
    pub external_host: String,

    pub external_port: u16,

    #[serde(default = "default_auto_start")]
    pub auto_start: bool,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RpcConfig {
    #[serde(default = "default_rpc_host")]
    pub host: String,

    #[serde(default = "default_rpc_port")]
    pub port: u16,

    pub auth_token: Option<String>,
}

fn default_healthcheck() -> String {
    "/health".to_string()
}

fn default_stop_signal() -> String {
    "SIGTERM".to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_start_timeout() -> u64 {
    10
}

fn default_stop_timeout() -> u64 {
    10
}

fn default_internal_host() -> String {
    "127.0.0.1".to_string()
}

fn default_external_host() -> String {
    "0.0.0.0".to_string()
}

fn default_auto_start() -> bool {
    true
}

fn default_rpc_host() -> String {
    "127.0.0.1".to_string()
}

fn default_rpc_port() -> u16 {
    9000
}

/// A validated, ready-to-use application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub name: String,
    pub command: String,
    pub healthcheck: String,
    pub stop_signal: StopSignal,
    pub max_retries: u32,
    pub start_timeout: Duration,
    pub stop_timeout: Duration,
    pub internal_host: String,
    pub external_host: String,
    pub external_port: u16,
    pub auto_start: bool,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the whole file and returns ready-to-use [`AppConfig`]s.
    pub fn validate(&self) -> anyhow::Result<Vec<AppConfig>> {
        let mut errors = Vec::new();

        if self.port_range.from > self.port_range.to {
            errors.push(format!(
                "port_range: 'from' ({}) must be <= 'to' ({})",
                self.port_range.from, self.port_range.to
            ));
        }

        if self.rpc.port == 0 {
            errors.push("rpc: 'port' must be greater than 0".to_string());
        }

        let mut seen = std::collections::HashSet::new();
        let mut apps = Vec::with_capacity(self.apps.len());

        for raw in &self.apps {
            if raw.name.is_empty() {
                errors.push("apps: 'name' must not be empty".to_string());
                continue;
            }
            if !seen.insert(raw.name.clone()) {
                errors.push(format!("apps: duplicate app name '{}'", raw.name));
                continue;
            }
            if raw.command.trim().is_empty() {
                errors.push(format!("app '{}': 'command' must not be empty", raw.name));
            }
            if raw.external_port == 0 {
                errors.push(format!(
                    "app '{}': 'external_port' must be greater than 0",
                    raw.name
                ));
            }
            let stop_signal = match StopSignal::from_str(&raw.stop_signal) {
                Ok(s) => s,
                Err(e) => {
                    errors.push(format!("app '{}': {}", raw.name, e));
                    continue;
                }
            };

            apps.push(AppConfig {
                name: raw.name.clone(),
                command: raw.command.clone(),
                healthcheck: raw.healthcheck.clone(),
                stop_signal,
                max_retries: raw.max_retries,
                start_timeout: Duration::from_secs(raw.start_timeout),
                stop_timeout: Duration::from_secs(raw.stop_timeout),
                internal_host: raw.internal_host.clone(),
                external_host: raw.external_host.clone(),
                external_port: raw.external_port,
                auto_start: raw.auto_start,
            });
        }

        if !errors.is_empty() {
            anyhow::bail!("configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(apps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> Config {
        serde_yml::from_str(yaml).expect("valid yaml")
    }

    #[test]
    fn parses_minimal_config() {
        let config = parse(
            r#"
port_range: { from: 20000, to: 20010 }
apps:
  - name: web
    command: "./demo-app"
    external_port: 8080
rpc:
  port: 9000
"#,
        );
        let apps = config.validate().unwrap();
        assert_eq!(apps.len(), 1);
        assert_eq!(apps[0].healthcheck, "/health");
        assert_eq!(apps[0].max_retries, 3);
    }

    #[test]
    fn rejects_duplicate_app_names() {
        let config = parse(
            r#"
port_range: { from: 20000, to: 20010 }
apps:
  - name: web
    command: "a"
    external_port: 8080
  - name: web
    command: "b"
    external_port: 8081
rpc:
  port: 9000
"#,
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_inverted_port_range() {
        let config = parse(
            r#"
port_range: { from: 20010, to: 20000 }
apps: []
rpc:
  port: 9000
"#,
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unknown_stop_signal() {
        let config = parse(
            r#"
port_range: { from: 20000, to: 20010 }
apps:
  - name: web
    command: "a"
    external_port: 8080
    stop_signal: "SIGBOGUS"
rpc:
  port: 9000
"#,
        );
        assert!(config.validate().is_err());
    }
}
