//! Configuration for the lodestar CLI
//!
//! Values are layered, later sources winning: built-in defaults, an optional
//! config file, `LODESTAR_` environment variables (nested keys separated by
//! `__`, e.g. `LODESTAR_REGISTRY__TTL_SECS`), then command line flags.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use config::{Config, Environment, File};
use lodestar_client::RegistryOptions;
use lodestar_client::store::EtcdOptions;
use serde::Deserialize;

const ENV_PREFIX: &str = "LODESTAR";

/// Connection settings for the etcd cluster.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    pub endpoints: Vec<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["http://127.0.0.1:2379".to_string()],
            username: None,
            password: None,
            connect_timeout_secs: 5,
            request_timeout_secs: 10,
        }
    }
}

impl StoreConfig {
    pub fn etcd_options(&self) -> EtcdOptions {
        EtcdOptions {
            endpoints: self.endpoints.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct RegistryConfig {
    pub namespace: String,
    pub ttl_secs: u64,
    pub max_retry: u32,
    pub attempt_timeout_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        let defaults = RegistryOptions::default();
        Self {
            namespace: defaults.namespace,
            ttl_secs: defaults.ttl.as_secs(),
            max_retry: defaults.max_retry,
            attempt_timeout_secs: defaults.attempt_timeout.as_secs(),
        }
    }
}

impl RegistryConfig {
    /// Registry options; validated later by `Registry::new`.
    pub fn options(&self) -> RegistryOptions {
        RegistryOptions::default()
            .with_namespace(self.namespace.clone())
            .with_ttl(Duration::from_secs(self.ttl_secs))
            .with_max_retry(self.max_retry)
            .with_attempt_timeout(Duration::from_secs(self.attempt_timeout_secs))
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
    /// Directory for the rolling log file; file logging is off when unset
    pub dir: Option<String>,
    pub file: bool,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
            file: false,
        }
    }
}

/// Complete CLI configuration.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub store: StoreConfig,
    pub registry: RegistryConfig,
    pub logging: LoggingSection,
}

impl AppConfig {
    /// Load from `path` (if given) and the process environment.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        Self::load_from(path, environment())
    }

    fn load_from(path: Option<&Path>, env: Environment) -> anyhow::Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        let config = builder
            .add_source(env)
            .build()
            .with_context(|| match path {
                Some(path) => format!("failed to load configuration from {}", path.display()),
                None => "failed to load configuration".to_string(),
            })?;

        config
            .try_deserialize()
            .context("invalid configuration")
    }

    /// Apply command line overrides; empty or absent values leave the config as is.
    pub fn override_with(&mut self, endpoints: &[String], namespace: Option<&str>) {
        if !endpoints.is_empty() {
            self.store.endpoints = endpoints.to_vec();
        }
        if let Some(namespace) = namespace {
            self.registry.namespace = namespace.to_string();
        }
    }
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("store.endpoints")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_from(vars: &[(&str, &str)]) -> Environment {
        let source: config::Map<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        environment().source(Some(source))
    }

    #[test]
    fn test_defaults_without_sources() {
        let config = AppConfig::load_from(None, env_from(&[])).unwrap();

        assert_eq!(config, AppConfig::default());
        assert_eq!(config.store.endpoints, vec!["http://127.0.0.1:2379"]);
        assert_eq!(config.registry.namespace, "/microservices");
        assert_eq!(config.registry.ttl_secs, 15);
        assert_eq!(config.registry.max_retry, 5);
        assert!(config.registry.options().validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lodestar.toml");
        std::fs::write(
            &path,
            r#"
[store]
endpoints = ["http://10.0.0.1:2379", "http://10.0.0.2:2379"]
username = "root"

[registry]
namespace = "/prod"
ttl_secs = 30

[logging]
level = "debug"
"#,
        )
        .unwrap();

        let config = AppConfig::load_from(Some(&path), env_from(&[])).unwrap();

        assert_eq!(config.store.endpoints.len(), 2);
        assert_eq!(config.store.username.as_deref(), Some("root"));
        assert_eq!(config.store.password, None);
        assert_eq!(config.registry.namespace, "/prod");
        assert_eq!(config.registry.ttl_secs, 30);
        // unset keys keep their defaults
        assert_eq!(config.registry.max_retry, 5);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_environment_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lodestar.toml");
        std::fs::write(&path, "[registry]\nttl_secs = 30\nmax_retry = 2\n").unwrap();

        let env = env_from(&[
            ("LODESTAR_REGISTRY__TTL_SECS", "60"),
            ("LODESTAR_STORE__ENDPOINTS", "http://a:2379,http://b:2379"),
        ]);
        let config = AppConfig::load_from(Some(&path), env).unwrap();

        assert_eq!(config.registry.ttl_secs, 60);
        assert_eq!(config.registry.max_retry, 2);
        assert_eq!(config.store.endpoints, vec!["http://a:2379", "http://b:2379"]);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");

        let err = AppConfig::load_from(Some(&path), env_from(&[])).unwrap_err();
        assert!(err.to_string().contains("absent.toml"));
    }

    #[test]
    fn test_command_line_overrides() {
        let mut config = AppConfig::default();
        config.override_with(&[], None);
        assert_eq!(config, AppConfig::default());

        config.override_with(&["http://etcd:2379".to_string()], Some("/staging"));
        assert_eq!(config.store.endpoints, vec!["http://etcd:2379"]);
        assert_eq!(config.registry.namespace, "/staging");
    }

    #[test]
    fn test_section_conversions() {
        let config = AppConfig {
            store: StoreConfig {
                connect_timeout_secs: 2,
                ..StoreConfig::default()
            },
            registry: RegistryConfig {
                ttl_secs: 20,
                max_retry: 0,
                ..RegistryConfig::default()
            },
            ..AppConfig::default()
        };

        let etcd = config.store.etcd_options();
        assert_eq!(etcd.connect_timeout, Duration::from_secs(2));
        assert_eq!(etcd.request_timeout, Duration::from_secs(10));

        let options = config.registry.options();
        assert_eq!(options.ttl, Duration::from_secs(20));
        assert_eq!(options.max_retry, 0);
        assert_eq!(options.namespace, "/microservices");
    }
}
