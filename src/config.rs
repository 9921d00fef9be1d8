// Configuration loading and validation
// Defaults, then an optional file, then BULWARK_* environment variables

//! # Configuration
//!
//! [`Settings`] gathers one section per middleware plus the server and
//! lifecycle sections. It is assembled with the `config` crate from three
//! layered sources, later ones overriding earlier ones:
//!
//! 1. built-in defaults (every section is `#[serde(default)]`)
//! 2. an optional file (`toml`, `yaml` or `json`, chosen by extension)
//! 3. environment variables: `BULWARK_<SECTION>__<FIELD>`, for example
//!    `BULWARK_RATE_LIMIT__LIMIT=200` or `BULWARK_SERVER__PORT=9000`
//!
//! Validation is separate from loading. [`Settings::validate`] runs every
//! section's checks and reports all problems at once in
//! [`BulwarkError::Validation`].

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use crate::middleware::{
    BodyLimitOptions, CircuitBreakerOptions, RateLimitOptions, RecoveryOptions, TimeoutOptions,
};
use crate::{BulwarkError, Result};

pub const ENV_PREFIX: &str = "BULWARK";

/// Environment variable names consulted to detect production, in order
pub const ENVIRONMENT_VARIABLES: [&str; 2] = ["APP_ENV", "GO_ENV"];

const PRODUCTION_VALUES: [&str; 4] = ["production", "prod", "PRODUCTION", "PROD"];

/// True when the environment names production. Stack traces are never sent
/// to clients in production.
pub fn is_production() -> bool {
    environment_name().map_or(false, |name| is_production_value(&name))
}

/// First non-empty value among [`ENVIRONMENT_VARIABLES`]
pub fn environment_name() -> Option<String> {
    ENVIRONMENT_VARIABLES
        .iter()
        .filter_map(|var| env::var(var).ok())
        .find(|value| !value.is_empty())
}

pub fn is_production_value(value: &str) -> bool {
    PRODUCTION_VALUES.contains(&value)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Service name, also used to name the circuit breaker
    pub name: String,
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            name: "bulwark".to_string(),
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleSettings {
    pub init_timeout_ms: u64,
    pub start_timeout_ms: u64,
    pub stop_timeout_ms: u64,
    /// Keep going when a component fails to init, start or stop
    pub continue_on_error: bool,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            init_timeout_ms: 30_000,
            start_timeout_ms: 30_000,
            stop_timeout_ms: 30_000,
            continue_on_error: false,
        }
    }
}

impl LifecycleSettings {
    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        for (name, value) in [
            ("init_timeout_ms", self.init_timeout_ms),
            ("start_timeout_ms", self.start_timeout_ms),
            ("stop_timeout_ms", self.stop_timeout_ms),
        ] {
            if value == 0 {
                errors.push(format!("lifecycle.{} must be greater than 0", name));
            }
        }
        errors
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub body_limit: BodyLimitOptions,
    pub recovery: RecoveryOptions,
    pub timeout: TimeoutOptions,
    pub rate_limit: RateLimitOptions,
    pub circuit_breaker: CircuitBreakerOptions,
    pub lifecycle: LifecycleSettings,
}

impl Settings {
    /// Load defaults, the optional file at `path`, then the environment
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::with_name(path).required(true));
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let settings: Settings = builder.build()?.try_deserialize()?;
        Ok(settings)
    }

    /// Every section's problems, collected
    pub fn errors(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.server.name.trim().is_empty() {
            errors.push("server.name must not be empty".to_string());
        }
        errors.extend(self.body_limit.validate());
        errors.extend(self.recovery.validate());
        errors.extend(self.timeout.validate());
        errors.extend(self.rate_limit.validate());
        errors.extend(self.circuit_breaker.validate());
        errors.extend(self.lifecycle.validate());
        errors
    }

    pub fn validate(&self) -> Result<()> {
        let errors = self.errors();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(BulwarkError::Validation(errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::LimiterBackend;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.circuit_breaker.error_threshold, 500);
        assert_eq!(settings.rate_limit.backend, LimiterBackend::Memory);
        assert!(settings.rate_limit.fail_open);
    }

    #[test]
    fn test_validation_collects_every_error() {
        let mut settings = Settings::default();
        settings.body_limit.max_size = 0;
        settings.timeout.timeout_ms = 0;
        settings.rate_limit.limit = 0;
        settings.rate_limit.backend = LimiterBackend::Redis;
        settings.rate_limit.trusted_proxies = vec!["nope".to_string()];
        settings.circuit_breaker.error_threshold = 302;
        settings.circuit_breaker.max_failures = 0;

        match settings.validate() {
            Err(BulwarkError::Validation(errors)) => {
                assert_eq!(errors.len(), 7, "{:?}", errors);
                assert!(errors.iter().any(|e| e.contains("error_threshold")));
                assert!(errors.iter().any(|e| e.contains("redis_url")));
            }
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_load_from_file() {
        let dir = env::temp_dir().join(format!("bulwark-config-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("settings.json");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(
            file,
            r#"{{
                "server": {{ "name": "orders", "port": 9090 }},
                "circuit_breaker": {{ "max_failures": 3, "skip_paths": ["/health"] }},
                "rate_limit": {{ "limit": 10, "window_ms": 1000 }}
            }}"#
        )
        .unwrap();

        let settings = Settings::load(path.to_str()).unwrap();
        assert_eq!(settings.server.name, "orders");
        assert_eq!(settings.server.port, 9090);
        assert_eq!(settings.circuit_breaker.max_failures, 3);
        assert_eq!(settings.circuit_breaker.skip_paths, vec!["/health".to_string()]);
        assert_eq!(settings.circuit_breaker.error_threshold, 500);
        assert_eq!(settings.rate_limit.limit, 10);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_production_values() {
        for value in ["production", "prod", "PRODUCTION", "PROD"] {
            assert!(is_production_value(value));
        }
        for value in ["", "staging", "Production", "dev"] {
            assert!(!is_production_value(value));
        }
    }
}
