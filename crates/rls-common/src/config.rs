//! Configuration types for the RLS engine

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Main configuration for the RLS engine and its collaborators
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RlsConfig {
    /// Policy evaluation configuration
    pub engine: EngineConfig,
    /// Principal/role configuration
    pub auth: AuthConfig,
    /// Change notification configuration
    pub realtime: RealtimeConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl RlsConfig {
    /// Parse configuration from TOML text
    ///
    /// # Errors
    /// Returns `ConfigError` if the text is not valid configuration.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| Error::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    ///
    /// # Errors
    /// Returns `ConfigError` describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        if self.engine.max_recursion_depth == 0 {
            return Err(Error::ConfigError(
                "engine.max_recursion_depth must be at least 1".to_string(),
            ));
        }
        if self.realtime.channel_capacity == 0 {
            return Err(Error::ConfigError(
                "realtime.channel_capacity must be at least 1".to_string(),
            ));
        }
        if matches!(&self.auth.service_key, Some(key) if key.len() < 16) {
            return Err(Error::ConfigError(
                "auth.service_key must be at least 16 characters".to_string(),
            ));
        }
        Ok(())
    }
}

/// Policy evaluation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum sub-query nesting depth while evaluating policies (default: 16)
    pub max_recursion_depth: u32,
    /// Cache resolved predicates per (table, operation, role)
    pub cache_enabled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_recursion_depth: 16,
            cache_enabled: true,
        }
    }
}

/// Principal/role configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Role assigned to requests without a principal id
    pub anon_role: String,
    /// Role assigned to authenticated principals by default
    pub authenticated_role: String,
    /// Service key accepted by the bypass authority (disabled if unset)
    pub service_key: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            anon_role: "anon".to_string(),
            authenticated_role: "authenticated".to_string(),
            service_key: None,
        }
    }
}

/// Change notification configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Per-subscriber channel buffer size
    pub channel_capacity: usize,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Emit JSON formatted log lines
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
