//! TOML settings for a registry
//!
//! ```toml
//! enabled = true
//!
//! [default]
//! failure_rate_threshold = 50.0
//! sliding_window_size = 20
//! minimum_number_of_calls = 10
//! wait_duration_in_open_state_ms = 30000
//!
//! [configs.sensitive]
//! failure_rate_threshold = 20.0
//!
//! [instances.payments]
//! base_config = "sensitive"
//! call_timeout_ms = 2000
//! ```
//!
//! Every field is optional; unset fields inherit from the base configuration.
//! Durations are milliseconds.

use crate::{
    circuit::Config, errors::ConfigError, registry::RegistryConfig, window::SlidingWindowType,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Partial circuit configuration as written in a settings file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BreakerSettings {
    /// Named shared configuration to inherit from (instances only)
    pub base_config: Option<String>,
    pub failure_rate_threshold: Option<f32>,
    pub slow_call_rate_threshold: Option<f32>,
    pub slow_call_duration_threshold_ms: Option<u64>,
    pub sliding_window_type: Option<SlidingWindowType>,
    pub sliding_window_size: Option<usize>,
    pub minimum_number_of_calls: Option<usize>,
    pub wait_duration_in_open_state_ms: Option<u64>,
    pub permitted_calls_in_half_open_state: Option<usize>,
    pub automatic_transition_from_open_to_half_open: Option<bool>,
    pub wait_jitter_factor: Option<f64>,
    pub call_timeout_ms: Option<u64>,
}

impl BreakerSettings {
    /// Overlay the fields that are set onto `base`
    pub fn apply_to(&self, base: &Config) -> Config {
        let mut config = base.clone();

        if let Some(threshold) = self.failure_rate_threshold {
            config.failure_rate_threshold = threshold;
        }
        if let Some(threshold) = self.slow_call_rate_threshold {
            config.slow_call_rate_threshold = threshold;
        }
        if let Some(ms) = self.slow_call_duration_threshold_ms {
            config.slow_call_duration_threshold = Duration::from_millis(ms);
        }
        if let Some(kind) = self.sliding_window_type {
            config.sliding_window_type = kind;
        }
        if let Some(size) = self.sliding_window_size {
            config.sliding_window_size = size;
        }
        if let Some(calls) = self.minimum_number_of_calls {
            config.minimum_number_of_calls = calls;
        }
        if let Some(ms) = self.wait_duration_in_open_state_ms {
            config.wait_duration_in_open_state = Duration::from_millis(ms);
        }
        if let Some(calls) = self.permitted_calls_in_half_open_state {
            config.permitted_calls_in_half_open_state = calls;
        }
        if let Some(enabled) = self.automatic_transition_from_open_to_half_open {
            config.automatic_transition_from_open_to_half_open = enabled;
        }
        if let Some(factor) = self.wait_jitter_factor {
            config.wait_jitter_factor = factor;
        }
        if let Some(ms) = self.call_timeout_ms {
            config.call_timeout = Some(Duration::from_millis(ms));
        }

        config
    }
}

/// Registry settings: the enable flag plus default, shared and per-instance configs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegistrySettings {
    /// When false, bootstrap builds no registry at all
    pub enabled: bool,
    pub default: BreakerSettings,
    pub configs: HashMap<String, BreakerSettings>,
    pub instances: HashMap<String, BreakerSettings>,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            default: BreakerSettings::default(),
            configs: HashMap::new(),
            instances: HashMap::new(),
        }
    }
}

impl RegistrySettings {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Load settings from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Resolve inheritance and validate every resulting configuration
    pub fn into_registry_config(&self) -> Result<RegistryConfig, ConfigError> {
        if self.default.base_config.is_some() {
            return Err(ConfigError::invalid(
                "base_config",
                "is not allowed on the default configuration",
            ));
        }
        let default_config = self.default.apply_to(&Config::default());
        default_config.validate()?;

        let mut configs = HashMap::with_capacity(self.configs.len());
        for (name, settings) in &self.configs {
            if settings.base_config.is_some() {
                return Err(ConfigError::invalid(
                    "base_config",
                    format!("is only allowed on instances, found on config '{name}'"),
                ));
            }
            let config = settings.apply_to(&default_config);
            config.validate()?;
            configs.insert(name.clone(), config);
        }

        let mut instances = HashMap::with_capacity(self.instances.len());
        for (name, settings) in &self.instances {
            let base = match &settings.base_config {
                Some(base_name) => configs
                    .get(base_name)
                    .ok_or_else(|| ConfigError::UnknownConfig(base_name.clone()))?,
                None => &default_config,
            };
            let config = settings.apply_to(base);
            config.validate()?;
            instances.insert(name.clone(), config);
        }

        Ok(RegistryConfig {
            default_config,
            configs,
            instances,
        })
    }
}
