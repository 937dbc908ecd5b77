//! Named circuit breakers shared across an application
//!
//! The registry owns every instance it creates. Lookups are lock-free per
//! shard; creation goes through `DashMap`'s entry API so concurrent first
//! access to a name yields exactly one instance.

use crate::{
    circuit::{CircuitBreaker, Config, Metrics},
    classifier::FailureClassifier,
    clock::{Clock, MonotonicClock},
    errors::ConfigError,
    events::{BreakerEventKind, EventPublisher, EventStream},
};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Configuration a registry starts from
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistryConfig {
    /// Used for every instance without a more specific configuration
    pub default_config: Config,
    /// Shared configurations addressable by name
    pub configs: HashMap<String, Config>,
    /// Per-instance overrides, keyed by circuit name
    pub instances: HashMap<String, Config>,
}

/// Owner of named circuit breakers
pub struct Registry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    default_config: RwLock<Config>,
    configs: DashMap<String, Config>,
    instances: DashMap<String, Config>,
    default_classifier: RwLock<Option<Arc<dyn FailureClassifier>>>,
    classifiers: DashMap<String, Arc<dyn FailureClassifier>>,
    clock: Arc<dyn Clock>,
    events: EventPublisher,
}

impl Registry {
    /// Create a registry, validating every configuration up front
    pub fn new(config: RegistryConfig) -> Result<Self, ConfigError> {
        Self::with_clock(config, Arc::new(MonotonicClock::new()))
    }

    /// Create a registry whose circuits all read the given clock
    pub fn with_clock(config: RegistryConfig, clock: Arc<dyn Clock>) -> Result<Self, ConfigError> {
        config.default_config.validate()?;
        for named in config.configs.values().chain(config.instances.values()) {
            named.validate()?;
        }

        Ok(Self {
            breakers: DashMap::new(),
            default_config: RwLock::new(config.default_config),
            configs: config.configs.into_iter().collect(),
            instances: config.instances.into_iter().collect(),
            default_classifier: RwLock::new(None),
            classifiers: DashMap::new(),
            clock,
            events: EventPublisher::new(),
        })
    }

    /// Registry with the default configuration and nothing else
    pub fn with_defaults() -> Self {
        Self {
            breakers: DashMap::new(),
            default_config: RwLock::new(Config::default()),
            configs: DashMap::new(),
            instances: DashMap::new(),
            default_classifier: RwLock::new(None),
            classifiers: DashMap::new(),
            clock: Arc::new(MonotonicClock::new()),
            events: EventPublisher::new(),
        }
    }

    /// Existing instance, or a new one from its override or the default config
    pub fn get_or_create(&self, name: &str) -> Result<Arc<CircuitBreaker>, ConfigError> {
        if let Some(existing) = self.find(name) {
            return Ok(existing);
        }

        let config = match self.instances.get(name) {
            Some(entry) => entry.value().clone(),
            None => self.default_config(),
        };
        self.get_or_create_with(name, config)
    }

    /// Existing instance, or a new one built from `config`
    pub fn get_or_create_with(
        &self,
        name: &str,
        config: Config,
    ) -> Result<Arc<CircuitBreaker>, ConfigError> {
        if let Some(existing) = self.find(name) {
            return Ok(existing);
        }

        let classifier = self.classifier_for(name);
        let breaker = match self.breakers.entry(name.to_string()) {
            Entry::Occupied(existing) => return Ok(Arc::clone(existing.get())),
            Entry::Vacant(slot) => {
                let breaker = Arc::new(CircuitBreaker::from_parts(
                    name.to_string(),
                    config,
                    Arc::clone(&self.clock),
                    classifier,
                    self.events.clone(),
                )?);
                slot.insert(Arc::clone(&breaker));
                breaker
            }
        };

        debug!(circuit = %name, "Circuit breaker created");
        self.publish(name, BreakerEventKind::Created);
        Ok(breaker)
    }

    /// Existing instance, or a new one built from a named shared configuration
    pub fn get_or_create_with_config_name(
        &self,
        name: &str,
        config_name: &str,
    ) -> Result<Arc<CircuitBreaker>, ConfigError> {
        let config = self
            .configs
            .get(config_name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ConfigError::UnknownConfig(config_name.to_string()))?;
        self.get_or_create_with(name, config)
    }

    pub fn find(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Forget an instance; callers still holding it keep a working breaker
    pub fn remove(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        let (_, removed) = self.breakers.remove(name)?;
        debug!(circuit = %name, "Circuit breaker removed");
        self.publish(name, BreakerEventKind::Removed);
        Some(removed)
    }

    /// Names of every instance, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.breakers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Metrics of every instance, sorted by name
    pub fn snapshots(&self) -> Vec<(String, Metrics)> {
        let mut snapshots: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().metrics()))
            .collect();
        snapshots.sort_by(|a, b| a.0.cmp(&b.0));
        snapshots
    }

    /// Events of every instance this registry owns, from now on
    ///
    /// Every call on every instance queues an event on the returned stream
    /// until it is received. Drop the stream when it is no longer read.
    pub fn subscribe(&self) -> EventStream {
        self.events.subscribe()
    }

    pub fn default_config(&self) -> Config {
        self.default_config.read().clone()
    }

    /// Replace the default for instances created from now on
    pub fn configure_default(&self, config: Config) -> Result<(), ConfigError> {
        config.validate()?;
        *self.default_config.write() = config;
        Ok(())
    }

    /// Register a shared configuration under `name`
    pub fn add_configuration(&self, name: &str, config: Config) -> Result<(), ConfigError> {
        config.validate()?;
        self.configs.insert(name.to_string(), config);
        Ok(())
    }

    /// Override the configuration used when `name` is first created
    pub fn configure_instance(&self, name: &str, config: Config) -> Result<(), ConfigError> {
        config.validate()?;
        self.instances.insert(name.to_string(), config);
        Ok(())
    }

    /// Classifier for instances created from now on without their own
    pub fn set_default_failure_classifier(&self, classifier: Arc<dyn FailureClassifier>) {
        *self.default_classifier.write() = Some(classifier);
    }

    /// Classifier used when `name` is first created
    pub fn set_failure_classifier(&self, name: &str, classifier: Arc<dyn FailureClassifier>) {
        self.classifiers.insert(name.to_string(), classifier);
    }

    fn classifier_for(&self, name: &str) -> Option<Arc<dyn FailureClassifier>> {
        match self.classifiers.get(name) {
            Some(entry) => Some(Arc::clone(entry.value())),
            None => self.default_classifier.read().clone(),
        }
    }

    pub fn configuration(&self, name: &str) -> Option<Config> {
        self.configs.get(name).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    fn publish(&self, name: &str, kind: BreakerEventKind) {
        self.events.publish(name, kind, self.clock.monotonic_time());
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("breakers", &self.names())
            .field("default_config", &*self.default_config.read())
            .field("configs", &self.configs.len())
            .field("instances", &self.instances.len())
            .finish()
    }
}
