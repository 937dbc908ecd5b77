//! Startup wiring
//!
//! Builds the registry once from settings, runs customizers against it and
//! optionally binds a metrics sink. Nothing is built when the settings are
//! disabled.

use crate::{
    clock::Clock,
    errors::ConfigError,
    metrics::{MetricsPublisher, MetricsSink},
    registry::Registry,
    settings::RegistrySettings,
};
use std::sync::Arc;
use tracing::info;

/// Hook run once against a freshly built registry
pub trait Customizer: Send + Sync {
    fn customize(&self, registry: &Registry);
}

impl<F> Customizer for F
where
    F: Fn(&Registry) + Send + Sync,
{
    fn customize(&self, registry: &Registry) {
        self(registry)
    }
}

/// Builder for the circuit breaker engine
pub struct Bootstrap {
    settings: RegistrySettings,
    customizers: Vec<Box<dyn Customizer>>,
    metrics_sink: Option<Arc<dyn MetricsSink>>,
    clock: Option<Arc<dyn Clock>>,
}

impl Bootstrap {
    pub fn new(settings: RegistrySettings) -> Self {
        Self {
            settings,
            customizers: Vec::new(),
            metrics_sink: None,
            clock: None,
        }
    }

    /// Add a customizer; customizers run in the order they were added
    pub fn customizer(mut self, customizer: impl Customizer + 'static) -> Self {
        self.customizers.push(Box::new(customizer));
        self
    }

    /// Bind a metrics sink; without one no publisher is created
    pub fn metrics_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics_sink = Some(sink);
        self
    }

    /// Use a custom time source for every circuit
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Build the engine, or `None` when the settings disable it
    pub fn build(self) -> Result<Option<Engine>, ConfigError> {
        if !self.settings.enabled {
            info!("Circuit breakers disabled by settings");
            return Ok(None);
        }

        let config = self.settings.into_registry_config()?;
        let registry = Arc::new(match self.clock {
            Some(clock) => Registry::with_clock(config, clock)?,
            None => Registry::new(config)?,
        });

        for customizer in &self.customizers {
            customizer.customize(&registry);
        }

        let metrics = self
            .metrics_sink
            .map(|sink| MetricsPublisher::new(Arc::clone(&registry), sink));

        info!(
            circuits = registry.len(),
            customizers = self.customizers.len(),
            metrics = metrics.is_some(),
            "Circuit breaker registry ready"
        );

        Ok(Some(Engine { registry, metrics }))
    }
}

impl std::fmt::Debug for Bootstrap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bootstrap")
            .field("settings", &self.settings)
            .field("customizers", &self.customizers.len())
            .field("metrics_sink", &self.metrics_sink.is_some())
            .finish_non_exhaustive()
    }
}

/// What bootstrap produced: the registry and, if bound, its metrics publisher
#[derive(Debug, Clone)]
pub struct Engine {
    registry: Arc<Registry>,
    metrics: Option<MetricsPublisher>,
}

impl Engine {
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn metrics_publisher(&self) -> Option<&MetricsPublisher> {
        self.metrics.as_ref()
    }
}
