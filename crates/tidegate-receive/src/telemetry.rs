use anyhow::{Context, Result};
use prometheus::{Encoder, Registry, TextEncoder};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::metrics::ReceiveMetrics;

/// Log subscriber and metrics registry for an embedding server.
pub struct Telemetry {
    registry: Registry,
}

impl Telemetry {
    /// Installs the global tracing subscriber (`RUST_LOG`, default `info`).
    pub fn init() -> Result<Self> {
        tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .try_init()
            .context("failed to initialise tracing subscriber")?;
        Ok(Self::metrics_only())
    }

    /// Registry without touching the global subscriber.
    pub fn metrics_only() -> Self {
        Self {
            registry: Registry::new(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn receive_metrics(&self) -> Result<ReceiveMetrics> {
        ReceiveMetrics::new(&self.registry).context("failed to register receive metrics")
    }

    /// Text exposition of every registered metric.
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .context("failed to encode metrics")?;
        String::from_utf8(buffer).context("metrics output is not utf-8")
    }
}
