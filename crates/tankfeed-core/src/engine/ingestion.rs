//! Main ingestion engine orchestration.
//!
//! Integrates all components of the live feed:
//! - Source registry with one watcher per source
//! - Broadcast hub fanning batches out to subscribers
//! - Health tracking per source plus registry and hub
//! - Metrics for cycles, errors and deliveries

use crate::broadcast::BroadcastHub;
use crate::config::Config;
use crate::health::{source_component, HealthCheck};
use crate::metrics::{ErrorType, IngestionMetrics};
use crate::source::{SourceDescriptor, SourceEvent, SourceRegistry};
use crate::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Upper bound on waiting for watchers during shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Main ingestion engine.
pub struct IngestionEngine {
    config: Config,
    registry: SourceRegistry,
    hub: Arc<BroadcastHub>,
    metrics: Arc<IngestionMetrics>,
    health: Arc<HealthCheck>,
    shutdown_tx: broadcast::Sender<()>,
}

impl IngestionEngine {
    /// Create a new ingestion engine reading through the standard loader.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let registry = SourceRegistry::new(config.registry.clone())?;
        Self::with_registry(config, registry)
    }

    /// Create an engine around an existing registry. The configured sources
    /// are added to it.
    pub fn with_registry(config: Config, registry: SourceRegistry) -> Result<Self> {
        let metrics = Arc::new(IngestionMetrics::new());
        let hub = Arc::new(BroadcastHub::with_metrics(
            config.broadcast.clone(),
            Arc::clone(&metrics),
        ));

        let health = Arc::new(HealthCheck::new());
        health.register_component("registry");
        health.register_component("broadcast");

        let (shutdown_tx, _) = broadcast::channel(1);

        let engine = Self {
            config,
            registry,
            hub,
            metrics,
            health,
            shutdown_tx,
        };

        for descriptor in engine.config.sources.clone() {
            engine.add_source(descriptor)?;
        }

        Ok(engine)
    }

    /// Register a source with the registry and start tracking its health.
    pub fn add_source(&self, descriptor: SourceDescriptor) -> Result<()> {
        let id = descriptor.id.clone();
        self.registry.add_source(descriptor)?;
        self.health.register_component(&source_component(&id));
        self.metrics.set_sources(self.registry.len());
        Ok(())
    }

    /// Remove a source, its replay snapshot and its health entry.
    pub fn remove_source(&self, id: &str) -> bool {
        if !self.registry.remove_source(id) {
            return false;
        }
        self.hub.forget_source(id);
        self.health.remove_component(&source_component(id));
        self.metrics.set_sources(self.registry.len());
        true
    }

    /// Run until a shutdown signal arrives.
    pub async fn run(&self) -> Result<()> {
        // Subscribe before starting so the first batches are not missed
        let mut events = self.registry.subscribe();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        self.registry.start();
        self.health.mark_healthy("registry");
        self.health.mark_healthy("broadcast");
        self.health.set_ready(true);

        let cancel = CancellationToken::new();
        let liveness = tokio::spawn(Arc::clone(&self.hub).run_health_checks(cancel.clone()));

        info!(sources = self.registry.len(), "Ingestion engine started");

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }

                event = events.recv() => match event {
                    Ok(event) => self.handle_event(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped = skipped, "Event consumer lagged, batches dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        self.health.mark_unhealthy("registry", "event channel closed");
                        error!("Registry event channel closed, stopping");
                        break;
                    }
                }
            }
        }

        self.health.set_ready(false);
        cancel.cancel();
        if let Err(e) = liveness.await {
            warn!(error = %e, "Liveness task ended abnormally");
        }

        self.shutdown().await;
        Ok(())
    }

    fn handle_event(&self, event: SourceEvent) {
        // Events queued before a removal must not revive the source
        if self.registry.source_status(event.source_id()).is_none() {
            debug!(source_id = %event.source_id(), "Dropping event for removed source");
            return;
        }

        match event {
            SourceEvent::Data {
                source_id,
                records,
                metadata,
            } => {
                self.metrics
                    .record_cycle(records.len(), Duration::from_millis(metadata.duration_ms));
                self.health.mark_healthy(&source_component(&source_id));

                match self.hub.broadcast_records(&source_id, &records) {
                    Ok(report) => {
                        self.health.mark_healthy("broadcast");
                        debug!(
                            source_id = %source_id,
                            records = records.len(),
                            delivered = report.delivered,
                            removed = report.removed,
                            "Batch broadcast"
                        );
                    }
                    Err(e) => {
                        self.health
                            .mark_degraded("broadcast", &format!("Broadcast failed: {}", e));
                        error!(source_id = %source_id, error = %e, "Failed to broadcast batch");
                    }
                }
            }
            SourceEvent::Error {
                source_id,
                category,
                error,
            } => {
                self.metrics
                    .record_error_by_type(ErrorType::from_category(&category));
                self.health
                    .mark_unhealthy(&source_component(&source_id), &error);

                if let Err(e) = self.hub.broadcast_error(&source_id, &error) {
                    error!(source_id = %source_id, error = %e, "Failed to broadcast source error");
                }
            }
        }
    }

    async fn shutdown(&self) {
        info!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "Shutting down ingestion engine"
        );
        self.registry.stop(SHUTDOWN_TIMEOUT).await;
        self.health.mark_unhealthy("registry", "stopped");

        let closed = self.hub.close_all();
        info!(subscribers_closed = closed, "Ingestion engine shut down complete");
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    /// Get metrics.
    pub fn metrics(&self) -> &Arc<IngestionMetrics> {
        &self.metrics
    }

    /// Get health check.
    pub fn health(&self) -> &Arc<HealthCheck> {
        &self.health
    }

    /// Get shutdown signal sender.
    pub fn shutdown_signal(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }
}
