//! Health check system for monitoring component status.
//!
//! Components are the registry, the broadcast hub, and one entry per source
//! named `source:<id>`.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;

/// Health status of a component.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "lowercase")]
pub enum ComponentStatus {
    /// Component is healthy
    Healthy,
    /// Component is degraded but operational
    Degraded(String),
    /// Component is unhealthy
    Unhealthy(String),
    /// Component status is unknown
    Unknown,
}

/// Overall system health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All components healthy
    Healthy,
    /// Some components degraded
    Degraded,
    /// System is unhealthy
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }
}

/// Status of one component with the time it last changed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentReport {
    #[serde(flatten)]
    pub status: ComponentStatus,
    pub updated_at: DateTime<Utc>,
}

/// Health check manager for tracking component health.
pub struct HealthCheck {
    components: RwLock<BTreeMap<String, ComponentReport>>,
    ready: RwLock<bool>,
}

/// Component name of a source.
pub fn source_component(source_id: &str) -> String {
    format!("source:{}", source_id)
}

impl HealthCheck {
    /// Create a new health check manager.
    pub fn new() -> Self {
        Self {
            components: RwLock::new(BTreeMap::new()),
            ready: RwLock::new(false),
        }
    }

    fn set(&self, name: &str, status: ComponentStatus) {
        self.components.write().insert(
            name.to_string(),
            ComponentReport {
                status,
                updated_at: Utc::now(),
            },
        );
    }

    /// Register a component to track.
    pub fn register_component(&self, name: &str) {
        self.set(name, ComponentStatus::Unknown);
    }

    /// Stop tracking a component.
    pub fn remove_component(&self, name: &str) {
        self.components.write().remove(name);
    }

    /// Mark a component as healthy.
    pub fn mark_healthy(&self, name: &str) {
        self.set(name, ComponentStatus::Healthy);
    }

    /// Mark a component as degraded.
    pub fn mark_degraded(&self, name: &str, reason: &str) {
        self.set(name, ComponentStatus::Degraded(reason.to_string()));
    }

    /// Mark a component as unhealthy.
    pub fn mark_unhealthy(&self, name: &str, reason: &str) {
        self.set(name, ComponentStatus::Unhealthy(reason.to_string()));
    }

    /// Get the status of a specific component.
    pub fn get_component_status(&self, name: &str) -> Option<ComponentStatus> {
        self.components.read().get(name).map(|r| r.status.clone())
    }

    /// Get all component reports, sorted by name.
    pub fn get_all_statuses(&self) -> BTreeMap<String, ComponentReport> {
        self.components.read().clone()
    }

    /// Get overall system health status.
    ///
    /// A failing source only degrades the system; only core components can
    /// make it unhealthy.
    pub fn overall_status(&self) -> HealthStatus {
        let components = self.components.read();

        let mut has_degraded = false;
        for (name, report) in components.iter() {
            match &report.status {
                ComponentStatus::Unhealthy(_) if !name.starts_with("source:") => {
                    return HealthStatus::Unhealthy
                }
                ComponentStatus::Unhealthy(_) | ComponentStatus::Degraded(_) => has_degraded = true,
                _ => {}
            }
        }

        if has_degraded {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    /// Check if the system is operational (healthy or degraded).
    pub fn is_operational(&self) -> bool {
        matches!(
            self.overall_status(),
            HealthStatus::Healthy | HealthStatus::Degraded
        )
    }

    /// Mark the pipeline as ready to serve.
    pub fn set_ready(&self, ready: bool) {
        *self.ready.write() = ready;
    }

    /// Whether the pipeline is running and operational.
    pub fn is_ready(&self) -> bool {
        *self.ready.read() && self.is_operational()
    }
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self::new()
    }
}
