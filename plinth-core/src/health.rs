//! Health checks.
//!
//! Plugins register indicators against their scoped registry; the platform
//! aggregates all of them for the liveness endpoint.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;

/// Result of one health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    Up,
    Down,
}

/// A single health check contributed by the platform or a plugin.
#[async_trait]
pub trait HealthIndicator: Send + Sync + 'static {
    fn name(&self) -> &str;
    async fn check(&self) -> HealthStatus;
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub checks: Vec<HealthCheckResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResult {
    pub plugin: String,
    pub name: String,
    pub status: HealthStatus,
}

/// Process-wide collection of indicators, keyed by the owning plugin.
#[derive(Clone, Default)]
pub struct HealthCheckRegistry {
    indicators: Arc<DashMap<String, Vec<Arc<dyn HealthIndicator>>>>,
}

impl HealthCheckRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A view that registers on behalf of one plugin.
    pub fn scoped(&self, plugin_id: &str) -> ScopedHealthRegistry {
        ScopedHealthRegistry {
            registry: self.clone(),
            plugin_id: plugin_id.to_string(),
        }
    }

    /// Drop a plugin's indicators (deregistration path).
    pub fn remove_plugin(&self, plugin_id: &str) {
        self.indicators.remove(plugin_id);
    }

    /// Run every indicator and aggregate.
    pub async fn report(&self) -> HealthReport {
        let mut checks = Vec::new();
        let entries: Vec<(String, Vec<Arc<dyn HealthIndicator>>)> = self
            .indicators
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        for (plugin, indicators) in entries {
            for indicator in indicators {
                let status = indicator.check().await;
                checks.push(HealthCheckResult {
                    plugin: plugin.clone(),
                    name: indicator.name().to_string(),
                    status,
                });
            }
        }

        let status = if checks.iter().any(|c| c.status == HealthStatus::Down) {
            HealthStatus::Down
        } else {
            HealthStatus::Up
        };
        HealthReport { status, checks }
    }
}

/// Per-plugin registration handle handed out by the service registry.
#[derive(Clone)]
pub struct ScopedHealthRegistry {
    registry: HealthCheckRegistry,
    plugin_id: String,
}

impl ScopedHealthRegistry {
    pub fn register(&self, indicator: Arc<dyn HealthIndicator>) {
        self.registry
            .indicators
            .entry(self.plugin_id.clone())
            .or_default()
            .push(indicator);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(&'static str, HealthStatus);

    #[async_trait]
    impl HealthIndicator for Fixed {
        fn name(&self) -> &str {
            self.0
        }
        async fn check(&self) -> HealthStatus {
            self.1
        }
    }

    #[tokio::test]
    async fn empty_registry_is_up() {
        let registry = HealthCheckRegistry::new();
        assert_eq!(registry.report().await.status, HealthStatus::Up);
    }

    #[tokio::test]
    async fn one_down_check_degrades_the_report() {
        let registry = HealthCheckRegistry::new();
        registry
            .scoped("a")
            .register(Arc::new(Fixed("db", HealthStatus::Up)));
        registry
            .scoped("b")
            .register(Arc::new(Fixed("queue", HealthStatus::Down)));

        let report = registry.report().await;
        assert_eq!(report.status, HealthStatus::Down);
        assert_eq!(report.checks.len(), 2);
    }

    #[tokio::test]
    async fn removing_a_plugin_drops_its_checks() {
        let registry = HealthCheckRegistry::new();
        registry
            .scoped("a")
            .register(Arc::new(Fixed("db", HealthStatus::Down)));
        registry.remove_plugin("a");
        assert_eq!(registry.report().await.status, HealthStatus::Up);
    }
}
