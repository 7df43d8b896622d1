//! Per-request context.
//!
//! The `/api/{plugin_id}/...` handler assembles a [`RequestContext`] by
//! resolving core services through the registry for the target plugin,
//! attaches the authenticated caller, and hands the context to the
//! plugin's router as a request extension.

use std::sync::Arc;

use plinth_data::ScopedDb;
use plinth_events::EventBus;
use serde::Serialize;
use tracing::debug;

use crate::auth::Caller;
use crate::error::AppError;
use crate::fetch::FetchClient;
use crate::health::ScopedHealthRegistry;
use crate::metadata::PluginMetadata;
use crate::plugin::ServiceAccess;
use crate::plugin_config::ConfigService;

/// Typed references to the services the host provides. Plugins resolve
/// these like any other service; additional queue services are provided by
/// queue plugins under the ids in [`crate::registry::services`].
pub mod core_services {
    use super::*;
    use crate::registry::{services, ServiceRef};

    pub const SCOPED_DB: ServiceRef<ScopedDb> = ServiceRef::new(services::SCOPED_DB);
    pub const SCOPED_LOGGER: ServiceRef<tracing::Span> = ServiceRef::new(services::SCOPED_LOGGER);
    pub const EVENT_BUS: ServiceRef<EventBus> = ServiceRef::new(services::EVENT_BUS);
    pub const FETCH_CLIENT: ServiceRef<FetchClient> = ServiceRef::new(services::FETCH_CLIENT);
    pub const HEALTH_CHECKS: ServiceRef<ScopedHealthRegistry> =
        ServiceRef::new(services::HEALTH_CHECKS);
    pub const PLUGIN_CONFIG: ServiceRef<ConfigService> = ServiceRef::new(services::PLUGIN_CONFIG);
}

struct ContextInner {
    plugin: PluginMetadata,
    caller: Caller,
    db: ScopedDb,
    bus: EventBus,
    fetch: FetchClient,
    health: ScopedHealthRegistry,
    config: ConfigService,
    services: ServiceAccess,
    span: tracing::Span,
}

/// Everything a plugin handler needs for one request. Cheap to clone.
#[derive(Clone)]
pub struct RequestContext {
    inner: Arc<ContextInner>,
}

impl RequestContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        plugin: PluginMetadata,
        caller: Caller,
        db: ScopedDb,
        bus: EventBus,
        fetch: FetchClient,
        health: ScopedHealthRegistry,
        config: ConfigService,
        services: ServiceAccess,
        span: tracing::Span,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                plugin,
                caller,
                db,
                bus,
                fetch,
                health,
                config,
                services,
                span,
            }),
        }
    }

    pub fn plugin(&self) -> &PluginMetadata {
        &self.inner.plugin
    }

    pub fn caller(&self) -> &Caller {
        &self.inner.caller
    }

    pub fn db(&self) -> &ScopedDb {
        &self.inner.db
    }

    pub fn fetch(&self) -> &FetchClient {
        &self.inner.fetch
    }

    pub fn health(&self) -> &ScopedHealthRegistry {
        &self.inner.health
    }

    pub fn config(&self) -> &ConfigService {
        &self.inner.config
    }

    pub fn services(&self) -> &ServiceAccess {
        &self.inner.services
    }

    pub fn span(&self) -> &tracing::Span {
        &self.inner.span
    }

    /// Enqueue a hook on the event bus.
    pub async fn emit_hook<P: Serialize>(&self, hook: &str, payload: &P) -> Result<(), AppError> {
        self.inner.bus.emit(hook, payload).await?;
        Ok(())
    }

    /// Enforce the plugin-local access rules required by an operation.
    ///
    /// Service callers passed the internal trust boundary (their token was
    /// signed by this platform) and are not subject to rule checks.
    pub fn require(&self, local_rules: &[&str]) -> Result<(), AppError> {
        if local_rules.is_empty() {
            return Ok(());
        }
        let qualified: Vec<String> = local_rules
            .iter()
            .map(|r| self.inner.plugin.qualify_rule(r))
            .collect();
        let refs: Vec<&str> = qualified.iter().map(String::as_str).collect();

        match &self.inner.caller {
            Caller::Service { .. } => Ok(()),
            // Anonymous callers may hold public-default rules; anything
            // beyond those requires authentication rather than more rules.
            Caller::Anonymous { access_rules } => {
                let held: Vec<&str> = access_rules.iter().map(String::as_str).collect();
                if refs.iter().all(|r| held.contains(r)) {
                    Ok(())
                } else {
                    Err(AppError::Unauthorized("authentication required".into()))
                }
            }
            Caller::Application(principal) | Caller::User(principal) => {
                if principal.has_rules(&refs) {
                    Ok(())
                } else {
                    debug!(
                        plugin = %self.inner.plugin.name,
                        required = ?qualified,
                        held = ?principal.access_rules,
                        "access rules not satisfied"
                    );
                    Err(AppError::Forbidden("insufficient permissions".into()))
                }
            }
        }
    }
}
