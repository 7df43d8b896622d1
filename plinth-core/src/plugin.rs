//! The plugin contract: what a backend plugin declares during registration
//! and the environments the host hands it across the three lifecycle phases.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use sqlx::migrate::Migrator;
use tracing::warn;

use plinth_events::{EventBus, Listener, SubscribeOptions, SubscriptionId};

use crate::error::AppError;
use crate::extension::{ExtensionPoint, ExtensionPointManager, ExtensionRef};
use crate::metadata::PluginMetadata;
use crate::registry::{ServiceError, ServiceRef, ServiceRegistry};

/// A compiled-in backend plugin.
///
/// Rust cannot hot-load native code, so the set of loadable plugins is a
/// build-time table; dynamic install enables a table entry at runtime and
/// runs its registration and init phases. `register` may be called again
/// after a deregistration, so it must produce fresh declarations each time.
pub trait BackendPlugin: Send + Sync + 'static {
    /// The plugin id. Schemas, access rules and API paths derive from it.
    fn name(&self) -> &'static str;

    /// Phase 1. Declare init requests, services, extension points, access
    /// rules, the RPC router and cleanup handlers on the environment.
    fn register(&self, env: &mut RegistrationEnv);
}

// ── Declarations ────────────────────────────────────────────────────────────

/// A plugin-local access rule declaration.
#[derive(Debug, Clone)]
pub struct AccessRuleSpec {
    /// Local id; the host qualifies it to `<pluginId>.<id>`.
    pub id: &'static str,
    pub description: &'static str,
    /// Attach to the `users` role by default (unless an admin disabled it).
    pub is_authenticated_default: bool,
    /// Attach to the `anonymous` role by default (unless disabled).
    pub is_public_default: bool,
}

/// A declared access rule with its globally unique, qualified id. Travels
/// on the `accessRulesRegistered` hook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRule {
    pub id: String,
    pub description: String,
    pub is_authenticated_default: bool,
    pub is_public_default: bool,
}

/// Which caller types an operation admits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserType {
    User,
    Application,
    Any,
}

/// Metadata for one operation of a plugin's RPC router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationSpec {
    pub operation_id: String,
    /// Uppercase HTTP method.
    pub method: String,
    /// Path relative to the plugin mount, starting with `/`.
    pub path: String,
    pub description: Option<String>,
    pub user_type: UserType,
    /// Plugin-local access rule ids required by the operation.
    pub access_rules: Vec<String>,
}

/// The declared contract of a plugin's RPC router, used for boot-time rule
/// validation and OpenAPI aggregation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouterContract {
    pub operations: Vec<OperationSpec>,
}

pub type InitFn = Box<dyn FnOnce(InitContext) -> BoxFuture<'static, Result<(), AppError>> + Send>;
pub type AfterReadyFn =
    Box<dyn FnOnce(AfterReadyContext) -> BoxFuture<'static, Result<(), AppError>> + Send>;
pub type CleanupFn = Arc<dyn Fn() -> BoxFuture<'static, Result<(), AppError>> + Send + Sync>;

/// A plugin's init request, declared during Phase 1 and executed in
/// dependency order during Phase 2.
pub struct InitSpec {
    /// Ids of the services this plugin's init depends on. Edges in the
    /// Phase 2 graph run from each provider to this plugin.
    pub dependencies: Vec<&'static str>,
    /// Whether the plugin owns a database schema. Implied by `migrations`.
    pub create_schema: bool,
    /// Filesystem-shipped migrations, applied to `plugin_<id>` before init.
    pub migrations: Option<&'static Migrator>,
    pub init: InitFn,
    pub after_plugins_ready: Option<AfterReadyFn>,
}

impl InitSpec {
    pub fn new(init: InitFn) -> Self {
        Self {
            dependencies: Vec::new(),
            create_schema: false,
            migrations: None,
            init,
            after_plugins_ready: None,
        }
    }

    pub fn depends_on(mut self, service_id: &'static str) -> Self {
        self.dependencies.push(service_id);
        self
    }

    pub fn with_schema(mut self) -> Self {
        self.create_schema = true;
        self
    }

    pub fn with_migrations(mut self, migrator: &'static Migrator) -> Self {
        self.create_schema = true;
        self.migrations = Some(migrator);
        self
    }

    pub fn with_after_plugins_ready(mut self, f: AfterReadyFn) -> Self {
        self.after_plugins_ready = Some(f);
        self
    }
}

// ── Registration environment (Phase 1) ─────────────────────────────────────

/// Everything a plugin declared during Phase 1.
pub(crate) struct PluginRecord {
    pub metadata: PluginMetadata,
    pub init: Option<InitSpec>,
    pub access_rules: Vec<AccessRule>,
    pub router: Option<(axum::Router, RouterContract)>,
    pub cleanups: Vec<CleanupFn>,
    /// Service ids this plugin registered; used to build provider edges.
    pub provided_services: Vec<&'static str>,
}

/// The environment handed to [`BackendPlugin::register`].
pub struct RegistrationEnv {
    metadata: PluginMetadata,
    registry: Arc<ServiceRegistry>,
    extensions: Arc<ExtensionPointManager>,
    init: Option<InitSpec>,
    access_rules: Vec<AccessRule>,
    router: Option<(axum::Router, RouterContract)>,
    cleanups: Vec<CleanupFn>,
    provided_services: Vec<&'static str>,
}

impl RegistrationEnv {
    pub(crate) fn new(
        metadata: PluginMetadata,
        registry: Arc<ServiceRegistry>,
        extensions: Arc<ExtensionPointManager>,
    ) -> Self {
        Self {
            metadata,
            registry,
            extensions,
            init: None,
            access_rules: Vec::new(),
            router: None,
            cleanups: Vec::new(),
            provided_services: Vec::new(),
        }
    }

    pub fn metadata(&self) -> &PluginMetadata {
        &self.metadata
    }

    /// Declare the plugin's init request. At most one; a second declaration
    /// replaces the first with a warning.
    pub fn register_init(&mut self, spec: InitSpec) {
        if self.init.is_some() {
            warn!(plugin = %self.metadata.name, "init request replaced");
        }
        self.init = Some(spec);
    }

    /// Declare a singleton service available to every plugin.
    pub fn register_service<T: Clone + Send + Sync + 'static>(
        &mut self,
        service: ServiceRef<T>,
        value: T,
    ) {
        self.registry.register(service, value);
        self.provided_services.push(service.id());
    }

    /// Declare a per-plugin service factory.
    pub fn register_service_factory<T, F>(&mut self, service: ServiceRef<T>, factory: F)
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(&PluginMetadata) -> T + Send + Sync + 'static,
    {
        self.registry.register_factory(service, factory);
        self.provided_services.push(service.id());
    }

    /// Provide the implementation of an extension point; buffered consumer
    /// calls replay immediately.
    pub fn register_extension_point<T: ?Sized + Send + Sync + 'static>(
        &self,
        reference: ExtensionRef<T>,
        implementation: Arc<T>,
    ) {
        self.extensions
            .register_extension_point(reference, implementation);
    }

    /// Obtain a (possibly not yet backed) extension-point proxy.
    pub fn get_extension_point<T: ?Sized + Send + Sync + 'static>(
        &self,
        reference: ExtensionRef<T>,
    ) -> Arc<ExtensionPoint<T>> {
        self.extensions.get_extension_point(reference)
    }

    /// Declare the plugin's access rules. Ids are qualified with the plugin
    /// id; a local id containing `.` is rejected to keep the namespace flat.
    pub fn register_access_rules(&mut self, specs: &[AccessRuleSpec]) {
        for spec in specs {
            if spec.id.contains('.') || spec.id.is_empty() {
                warn!(
                    plugin = %self.metadata.name,
                    rule = spec.id,
                    "ignoring access rule with invalid local id"
                );
                continue;
            }
            self.access_rules.push(AccessRule {
                id: self.metadata.qualify_rule(spec.id),
                description: spec.description.to_string(),
                is_authenticated_default: spec.is_authenticated_default,
                is_public_default: spec.is_public_default,
            });
        }
    }

    /// Declare the plugin's RPC router and its contract. The router is
    /// mounted under `/api/<pluginId>/` once init succeeds.
    pub fn register_router(&mut self, router: axum::Router, contract: RouterContract) {
        if self.router.is_some() {
            warn!(plugin = %self.metadata.name, "router registration replaced");
        }
        self.router = Some((router, contract));
    }

    /// Register a cleanup handler; handlers run in LIFO order when the
    /// plugin is deregistered.
    pub fn register_cleanup(&mut self, cleanup: CleanupFn) {
        self.cleanups.push(cleanup);
    }

    pub(crate) fn into_record(self) -> PluginRecord {
        PluginRecord {
            metadata: self.metadata,
            init: self.init,
            access_rules: self.access_rules,
            router: self.router,
            cleanups: self.cleanups,
            provided_services: self.provided_services,
        }
    }
}

// ── Init / after-ready contexts (Phases 2 and 3) ────────────────────────────

/// Plugin-scoped service resolution.
#[derive(Clone)]
pub struct ServiceAccess {
    registry: Arc<ServiceRegistry>,
    plugin: PluginMetadata,
}

impl ServiceAccess {
    pub(crate) fn new(registry: Arc<ServiceRegistry>, plugin: PluginMetadata) -> Self {
        Self { registry, plugin }
    }

    pub fn get<T: Clone + Send + Sync + 'static>(
        &self,
        service: ServiceRef<T>,
    ) -> Result<T, ServiceError> {
        self.registry.get(service, &self.plugin)
    }
}

/// Context for Phase 2 init.
pub struct InitContext {
    pub plugin: PluginMetadata,
    pub services: ServiceAccess,
}

/// Subscription binder handed to `after_plugins_ready`. Subscriptions made
/// through it are recorded against the plugin, so deregistration removes
/// them in bulk.
#[derive(Clone)]
pub struct HookBinder {
    bus: EventBus,
    plugin_id: String,
}

impl HookBinder {
    pub(crate) fn new(bus: EventBus, plugin_id: String) -> Self {
        Self { bus, plugin_id }
    }

    pub async fn on_hook(
        &self,
        hook: &str,
        options: SubscribeOptions,
        listener: Listener,
    ) -> Result<SubscriptionId, plinth_events::EventError> {
        self.bus
            .subscribe(&self.plugin_id, hook, options, listener)
            .await
    }

    pub async fn emit_hook<P: Serialize>(
        &self,
        hook: &str,
        payload: &P,
    ) -> Result<(), plinth_events::EventError> {
        self.bus.emit(hook, payload).await
    }
}

/// Context for Phase 3.
pub struct AfterReadyContext {
    pub plugin: PluginMetadata,
    pub services: ServiceAccess,
    pub hooks: HookBinder,
}
