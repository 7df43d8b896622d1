//! The plugin lifecycle manager.
//!
//! Owns discovery, the three-phase initialization, request-context
//! assembly, and dynamic install/uninstall coordination across process
//! instances. All registries live inside the host and are reached through
//! its methods; nothing here is package-level mutable state.

use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::postgres::PgPool;
use sqlx::Row;
use tokio::sync::Mutex;
use tracing::{error, info, info_span, warn};

use plinth_data::{drop_plugin_schema, plugin_schema, run_plugin_migrations, ScopedDb};
use plinth_events::{hooks, EventBus, Listener, SubscribeOptions};

use crate::auth::{Caller, ServiceTokenIssuer};
use crate::config::PlatformConfig;
use crate::context::{core_services, RequestContext};
use crate::error::{AppError, BootError};
use crate::extension::ExtensionPointManager;
use crate::fetch::FetchClient;
use crate::health::HealthCheckRegistry;
use crate::metadata::{PluginKind, PluginMetadata};
use crate::plugin::{
    AccessRule, AfterReadyContext, AfterReadyFn, BackendPlugin, CleanupFn, HookBinder, InitContext,
    PluginRecord, RegistrationEnv, RouterContract, ServiceAccess,
};
use crate::plugin_config::{ConfigService, SecretCipher};
use crate::registry::{services, ServiceRegistry};
use crate::signals::{SignalHub, SIGNAL_PLUGIN_DEREGISTERED, SIGNAL_PLUGIN_INSTALLED};

/// Subscriptions the host itself makes are recorded under this id.
const PLATFORM_PLUGIN_ID: &str = "platform";

/// Payload of the single-plugin lifecycle hooks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginEvent {
    pub plugin_id: String,
}

/// Payload of `pluginInstallationRequested`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallRequested {
    pub plugin_id: String,
    pub path: String,
    pub kind: PluginKind,
}

/// Payload of `pluginDeregistrationRequested`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeregistrationRequested {
    pub plugin_id: String,
    pub delete_schema: bool,
}

/// Payload of `accessRulesRegistered`, one event per plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessRulesRegistered {
    pub plugin_id: String,
    pub rules: Vec<AccessRule>,
}

// ── Topological ordering ────────────────────────────────────────────────────

/// One plugin's edges for the Phase 2 graph.
pub(crate) struct TopoNode {
    pub name: String,
    pub dependencies: Vec<String>,
    pub provided: Vec<String>,
}

/// Stable topological sort of the plugin graph.
///
/// Edges run from each service provider to each consumer; additionally,
/// every provider of the queue-plugin registry precedes every consumer of
/// the queue manager, so the queue backend is chosen before anyone uses
/// it. Ready nodes are picked in insertion order (Kahn with an index heap).
/// `is_external` covers services the host itself provides.
pub(crate) fn topo_order(
    nodes: &[TopoNode],
    is_external: impl Fn(&str) -> bool,
) -> Result<Vec<usize>, BootError> {
    let mut providers: HashMap<&str, usize> = HashMap::new();
    for (i, node) in nodes.iter().enumerate() {
        for service in &node.provided {
            if providers.insert(service, i).is_some() {
                warn!(service = %service, "service provided by more than one plugin");
            }
        }
    }

    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    let mut in_degree: Vec<usize> = vec![0; nodes.len()];
    fn add_edge(
        from: usize,
        to: usize,
        dependents: &mut [Vec<usize>],
        in_degree: &mut [usize],
    ) {
        if from != to && !dependents[from].contains(&to) {
            dependents[from].push(to);
            in_degree[to] += 1;
        }
    }

    for (i, node) in nodes.iter().enumerate() {
        for dep in &node.dependencies {
            match providers.get(dep.as_str()) {
                Some(&j) => add_edge(j, i, &mut dependents, &mut in_degree),
                None if is_external(dep) => {}
                None => {
                    return Err(BootError::MissingDependency {
                        plugin: node.name.clone(),
                        service: dep.clone(),
                    })
                }
            }
        }
    }

    // Queue ordering: registry providers before queue-manager consumers.
    let registry_providers: Vec<usize> = nodes
        .iter()
        .enumerate()
        .filter(|(_, n)| n.provided.iter().any(|s| s == services::QUEUE_PLUGIN_REGISTRY))
        .map(|(i, _)| i)
        .collect();
    let manager_consumers: Vec<usize> = nodes
        .iter()
        .enumerate()
        .filter(|(_, n)| n.dependencies.iter().any(|s| s == services::QUEUE_MANAGER))
        .map(|(i, _)| i)
        .collect();
    for &from in &registry_providers {
        for &to in &manager_consumers {
            add_edge(from, to, &mut dependents, &mut in_degree);
        }
    }

    // Kahn's algorithm; the min-heap of indices keeps ties in insertion order.
    let mut ready: BinaryHeap<std::cmp::Reverse<usize>> = (0..nodes.len())
        .filter(|&i| in_degree[i] == 0)
        .map(std::cmp::Reverse)
        .collect();
    let mut order = Vec::with_capacity(nodes.len());

    while let Some(std::cmp::Reverse(i)) = ready.pop() {
        order.push(i);
        for &j in &dependents[i] {
            in_degree[j] -= 1;
            if in_degree[j] == 0 {
                ready.push(std::cmp::Reverse(j));
            }
        }
    }

    if order.len() != nodes.len() {
        let cycle: Vec<String> = (0..nodes.len())
            .filter(|&i| in_degree[i] > 0)
            .map(|i| nodes[i].name.clone())
            .collect();
        return Err(BootError::DependencyCycle { cycle });
    }
    Ok(order)
}

// ── The host ────────────────────────────────────────────────────────────────

/// The plugin host.
pub struct PluginHost {
    pool: PgPool,
    bus: EventBus,
    config: PlatformConfig,
    table: Vec<Arc<dyn BackendPlugin>>,
    registry: Arc<ServiceRegistry>,
    extensions: Arc<ExtensionPointManager>,
    health: HealthCheckRegistry,
    signals: SignalHub,
    config_service: ConfigService,
    fetch_base: FetchClient,
    routers: DashMap<String, axum::Router>,
    contracts: DashMap<String, RouterContract>,
    declared_rules: DashMap<String, Vec<AccessRule>>,
    cleanups: Mutex<HashMap<String, Vec<CleanupFn>>>,
    loaded: DashMap<String, PluginMetadata>,
}

impl PluginHost {
    pub fn new(
        pool: PgPool,
        bus: EventBus,
        config: PlatformConfig,
        issuer: Arc<dyn ServiceTokenIssuer>,
        table: Vec<Arc<dyn BackendPlugin>>,
    ) -> Arc<Self> {
        let cipher = match &config.config_encryption_key {
            Some(encoded) => Arc::new(
                SecretCipher::from_base64(encoded)
                    .unwrap_or_else(|e| panic!("invalid CONFIG_ENCRYPTION_KEY: {e}")),
            ),
            None => Arc::new(SecretCipher::ephemeral()),
        };
        let config_service = ConfigService::new(pool.clone(), cipher);
        let fetch_base = FetchClient::new(issuer, config.internal_url.clone());

        let host = Arc::new(Self {
            pool,
            bus,
            config,
            table,
            registry: Arc::new(ServiceRegistry::new()),
            extensions: Arc::new(ExtensionPointManager::new()),
            health: HealthCheckRegistry::new(),
            signals: SignalHub::new(),
            config_service,
            fetch_base,
            routers: DashMap::new(),
            contracts: DashMap::new(),
            declared_rules: DashMap::new(),
            cleanups: Mutex::new(HashMap::new()),
            loaded: DashMap::new(),
        });
        host.register_core_services();
        host
    }

    /// Register the factories for host-provided services. Factories are
    /// idempotent for the same plugin; the event bus is a shared singleton.
    fn register_core_services(&self) {
        let pool = self.pool.clone();
        self.registry
            .register_factory(core_services::SCOPED_DB, move |p| {
                ScopedDb::new(pool.clone(), &p.name).expect("plugin id validated at registration")
            });

        self.registry
            .register_factory(core_services::SCOPED_LOGGER, |p| {
                info_span!("plugin", plugin = %p.name)
            });

        self.registry
            .register(core_services::EVENT_BUS, self.bus.clone());

        let fetch = self.fetch_base.clone();
        self.registry
            .register_factory(core_services::FETCH_CLIENT, move |p| {
                fetch.for_plugin(&p.name)
            });

        let health = self.health.clone();
        self.registry
            .register_factory(core_services::HEALTH_CHECKS, move |p| {
                health.scoped(&p.name)
            });

        self.registry
            .register(core_services::PLUGIN_CONFIG, self.config_service.clone());
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn extensions(&self) -> &Arc<ExtensionPointManager> {
        &self.extensions
    }

    pub fn signals(&self) -> &SignalHub {
        &self.signals
    }

    pub fn health(&self) -> &HealthCheckRegistry {
        &self.health
    }

    pub fn config(&self) -> &PlatformConfig {
        &self.config
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Every access rule declared by currently loaded plugins. Input for
    /// the full rule sync.
    pub fn all_declared_rules(&self) -> Vec<AccessRule> {
        self.declared_rules
            .iter()
            .flat_map(|e| e.value().clone())
            .collect()
    }

    /// Snapshot of registered contracts for OpenAPI aggregation.
    pub fn contracts_snapshot(&self) -> Vec<(String, RouterContract)> {
        let mut out: Vec<(String, RouterContract)> = self
            .contracts
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn router_for(&self, plugin_id: &str) -> Option<axum::Router> {
        self.routers.get(plugin_id).map(|r| r.clone())
    }

    // ── Boot ────────────────────────────────────────────────────────────

    /// Discover, register, order, and initialize every enabled plugin,
    /// then run the after-ready phase and start install/uninstall
    /// coordination. Any failure aborts boot.
    pub async fn boot(self: &Arc<Self>) -> Result<(), BootError> {
        let discovered = self.discover().await?;
        let enabled: Vec<PluginMetadata> = discovered
            .into_iter()
            .filter(|m| m.enabled && m.kind == PluginKind::Backend)
            .collect();
        info!(count = enabled.len(), "starting plugin initialization");

        // Phase 1: register.
        let mut records = Vec::with_capacity(enabled.len());
        for metadata in enabled {
            records.push(self.run_register_phase(metadata)?);
        }

        // Phase 2: dependency-ordered init.
        let nodes: Vec<TopoNode> = records
            .iter()
            .map(|r| TopoNode {
                name: r.metadata.name.clone(),
                dependencies: r
                    .init
                    .as_ref()
                    .map(|i| i.dependencies.iter().map(|s| s.to_string()).collect())
                    .unwrap_or_default(),
                provided: r.provided_services.iter().map(|s| s.to_string()).collect(),
            })
            .collect();
        let registry = self.registry.clone();
        let order = topo_order(&nodes, |id| registry.contains(id))?;

        let mut records: Vec<Option<PluginRecord>> = records.into_iter().map(Some).collect();
        let mut after_ready: Vec<(PluginMetadata, AfterReadyFn)> = Vec::new();
        let mut initialized: Vec<PluginMetadata> = Vec::new();

        for idx in order {
            let record = records[idx].take().expect("each plugin initialized once");
            let metadata = record.metadata.clone();
            if let Some(ready) = self.run_init_phase(record).await? {
                after_ready.push(ready);
            }
            initialized.push(metadata);
        }

        for metadata in &initialized {
            self.bus
                .emit(
                    hooks::PLUGIN_INITIALIZED,
                    &PluginEvent {
                        plugin_id: metadata.name.clone(),
                    },
                )
                .await?;
        }

        self.validate_contracts()?;

        // Phase 3: announce rules, then run after-ready callbacks.
        for metadata in &initialized {
            self.emit_rules_registered(&metadata.name).await?;
        }
        for (metadata, callback) in after_ready {
            self.run_after_ready(metadata, callback).await?;
        }

        self.start_coordination().await?;
        info!("plugin host ready");
        Ok(())
    }

    /// Reconcile the compiled-in plugin table with the `plugin` DB table.
    ///
    /// New locals are inserted, renamed locals get their path updated, and
    /// rows marked uninstallable (remote installs) are never touched.
    async fn discover(&self) -> Result<Vec<PluginMetadata>, BootError> {
        let rows = sqlx::query(
            r#"SELECT name, path, type, enabled, is_uninstallable FROM plugin"#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut db_rows: HashMap<String, (String, String, bool, bool)> = rows
            .into_iter()
            .map(|row| {
                let name: String = row.get("name");
                (
                    name,
                    (
                        row.get("path"),
                        row.get("type"),
                        row.get("enabled"),
                        row.get("is_uninstallable"),
                    ),
                )
            })
            .collect();

        let mut discovered = Vec::new();
        for plugin in &self.table {
            let name = plugin.name().to_string();
            // The id feeds schemas and API paths; a hostile id must never
            // reach SQL identifier position.
            plugin_schema(&name).map_err(|e| BootError::PluginInit {
                plugin: name.clone(),
                message: e.to_string(),
            })?;
            let path = format!("plugins/{name}");

            match db_rows.remove(&name) {
                Some((db_path, _, enabled, true)) => {
                    // Remote install that is also in the build: keep its row.
                    discovered.push(PluginMetadata {
                        name,
                        path: db_path,
                        kind: PluginKind::Backend,
                        enabled,
                        is_uninstallable: true,
                    });
                }
                Some((db_path, _, enabled, false)) => {
                    if db_path != path {
                        sqlx::query("UPDATE plugin SET path = $1 WHERE name = $2")
                            .bind(&path)
                            .bind(&name)
                            .execute(&self.pool)
                            .await?;
                    }
                    discovered.push(PluginMetadata {
                        name,
                        path,
                        kind: PluginKind::Backend,
                        enabled,
                        is_uninstallable: false,
                    });
                }
                None => {
                    sqlx::query(
                        "INSERT INTO plugin (name, path, type, enabled, is_uninstallable)
                         VALUES ($1, $2, 'backend', true, false)",
                    )
                    .bind(&name)
                    .bind(&path)
                    .execute(&self.pool)
                    .await?;
                    discovered.push(PluginMetadata {
                        name,
                        path,
                        kind: PluginKind::Backend,
                        enabled: true,
                        is_uninstallable: false,
                    });
                }
            }
        }

        for (name, (_, kind, _, is_uninstallable)) in db_rows {
            if kind == "backend" && is_uninstallable {
                warn!(plugin = %name, "installed plugin is not present in this build, skipping");
            }
        }

        Ok(discovered)
    }

    fn run_register_phase(&self, metadata: PluginMetadata) -> Result<PluginRecord, BootError> {
        let plugin = self
            .table
            .iter()
            .find(|p| p.name() == metadata.name)
            .ok_or_else(|| BootError::UnknownPlugin {
                plugin: metadata.name.clone(),
            })?
            .clone();

        let mut env =
            RegistrationEnv::new(metadata, self.registry.clone(), self.extensions.clone());
        plugin.register(&mut env);
        Ok(env.into_record())
    }

    /// Phase 2 for one plugin: migrations, dependency resolution, init.
    /// Stores the plugin's declarations in the host registries once init
    /// succeeded.
    async fn run_init_phase(
        &self,
        record: PluginRecord,
    ) -> Result<Option<(PluginMetadata, AfterReadyFn)>, BootError> {
        let metadata = record.metadata.clone();
        let mut ready = None;

        if let Some(init) = record.init {
            if let Some(migrator) = init.migrations {
                run_plugin_migrations(&self.pool, &metadata.name, migrator)
                    .await
                    .map_err(|e| BootError::PluginInit {
                        plugin: metadata.name.clone(),
                        message: e.to_string(),
                    })?;
            } else if init.create_schema {
                let schema = metadata.schema();
                sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS \"{schema}\""))
                    .execute(&self.pool)
                    .await?;
            }

            let context = InitContext {
                plugin: metadata.clone(),
                services: ServiceAccess::new(self.registry.clone(), metadata.clone()),
            };
            (init.init)(context)
                .await
                .map_err(|e| BootError::PluginInit {
                    plugin: metadata.name.clone(),
                    message: e.to_string(),
                })?;

            if let Some(callback) = init.after_plugins_ready {
                ready = Some((metadata.clone(), callback));
            }
        }

        if !record.access_rules.is_empty() {
            self.declared_rules
                .insert(metadata.name.clone(), record.access_rules);
        }
        if let Some((router, contract)) = record.router {
            self.routers.insert(metadata.name.clone(), router);
            self.contracts.insert(metadata.name.clone(), contract);
        }
        if !record.cleanups.is_empty() {
            self.cleanups
                .lock()
                .await
                .insert(metadata.name.clone(), record.cleanups);
        }
        self.loaded.insert(metadata.name.clone(), metadata.clone());

        info!(plugin = %metadata.name, "plugin initialized");
        Ok(ready)
    }

    /// Every rule referenced by a contract must have been declared by the
    /// same plugin. A leak here would let an operation require a rule that
    /// never reaches the database.
    fn validate_contracts(&self) -> Result<(), BootError> {
        for entry in self.contracts.iter() {
            let plugin_id = entry.key();
            let declared: Vec<String> = self
                .declared_rules
                .get(plugin_id)
                .map(|rules| rules.iter().map(|r| r.id.clone()).collect())
                .unwrap_or_default();
            for operation in &entry.value().operations {
                for local in &operation.access_rules {
                    let qualified = format!("{plugin_id}.{local}");
                    if !declared.contains(&qualified) {
                        return Err(BootError::UnregisteredRule {
                            plugin: plugin_id.clone(),
                            rule: qualified,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    async fn emit_rules_registered(&self, plugin_id: &str) -> Result<(), BootError> {
        let rules = self
            .declared_rules
            .get(plugin_id)
            .map(|r| r.clone())
            .unwrap_or_default();
        self.bus
            .emit(
                hooks::ACCESS_RULES_REGISTERED,
                &AccessRulesRegistered {
                    plugin_id: plugin_id.to_string(),
                    rules,
                },
            )
            .await?;
        Ok(())
    }

    async fn run_after_ready(
        &self,
        metadata: PluginMetadata,
        callback: AfterReadyFn,
    ) -> Result<(), BootError> {
        let context = AfterReadyContext {
            plugin: metadata.clone(),
            services: ServiceAccess::new(self.registry.clone(), metadata.clone()),
            hooks: HookBinder::new(self.bus.clone(), metadata.name.clone()),
        };
        callback(context).await.map_err(|e| BootError::PluginInit {
            plugin: metadata.name,
            message: e.to_string(),
        })
    }

    // ── Request routing ─────────────────────────────────────────────────

    /// Assemble the per-request context for a plugin, resolving core
    /// services through the registry.
    pub fn request_context(
        &self,
        plugin_id: &str,
        caller: Caller,
    ) -> Result<RequestContext, AppError> {
        let metadata = self
            .loaded
            .get(plugin_id)
            .map(|m| m.clone())
            .ok_or_else(|| AppError::NotFound(format!("no plugin '{plugin_id}'")))?;

        let resolve_err = |e: crate::registry::ServiceError| AppError::Internal(e.to_string());
        let db = self
            .registry
            .get(core_services::SCOPED_DB, &metadata)
            .map_err(resolve_err)?;
        let fetch = self
            .registry
            .get(core_services::FETCH_CLIENT, &metadata)
            .map_err(resolve_err)?;
        let health = self
            .registry
            .get(core_services::HEALTH_CHECKS, &metadata)
            .map_err(resolve_err)?;
        let span = self
            .registry
            .get(core_services::SCOPED_LOGGER, &metadata)
            .map_err(resolve_err)?;

        Ok(RequestContext::new(
            metadata.clone(),
            caller,
            db,
            self.bus.clone(),
            fetch,
            health,
            self.config_service.clone(),
            ServiceAccess::new(self.registry.clone(), metadata),
            span,
        ))
    }

    // ── Dynamic install ─────────────────────────────────────────────────

    /// Record a remote install and ask every instance to load the plugin.
    pub async fn request_installation(
        &self,
        plugin_id: &str,
        path: &str,
        kind: PluginKind,
    ) -> Result<(), AppError> {
        if kind == PluginKind::Backend && !self.table.iter().any(|p| p.name() == plugin_id) {
            return Err(AppError::BadRequest(format!(
                "plugin '{plugin_id}' is not present in this build"
            )));
        }

        sqlx::query(
            "INSERT INTO plugin (name, path, type, enabled, is_uninstallable)
             VALUES ($1, $2, $3, true, true)
             ON CONFLICT (name) DO UPDATE SET path = EXCLUDED.path, enabled = true",
        )
        .bind(plugin_id)
        .bind(path)
        .bind(kind.as_str())
        .execute(&self.pool)
        .await?;

        self.bus
            .emit(
                hooks::PLUGIN_INSTALLATION_REQUESTED,
                &InstallRequested {
                    plugin_id: plugin_id.to_string(),
                    path: path.to_string(),
                    kind,
                },
            )
            .await?;
        Ok(())
    }

    /// Load one plugin on this instance: register, init, announce.
    pub async fn load_single_plugin(
        self: &Arc<Self>,
        plugin_id: &str,
        path: &str,
    ) -> Result<(), BootError> {
        self.bus
            .emit_local(
                hooks::PLUGIN_INSTALLING,
                json!({ "pluginId": plugin_id }),
            )
            .await;

        let metadata = PluginMetadata {
            name: plugin_id.to_string(),
            path: path.to_string(),
            kind: PluginKind::Backend,
            enabled: true,
            is_uninstallable: true,
        };
        plugin_schema(&metadata.name).map_err(|e| BootError::PluginInit {
            plugin: metadata.name.clone(),
            message: e.to_string(),
        })?;

        let record = self.run_register_phase(metadata)?;
        let ready = self.run_init_phase(record).await?;

        self.bus
            .emit(
                hooks::PLUGIN_INITIALIZED,
                &PluginEvent {
                    plugin_id: plugin_id.to_string(),
                },
            )
            .await?;
        self.validate_contracts()?;
        self.emit_rules_registered(plugin_id).await?;
        if let Some((metadata, callback)) = ready {
            self.run_after_ready(metadata, callback).await?;
        }

        self.bus
            .emit(
                hooks::PLUGIN_INSTALLED,
                &PluginEvent {
                    plugin_id: plugin_id.to_string(),
                },
            )
            .await?;
        info!(plugin = %plugin_id, "plugin installed");
        Ok(())
    }

    // ── Dynamic uninstall ───────────────────────────────────────────────

    /// Ask every instance to tear a plugin down. Only remotely installed
    /// plugins are eligible; core components fail fast.
    pub async fn request_deregistration(
        &self,
        plugin_id: &str,
        delete_schema: bool,
    ) -> Result<(), AppError> {
        let row = sqlx::query("SELECT is_uninstallable FROM plugin WHERE name = $1")
            .bind(plugin_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("no plugin '{plugin_id}'")))?;
        let is_uninstallable: bool = row.get("is_uninstallable");
        if !is_uninstallable {
            return Err(AppError::Forbidden(format!(
                "plugin '{plugin_id}' is a core component and cannot be uninstalled"
            )));
        }

        self.bus
            .emit(
                hooks::PLUGIN_DEREGISTRATION_REQUESTED,
                &DeregistrationRequested {
                    plugin_id: plugin_id.to_string(),
                    delete_schema,
                },
            )
            .await?;

        sqlx::query("DELETE FROM plugin WHERE name = $1")
            .bind(plugin_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Tear a plugin down on this instance.
    pub async fn deregister_plugin(&self, plugin_id: &str, delete_schema: bool) {
        // Dependents first: local listeners run in LIFO order.
        self.bus
            .emit_local_lifo(
                hooks::PLUGIN_DEREGISTERING,
                json!({ "pluginId": plugin_id }),
            )
            .await;

        // Cleanup handlers, newest first. Errors are logged, not fatal.
        let handlers = self.cleanups.lock().await.remove(plugin_id);
        if let Some(handlers) = handlers {
            for cleanup in handlers.iter().rev() {
                if let Err(e) = cleanup().await {
                    error!(plugin = %plugin_id, error = %e, "cleanup handler failed");
                }
            }
        }

        self.bus.unsubscribe_plugin(plugin_id).await;
        self.routers.remove(plugin_id);
        self.contracts.remove(plugin_id);
        self.declared_rules.remove(plugin_id);
        self.health.remove_plugin(plugin_id);
        self.loaded.remove(plugin_id);

        if delete_schema {
            if let Err(e) = drop_plugin_schema(&self.pool, plugin_id).await {
                error!(plugin = %plugin_id, error = %e, "failed to drop plugin schema");
            }
        }

        if let Err(e) = self
            .bus
            .emit(
                hooks::PLUGIN_DEREGISTERED,
                &PluginEvent {
                    plugin_id: plugin_id.to_string(),
                },
            )
            .await
        {
            error!(plugin = %plugin_id, error = %e, "failed to emit deregistration hook");
        }
        info!(plugin = %plugin_id, "plugin deregistered");
    }

    /// Body of the install-requested listener, factored out of the closure
    /// in [`start_coordination`] so its future isn't nested inside the
    /// boxed `Fn` trait object (avoids an HRTB inference limitation with
    /// the migrator's `Acquire` bound).
    async fn handle_install_requested(
        self: Arc<Self>,
        payload: serde_json::Value,
    ) -> Result<(), plinth_events::ListenerError> {
        let request: InstallRequested = serde_json::from_value(payload)?;
        if request.kind == PluginKind::Backend {
            self.load_single_plugin(&request.plugin_id, &request.path)
                .await
                .map_err(|e| Box::new(e) as plinth_events::ListenerError)?;
        } else {
            // Nothing to load for frontend/common packages; announce
            // so shells refresh their manifest.
            self.bus
                .emit(
                    hooks::PLUGIN_INSTALLED,
                    &PluginEvent {
                        plugin_id: request.plugin_id,
                    },
                )
                .await?;
        }
        Ok(())
    }

    // ── Cross-instance coordination ─────────────────────────────────────

    /// Subscribe to the install/uninstall broadcasts and forward plugin
    /// lifecycle hooks to the realtime signal channel.
    async fn start_coordination(self: &Arc<Self>) -> Result<(), BootError> {
        let host = self.clone();
        let install: Listener = Arc::new(move |payload| {
            let host = host.clone();
            Box::pin(async move { host.handle_install_requested(payload).await })
        });
        self.bus
            .subscribe(
                PLATFORM_PLUGIN_ID,
                hooks::PLUGIN_INSTALLATION_REQUESTED,
                SubscribeOptions::broadcast(),
                install,
            )
            .await?;

        let host = self.clone();
        let deregister: Listener = Arc::new(move |payload| {
            let host = host.clone();
            Box::pin(async move {
                let request: DeregistrationRequested = serde_json::from_value(payload)?;
                host.deregister_plugin(&request.plugin_id, request.delete_schema)
                    .await;
                Ok(())
            })
        });
        self.bus
            .subscribe(
                PLATFORM_PLUGIN_ID,
                hooks::PLUGIN_DEREGISTRATION_REQUESTED,
                SubscribeOptions::broadcast(),
                deregister,
            )
            .await?;

        // Realtime signals for the frontend shell.
        for (hook, signal) in [
            (hooks::PLUGIN_INSTALLED, SIGNAL_PLUGIN_INSTALLED),
            (hooks::PLUGIN_DEREGISTERED, SIGNAL_PLUGIN_DEREGISTERED),
        ] {
            let signals = self.signals.clone();
            let forward: Listener = Arc::new(move |payload| {
                let signals = signals.clone();
                Box::pin(async move {
                    let event: PluginEvent = serde_json::from_value(payload)?;
                    signals.send_plugin_signal(signal, &event.plugin_id);
                    Ok(())
                })
            });
            self.bus
                .subscribe(PLATFORM_PLUGIN_ID, hook, SubscribeOptions::broadcast(), forward)
                .await?;
        }

        Ok(())
    }

    /// Manifest of enabled remote frontend plugins, `[{name, path}]`.
    pub async fn frontend_manifest(&self) -> Result<Vec<serde_json::Value>, AppError> {
        let rows = sqlx::query(
            "SELECT name, path FROM plugin
             WHERE type = 'frontend' AND enabled AND is_uninstallable
             ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                json!({
                    "name": row.get::<String, _>("name"),
                    "path": row.get::<String, _>("path"),
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str, deps: &[&str], provided: &[&str]) -> TopoNode {
        TopoNode {
            name: name.into(),
            dependencies: deps.iter().map(|s| s.to_string()).collect(),
            provided: provided.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn names(nodes: &[TopoNode], order: &[usize]) -> Vec<String> {
        order.iter().map(|&i| nodes[i].name.clone()).collect()
    }

    #[test]
    fn providers_precede_consumers() {
        let nodes = vec![
            node("consumer", &["svc.a"], &[]),
            node("provider", &[], &["svc.a"]),
        ];
        let order = topo_order(&nodes, |_| false).unwrap();
        assert_eq!(names(&nodes, &order), vec!["provider", "consumer"]);
    }

    #[test]
    fn insertion_order_breaks_ties() {
        let nodes = vec![
            node("b", &[], &[]),
            node("a", &[], &[]),
            node("c", &[], &[]),
        ];
        let order = topo_order(&nodes, |_| false).unwrap();
        assert_eq!(names(&nodes, &order), vec!["b", "a", "c"]);
    }

    #[test]
    fn queue_registry_providers_precede_queue_consumers() {
        // No direct service edge connects these two; the queue rule alone
        // must order them.
        let nodes = vec![
            node("worker", &[services::QUEUE_MANAGER], &[]),
            node("queue-backend", &[], &[services::QUEUE_PLUGIN_REGISTRY]),
        ];
        let order = topo_order(&nodes, |id| id == services::QUEUE_MANAGER).unwrap();
        assert_eq!(names(&nodes, &order), vec!["queue-backend", "worker"]);
    }

    #[test]
    fn cycle_is_fatal_and_names_participants() {
        let nodes = vec![
            node("a", &["svc.b"], &["svc.a"]),
            node("b", &["svc.a"], &["svc.b"]),
        ];
        let err = topo_order(&nodes, |_| false).unwrap_err();
        match err {
            BootError::DependencyCycle { cycle } => {
                assert!(cycle.contains(&"a".to_string()));
                assert!(cycle.contains(&"b".to_string()));
            }
            other => panic!("expected DependencyCycle, got {other}"),
        }
    }

    #[test]
    fn missing_provider_is_fatal() {
        let nodes = vec![node("a", &["svc.missing"], &[])];
        let err = topo_order(&nodes, |_| false).unwrap_err();
        assert!(matches!(
            err,
            BootError::MissingDependency { plugin, service }
                if plugin == "a" && service == "svc.missing"
        ));
    }

    #[test]
    fn host_provided_services_need_no_edge() {
        let nodes = vec![node("a", &["core.database"], &[])];
        let order = topo_order(&nodes, |id| id == "core.database").unwrap();
        assert_eq!(order, vec![0]);
    }

    #[test]
    fn diamond_graph_is_stable() {
        let nodes = vec![
            node("app", &["svc.left", "svc.right"], &[]),
            node("left", &["svc.base"], &["svc.left"]),
            node("right", &["svc.base"], &["svc.right"]),
            node("base", &[], &["svc.base"]),
        ];
        let order = topo_order(&nodes, |_| false).unwrap();
        assert_eq!(names(&nodes, &order), vec!["base", "left", "right", "app"]);
    }

    // ── Host tests (lazy pool, no database I/O) ─────────────────────────

    use crate::auth::{Authenticator, JwksSource, Principal};
    use crate::error::AppError;
    use crate::http::{platform_router, PlatformState};
    use crate::plugin::{
        AccessRuleSpec, BackendPlugin, OperationSpec, RegistrationEnv, RouterContract, UserType,
    };
    use axum::extract::Extension;
    use axum::routing::get;
    use http_body_util::BodyExt;
    use plinth_events::InMemoryBroker;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    struct NoopIssuer;
    impl ServiceTokenIssuer for NoopIssuer {
        fn issue(&self, _plugin_id: &str) -> Result<String, AppError> {
            Ok("test-token".into())
        }
    }

    struct AnonAuth;
    #[async_trait::async_trait]
    impl Authenticator for AnonAuth {
        async fn authenticate(
            &self,
            _headers: &axum::http::HeaderMap,
        ) -> Result<Caller, AppError> {
            Ok(Caller::anonymous())
        }
    }

    struct NoJwks;
    impl JwksSource for NoJwks {
        fn jwks(&self) -> serde_json::Value {
            serde_json::json!({ "keys": [] })
        }
    }

    fn test_config() -> PlatformConfig {
        PlatformConfig {
            database_url: "postgres://localhost/unused".into(),
            base_url: "http://localhost:3000".into(),
            internal_url: "http://localhost:7007".into(),
            brand: "plinth".into(),
            broker: crate::config::BrokerConfig {
                host: "localhost".into(),
                port: 6379,
                password: None,
                db: 0,
                timeout_secs: 5,
            },
            config_encryption_key: None,
        }
    }

    fn test_host_with(
        broker: Arc<InMemoryBroker>,
        instance_id: &str,
        table: Vec<Arc<dyn BackendPlugin>>,
    ) -> Arc<PluginHost> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/unused")
            .expect("lazy pool");
        let bus = EventBus::new(broker, instance_id);
        PluginHost::new(pool, bus, test_config(), Arc::new(NoopIssuer), table)
    }

    fn test_host(table: Vec<Arc<dyn BackendPlugin>>) -> Arc<PluginHost> {
        test_host_with(InMemoryBroker::new(), "test-instance", table)
    }

    fn backend_metadata(name: &str) -> PluginMetadata {
        PluginMetadata {
            name: name.into(),
            path: format!("plugins/{name}"),
            kind: PluginKind::Backend,
            enabled: true,
            is_uninstallable: false,
        }
    }

    struct DemoPlugin;

    impl BackendPlugin for DemoPlugin {
        fn name(&self) -> &'static str {
            "demo"
        }

        fn register(&self, env: &mut RegistrationEnv) {
            env.register_access_rules(&[AccessRuleSpec {
                id: "read",
                description: "Read demo data",
                is_authenticated_default: true,
                is_public_default: false,
            }]);

            async fn hello(Extension(ctx): Extension<crate::context::RequestContext>) -> String {
                ctx.plugin().name.clone()
            }
            env.register_router(
                axum::Router::new().route("/hello", get(hello)),
                RouterContract {
                    operations: vec![OperationSpec {
                        operation_id: "hello".into(),
                        method: "GET".into(),
                        path: "/hello".into(),
                        description: None,
                        user_type: UserType::Any,
                        access_rules: vec![],
                    }],
                },
            );
        }
    }

    /// Declares a contract rule it never registered.
    struct LeakyPlugin;

    impl BackendPlugin for LeakyPlugin {
        fn name(&self) -> &'static str {
            "leaky"
        }

        fn register(&self, env: &mut RegistrationEnv) {
            env.register_router(
                axum::Router::new(),
                RouterContract {
                    operations: vec![OperationSpec {
                        operation_id: "secret".into(),
                        method: "GET".into(),
                        path: "/secret".into(),
                        description: None,
                        user_type: UserType::User,
                        access_rules: vec!["undeclared".into()],
                    }],
                },
            );
        }
    }

    async fn load_plugin(host: &Arc<PluginHost>, plugin: &dyn BackendPlugin) {
        let record = host
            .run_register_phase(backend_metadata(plugin.name()))
            .expect("register phase");
        host.run_init_phase(record).await.expect("init phase");
    }

    #[tokio::test]
    async fn register_phase_qualifies_access_rules() {
        let host = test_host(vec![Arc::new(DemoPlugin)]);
        load_plugin(&host, &DemoPlugin).await;

        let rules = host.all_declared_rules();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].id, "demo.read");
        assert!(rules[0].is_authenticated_default);
    }

    #[tokio::test]
    async fn contract_rule_leak_is_fatal() {
        let host = test_host(vec![Arc::new(LeakyPlugin)]);
        load_plugin(&host, &LeakyPlugin).await;

        let err = host.validate_contracts().unwrap_err();
        assert!(matches!(
            err,
            BootError::UnregisteredRule { plugin, rule }
                if plugin == "leaky" && rule == "leaky.undeclared"
        ));
    }

    #[tokio::test]
    async fn declared_contracts_validate_cleanly() {
        let host = test_host(vec![Arc::new(DemoPlugin)]);
        load_plugin(&host, &DemoPlugin).await;
        host.validate_contracts().unwrap();
    }

    #[tokio::test]
    async fn dispatch_reaches_plugin_router_with_context() {
        let host = test_host(vec![Arc::new(DemoPlugin)]);
        load_plugin(&host, &DemoPlugin).await;

        let router = platform_router(PlatformState {
            host,
            authenticator: Arc::new(AnonAuth),
            jwks: Arc::new(NoJwks),
        });

        let response = router
            .oneshot(
                axum::http::Request::get("/api/demo/hello")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"demo");
    }

    #[tokio::test]
    async fn unknown_plugin_dispatch_is_404() {
        let host = test_host(vec![]);
        let router = platform_router(PlatformState {
            host,
            authenticator: Arc::new(AnonAuth),
            jwks: Arc::new(NoJwks),
        });

        let response = router
            .oneshot(
                axum::http::Request::get("/api/ghost/anything")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn request_context_enforces_rules() {
        let host = test_host(vec![Arc::new(DemoPlugin)]);
        load_plugin(&host, &DemoPlugin).await;

        let reader = Principal {
            id: "u1".into(),
            name: None,
            email: None,
            access_rules: vec!["demo.read".into()],
            team_ids: vec![],
        };
        let context = host
            .request_context("demo", Caller::User(reader))
            .unwrap();
        assert!(context.require(&["read"]).is_ok());
        assert!(matches!(
            context.require(&["manage"]),
            Err(AppError::Forbidden(_))
        ));

        let anonymous = host
            .request_context("demo", Caller::anonymous())
            .unwrap();
        assert!(matches!(
            anonymous.require(&["read"]),
            Err(AppError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn deregistration_runs_cleanups_lifo_and_unmounts() {
        struct CleanupPlugin {
            order: Arc<std::sync::Mutex<Vec<u32>>>,
        }

        impl BackendPlugin for CleanupPlugin {
            fn name(&self) -> &'static str {
                "tidy"
            }

            fn register(&self, env: &mut RegistrationEnv) {
                for tag in [1u32, 2] {
                    let order = self.order.clone();
                    env.register_cleanup(Arc::new(move || {
                        let order = order.clone();
                        Box::pin(async move {
                            order.lock().unwrap().push(tag);
                            Ok(())
                        })
                    }));
                }
                env.register_router(axum::Router::new(), RouterContract::default());
            }
        }

        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let plugin = CleanupPlugin {
            order: order.clone(),
        };
        let host = test_host(vec![]);
        let record = {
            let mut env = RegistrationEnv::new(
                backend_metadata("tidy"),
                host.registry.clone(),
                host.extensions.clone(),
            );
            plugin.register(&mut env);
            env.into_record()
        };
        host.run_init_phase(record).await.unwrap();
        assert!(host.router_for("tidy").is_some());

        host.deregister_plugin("tidy", false).await;

        assert_eq!(*order.lock().unwrap(), vec![2, 1]);
        assert!(host.router_for("tidy").is_none());
        assert!(host.all_declared_rules().is_empty());
    }

    #[tokio::test]
    async fn factories_resolve_per_plugin_scoped_services() {
        let host = test_host(vec![Arc::new(DemoPlugin)]);
        load_plugin(&host, &DemoPlugin).await;

        let db = host
            .registry()
            .get(core_services::SCOPED_DB, &backend_metadata("demo"))
            .unwrap();
        assert_eq!(db.schema(), "plugin_demo");
    }

    #[tokio::test]
    async fn installation_broadcast_loads_the_plugin_on_every_instance() {
        let broker = InMemoryBroker::new();
        let host1 = test_host_with(broker.clone(), "inst-1", vec![Arc::new(DemoPlugin)]);
        let host2 = test_host_with(broker.clone(), "inst-2", vec![Arc::new(DemoPlugin)]);
        host1.start_coordination().await.unwrap();
        host2.start_coordination().await.unwrap();

        // Either instance may originate the request; the broadcast reaches
        // every instance, including the originator.
        host1
            .bus
            .emit(
                hooks::PLUGIN_INSTALLATION_REQUESTED,
                &InstallRequested {
                    plugin_id: "demo".into(),
                    path: "plugins/demo".into(),
                    kind: PluginKind::Backend,
                },
            )
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        assert!(host1.router_for("demo").is_some());
        assert!(host2.router_for("demo").is_some());
    }

    #[tokio::test]
    async fn counting_cleanups_do_not_rerun_after_deregistration() {
        let calls = Arc::new(AtomicUsize::new(0));

        struct OncePlugin {
            calls: Arc<AtomicUsize>,
        }
        impl BackendPlugin for OncePlugin {
            fn name(&self) -> &'static str {
                "once"
            }
            fn register(&self, env: &mut RegistrationEnv) {
                let calls = self.calls.clone();
                env.register_cleanup(Arc::new(move || {
                    let calls = calls.clone();
                    Box::pin(async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                }));
            }
        }

        let plugin = OncePlugin {
            calls: calls.clone(),
        };
        let host = test_host(vec![]);
        let record = {
            let mut env = RegistrationEnv::new(
                backend_metadata("once"),
                host.registry.clone(),
                host.extensions.clone(),
            );
            plugin.register(&mut env);
            env.into_record()
        };
        host.run_init_phase(record).await.unwrap();

        host.deregister_plugin("once", false).await;
        host.deregister_plugin("once", false).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
