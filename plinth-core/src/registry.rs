//! The service registry.
//!
//! Services are resolved through typed references. Two registration shapes
//! exist: global singletons, and factories invoked with the requesting
//! plugin's metadata to produce per-plugin views (scoped database, scoped
//! logger, scoped health registry). Factories are tried before singletons.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::RwLock;

use tracing::warn;

use crate::metadata::PluginMetadata;

/// A typed reference to a service.
///
/// Declared as constants by the providing side; the phantom type ties the
/// reference to the concrete service type at the `get` site.
pub struct ServiceRef<T> {
    id: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ServiceRef<T> {
    pub const fn new(id: &'static str) -> Self {
        Self {
            id,
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> &'static str {
        self.id
    }
}

impl<T> Clone for ServiceRef<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for ServiceRef<T> {}

impl<T> fmt::Debug for ServiceRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServiceRef({})", self.id)
    }
}

/// Well-known core service ids. The host provides these; plugins resolve
/// them as dependencies without an ordering edge (core is always first).
pub mod services {
    /// The plugin's schema-scoped database handle.
    pub const SCOPED_DB: &str = "core.database";
    /// A tracing span tagged with the plugin id.
    pub const SCOPED_LOGGER: &str = "core.logger";
    /// The event-bus handle.
    pub const EVENT_BUS: &str = "core.eventBus";
    /// Inter-plugin HTTP client that mints service tokens.
    pub const FETCH_CLIENT: &str = "core.fetchClient";
    /// Per-plugin health-check registry.
    pub const HEALTH_CHECKS: &str = "core.healthChecks";
    /// Versioned, encrypted per-plugin configuration.
    pub const PLUGIN_CONFIG: &str = "core.pluginConfig";
    /// Registry where queue backends announce themselves. Providers of this
    /// service initialize before any consumer of the queue manager.
    pub const QUEUE_PLUGIN_REGISTRY: &str = "core.queuePluginRegistry";
    /// The selected queue backend.
    pub const QUEUE_MANAGER: &str = "core.queueManager";
}

#[derive(Debug)]
pub enum ServiceError {
    /// Neither a factory nor a singleton is registered under the reference.
    UnknownService { id: &'static str },
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceError::UnknownService { id } => {
                write!(f, "no service registered under '{id}'")
            }
        }
    }
}

impl std::error::Error for ServiceError {}

type FactoryFn = Box<dyn Fn(&PluginMetadata) -> Box<dyn Any + Send + Sync> + Send + Sync>;

enum Registration {
    Singleton(Box<dyn Any + Send + Sync>),
    Factory(FactoryFn),
}

/// Resolves typed service references to implementations.
///
/// Mutated only during register/init/uninstall; resolution on the request
/// path is read-only.
pub struct ServiceRegistry {
    entries: RwLock<HashMap<&'static str, Registration>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Register a global singleton. Every caller receives a clone.
    pub fn register<T: Clone + Send + Sync + 'static>(&self, service: ServiceRef<T>, value: T) {
        let mut entries = self.entries.write().expect("service registry poisoned");
        if entries
            .insert(service.id, Registration::Singleton(Box::new(value)))
            .is_some()
        {
            warn!(service = service.id, "service registration replaced");
        }
    }

    /// Register a factory invoked per `get` with the requesting plugin's
    /// metadata. Factories that must hand out one instance per plugin
    /// memoize internally.
    pub fn register_factory<T, F>(&self, service: ServiceRef<T>, factory: F)
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(&PluginMetadata) -> T + Send + Sync + 'static,
    {
        let erased: FactoryFn = Box::new(move |plugin| Box::new(factory(plugin)));
        let mut entries = self.entries.write().expect("service registry poisoned");
        if entries
            .insert(service.id, Registration::Factory(erased))
            .is_some()
        {
            warn!(service = service.id, "service registration replaced");
        }
    }

    /// Resolve a service for the given plugin.
    ///
    /// # Panics
    ///
    /// Panics if a registration exists under the id but with a different
    /// concrete type. Two `ServiceRef`s sharing an id with different types
    /// is a wiring bug, not a runtime condition.
    pub fn get<T: Clone + Send + Sync + 'static>(
        &self,
        service: ServiceRef<T>,
        plugin: &PluginMetadata,
    ) -> Result<T, ServiceError> {
        let entries = self.entries.read().expect("service registry poisoned");
        match entries.get(service.id) {
            Some(Registration::Factory(factory)) => {
                let produced = factory(plugin);
                Ok(produced
                    .downcast_ref::<T>()
                    .unwrap_or_else(|| {
                        panic!("service '{}' factory produced a different type", service.id)
                    })
                    .clone())
            }
            Some(Registration::Singleton(value)) => Ok(value
                .downcast_ref::<T>()
                .unwrap_or_else(|| {
                    panic!("service '{}' registered with a different type", service.id)
                })
                .clone()),
            None => Err(ServiceError::UnknownService { id: service.id }),
        }
    }

    /// Whether any registration exists under the id.
    pub fn contains(&self, id: &str) -> bool {
        self.entries
            .read()
            .expect("service registry poisoned")
            .contains_key(id)
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::PluginKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn plugin(name: &str) -> PluginMetadata {
        PluginMetadata {
            name: name.into(),
            path: format!("plugins/{name}"),
            kind: PluginKind::Backend,
            enabled: true,
            is_uninstallable: false,
        }
    }

    const GREETER: ServiceRef<String> = ServiceRef::new("test.greeter");

    #[test]
    fn singleton_returned_to_every_caller() {
        let registry = ServiceRegistry::new();
        registry.register(GREETER, "hello".to_string());

        assert_eq!(registry.get(GREETER, &plugin("a")).unwrap(), "hello");
        assert_eq!(registry.get(GREETER, &plugin("b")).unwrap(), "hello");
    }

    #[test]
    fn factory_sees_requesting_plugin() {
        let registry = ServiceRegistry::new();
        registry.register_factory(GREETER, |p| format!("hello {}", p.name));

        assert_eq!(registry.get(GREETER, &plugin("a")).unwrap(), "hello a");
        assert_eq!(registry.get(GREETER, &plugin("b")).unwrap(), "hello b");
    }

    #[test]
    fn unknown_service_errors() {
        let registry = ServiceRegistry::new();
        let err = registry.get(GREETER, &plugin("a")).unwrap_err();
        assert!(matches!(err, ServiceError::UnknownService { id } if id == "test.greeter"));
    }

    #[test]
    fn factory_invoked_per_get() {
        const COUNTER: ServiceRef<usize> = ServiceRef::new("test.counter");
        let registry = ServiceRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        registry.register_factory(COUNTER, move |_| c.fetch_add(1, Ordering::SeqCst));

        registry.get(COUNTER, &plugin("a")).unwrap();
        registry.get(COUNTER, &plugin("a")).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
