//! Extension points.
//!
//! A consumer plugin can call into a provider plugin whose init order is
//! not fixed. `get_extension_point` therefore always hands out a proxy;
//! calls made before the provider registers are buffered in arrival order
//! and replayed once the implementation arrives. Registration is
//! exactly-once per reference; a second registration wins with a warning.
//! Extension points live for the process; there is no deregistration.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use tracing::warn;

/// A typed reference to an extension point, `T` being the capability trait.
pub struct ExtensionRef<T: ?Sized> {
    id: &'static str,
    _marker: PhantomData<fn() -> Arc<T>>,
}

impl<T: ?Sized> ExtensionRef<T> {
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

impl<T: ?Sized> Clone for ExtensionRef<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T: ?Sized> Copy for ExtensionRef<T> {}

impl<T: ?Sized> fmt::Debug for ExtensionRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExtensionRef({})", self.id)
    }
}

type BufferedCall<T> = Box<dyn FnOnce(&Arc<T>) + Send>;

struct PointState<T: ?Sized> {
    buffered: Vec<BufferedCall<T>>,
    implementation: Option<Arc<T>>,
}

/// The proxy returned to consumers: forwards when the implementation is
/// installed, buffers otherwise.
pub struct ExtensionPoint<T: ?Sized> {
    id: &'static str,
    state: Mutex<PointState<T>>,
}

impl<T: ?Sized + Send + Sync + 'static> ExtensionPoint<T> {
    fn new(id: &'static str) -> Self {
        Self {
            id,
            state: Mutex::new(PointState {
                buffered: Vec::new(),
                implementation: None,
            }),
        }
    }

    /// Invoke the extension point. Runs immediately when the provider has
    /// registered; otherwise the call is buffered in arrival order.
    pub fn invoke(&self, call: impl FnOnce(&Arc<T>) + Send + 'static) {
        let mut state = self.state.lock().expect("extension point poisoned");
        match &state.implementation {
            Some(implementation) => {
                let implementation = implementation.clone();
                drop(state);
                call(&implementation);
            }
            None => state.buffered.push(Box::new(call)),
        }
    }

    /// Install the implementation, replaying buffered calls in order.
    fn install(&self, implementation: Arc<T>) {
        let drained = {
            let mut state = self.state.lock().expect("extension point poisoned");
            if state.implementation.is_some() {
                warn!(
                    extension_point = self.id,
                    "extension point registered twice, last registration wins"
                );
            }
            state.implementation = Some(implementation.clone());
            std::mem::take(&mut state.buffered)
        };
        for call in drained {
            call(&implementation);
        }
    }

    pub fn is_registered(&self) -> bool {
        self.state
            .lock()
            .expect("extension point poisoned")
            .implementation
            .is_some()
    }
}

/// Process-wide map of extension-point proxies.
pub struct ExtensionPointManager {
    points: Mutex<HashMap<&'static str, Box<dyn Any + Send + Sync>>>,
}

impl ExtensionPointManager {
    pub fn new() -> Self {
        Self {
            points: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the proxy for `reference`, creating it on first use. The
    /// same proxy instance is shared by all callers.
    pub fn get_extension_point<T: ?Sized + Send + Sync + 'static>(
        &self,
        reference: ExtensionRef<T>,
    ) -> Arc<ExtensionPoint<T>> {
        let mut points = self.points.lock().expect("extension registry poisoned");
        let entry = points
            .entry(reference.id)
            .or_insert_with(|| Box::new(Arc::new(ExtensionPoint::<T>::new(reference.id))));
        entry
            .downcast_ref::<Arc<ExtensionPoint<T>>>()
            .unwrap_or_else(|| {
                panic!(
                    "extension point '{}' requested with a different type",
                    reference.id
                )
            })
            .clone()
    }

    /// Install a provider implementation, replaying any buffered calls.
    pub fn register_extension_point<T: ?Sized + Send + Sync + 'static>(
        &self,
        reference: ExtensionRef<T>,
        implementation: Arc<T>,
    ) {
        self.get_extension_point(reference).install(implementation);
    }
}

impl Default for ExtensionPointManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    trait Collector: Send + Sync {
        fn add(&self, value: u32);
        fn values(&self) -> Vec<u32>;
    }

    struct VecCollector(StdMutex<Vec<u32>>);

    impl Collector for VecCollector {
        fn add(&self, value: u32) {
            self.0.lock().unwrap().push(value);
        }
        fn values(&self) -> Vec<u32> {
            self.0.lock().unwrap().clone()
        }
    }

    const COLLECTOR: ExtensionRef<dyn Collector> = ExtensionRef::new("test.collector");

    #[test]
    fn calls_before_registration_are_buffered_and_replayed_in_order() {
        let manager = ExtensionPointManager::new();
        let proxy = manager.get_extension_point(COLLECTOR);

        proxy.invoke(|c| c.add(1));
        proxy.invoke(|c| c.add(2));
        assert!(!proxy.is_registered());

        let implementation = Arc::new(VecCollector(StdMutex::new(Vec::new())));
        manager.register_extension_point(COLLECTOR, implementation.clone() as Arc<dyn Collector>);

        assert_eq!(implementation.values(), vec![1, 2]);
    }

    #[test]
    fn calls_after_registration_pass_through() {
        let manager = ExtensionPointManager::new();
        let implementation = Arc::new(VecCollector(StdMutex::new(Vec::new())));
        manager.register_extension_point(COLLECTOR, implementation.clone() as Arc<dyn Collector>);

        manager.get_extension_point(COLLECTOR).invoke(|c| c.add(7));
        assert_eq!(implementation.values(), vec![7]);
    }

    #[test]
    fn proxy_identity_is_shared() {
        let manager = ExtensionPointManager::new();
        let a = manager.get_extension_point(COLLECTOR);
        let b = manager.get_extension_point(COLLECTOR);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn duplicate_registration_last_write_wins() {
        let manager = ExtensionPointManager::new();
        let first = Arc::new(VecCollector(StdMutex::new(Vec::new())));
        let second = Arc::new(VecCollector(StdMutex::new(Vec::new())));

        manager.register_extension_point(COLLECTOR, first.clone() as Arc<dyn Collector>);
        manager.register_extension_point(COLLECTOR, second.clone() as Arc<dyn Collector>);

        manager.get_extension_point(COLLECTOR).invoke(|c| c.add(9));
        assert_eq!(first.values(), Vec::<u32>::new());
        assert_eq!(second.values(), vec![9]);
    }
}
