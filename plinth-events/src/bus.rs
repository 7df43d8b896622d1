//! The event bus: subscriptions, delivery workers, and local dispatch.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::broker::Broker;
use crate::error::EventError;

/// Boxed error a listener may return. Failures never propagate to the
/// emitter; work-queue deliveries are retried, everything else is logged.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

/// A hook listener. Receives the decoded JSON payload.
pub type Listener =
    Arc<dyn Fn(serde_json::Value) -> BoxFuture<'static, Result<(), ListenerError>> + Send + Sync>;

/// Delivery semantics for one subscription.
#[derive(Debug, Clone)]
pub enum DeliveryMode {
    /// Exactly one subscriber per worker group receives each event. The
    /// group is namespaced to `<pluginId>.<group>` on the broker.
    WorkQueue { worker_group: String },
    /// Every subscriber receives each event; each gets a consumer group
    /// tagged with the process-instance id.
    Broadcast,
    /// In-process dispatch only; the broker is never involved.
    InstanceLocal,
}

/// Options accompanying a subscription.
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    pub mode: DeliveryMode,
    /// Overrides the bus-wide retry bound for this work-queue subscription.
    pub max_retries: Option<u32>,
}

impl SubscribeOptions {
    pub fn work_queue(worker_group: impl Into<String>) -> Self {
        Self {
            mode: DeliveryMode::WorkQueue {
                worker_group: worker_group.into(),
            },
            max_retries: None,
        }
    }

    pub fn broadcast() -> Self {
        Self {
            mode: DeliveryMode::Broadcast,
            max_retries: None,
        }
    }

    pub fn instance_local() -> Self {
        Self {
            mode: DeliveryMode::InstanceLocal,
            max_retries: None,
        }
    }
}

/// Handle identifying one subscription, usable for unsubscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct RemoteSub {
    plugin_id: String,
    hook: String,
    group: String,
    worker: JoinHandle<()>,
}

struct LocalSub {
    id: u64,
    plugin_id: String,
    listener: Listener,
}

#[derive(Default)]
struct BusState {
    remote: HashMap<u64, RemoteSub>,
    /// `(hook, group)` pairs currently registered. Guards the duplicate
    /// worker-group rule for work-queue subscriptions.
    groups: HashSet<(String, String)>,
}

/// Publish/subscribe over a [`Broker`] plus instance-local dispatch.
///
/// Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    broker: Arc<dyn Broker>,
    instance_id: String,
    max_retries: u32,
    retry_base: Duration,
    state: Mutex<BusState>,
    local: RwLock<HashMap<String, Vec<LocalSub>>>,
    next_id: AtomicU64,
    shut_down: AtomicBool,
}

/// Default bound on work-queue redelivery attempts after the first failure.
const DEFAULT_MAX_RETRIES: u32 = 3;

/// Base delay of the exponential backoff between redeliveries.
const DEFAULT_RETRY_BASE: Duration = Duration::from_millis(250);

impl EventBus {
    pub fn new(broker: Arc<dyn Broker>, instance_id: impl Into<String>) -> Self {
        Self::with_retry(broker, instance_id, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_BASE)
    }

    /// Construct with an explicit retry policy (tests use a short base).
    pub fn with_retry(
        broker: Arc<dyn Broker>,
        instance_id: impl Into<String>,
        max_retries: u32,
        retry_base: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(BusInner {
                broker,
                instance_id: instance_id.into(),
                max_retries,
                retry_base,
                state: Mutex::new(BusState::default()),
                local: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// The id distinguishing this process instance in broadcast groups.
    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    /// Register a listener for `hook` on behalf of `plugin_id`.
    ///
    /// Fails with [`EventError::InvalidConfig`] when the mode is work-queue
    /// and the worker group is empty, or when the same `<pluginId>.<group>`
    /// pair is already registered for this hook.
    pub async fn subscribe(
        &self,
        plugin_id: &str,
        hook: &str,
        options: SubscribeOptions,
        listener: Listener,
    ) -> Result<SubscriptionId, EventError> {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Err(EventError::ShutDown);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);

        match options.mode {
            DeliveryMode::InstanceLocal => {
                let mut local = self.inner.local.write().await;
                local.entry(hook.to_string()).or_default().push(LocalSub {
                    id,
                    plugin_id: plugin_id.to_string(),
                    listener,
                });
                Ok(SubscriptionId(id))
            }
            DeliveryMode::WorkQueue { worker_group } => {
                if worker_group.is_empty() {
                    return Err(EventError::InvalidConfig(format!(
                        "work-queue subscription to '{hook}' requires a worker group"
                    )));
                }
                let group = format!("{plugin_id}.{worker_group}");
                {
                    let state = self.inner.state.lock().await;
                    if state.groups.contains(&(hook.to_string(), group.clone())) {
                        return Err(EventError::InvalidConfig(format!(
                            "worker group '{group}' is already registered for hook '{hook}'"
                        )));
                    }
                }
                let retries = options.max_retries.unwrap_or(self.inner.max_retries);
                self.spawn_worker(id, plugin_id, hook, group, listener, Some(retries))
                    .await
            }
            DeliveryMode::Broadcast => {
                // Unique consumer group per subscription, tagged with the
                // process instance so every instance sees every event.
                let group = format!("{plugin_id}.{}.{id}", self.inner.instance_id);
                self.spawn_worker(id, plugin_id, hook, group, listener, None)
                    .await
            }
        }
    }

    async fn spawn_worker(
        &self,
        id: u64,
        plugin_id: &str,
        hook: &str,
        group: String,
        listener: Listener,
        retries: Option<u32>,
    ) -> Result<SubscriptionId, EventError> {
        let mut rx = self.inner.broker.subscribe(hook, &group).await?;

        let hook_owned = hook.to_string();
        let retry_base = self.inner.retry_base;
        let worker = tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                let payload: serde_json::Value =
                    match serde_json::from_slice(&delivery.payload) {
                        Ok(v) => v,
                        Err(e) => {
                            error!(hook = %hook_owned, error = %e, "undecodable hook payload, dropping");
                            continue;
                        }
                    };

                match retries {
                    // Work-queue: bounded redelivery with exponential backoff.
                    Some(max) => {
                        let mut attempt = 0u32;
                        loop {
                            match listener(payload.clone()).await {
                                Ok(()) => break,
                                Err(e) if attempt < max => {
                                    attempt += 1;
                                    let delay = retry_base * 2u32.saturating_pow(attempt - 1);
                                    warn!(
                                        hook = %hook_owned,
                                        attempt,
                                        error = %e,
                                        "hook listener failed, retrying"
                                    );
                                    tokio::time::sleep(delay).await;
                                }
                                Err(e) => {
                                    error!(
                                        hook = %hook_owned,
                                        attempts = attempt + 1,
                                        error = %e,
                                        "hook listener failed permanently"
                                    );
                                    break;
                                }
                            }
                        }
                    }
                    // Broadcast: deliver once, log failures.
                    None => {
                        if let Err(e) = listener(payload).await {
                            error!(hook = %hook_owned, error = %e, "broadcast listener failed");
                        }
                    }
                }
            }
        });

        let mut state = self.inner.state.lock().await;
        state
            .groups
            .insert((hook.to_string(), group.clone()));
        state.remote.insert(
            id,
            RemoteSub {
                plugin_id: plugin_id.to_string(),
                hook: hook.to_string(),
                group,
                worker,
            },
        );
        Ok(SubscriptionId(id))
    }

    /// Remove one subscription and release its broker group. Releasing the
    /// last group of a hook releases the hook's channel.
    pub async fn unsubscribe(&self, id: SubscriptionId) {
        let removed = {
            let mut state = self.inner.state.lock().await;
            state.remote.remove(&id.0).map(|sub| {
                state.groups.remove(&(sub.hook.clone(), sub.group.clone()));
                sub
            })
        };
        if let Some(sub) = removed {
            sub.worker.abort();
            self.inner.broker.release_group(&sub.hook, &sub.group).await;
            return;
        }

        let mut local = self.inner.local.write().await;
        for subs in local.values_mut() {
            subs.retain(|s| s.id != id.0);
        }
        local.retain(|_, subs| !subs.is_empty());
    }

    /// Remove every subscription registered on behalf of `plugin_id`.
    /// Used when a plugin is deregistered.
    pub async fn unsubscribe_plugin(&self, plugin_id: &str) {
        let removed: Vec<RemoteSub> = {
            let mut state = self.inner.state.lock().await;
            let ids: Vec<u64> = state
                .remote
                .iter()
                .filter(|(_, s)| s.plugin_id == plugin_id)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| {
                    state.remote.remove(&id).map(|sub| {
                        state.groups.remove(&(sub.hook.clone(), sub.group.clone()));
                        sub
                    })
                })
                .collect()
        };
        for sub in removed {
            sub.worker.abort();
            self.inner.broker.release_group(&sub.hook, &sub.group).await;
        }

        let mut local = self.inner.local.write().await;
        for subs in local.values_mut() {
            subs.retain(|s| s.plugin_id != plugin_id);
        }
        local.retain(|_, subs| !subs.is_empty());
    }

    /// Enqueue a hook on the broker. Returns once the broker accepted it.
    pub async fn emit<P: serde::Serialize>(&self, hook: &str, payload: &P) -> Result<(), EventError> {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Err(EventError::ShutDown);
        }
        let bytes = serde_json::to_vec(payload)?;
        self.inner.broker.publish(hook, bytes).await
    }

    /// Dispatch a hook to instance-local listeners in registration order.
    ///
    /// Every listener runs to completion regardless of the others; failures
    /// are logged and never propagate to the emitter.
    pub async fn emit_local(&self, hook: &str, payload: serde_json::Value) {
        self.dispatch_local(hook, payload, false).await;
    }

    /// Like [`emit_local`](Self::emit_local) but in reverse registration
    /// order. Deregistration uses this so dependents run before providers.
    pub async fn emit_local_lifo(&self, hook: &str, payload: serde_json::Value) {
        self.dispatch_local(hook, payload, true).await;
    }

    async fn dispatch_local(&self, hook: &str, payload: serde_json::Value, lifo: bool) {
        let listeners: Vec<Listener> = {
            let local = self.inner.local.read().await;
            match local.get(hook) {
                Some(subs) => {
                    let iter = subs.iter().map(|s| s.listener.clone());
                    if lifo {
                        iter.rev().collect()
                    } else {
                        iter.collect()
                    }
                }
                None => return,
            }
        };

        for listener in listeners {
            if let Err(e) = listener(payload.clone()).await {
                warn!(hook = %hook, error = %e, "local hook listener failed");
            }
        }
        debug!(hook = %hook, "local hook dispatched");
    }

    /// Stop every worker and close the broker. No further emits succeed.
    pub async fn shutdown(&self) {
        self.inner.shut_down.store(true, Ordering::SeqCst);
        let subs: Vec<RemoteSub> = {
            let mut state = self.inner.state.lock().await;
            state.groups.clear();
            state.remote.drain().map(|(_, s)| s).collect()
        };
        for sub in subs {
            sub.worker.abort();
        }
        self.inner.local.write().await.clear();
        self.inner.broker.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn counting_listener(counter: Arc<AtomicUsize>) -> Listener {
        Arc::new(move |_| {
            let c = counter.clone();
            Box::pin(async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    fn failing_listener(attempts: Arc<AtomicUsize>) -> Listener {
        Arc::new(move |_| {
            let a = attempts.clone();
            Box::pin(async move {
                a.fetch_add(1, Ordering::SeqCst);
                Err("boom".into())
            })
        })
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    fn fast_bus(broker: Arc<InMemoryBroker>) -> EventBus {
        EventBus::with_retry(broker, "inst-1", 3, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn work_queue_requires_worker_group() {
        let bus = fast_bus(InMemoryBroker::new());
        let err = bus
            .subscribe(
                "p1",
                "someHook",
                SubscribeOptions::work_queue(""),
                counting_listener(Arc::new(AtomicUsize::new(0))),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EventError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn duplicate_worker_group_rejected() {
        let bus = fast_bus(InMemoryBroker::new());
        let c = Arc::new(AtomicUsize::new(0));
        bus.subscribe("p1", "h", SubscribeOptions::work_queue("g"), counting_listener(c.clone()))
            .await
            .unwrap();
        let err = bus
            .subscribe("p1", "h", SubscribeOptions::work_queue("g"), counting_listener(c))
            .await
            .unwrap_err();
        assert!(matches!(err, EventError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn same_group_name_different_plugins_coexist() {
        let bus = fast_bus(InMemoryBroker::new());
        let c = Arc::new(AtomicUsize::new(0));
        bus.subscribe("p1", "h", SubscribeOptions::work_queue("g"), counting_listener(c.clone()))
            .await
            .unwrap();
        // The group is namespaced by plugin id, so this is a distinct queue.
        bus.subscribe("p2", "h", SubscribeOptions::work_queue("g"), counting_listener(c.clone()))
            .await
            .unwrap();

        bus.emit("h", &json!({})).await.unwrap();
        settle().await;
        assert_eq!(c.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn broadcast_reaches_every_subscriber() {
        let bus = fast_bus(InMemoryBroker::new());
        let c = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            bus.subscribe("p1", "h", SubscribeOptions::broadcast(), counting_listener(c.clone()))
                .await
                .unwrap();
        }

        bus.emit("h", &json!({"n": 1})).await.unwrap();
        settle().await;
        assert_eq!(c.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn local_listeners_all_run_despite_failure() {
        let bus = fast_bus(InMemoryBroker::new());
        let c = Arc::new(AtomicUsize::new(0));
        let fails = Arc::new(AtomicUsize::new(0));

        bus.subscribe("p1", "h", SubscribeOptions::instance_local(), counting_listener(c.clone()))
            .await
            .unwrap();
        bus.subscribe("p1", "h", SubscribeOptions::instance_local(), failing_listener(fails.clone()))
            .await
            .unwrap();
        bus.subscribe("p1", "h", SubscribeOptions::instance_local(), counting_listener(c.clone()))
            .await
            .unwrap();

        bus.emit_local("h", json!({})).await;
        assert_eq!(c.load(Ordering::SeqCst), 2);
        assert_eq!(fails.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn local_lifo_runs_in_reverse_order() {
        let bus = fast_bus(InMemoryBroker::new());
        let order = Arc::new(Mutex::new(Vec::<u32>::new()));

        for tag in [1u32, 2, 3] {
            let order = order.clone();
            let listener: Listener = Arc::new(move |_| {
                let order = order.clone();
                Box::pin(async move {
                    order.lock().await.push(tag);
                    Ok(())
                })
            });
            bus.subscribe("p1", "h", SubscribeOptions::instance_local(), listener)
                .await
                .unwrap();
        }

        bus.emit_local_lifo("h", json!({})).await;
        assert_eq!(*order.lock().await, vec![3, 2, 1]);
    }

    #[tokio::test]
    async fn work_queue_retries_then_gives_up() {
        let bus = fast_bus(InMemoryBroker::new());
        let attempts = Arc::new(AtomicUsize::new(0));
        bus.subscribe("p1", "h", SubscribeOptions::work_queue("g"), failing_listener(attempts.clone()))
            .await
            .unwrap();

        bus.emit("h", &json!({})).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // 1 initial attempt + 3 retries.
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn unsubscribing_last_listener_releases_channel() {
        let broker = InMemoryBroker::new();
        let bus = fast_bus(broker.clone());
        let id = bus
            .subscribe(
                "p1",
                "h",
                SubscribeOptions::work_queue("g"),
                counting_listener(Arc::new(AtomicUsize::new(0))),
            )
            .await
            .unwrap();
        assert!(broker.has_channel("h").await);

        bus.unsubscribe(id).await;
        assert!(!broker.has_channel("h").await);
    }

    #[tokio::test]
    async fn unsubscribe_plugin_removes_all_subscriptions() {
        let broker = InMemoryBroker::new();
        let bus = fast_bus(broker.clone());
        let c = Arc::new(AtomicUsize::new(0));

        bus.subscribe("p1", "h", SubscribeOptions::work_queue("g1"), counting_listener(c.clone()))
            .await
            .unwrap();
        bus.subscribe("p1", "h", SubscribeOptions::broadcast(), counting_listener(c.clone()))
            .await
            .unwrap();
        bus.subscribe("p1", "h", SubscribeOptions::instance_local(), counting_listener(c.clone()))
            .await
            .unwrap();

        bus.unsubscribe_plugin("p1").await;
        bus.emit("h", &json!({})).await.unwrap();
        bus.emit_local("h", json!({})).await;
        settle().await;

        assert_eq!(c.load(Ordering::SeqCst), 0);
        assert!(!broker.has_channel("h").await);
    }

    #[tokio::test]
    async fn emit_after_shutdown_fails() {
        let bus = fast_bus(InMemoryBroker::new());
        bus.shutdown().await;
        let err = bus.emit("h", &json!({})).await.unwrap_err();
        assert!(matches!(err, EventError::ShutDown));
    }

    #[tokio::test]
    async fn work_queue_preserves_enqueue_order() {
        let bus = fast_bus(InMemoryBroker::new());
        let seen = Arc::new(Mutex::new(Vec::<i64>::new()));
        let seen2 = seen.clone();
        let listener: Listener = Arc::new(move |payload| {
            let seen = seen2.clone();
            Box::pin(async move {
                seen.lock().await.push(payload["n"].as_i64().unwrap());
                Ok(())
            })
        });
        bus.subscribe("p1", "h", SubscribeOptions::work_queue("g"), listener)
            .await
            .unwrap();

        for n in 0..10 {
            bus.emit("h", &json!({ "n": n })).await.unwrap();
        }
        settle().await;
        assert_eq!(*seen.lock().await, (0..10).collect::<Vec<i64>>());
    }
}
