//! Resource manager for coordinating shared and exclusive access
//!
//! The resource manager is the central point through which host-agent
//! components serialize access to storage domains, VMs and other named
//! resources. It handles:
//! - A registry of namespaces, each backed by a [`ResourceFactory`]
//! - Lazily created per-resource lock entries with FIFO admission
//! - Blocking, callback-based and future-based acquisition
//! - Automatic release of handles that are dropped
//!
//! One manager is built at process start and passed to the components
//! that need it; clones share the same state.

use super::entry::{LockEntry, Outcome};
use super::factory::{ResourceFactory, call_guarded};
use super::handle::ResourceHandle;
use super::request::{Request, RequestHandle, lock};
use super::types::{
    LockMode, RequestState, ResourceConfig, ResourceError, ResourceInfo, ResourceKey,
    ResourceResult, ResourceStatus, validate_name,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Resource manager for namespaced shared/exclusive locks
#[derive(Debug, Clone)]
pub struct ResourceManager {
    inner: Arc<ManagerInner>,
}

/// State shared by a manager, its clones, and (weakly) its handles
pub(crate) struct ManagerInner {
    /// Configuration
    config: ResourceConfig,

    /// Registered namespaces (name -> factory)
    namespaces: RwLock<HashMap<String, Arc<dyn ResourceFactory>>>,

    /// Live lock entries. Lock this before any entry, never after.
    entries: Mutex<HashMap<ResourceKey, Arc<LockEntry>>>,
}

impl ResourceManager {
    /// Create a new resource manager with the given configuration
    pub fn new(config: ResourceConfig) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                namespaces: RwLock::new(HashMap::new()),
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Create a resource manager with default configuration
    pub fn with_defaults() -> Self {
        Self::new(ResourceConfig::default())
    }

    /// Get the configuration
    pub fn config(&self) -> &ResourceConfig {
        &self.inner.config
    }

    // ========== Namespaces ==========

    /// Register a namespace backed by `factory`.
    ///
    /// Fails if the name contains the key separator, or if the namespace
    /// exists and `force` is not set.
    pub fn register_namespace(
        &self,
        name: &str,
        factory: Arc<dyn ResourceFactory>,
        force: bool,
    ) -> ResourceResult<()> {
        validate_name(name)?;

        let mut namespaces = self
            .inner
            .namespaces
            .write()
            .unwrap_or_else(|e| e.into_inner());
        if namespaces.contains_key(name) && !force {
            return Err(ResourceError::AlreadyRegistered(name.to_string()));
        }
        namespaces.insert(name.to_string(), factory);

        info!(namespace = %name, force, "Namespace registered");
        Ok(())
    }

    /// Remove a namespace.
    ///
    /// Resources of the namespace should all be released first; entries
    /// still alive keep the factory they were created with.
    pub fn unregister_namespace(&self, name: &str) -> ResourceResult<()> {
        let removed = self
            .inner
            .namespaces
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);

        match removed {
            Some(_) => {
                info!(namespace = %name, "Namespace unregistered");
                Ok(())
            }
            None => Err(ResourceError::UnknownNamespace(name.to_string())),
        }
    }

    /// Names of all registered namespaces
    pub fn list_namespaces(&self) -> BTreeSet<String> {
        self.inner
            .namespaces
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    // ========== Acquisition ==========

    /// Acquire a resource, blocking until it is granted.
    ///
    /// `timeout` of `None` falls back to the configured default. When the
    /// timeout elapses the request is canceled before `TimedOut` is
    /// returned, so it can never be granted afterwards.
    pub fn acquire_resource(
        &self,
        namespace: &str,
        name: &str,
        mode: LockMode,
        timeout: Option<Duration>,
    ) -> ResourceResult<ResourceHandle> {
        let timeout = match timeout {
            Some(timeout) => Some(timeout),
            None => self.inner.config.default_timeout()?,
        };

        let (tx, rx) = mpsc::sync_channel(1);
        let request = self.register_resource(namespace, name, mode, move |_, resource| {
            // The receiver is gone only if the caller stopped waiting; the
            // returned handle is then dropped, which releases it.
            let _ = tx.send(resource);
        })?;

        let delivered = match timeout {
            None => rx.recv().ok(),
            Some(timeout) => match rx.recv_timeout(timeout) {
                Ok(resource) => Some(resource),
                Err(RecvTimeoutError::Disconnected) => None,
                Err(RecvTimeoutError::Timeout) => match request.cancel() {
                    Ok(()) => {
                        debug!(resource = %request.key(), request = %request.id(), "Acquire timed out");
                        return Err(ResourceError::TimedOut {
                            resource: request.key().to_string(),
                            timeout,
                        });
                    }
                    // Processed while we gave up: the callback is on its way.
                    Err(ResourceError::AlreadyProcessed { .. }) => rx.recv().ok(),
                    Err(e) => return Err(e),
                },
            },
        };

        match delivered {
            Some(Some(resource)) => Ok(resource),
            _ => Err(creation_failed(request.key(), request.state())),
        }
    }

    /// Acquire a resource without blocking a thread.
    ///
    /// Dropping the future before it resolves cancels the request.
    pub async fn acquire_resource_async(
        &self,
        namespace: &str,
        name: &str,
        mode: LockMode,
    ) -> ResourceResult<ResourceHandle> {
        let (tx, rx) = oneshot::channel();
        let request = self.register_resource(namespace, name, mode, move |_, resource| {
            let _ = tx.send(resource);
        })?;

        let mut guard = CancelOnDrop(Some(request.clone()));
        let delivered = rx.await;
        guard.0 = None;

        match delivered {
            Ok(Some(resource)) => Ok(resource),
            _ => Err(creation_failed(request.key(), request.state())),
        }
    }

    /// Queue a request and return immediately.
    ///
    /// `callback` runs exactly once: with the handle when the request is
    /// granted, or with `None` when it is canceled or the resource could not
    /// be created. It may run on this thread before `register_resource`
    /// returns, or later on whichever thread makes the request grantable.
    /// It never runs while manager state is locked.
    pub fn register_resource<F>(
        &self,
        namespace: &str,
        name: &str,
        mode: LockMode,
        callback: F,
    ) -> ResourceResult<RequestHandle>
    where
        F: FnOnce(&RequestHandle, Option<ResourceHandle>) + Send + 'static,
    {
        let factory = self.inner.factory(namespace)?;
        let key = ResourceKey::new(namespace, name)?;
        self.inner.check_exists(&factory, &key)?;

        let request = Request::new(key.clone(), mode, Box::new(callback));
        let outcome = loop {
            let entry = self.inner.entry(&key, &factory);
            if let Some(outcome) = entry.enqueue(request.clone()) {
                break outcome;
            }
        };

        let handle = RequestHandle::new(request, Arc::downgrade(&self.inner));
        self.inner.finish(&key, outcome);
        Ok(handle)
    }

    /// Release one holder of a resource without its handle.
    ///
    /// Legacy path: the longest-standing grant is released, and the handle
    /// that owned it becomes inert.
    pub fn release_resource(&self, namespace: &str, name: &str) -> ResourceResult<()> {
        self.inner.factory(namespace)?;
        let key = ResourceKey::new(namespace, name)?;

        let outcome = self
            .inner
            .lookup(&key)
            .and_then(|entry| entry.release_oldest())
            .ok_or_else(|| ResourceError::NotLocked(key.to_string()))?;
        self.inner.finish(&key, outcome);
        Ok(())
    }

    // ========== Introspection ==========

    /// Current status of a resource
    pub fn get_resource_status(&self, namespace: &str, name: &str) -> ResourceResult<ResourceStatus> {
        let factory = self.inner.factory(namespace)?;
        let key = ResourceKey::new(namespace, name)?;
        self.inner.check_exists(&factory, &key)?;

        Ok(self
            .inner
            .lookup(&key)
            .map(|entry| entry.status())
            .unwrap_or(ResourceStatus::Free))
    }

    /// Snapshot of a resource's holders and waiters, if anyone holds or waits for it
    pub fn resource_info(&self, namespace: &str, name: &str) -> Option<ResourceInfo> {
        let key = ResourceKey::new(namespace, name).ok()?;
        self.inner.lookup(&key).map(|entry| entry.info())
    }

    /// Snapshots of every resource currently held or waited for
    pub fn list_resources(&self) -> Vec<ResourceInfo> {
        let entries: Vec<Arc<LockEntry>> = lock(&self.inner.entries).values().cloned().collect();
        let mut infos: Vec<ResourceInfo> = entries.iter().map(|entry| entry.info()).collect();
        infos.sort_by(|a, b| a.key.cmp(&b.key));
        infos
    }
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl ManagerInner {
    fn factory(&self, namespace: &str) -> ResourceResult<Arc<dyn ResourceFactory>> {
        self.namespaces
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(namespace)
            .cloned()
            .ok_or_else(|| ResourceError::UnknownNamespace(namespace.to_string()))
    }

    fn check_exists(&self, factory: &Arc<dyn ResourceFactory>, key: &ResourceKey) -> ResourceResult<()> {
        match call_guarded(|| Ok(factory.resource_exists(key.name()))) {
            Ok(true) => Ok(()),
            Ok(false) => Err(ResourceError::NotFound(key.to_string())),
            Err(e) => {
                warn!(resource = %key, error = %e, "Existence check failed");
                Err(ResourceError::CreationFailed {
                    resource: key.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    fn lookup(&self, key: &ResourceKey) -> Option<Arc<LockEntry>> {
        lock(&self.entries).get(key).cloned()
    }

    fn entry(self: &Arc<Self>, key: &ResourceKey, factory: &Arc<dyn ResourceFactory>) -> Arc<LockEntry> {
        lock(&self.entries)
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(LockEntry::new(
                    key.clone(),
                    factory.clone(),
                    Arc::downgrade(self),
                    self.config.log_auto_release,
                ))
            })
            .clone()
    }

    /// Drop an idle entry, then run the callbacks of processed requests
    fn finish(&self, key: &ResourceKey, outcome: Outcome) {
        if outcome.idle {
            let mut entries = lock(&self.entries);
            if entries.get(key).is_some_and(|entry| entry.retire_if_idle()) {
                entries.remove(key);
                debug!(resource = %key, "Lock entry removed");
            }
        }
        outcome.deliver();
    }

    /// Called by handles on release
    pub(crate) fn release_grant(&self, key: &ResourceKey, request_id: Uuid) {
        match self.lookup(key) {
            Some(entry) => {
                let outcome = entry.release(request_id);
                self.finish(key, outcome);
            }
            None => debug!(resource = %key, request = %request_id, "Release for a resource no longer tracked"),
        }
    }

    /// Called by request handles on cancel
    pub(crate) fn cancel_request(&self, request: &Arc<Request>) -> ResourceResult<()> {
        let key = request.key();
        match self.lookup(key) {
            Some(entry) => {
                let outcome = entry.cancel(request)?;
                self.finish(key, outcome);
                Ok(())
            }
            // Pending requests always sit in a live entry
            None => request.cancel(),
        }
    }
}

impl std::fmt::Debug for ManagerInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagerInner")
            .field("config", &self.config)
            .field("entries", &lock(&self.entries).len())
            .finish_non_exhaustive()
    }
}

/// Cancels an async acquisition whose future was dropped
struct CancelOnDrop(Option<RequestHandle>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(request) = self.0.take() {
            if request.cancel().is_ok() {
                debug!(resource = %request.key(), request = %request.id(), "Async acquire abandoned");
            }
        }
    }
}

fn creation_failed(key: &ResourceKey, state: RequestState) -> ResourceError {
    ResourceError::CreationFailed {
        resource: key.to_string(),
        reason: match state {
            RequestState::Canceled => "request was canceled".to_string(),
            _ => "no resource was delivered".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::resource::factory::{ResourceInstance, SharedValue, SimpleResource, SimpleResourceFactory};
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn create_test_manager() -> ResourceManager {
        let manager = ResourceManager::new(ResourceConfig::default().with_auto_release_logging(false));
        manager
            .register_namespace("vm", Arc::new(SimpleResourceFactory), false)
            .expect("Failed to register namespace");
        manager
    }

    struct PickyFactory;

    impl ResourceFactory for PickyFactory {
        fn resource_exists(&self, name: &str) -> bool {
            name != "ghost"
        }

        fn create_resource(&self, name: &str, mode: LockMode) -> anyhow::Result<Box<dyn ResourceInstance>> {
            SimpleResourceFactory.create_resource(name, mode)
        }
    }

    #[test]
    fn test_register_namespace() {
        let manager = create_test_manager();

        let err = manager
            .register_namespace("vm", Arc::new(SimpleResourceFactory), false)
            .unwrap_err();
        assert_eq!(err, ResourceError::AlreadyRegistered("vm".to_string()));
        manager
            .register_namespace("vm", Arc::new(SimpleResourceFactory), true)
            .expect("Forced registration should succeed");

        let err = manager
            .register_namespace("bad.name", Arc::new(SimpleResourceFactory), false)
            .unwrap_err();
        assert!(matches!(err, ResourceError::InvalidName(_)));

        manager
            .register_namespace("storage", Arc::new(SimpleResourceFactory), false)
            .unwrap();
        let names: Vec<String> = manager.list_namespaces().into_iter().collect();
        assert_eq!(names, vec!["storage".to_string(), "vm".to_string()]);

        manager.unregister_namespace("storage").unwrap();
        assert!(matches!(
            manager.unregister_namespace("storage"),
            Err(ResourceError::UnknownNamespace(_))
        ));
    }

    #[test]
    fn test_acquire_and_release() {
        let manager = create_test_manager();

        let handle = manager
            .acquire_resource("vm", "vm-1", LockMode::Exclusive, None)
            .expect("Failed to acquire resource");
        assert_eq!(handle.get::<SimpleResource>().unwrap().mode, LockMode::Exclusive);
        assert_eq!(
            manager.get_resource_status("vm", "vm-1").unwrap(),
            ResourceStatus::Locked
        );

        handle.release();
        assert_eq!(
            manager.get_resource_status("vm", "vm-1").unwrap(),
            ResourceStatus::Free
        );
        assert!(manager.resource_info("vm", "vm-1").is_none());
    }

    #[test]
    fn test_argument_errors() {
        let manager = create_test_manager();
        manager
            .register_namespace("picky", Arc::new(PickyFactory), false)
            .unwrap();

        assert!(matches!(
            manager.acquire_resource("nope", "r", LockMode::Shared, None),
            Err(ResourceError::UnknownNamespace(_))
        ));
        assert!(matches!(
            manager.acquire_resource("vm", "a.b", LockMode::Shared, None),
            Err(ResourceError::InvalidName(_))
        ));
        assert!(matches!(
            manager.acquire_resource("picky", "ghost", LockMode::Shared, None),
            Err(ResourceError::NotFound(_))
        ));
        assert!(matches!(
            manager.get_resource_status("picky", "ghost"),
            Err(ResourceError::NotFound(_))
        ));
        assert!(matches!(
            manager.release_resource("vm", "a.b"),
            Err(ResourceError::InvalidName(_))
        ));
        assert!(matches!(
            manager.release_resource("nope", "r"),
            Err(ResourceError::UnknownNamespace(_))
        ));
        assert!(matches!(
            manager.release_resource("vm", "idle"),
            Err(ResourceError::NotLocked(_))
        ));
    }

    #[test]
    fn test_invalid_default_timeout() {
        let manager = ResourceManager::new(ResourceConfig {
            default_timeout_secs: Some(f64::NAN),
            log_auto_release: false,
        });
        manager
            .register_namespace("vm", Arc::new(SimpleResourceFactory), false)
            .unwrap();

        assert!(matches!(
            manager.acquire_resource("vm", "r", LockMode::Shared, None),
            Err(ResourceError::InvalidTimeout(_))
        ));
    }

    #[test]
    fn test_shared_holders_share_instance() {
        let manager = create_test_manager();
        let a = manager
            .acquire_resource("vm", "r", LockMode::Shared, None)
            .unwrap();
        let b = manager
            .acquire_resource("vm", "r", LockMode::Shared, None)
            .unwrap();

        assert!(Arc::ptr_eq(&a.value(), &b.value()));
        assert_eq!(manager.resource_info("vm", "r").unwrap().grantees.len(), 2);
    }

    #[test]
    fn test_legacy_release_makes_handle_inert() {
        let manager = create_test_manager();
        let handle = manager
            .acquire_resource("vm", "r", LockMode::Exclusive, None)
            .unwrap();

        manager.release_resource("vm", "r").unwrap();
        assert_eq!(manager.get_resource_status("vm", "r").unwrap(), ResourceStatus::Free);

        let next = manager
            .acquire_resource("vm", "r", LockMode::Exclusive, None)
            .unwrap();
        // The old handle no longer holds anything; releasing it must not
        // disturb the new holder.
        handle.release();
        assert_eq!(manager.get_resource_status("vm", "r").unwrap(), ResourceStatus::Locked);
        drop(next);
    }

    #[test]
    fn test_callback_may_release_reentrantly() {
        let manager = create_test_manager();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let request = manager
            .register_resource("vm", "r", LockMode::Exclusive, move |request, resource| {
                assert!(request.granted());
                let resource = resource.expect("Expected a grant");
                resource.release();
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        assert!(request.granted());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.get_resource_status("vm", "r").unwrap(), ResourceStatus::Free);
    }

    #[test]
    fn test_callback_may_register_reentrantly() {
        let manager = create_test_manager();
        let holder = manager
            .acquire_resource("vm", "r", LockMode::Exclusive, None)
            .unwrap();

        let inner_manager = manager.clone();
        let (tx, rx) = mpsc::channel();
        manager
            .register_resource("vm", "r", LockMode::Exclusive, move |_, resource| {
                drop(resource);
                let nested = inner_manager
                    .register_resource("vm", "other", LockMode::Shared, |_, _| {})
                    .unwrap();
                tx.send(nested.granted()).unwrap();
            })
            .unwrap();

        let releaser = thread::spawn(move || holder.release());
        releaser.join().unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    }

    #[test]
    fn test_switch_failure_falls_back_to_recreate() {
        struct StubbornInstance(LockMode);
        impl ResourceInstance for StubbornInstance {
            fn value(&self) -> SharedValue {
                Arc::new(self.0)
            }
            fn switch_lock_mode(&mut self, _mode: LockMode) -> anyhow::Result<()> {
                Err(anyhow!("refusing to switch"))
            }
            fn close(&mut self) -> anyhow::Result<()> {
                panic!("close blew up");
            }
        }
        struct StubbornFactory(AtomicUsize);
        impl ResourceFactory for StubbornFactory {
            fn create_resource(&self, _: &str, mode: LockMode) -> anyhow::Result<Box<dyn ResourceInstance>> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(StubbornInstance(mode)))
            }
        }

        let manager = create_test_manager();
        let factory = Arc::new(StubbornFactory(AtomicUsize::new(0)));
        manager.register_namespace("db", factory.clone(), false).unwrap();

        let writer = manager
            .acquire_resource("db", "r", LockMode::Exclusive, None)
            .unwrap();
        let (tx, rx) = mpsc::channel();
        manager
            .register_resource("db", "r", LockMode::Shared, move |_, resource| {
                tx.send(resource.map(|r| *r.get::<LockMode>().unwrap())).unwrap();
            })
            .unwrap();

        writer.release();
        assert_eq!(rx.recv().unwrap(), Some(LockMode::Shared));
        assert_eq!(factory.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_acquire_async() {
        let manager = create_test_manager();
        let handle = manager
            .acquire_resource_async("vm", "r", LockMode::Shared)
            .await
            .expect("Failed to acquire resource");
        assert_eq!(handle.mode(), LockMode::Shared);
        assert_eq!(manager.get_resource_status("vm", "r").unwrap(), ResourceStatus::Shared);
    }

    #[tokio::test]
    async fn test_dropped_async_acquire_cancels_request() {
        let manager = create_test_manager();
        let holder = manager
            .acquire_resource("vm", "r", LockMode::Exclusive, None)
            .unwrap();

        let attempt = tokio::time::timeout(
            Duration::from_millis(50),
            manager.acquire_resource_async("vm", "r", LockMode::Exclusive),
        )
        .await;
        assert!(attempt.is_err());

        let info = manager.resource_info("vm", "r").unwrap();
        assert!(info.queued.is_empty());
        assert_eq!(info.grantees.len(), 1);
        drop(holder);
        assert!(manager.resource_info("vm", "r").is_none());
    }
}
