//! Per-resource lock state and the admission algorithm
//!
//! A [`LockEntry`] tracks who holds one resource, who waits for it, and
//! the live instance they share. Every state change (a request arriving,
//! a holder releasing, a waiter canceling) ends with an admission pass,
//! which grants from the head of the queue in arrival order:
//!
//! - with no holders, the head is granted whatever its mode;
//! - with shared holders, a shared head is granted as well;
//! - an exclusive request at the head waits for the entry to empty, and
//!   everything behind it waits too.
//!
//! So requests never overtake an exclusive request queued before them.
//!
//! Callbacks are never run here. Each operation returns an [`Outcome`]
//! that the manager delivers after the entry mutex is released, so a
//! callback may release its handle or register more requests.

use super::factory::{ResourceFactory, ResourceInstance, SharedValue, call_guarded};
use super::handle::ResourceHandle;
use super::manager::ManagerInner;
use super::request::{Request, RequestHandle, lock};
use super::types::{LockMode, ResourceInfo, ResourceKey, ResourceResult, ResourceStatus};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, warn};
use uuid::Uuid;

/// Work left for the caller once the entry is unlocked
#[derive(Default)]
#[must_use]
pub(crate) struct Outcome {
    notifications: Vec<(RequestHandle, Option<ResourceHandle>)>,
    /// Nobody holds or waits for the resource any more
    pub(crate) idle: bool,
}

impl Outcome {
    /// Run the callbacks of every request processed
    pub(crate) fn deliver(self) {
        for (request, resource) in self.notifications {
            request.notify(resource);
        }
    }

    #[cfg(test)]
    fn granted(&self) -> Vec<Uuid> {
        self.notifications
            .iter()
            .filter(|(_, resource)| resource.is_some())
            .map(|(request, _)| request.id())
            .collect()
    }
}

/// The factory-created instance shared by the current holders
struct LiveInstance {
    mode: LockMode,
    value: SharedValue,
    inner: Box<dyn ResourceInstance>,
}

#[derive(Default)]
struct EntryState {
    /// All shared, or a single exclusive request
    grantees: Vec<Arc<Request>>,
    /// Pending requests in arrival order
    queue: VecDeque<Arc<Request>>,
    instance: Option<LiveInstance>,
    /// Removed from the manager; new requests must go to a fresh entry
    retired: bool,
}

impl EntryState {
    fn held_mode(&self) -> Option<LockMode> {
        self.grantees.first().map(|request| request.mode())
    }

    fn is_idle(&self) -> bool {
        self.grantees.is_empty() && self.queue.is_empty()
    }
}

/// Lock state of one `(namespace, name)` resource
pub(crate) struct LockEntry {
    key: ResourceKey,
    factory: Arc<dyn ResourceFactory>,
    manager: Weak<ManagerInner>,
    log_auto_release: bool,
    state: Mutex<EntryState>,
}

impl LockEntry {
    pub(crate) fn new(
        key: ResourceKey,
        factory: Arc<dyn ResourceFactory>,
        manager: Weak<ManagerInner>,
        log_auto_release: bool,
    ) -> Self {
        Self {
            key,
            factory,
            manager,
            log_auto_release,
            state: Mutex::new(EntryState::default()),
        }
    }

    /// Queue a request and admit what can be admitted.
    ///
    /// Returns `None` if the entry was retired; the caller must look the
    /// key up again.
    pub(crate) fn enqueue(&self, request: Arc<Request>) -> Option<Outcome> {
        let mut state = lock(&self.state);
        if state.retired {
            return None;
        }

        debug!(
            resource = %self.key,
            request = %request.id(),
            mode = %request.mode(),
            holders = state.grantees.len(),
            waiting = state.queue.len(),
            "Request queued"
        );
        state.queue.push_back(request);

        let mut outcome = Outcome::default();
        self.admit(&mut state, &mut outcome);
        outcome.idle = self.settle(&mut state);
        Some(outcome)
    }

    /// Drop the grant held by `request_id`, if it still holds one
    pub(crate) fn release(&self, request_id: Uuid) -> Outcome {
        self.release_where(|grantees| grantees.iter().position(|r| r.id() == request_id))
            .unwrap_or_else(|| {
                debug!(resource = %self.key, request = %request_id, "Release of a grant not held, ignoring");
                Outcome::default()
            })
    }

    /// Drop the longest-standing grant. `None` if nobody holds the resource.
    pub(crate) fn release_oldest(&self) -> Option<Outcome> {
        self.release_where(|grantees| if grantees.is_empty() { None } else { Some(0) })
    }

    fn release_where(&self, pick: impl FnOnce(&[Arc<Request>]) -> Option<usize>) -> Option<Outcome> {
        let mut state = lock(&self.state);
        let index = pick(&state.grantees)?;
        let request = state.grantees.remove(index);
        debug!(
            resource = %self.key,
            request = %request.id(),
            holders = state.grantees.len(),
            "Resource released"
        );

        let mut outcome = Outcome::default();
        self.admit(&mut state, &mut outcome);
        outcome.idle = self.settle(&mut state);
        Some(outcome)
    }

    /// Withdraw a pending request from the queue
    pub(crate) fn cancel(&self, request: &Arc<Request>) -> ResourceResult<Outcome> {
        let mut state = lock(&self.state);

        if let Some(index) = state.queue.iter().position(|r| Arc::ptr_eq(r, request)) {
            state.queue.remove(index);
        }
        request.cancel()?;
        debug!(resource = %self.key, request = %request.id(), "Request canceled");

        let mut outcome = Outcome::default();
        outcome
            .notifications
            .push((self.request_handle(request.clone()), None));
        // A canceled exclusive request may have been holding others back
        self.admit(&mut state, &mut outcome);
        outcome.idle = self.settle(&mut state);
        Ok(outcome)
    }

    /// Mark the entry retired if it is idle. Returns whether it was.
    pub(crate) fn retire_if_idle(&self) -> bool {
        let mut state = lock(&self.state);
        if state.is_idle() {
            state.retired = true;
        }
        state.retired
    }

    pub(crate) fn status(&self) -> ResourceStatus {
        ResourceStatus::from(lock(&self.state).held_mode())
    }

    pub(crate) fn info(&self) -> ResourceInfo {
        let state = lock(&self.state);
        ResourceInfo {
            key: self.key.to_string(),
            status: ResourceStatus::from(state.held_mode()),
            instance_mode: state.instance.as_ref().map(|live| live.mode),
            grantees: state.grantees.iter().map(|r| r.info()).collect(),
            queued: state.queue.iter().map(|r| r.info()).collect(),
        }
    }

    fn request_handle(&self, request: Arc<Request>) -> RequestHandle {
        RequestHandle::new(request, self.manager.clone())
    }

    /// Grant queued requests, head first, until one is incompatible
    fn admit(&self, state: &mut EntryState, outcome: &mut Outcome) {
        loop {
            let grantable = match (state.queue.front(), state.held_mode()) {
                (None, _) => false,
                (Some(_), None) => true,
                (Some(head), Some(held)) => head.mode().is_compatible_with(held),
            };
            if !grantable {
                break;
            }
            let Some(request) = state.queue.pop_front() else {
                break;
            };

            let value = match self.prepare_instance(state, request.mode()) {
                Ok(value) => value,
                Err(reason) => {
                    warn!(
                        resource = %self.key,
                        request = %request.id(),
                        mode = %request.mode(),
                        error = %reason,
                        "Could not provide resource instance, canceling request"
                    );
                    if let Err(e) = request.cancel() {
                        warn!(request = %request.id(), error = %e, "Queued request was not pending");
                    }
                    outcome
                        .notifications
                        .push((self.request_handle(request), None));
                    continue;
                }
            };

            if let Err(e) = request.grant() {
                warn!(request = %request.id(), error = %e, "Queued request was not pending");
                continue;
            }
            debug!(
                resource = %self.key,
                request = %request.id(),
                mode = %request.mode(),
                holders = state.grantees.len() + 1,
                "Request granted"
            );

            let resource = ResourceHandle::new(
                self.key.clone(),
                request.mode(),
                request.id(),
                value,
                self.manager.clone(),
                self.log_auto_release,
            );
            state.grantees.push(request.clone());
            outcome
                .notifications
                .push((self.request_handle(request), Some(resource)));
        }
    }

    /// Make sure a live instance suitable for `mode` exists and return its value.
    ///
    /// Reuses the instance when its mode matches, tries an in-place switch
    /// when it does not, and falls back to closing it and creating a new one.
    fn prepare_instance(&self, state: &mut EntryState, mode: LockMode) -> Result<SharedValue, String> {
        if let Some(live) = state.instance.as_mut() {
            if live.mode == mode {
                return Ok(live.value.clone());
            }

            let switched = call_guarded(|| {
                live.inner.switch_lock_mode(mode)?;
                Ok(live.inner.value())
            });
            match switched {
                Ok(value) => {
                    debug!(resource = %self.key, from = %live.mode, to = %mode, "Resource instance switched");
                    live.mode = mode;
                    live.value = value.clone();
                    return Ok(value);
                }
                Err(e) => {
                    debug!(
                        resource = %self.key,
                        to = %mode,
                        error = %e,
                        "Could not switch resource instance, recreating it"
                    );
                }
            }

            if let Some(old) = state.instance.take() {
                self.close_instance(old);
            }
        }

        let created = call_guarded(|| {
            let inner = self.factory.create_resource(self.key.name(), mode)?;
            let value = inner.value();
            Ok(LiveInstance { mode, value, inner })
        })
        .map_err(|e| format!("{:#}", e))?;

        debug!(resource = %self.key, mode = %mode, "Resource instance created");
        let value = created.value.clone();
        state.instance = Some(created);
        Ok(value)
    }

    fn close_instance(&self, mut live: LiveInstance) {
        if let Err(e) = call_guarded(|| live.inner.close()) {
            warn!(resource = %self.key, error = %e, "Failed to close resource instance");
        }
    }

    /// Close the instance once nobody holds or waits for it
    fn settle(&self, state: &mut EntryState) -> bool {
        if !state.is_idle() {
            return false;
        }
        if let Some(live) = state.instance.take() {
            self.close_instance(live);
            debug!(resource = %self.key, "Resource instance closed");
        }
        true
    }
}

impl std::fmt::Debug for LockEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockEntry").field("key", &self.key).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::resource::types::RequestState;
    use crate::domain::resource::factory::SimpleResourceFactory;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn entry_with(factory: Arc<dyn ResourceFactory>) -> LockEntry {
        LockEntry::new(ResourceKey::new("ns", "r").unwrap(), factory, Weak::new(), false)
    }

    fn request(mode: LockMode) -> Arc<Request> {
        Request::new(ResourceKey::new("ns", "r").unwrap(), mode, Box::new(|_, _| {}))
    }

    fn queue(entry: &LockEntry, mode: LockMode) -> (Arc<Request>, Outcome) {
        let request = request(mode);
        let outcome = entry.enqueue(request.clone()).unwrap();
        (request, outcome)
    }

    struct FailingFactory;

    impl ResourceFactory for FailingFactory {
        fn create_resource(&self, _name: &str, _mode: LockMode) -> anyhow::Result<Box<dyn ResourceInstance>> {
            Err(anyhow!("backing storage unavailable"))
        }
    }

    #[test]
    fn test_exclusive_blocks_everything_behind_it() {
        let entry = entry_with(Arc::new(SimpleResourceFactory));
        let (holder, first) = queue(&entry, LockMode::Exclusive);
        assert_eq!(first.granted(), vec![holder.id()]);

        let (shared, outcome) = queue(&entry, LockMode::Shared);
        assert!(outcome.granted().is_empty());
        assert_eq!(shared.state(), RequestState::Pending);
        assert_eq!(entry.status(), ResourceStatus::Locked);

        // Release the holder directly: handles in `first` are detached.
        let outcome = entry.release(holder.id());
        assert_eq!(outcome.granted(), vec![shared.id()]);
        assert_eq!(entry.status(), ResourceStatus::Shared);
        drop(first);
    }

    #[test]
    fn test_shared_requests_queue_behind_waiting_exclusive() {
        let entry = entry_with(Arc::new(SimpleResourceFactory));
        let (reader, _) = queue(&entry, LockMode::Shared);
        let (writer, outcome) = queue(&entry, LockMode::Exclusive);
        assert!(outcome.granted().is_empty());

        let (late_reader, outcome) = queue(&entry, LockMode::Shared);
        assert!(outcome.granted().is_empty());
        assert_eq!(late_reader.state(), RequestState::Pending);

        let outcome = entry.release(reader.id());
        assert_eq!(outcome.granted(), vec![writer.id()]);

        let outcome = entry.release(writer.id());
        assert_eq!(outcome.granted(), vec![late_reader.id()]);
    }

    #[test]
    fn test_canceling_barrier_admits_blocked_readers() {
        let entry = entry_with(Arc::new(SimpleResourceFactory));
        let (reader, _) = queue(&entry, LockMode::Shared);
        let (writer, _) = queue(&entry, LockMode::Exclusive);
        let (r1, _) = queue(&entry, LockMode::Shared);
        let (r2, _) = queue(&entry, LockMode::Shared);

        let outcome = entry.cancel(&writer).unwrap();
        assert_eq!(outcome.granted(), vec![r1.id(), r2.id()]);
        assert_eq!(writer.state(), RequestState::Canceled);
        assert_eq!(entry.info().grantees.len(), 3);
        assert!(entry.info().queued.is_empty());

        assert!(entry.cancel(&writer).is_err());
        let _ = reader;
    }

    #[test]
    fn test_creation_failure_cancels_and_continues() {
        let entry = entry_with(Arc::new(FailingFactory));
        let (first, outcome) = queue(&entry, LockMode::Exclusive);
        assert!(outcome.granted().is_empty());
        assert!(outcome.idle);
        assert_eq!(first.state(), RequestState::Canceled);
        assert!(entry.retire_if_idle());
        assert!(entry.enqueue(request(LockMode::Shared)).is_none());
    }

    #[test]
    fn test_instance_closed_when_idle() {
        struct CountingInstance(Arc<AtomicUsize>);
        impl ResourceInstance for CountingInstance {
            fn value(&self) -> SharedValue {
                Arc::new(())
            }
            fn close(&mut self) -> anyhow::Result<()> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Err(anyhow!("close failures are tolerated"))
            }
        }
        struct CountingFactory(Arc<AtomicUsize>);
        impl ResourceFactory for CountingFactory {
            fn create_resource(&self, _: &str, _: LockMode) -> anyhow::Result<Box<dyn ResourceInstance>> {
                Ok(Box::new(CountingInstance(self.0.clone())))
            }
        }

        let closed = Arc::new(AtomicUsize::new(0));
        let entry = entry_with(Arc::new(CountingFactory(closed.clone())));
        let (holder, _) = queue(&entry, LockMode::Exclusive);
        assert_eq!(entry.info().instance_mode, Some(LockMode::Exclusive));

        let outcome = entry.release(holder.id());
        assert!(outcome.idle);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert_eq!(entry.info().instance_mode, None);
        assert_eq!(entry.status(), ResourceStatus::Free);
    }
}
