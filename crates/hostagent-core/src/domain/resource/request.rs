//! Requests and request handles
//!
//! A [`Request`] is one queued demand for a resource in a given mode. It
//! moves from pending to granted or canceled exactly once. Only the manager
//! drives those transitions; callers get a [`RequestHandle`], which can
//! wait on or cancel the request but has no way to grant it.

use super::factory::panic_message;
use super::handle::ResourceHandle;
use super::manager::ManagerInner;
use super::types::{
    LockMode, RequestInfo, RequestState, ResourceError, ResourceKey, ResourceResult,
};
use chrono::{DateTime, Utc};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tracing::{debug, error};
use uuid::Uuid;

/// Notification run once a request is granted (`Some`) or canceled (`None`)
pub type RequestCallback = Box<dyn FnOnce(&RequestHandle, Option<ResourceHandle>) + Send>;

/// Lock a mutex, recovering the data if a previous holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One queued demand for a resource
pub(crate) struct Request {
    id: Uuid,
    key: ResourceKey,
    mode: LockMode,
    created_at: DateTime<Utc>,
    state: Mutex<RequestState>,
    changed: Condvar,
    callback: Mutex<Option<RequestCallback>>,
}

impl Request {
    pub(crate) fn new(key: ResourceKey, mode: LockMode, callback: RequestCallback) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            key,
            mode,
            created_at: Utc::now(),
            state: Mutex::new(RequestState::Pending),
            changed: Condvar::new(),
            callback: Mutex::new(Some(callback)),
        })
    }

    pub(crate) fn id(&self) -> Uuid {
        self.id
    }

    pub(crate) fn key(&self) -> &ResourceKey {
        &self.key
    }

    pub(crate) fn mode(&self) -> LockMode {
        self.mode
    }

    pub(crate) fn state(&self) -> RequestState {
        *lock(&self.state)
    }

    pub(crate) fn grant(&self) -> ResourceResult<()> {
        self.transition(RequestState::Granted)
    }

    pub(crate) fn cancel(&self) -> ResourceResult<()> {
        self.transition(RequestState::Canceled)
    }

    fn transition(&self, to: RequestState) -> ResourceResult<()> {
        let mut state = lock(&self.state);
        if state.is_terminal() {
            return Err(ResourceError::AlreadyProcessed {
                request: self.id,
                state: *state,
            });
        }
        *state = to;
        self.changed.notify_all();
        debug!(request = %self.id, resource = %self.key, state = %to, "Request processed");
        Ok(())
    }

    /// Block until the request is granted or canceled
    pub(crate) fn wait(&self, timeout: Option<Duration>) -> ResourceResult<RequestState> {
        let state = lock(&self.state);
        match timeout {
            None => {
                let state = self
                    .changed
                    .wait_while(state, |s| !s.is_terminal())
                    .unwrap_or_else(PoisonError::into_inner);
                Ok(*state)
            }
            Some(timeout) => {
                let (state, result) = self
                    .changed
                    .wait_timeout_while(state, timeout, |s| !s.is_terminal())
                    .unwrap_or_else(PoisonError::into_inner);
                if result.timed_out() && !state.is_terminal() {
                    return Err(ResourceError::TimedOut {
                        resource: self.key.to_string(),
                        timeout,
                    });
                }
                Ok(*state)
            }
        }
    }

    pub(crate) fn info(&self) -> RequestInfo {
        RequestInfo {
            id: self.id,
            mode: self.mode,
            state: self.state(),
            created_at: self.created_at,
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("mode", &self.mode)
            .field("state", &self.state())
            .finish()
    }
}

/// Caller-facing view of a request
///
/// Two handles are equal only when they refer to the same request.
#[derive(Clone)]
pub struct RequestHandle {
    request: Arc<Request>,
    manager: Weak<ManagerInner>,
}

impl RequestHandle {
    pub(crate) fn new(request: Arc<Request>, manager: Weak<ManagerInner>) -> Self {
        Self { request, manager }
    }

    /// Request ID
    pub fn id(&self) -> Uuid {
        self.request.id()
    }

    /// Key of the requested resource
    pub fn key(&self) -> &ResourceKey {
        self.request.key()
    }

    /// Requested mode
    pub fn mode(&self) -> LockMode {
        self.request.mode()
    }

    /// Current state
    pub fn state(&self) -> RequestState {
        self.request.state()
    }

    /// Whether the request has been granted
    pub fn granted(&self) -> bool {
        self.state() == RequestState::Granted
    }

    /// Whether the request has been canceled
    pub fn canceled(&self) -> bool {
        self.state() == RequestState::Canceled
    }

    /// Block until the request is granted or canceled.
    ///
    /// Returns the final state, or `TimedOut` if `timeout` elapses first.
    /// A granted request may return before its callback has run.
    pub fn wait(&self, timeout: Option<Duration>) -> ResourceResult<RequestState> {
        self.request.wait(timeout)
    }

    /// Withdraw a pending request. Its callback receives `None`.
    ///
    /// Fails with `AlreadyProcessed` once the request was granted or canceled.
    pub fn cancel(&self) -> ResourceResult<()> {
        match self.manager.upgrade() {
            Some(manager) => manager.cancel_request(&self.request),
            None => {
                self.request.cancel()?;
                self.notify(None);
                Ok(())
            }
        }
    }

    /// Run the callback, at most once. Must not be called with an entry locked.
    pub(crate) fn notify(&self, resource: Option<ResourceHandle>) {
        let Some(callback) = lock(&self.request.callback).take() else {
            return;
        };

        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || callback(self, resource))) {
            error!(
                request = %self.id(),
                resource = %self.key(),
                panic = %panic_message(payload.as_ref()),
                "Request callback panicked"
            );
        }
    }
}

impl PartialEq for RequestHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.request, &other.request)
    }
}

impl Eq for RequestHandle {}

impl fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RequestHandle").field(&self.request).finish()
    }
}

impl fmt::Display for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Request[{}:{}:{}]", self.key(), self.mode(), self.state())
    }
}
