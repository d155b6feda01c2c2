//! Resource handles for RAII-style resource release
//!
//! A handle is what a successful acquirer holds. It gives access to the
//! value of the live instance and nothing else: the instance's lifecycle
//! stays with the manager. Dropping the handle releases the resource if
//! `release` was not called first.

use super::factory::SharedValue;
use super::manager::ManagerInner;
use super::types::{LockMode, ResourceKey};
use std::any::Any;
use std::fmt;
use std::sync::Weak;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;
use uuid::Uuid;

/// A granted resource
pub struct ResourceHandle {
    key: ResourceKey,
    mode: LockMode,
    request_id: Uuid,
    value: SharedValue,
    released: AtomicBool,
    /// Weak so that outstanding handles never keep the manager alive
    manager: Weak<ManagerInner>,
    log_auto_release: bool,
}

impl ResourceHandle {
    pub(crate) fn new(
        key: ResourceKey,
        mode: LockMode,
        request_id: Uuid,
        value: SharedValue,
        manager: Weak<ManagerInner>,
        log_auto_release: bool,
    ) -> Self {
        Self {
            key,
            mode,
            request_id,
            value,
            released: AtomicBool::new(false),
            manager,
            log_auto_release,
        }
    }

    /// Get the resource key
    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    /// Namespace of the resource
    pub fn namespace(&self) -> &str {
        self.key.namespace()
    }

    /// Name of the resource
    pub fn name(&self) -> &str {
        self.key.name()
    }

    /// Mode this handle was granted in
    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// ID of the request this handle was granted for
    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// The shared value, type-erased
    pub fn value(&self) -> SharedValue {
        self.value.clone()
    }

    /// The shared value as a concrete type
    pub fn get<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    /// Whether `release` has already run
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Release the resource. Calling it again does nothing.
    pub fn release(&self) {
        self.do_release(false);
    }

    fn do_release(&self, dropped: bool) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }

        if dropped && self.log_auto_release {
            warn!(
                resource = %self.key,
                request = %self.request_id,
                "Resource handle dropped without release, releasing automatically"
            );
        }

        if let Some(manager) = self.manager.upgrade() {
            manager.release_grant(&self.key, self.request_id);
        }
    }
}

impl Drop for ResourceHandle {
    fn drop(&mut self) {
        self.do_release(true);
    }
}

impl fmt::Debug for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceHandle")
            .field("key", &self.key)
            .field("mode", &self.mode)
            .field("request_id", &self.request_id)
            .field("released", &self.is_released())
            .finish()
    }
}

impl fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Resource[{}:{}]", self.key, self.mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn detached_handle() -> ResourceHandle {
        ResourceHandle::new(
            ResourceKey::new("storage", "sd-1").unwrap(),
            LockMode::Shared,
            Uuid::new_v4(),
            Arc::new(String::from("payload")),
            Weak::new(),
            false,
        )
    }

    #[test]
    fn test_handle_accessors() {
        let handle = detached_handle();
        assert_eq!(handle.namespace(), "storage");
        assert_eq!(handle.name(), "sd-1");
        assert_eq!(handle.mode(), LockMode::Shared);
        assert_eq!(handle.get::<String>().map(String::as_str), Some("payload"));
        assert!(handle.get::<u32>().is_none());
    }

    #[test]
    fn test_release_is_idempotent() {
        let handle = detached_handle();
        assert!(!handle.is_released());
        handle.release();
        assert!(handle.is_released());
        handle.release();
        assert!(handle.is_released());
    }

    #[test]
    fn test_handle_display() {
        let handle = detached_handle();
        assert_eq!(handle.to_string(), "Resource[storage.sd-1:shared]");
    }
}
