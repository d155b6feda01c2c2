//! Resource owners
//!
//! A [`ResourceOwner`] holds the resources one task works with. It refuses
//! to take the same resource twice, acquires batches in key order so that
//! tasks sharing resources always lock them in the same sequence, and
//! releases everything it still holds when dropped.

use super::handle::ResourceHandle;
use super::manager::ResourceManager;
use super::types::{LockMode, ResourceError, ResourceKey, ResourceResult};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tracing::debug;

/// Holder of the resources acquired by one task
#[derive(Debug)]
pub struct ResourceOwner {
    manager: ResourceManager,
    /// Description of the owner, for logs
    description: String,
    held: BTreeMap<ResourceKey, ResourceHandle>,
}

impl ResourceOwner {
    /// Create an owner acquiring through `manager`
    pub fn new(manager: ResourceManager, description: impl Into<String>) -> Self {
        Self {
            manager,
            description: description.into(),
            held: BTreeMap::new(),
        }
    }

    /// Get the owner description
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Acquire one resource, blocking up to `timeout`
    pub fn acquire(
        &mut self,
        namespace: &str,
        name: &str,
        mode: LockMode,
        timeout: Option<Duration>,
    ) -> ResourceResult<&ResourceHandle> {
        let key = ResourceKey::new(namespace, name)?;
        if self.held.contains_key(&key) {
            return Err(ResourceError::AlreadyOwned(key.to_string()));
        }

        let handle = self.manager.acquire_resource(namespace, name, mode, timeout)?;
        debug!(owner = %self.description, resource = %key, mode = %mode, "Resource owned");
        Ok(self.held.entry(key).or_insert(handle))
    }

    /// Acquire several resources, all or nothing.
    ///
    /// Resources are taken in key order, whatever order they are listed in.
    /// If any acquisition fails, the ones taken by this call are released.
    pub fn acquire_all(
        &mut self,
        resources: &[(&str, &str, LockMode)],
        timeout: Option<Duration>,
    ) -> ResourceResult<()> {
        let mut wanted: BTreeMap<ResourceKey, LockMode> = BTreeMap::new();
        for (namespace, name, mode) in resources {
            let key = ResourceKey::new(namespace, name)?;
            if self.held.contains_key(&key) || wanted.insert(key.clone(), *mode).is_some() {
                return Err(ResourceError::AlreadyOwned(key.to_string()));
            }
        }

        let mut acquired = Vec::with_capacity(wanted.len());
        for (key, mode) in wanted {
            // On error the handles in `acquired` drop and release themselves
            let handle = self
                .manager
                .acquire_resource(key.namespace(), key.name(), mode, timeout)?;
            acquired.push((key, handle));
        }

        for (key, handle) in acquired {
            debug!(owner = %self.description, resource = %key, mode = %handle.mode(), "Resource owned");
            self.held.insert(key, handle);
        }
        Ok(())
    }

    /// Release one owned resource
    pub fn release(&mut self, namespace: &str, name: &str) -> ResourceResult<()> {
        let key = ResourceKey::new(namespace, name)?;
        let handle = self
            .held
            .remove(&key)
            .ok_or_else(|| ResourceError::NotLocked(key.to_string()))?;
        handle.release();
        debug!(owner = %self.description, resource = %key, "Resource disowned");
        Ok(())
    }

    /// Release every owned resource, in reverse key order
    pub fn release_all(&mut self) {
        while let Some((key, handle)) = self.held.pop_last() {
            handle.release();
            debug!(owner = %self.description, resource = %key, "Resource disowned");
        }
    }

    /// Handle of an owned resource
    pub fn get(&self, namespace: &str, name: &str) -> Option<&ResourceHandle> {
        let key = ResourceKey::new(namespace, name).ok()?;
        self.held.get(&key)
    }

    /// Owned resources and their modes, in key order
    pub fn owned(&self) -> Vec<(ResourceKey, LockMode)> {
        self.held
            .iter()
            .map(|(key, handle)| (key.clone(), handle.mode()))
            .collect()
    }

    /// Get the number of owned resources
    pub fn len(&self) -> usize {
        self.held.len()
    }

    /// Check if nothing is owned
    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

impl Drop for ResourceOwner {
    fn drop(&mut self) {
        self.release_all();
    }
}

impl fmt::Display for ResourceOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Owner[{}: ", self.description)?;
        for (i, handle) in self.held.values().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", handle)?;
        }
        write!(f, "]")
    }
}
