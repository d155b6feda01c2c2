//! Resource factories and the instances they produce
//!
//! Each namespace owner supplies a [`ResourceFactory`]. The manager asks it
//! for a [`ResourceInstance`] whenever a request is granted and no instance
//! in the right mode is live. The instance keeps its lifecycle hooks
//! (`switch_lock_mode`, `close`) to itself; holders only ever see the value
//! it exposes through [`ResourceInstance::value`].

use super::types::LockMode;
use anyhow::anyhow;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// The object shared with every holder of a granted resource
pub type SharedValue = Arc<dyn Any + Send + Sync>;

/// Creates resource instances for one namespace
pub trait ResourceFactory: Send + Sync {
    /// Whether `name` exists in this namespace. Checked before a request is queued.
    fn resource_exists(&self, _name: &str) -> bool {
        true
    }

    /// Produce a live instance of `name` for holders in `mode`
    fn create_resource(&self, name: &str, mode: LockMode) -> anyhow::Result<Box<dyn ResourceInstance>>;
}

/// A live, factory-created resource owned by the manager
pub trait ResourceInstance: Send {
    /// The value handed out to holders.
    ///
    /// Called after every creation and every successful switch, so a switch
    /// may replace the value rather than mutate it.
    fn value(&self) -> SharedValue;

    /// Turn this instance into one suitable for `mode` without recreating it.
    ///
    /// Only called while nobody holds the resource. An error makes the
    /// manager close this instance and ask the factory for a new one.
    fn switch_lock_mode(&mut self, mode: LockMode) -> anyhow::Result<()> {
        Err(anyhow!("switching to {} mode is not supported", mode))
    }

    /// Called once when the manager discards the instance. Failures are logged.
    fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Marker value for namespaces that only need mutual exclusion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimpleResource {
    /// Resource name
    pub name: String,
    /// Mode the resource was last prepared for
    pub mode: LockMode,
}

struct SimpleInstance {
    value: Arc<SimpleResource>,
}

impl ResourceInstance for SimpleInstance {
    fn value(&self) -> SharedValue {
        self.value.clone()
    }

    fn switch_lock_mode(&mut self, mode: LockMode) -> anyhow::Result<()> {
        self.value = Arc::new(SimpleResource {
            name: self.value.name.clone(),
            mode,
        });
        Ok(())
    }
}

/// Factory whose resources always exist and carry no state
#[derive(Debug, Default, Clone, Copy)]
pub struct SimpleResourceFactory;

impl ResourceFactory for SimpleResourceFactory {
    fn create_resource(&self, name: &str, mode: LockMode) -> anyhow::Result<Box<dyn ResourceInstance>> {
        Ok(Box::new(SimpleInstance {
            value: Arc::new(SimpleResource {
                name: name.to_string(),
                mode,
            }),
        }))
    }
}

/// Run user-supplied code, turning a panic into an error
pub(crate) fn call_guarded<T>(f: impl FnOnce() -> anyhow::Result<T>) -> anyhow::Result<T> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(anyhow!("panicked: {}", panic_message(payload.as_ref()))),
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_factory_switches_in_place() {
        let mut instance = SimpleResourceFactory
            .create_resource("vm-1", LockMode::Exclusive)
            .unwrap();
        let value = instance.value();
        let resource = value.downcast_ref::<SimpleResource>().unwrap();
        assert_eq!(resource.name, "vm-1");
        assert_eq!(resource.mode, LockMode::Exclusive);

        instance.switch_lock_mode(LockMode::Shared).unwrap();
        let switched = instance.value();
        assert_eq!(
            switched.downcast_ref::<SimpleResource>().unwrap().mode,
            LockMode::Shared
        );
        assert!(SimpleResourceFactory.resource_exists("anything"));
    }

    #[test]
    fn test_call_guarded_catches_panics() {
        let ok = call_guarded(|| Ok(7));
        assert_eq!(ok.unwrap(), 7);

        let failed: anyhow::Result<()> = call_guarded(|| Err(anyhow!("boom")));
        assert_eq!(failed.unwrap_err().to_string(), "boom");

        let panicked: anyhow::Result<()> = call_guarded(|| panic!("factory exploded"));
        assert!(panicked.unwrap_err().to_string().contains("factory exploded"));
    }
}
