//! Namespaced resource locking
//!
//! This module serializes access to named host resources (storage
//! domains, VMs, images) between the threads of the agent. Each resource
//! can be held by any number of shared holders or by a single exclusive
//! holder, and requests are served in arrival order.
//!
//! # Architecture
//!
//! - **Factories**: each namespace registers a `ResourceFactory` that
//!   creates the instance holders share, and may switch it between modes
//! - **Manager**: `ResourceManager` owns the namespace registry and one
//!   lock entry per resource in use
//! - **Requests**: `RequestHandle` lets an asynchronous caller wait for or
//!   cancel a queued request
//! - **Handles**: `ResourceHandle` is an RAII grant, released on drop
//! - **Owners**: `ResourceOwner` acquires several resources for one task
//!
//! # Example
//!
//! ```ignore
//! use hostagent_core::domain::resource::{LockMode, ResourceManager, SimpleResourceFactory};
//!
//! let manager = ResourceManager::with_defaults();
//! manager.register_namespace("storage", Arc::new(SimpleResourceFactory), false)?;
//!
//! let handle = manager.acquire_resource("storage", "sd-1", LockMode::Exclusive, Some(Duration::from_secs(5)))?;
//!
//! // Work with the storage domain...
//!
//! // Resource is released when the handle is dropped
//! ```

pub(crate) mod entry;
pub mod factory;
pub mod handle;
pub mod manager;
pub mod owner;
pub mod request;
pub mod types;

// Re-export main types
pub use factory::{ResourceFactory, ResourceInstance, SharedValue, SimpleResource, SimpleResourceFactory};
pub use handle::ResourceHandle;
pub use manager::ResourceManager;
pub use owner::ResourceOwner;
pub use request::{RequestCallback, RequestHandle};
pub use types::{
    KEY_SEPARATOR, LockMode, RequestInfo, RequestState, ResourceConfig, ResourceError,
    ResourceInfo, ResourceKey, ResourceResult, ResourceStatus, parse_timeout, timeout_from_secs,
    validate_name,
};
