//! Host agent core library
//!
//! This crate provides the core functionality of the host agent:
//! - Resource manager (namespaced shared/exclusive locks with FIFO admission)
//! - Configuration with file persistence
//! - Error types with codes and suggestions

pub mod config;
pub mod domain;
pub mod error;

pub use domain::resource::{
    LockMode, RequestHandle, ResourceError, ResourceFactory, ResourceHandle, ResourceInstance,
    ResourceManager, ResourceOwner, ResourceStatus,
};
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::domain::resource::{
        LockMode, ResourceFactory, ResourceHandle, ResourceInstance, ResourceManager,
        ResourceStatus,
    };
    pub use crate::error::{Error, Result};
}
