//! Domain layer
//!
//! Contains the core logic of the host agent.

pub mod resource;
