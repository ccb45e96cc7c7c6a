//! Database models split into domain-specific modules.

pub mod deployment;
pub mod service;

pub use deployment::*;
pub use service::*;
