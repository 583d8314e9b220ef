pub mod action;
pub mod attribute;
pub mod automation;
pub mod cluster;
pub mod collaborators;
pub mod config;
pub mod engine;
pub mod error;
pub mod node;
mod pool;
pub mod scheduler;
pub mod store;
pub mod strategy;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use error::{Result, WardError};
