pub mod agent;
pub mod config;
pub mod dataplane;
pub mod error;
pub mod gateway;
pub mod hops;
pub mod http;
pub mod kernel;
pub mod manager;
pub mod metrics;
pub mod node;
pub mod readiness;
pub mod table;
pub mod tracker;
pub mod update;

#[cfg(test)]
pub(crate) mod fake;

pub use error::{Error, Result};
