//! JVM discovery engine.
//!
//! Maintains one tree of discovered JVM targets across several discovery
//! sources: JDP multicast, container engines, the Kubernetes API, manually
//! registered targets and external plugins. Each source observes its
//! environment per scope and the tree is reconciled against what it saw.

pub mod bus;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod handlers;
pub mod model;
pub mod plugins;
pub mod storage;
pub mod topology;
pub mod utils;

pub use error::{DiscoveryError, Result};
