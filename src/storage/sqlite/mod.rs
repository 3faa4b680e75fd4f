//! SQLite implementation of the topology store.

mod schema;
mod topology_store;

pub use topology_store::SqliteTopologyStore;
