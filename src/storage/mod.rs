//! Persistence of the discovery tree.
//!
//! The engine only talks to `TopologyStore` / `TopologyTxn`. Every mutation
//! happens inside a transaction; dropping a transaction without calling
//! `commit` discards everything it did.
//!
//! Implementations:
//! - `MemoryTopologyStore`: copy-on-write in-process store
//! - `SqliteTopologyStore`: sqlx/sea-query backed store (feature `sqlite`)

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use crate::config::StorageConfig;
use crate::model::{NodeId, NodeRecord, NodeType, PluginRecord, Target};

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::MemoryTopologyStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteTopologyStore;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors from store operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StorageError::Conflict(db.message().to_string())
            }
            _ => StorageError::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// One unit of work against the store.
#[async_trait]
pub trait TopologyTxn: Send {
    /// The Universe node, if it has been created.
    async fn root(&mut self) -> Result<Option<NodeRecord>>;

    async fn node(&mut self, id: NodeId) -> Result<Option<NodeRecord>>;

    /// Direct children of `parent`, in insertion order.
    async fn children(&mut self, parent: NodeId) -> Result<Vec<NodeRecord>>;

    /// Insert a node. Its parent must already exist in this transaction.
    /// Fails with `Conflict` when the node wraps a target whose connect URL
    /// or alias is already taken.
    async fn insert_node(&mut self, node: &NodeRecord) -> Result<()>;

    async fn update_labels(&mut self, id: NodeId, labels: &crate::model::Labels) -> Result<()>;

    /// Replace the target carried by leaf node `id`.
    async fn update_target(&mut self, id: NodeId, target: &Target) -> Result<()>;

    /// Delete a node together with its whole subtree and their targets.
    async fn delete_node(&mut self, id: NodeId) -> Result<()>;

    /// Leaf node carrying the target with this connect URL.
    async fn node_by_url(&mut self, connect_url: &str) -> Result<Option<NodeRecord>>;

    /// Leaf node carrying the target with this alias.
    async fn node_by_alias(&mut self, alias: &str) -> Result<Option<NodeRecord>>;

    /// All leaf nodes (with targets) in the subtree rooted at `root`.
    async fn targets_under(&mut self, root: NodeId) -> Result<Vec<NodeRecord>>;

    async fn plugins(&mut self) -> Result<Vec<PluginRecord>>;

    async fn plugin(&mut self, id: Uuid) -> Result<Option<PluginRecord>>;

    async fn insert_plugin(&mut self, plugin: &PluginRecord) -> Result<()>;

    async fn delete_plugin(&mut self, id: Uuid) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;

    /// First child of `parent` with the given name and type.
    async fn find_child(
        &mut self,
        parent: NodeId,
        name: &str,
        node_type: NodeType,
    ) -> Result<Option<NodeRecord>> {
        Ok(self
            .children(parent)
            .await?
            .into_iter()
            .find(|n| n.name == name && n.node_type == node_type))
    }

    async fn plugin_by_realm(&mut self, realm_name: &str) -> Result<Option<PluginRecord>> {
        Ok(self
            .plugins()
            .await?
            .into_iter()
            .find(|p| p.realm_name == realm_name))
    }
}

/// Pluggable backing store for the discovery tree.
#[async_trait]
pub trait TopologyStore: Send + Sync + 'static {
    /// Create tables and indexes if they don't exist.
    async fn init_schema(&self) -> Result<()>;

    /// Start a transaction.
    async fn begin(&self) -> Result<Box<dyn TopologyTxn>>;

    /// All committed nodes. Never blocks behind an open transaction for
    /// longer than a single read.
    async fn nodes(&self) -> Result<Vec<NodeRecord>>;

    /// All committed plugin records.
    async fn plugin_records(&self) -> Result<Vec<PluginRecord>>;
}

/// Initialize the store selected by configuration.
pub async fn init_store(
    config: &StorageConfig,
) -> std::result::Result<Arc<dyn TopologyStore>, Box<dyn std::error::Error>> {
    info!(storage = %config.storage_type, path = %config.path, "initializing topology store");

    let store: Arc<dyn TopologyStore> = match config.storage_type.as_str() {
        "memory" => Arc::new(MemoryTopologyStore::new()),
        #[cfg(feature = "sqlite")]
        "sqlite" => {
            use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
            use std::time::Duration;

            if let Some(parent) = std::path::Path::new(&config.path).parent() {
                std::fs::create_dir_all(parent)?;
            }

            let opts = SqliteConnectOptions::new()
                .filename(&config.path)
                .journal_mode(SqliteJournalMode::Wal)
                .busy_timeout(Duration::from_secs(30))
                .foreign_keys(true)
                .create_if_missing(true);

            let pool = SqlitePoolOptions::new()
                .max_connections(5)
                .connect_with(opts)
                .await?;

            Arc::new(SqliteTopologyStore::new(pool))
        }
        other => {
            return Err(format!("unsupported storage type: {}", other).into());
        }
    };

    store.init_schema().await?;
    Ok(store)
}
