//! Storage configuration types.

use serde::Deserialize;

/// Topology store selection.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// `memory` or `sqlite`.
    #[serde(rename = "type")]
    pub storage_type: String,
    /// Database file for `sqlite`.
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_type: "sqlite".to_string(),
            path: "data/discovery.db".to_string(),
        }
    }
}

impl StorageConfig {
    pub fn memory() -> Self {
        Self {
            storage_type: "memory".to_string(),
            path: String::new(),
        }
    }
}
