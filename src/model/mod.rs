//! Topology data model.
//!
//! - `NodeType` / `NodeRecord`: nodes of the discovery tree
//! - `Target`: one connectable JVM, always wrapped by a leaf node
//! - `PluginRecord`: registration of a discovery source owning a realm
//! - `KeyValue`: transport form of label and annotation maps

mod key_value;
mod node;
mod plugin;
mod target;

pub use key_value::{DuplicateKey, KeyValue};
pub use node::{NodeId, NodeRecord, NodeType, UnknownNodeType};
pub use plugin::{Credential, PluginRecord};
pub use target::{jmx_service_url, Annotations, AnnotationsDto, Target, TargetDto};

use std::collections::BTreeMap;

/// Unordered string-to-string map. Backed by a `BTreeMap` so comparisons
/// and serialized forms are deterministic.
pub type Labels = BTreeMap<String, String>;

/// Well-known realm names of the first-party backends.
pub mod realms {
    pub const JDP: &str = "JDP";
    pub const PODMAN: &str = "Podman";
    pub const DOCKER: &str = "Docker";
    pub const KUBERNETES: &str = "KubernetesApi";
    pub const CUSTOM: &str = "Custom Targets";
}

/// Keys of the engine-assigned (`cryostat`) annotation tier.
pub mod annotation_keys {
    pub const REALM: &str = "REALM";
    pub const HOST: &str = "HOST";
    pub const PORT: &str = "PORT";
    pub const NAMESPACE: &str = "NAMESPACE";
    pub const POD_NAME: &str = "POD_NAME";
    pub const CONTAINER_NAME: &str = "CONTAINER_NAME";
    pub const JAVA_MAIN: &str = "JAVA_MAIN";
    pub const PID: &str = "PID";
    pub const START_TIME: &str = "START_TIME";
}
