use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Labels, Target};

/// Identity of a persisted discovery node.
pub type NodeId = Uuid;

/// Closed set of node kinds in the discovery tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeType {
    Universe,
    Realm,
    Namespace,
    StatefulSet,
    DaemonSet,
    Deployment,
    ReplicaSet,
    ReplicationController,
    Pod,
    Endpoint,
    EndpointSlice,
    Environment,
    #[serde(rename = "JVM")]
    Jvm,
    Agent,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown node type: {0}")]
pub struct UnknownNodeType(pub String);

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Universe => "Universe",
            NodeType::Realm => "Realm",
            NodeType::Namespace => "Namespace",
            NodeType::StatefulSet => "StatefulSet",
            NodeType::DaemonSet => "DaemonSet",
            NodeType::Deployment => "Deployment",
            NodeType::ReplicaSet => "ReplicaSet",
            NodeType::ReplicationController => "ReplicationController",
            NodeType::Pod => "Pod",
            NodeType::Endpoint => "Endpoint",
            NodeType::EndpointSlice => "EndpointSlice",
            NodeType::Environment => "Environment",
            NodeType::Jvm => "JVM",
            NodeType::Agent => "Agent",
        }
    }

    /// Leaf kinds wrap exactly one target and never have children.
    pub fn is_leaf(&self) -> bool {
        matches!(self, NodeType::Jvm | NodeType::Agent)
    }

    /// Structural kinds are never pruned, even when they become empty.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            NodeType::Universe | NodeType::Realm | NodeType::Namespace
        )
    }

    /// Map a cluster object kind onto the node kind used for it in the tree.
    /// Returns `None` for kinds that cannot appear in an ownership chain.
    pub fn from_kube_kind(kind: &str) -> Option<NodeType> {
        match kind {
            "Pod" => Some(NodeType::Pod),
            "ReplicaSet" => Some(NodeType::ReplicaSet),
            "Deployment" => Some(NodeType::Deployment),
            "StatefulSet" => Some(NodeType::StatefulSet),
            "DaemonSet" => Some(NodeType::DaemonSet),
            "ReplicationController" => Some(NodeType::ReplicationController),
            _ => None,
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeType {
    type Err = UnknownNodeType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let node_type = match s {
            "Universe" => NodeType::Universe,
            "Realm" => NodeType::Realm,
            "Namespace" => NodeType::Namespace,
            "StatefulSet" => NodeType::StatefulSet,
            "DaemonSet" => NodeType::DaemonSet,
            "Deployment" => NodeType::Deployment,
            "ReplicaSet" => NodeType::ReplicaSet,
            "ReplicationController" => NodeType::ReplicationController,
            "Pod" => NodeType::Pod,
            "Endpoint" => NodeType::Endpoint,
            "EndpointSlice" => NodeType::EndpointSlice,
            "Environment" => NodeType::Environment,
            "JVM" => NodeType::Jvm,
            "Agent" => NodeType::Agent,
            other => return Err(UnknownNodeType(other.to_string())),
        };
        Ok(node_type)
    }
}

/// A persisted node of the discovery tree.
///
/// Children are not stored inline; they are found through `parent`. A node
/// with `leaf == true` can never have children and carries a target.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeRecord {
    pub id: NodeId,
    pub parent: Option<NodeId>,
    pub name: String,
    pub node_type: NodeType,
    pub labels: Labels,
    pub leaf: bool,
    pub target: Option<Target>,
}

impl NodeRecord {
    /// A new non-leaf node.
    pub fn environment(
        parent: Option<NodeId>,
        name: impl Into<String>,
        node_type: NodeType,
        labels: Labels,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent,
            name: name.into(),
            node_type,
            labels,
            leaf: false,
            target: None,
        }
    }

    /// A new leaf node wrapping `target`. The node takes the target's alias
    /// as its name and its labels.
    pub fn for_target(parent: NodeId, target: Target, node_type: NodeType) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent: Some(parent),
            name: target.alias.clone(),
            node_type,
            labels: target.labels.clone(),
            leaf: true,
            target: Some(target),
        }
    }
}
