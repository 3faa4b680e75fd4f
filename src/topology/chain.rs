//! In-memory ownership chains.
//!
//! Observation builds a `ChainForest` without touching the store: every
//! observed target becomes a draft leaf, and the environment's ownership
//! metadata hangs it under draft ancestors. Draft roots (nodes without a
//! parent) are attached under the reconciled scope node when the forest is
//! persisted.

use std::collections::HashMap;

use async_trait::async_trait;
use tracing::debug;

use crate::discovery::BackendError;
use crate::model::{Labels, NodeType, Target};

/// Label placed on the top of a chain whose owner vanished between
/// observation and lookup.
pub const NAMESPACE_LABEL: &str = "discovery.cryostat.io/namespace";

/// Index of a node within its forest.
pub type DraftId = usize;

#[derive(Debug, Clone, PartialEq)]
pub struct DraftNode {
    pub name: String,
    pub node_type: NodeType,
    pub labels: Labels,
    pub parent: Option<DraftId>,
    pub target: Option<Target>,
}

/// Arena of draft nodes.
#[derive(Debug, Clone, Default)]
pub struct ChainForest {
    nodes: Vec<DraftNode>,
    siblings: HashMap<(Option<DraftId>, NodeType, String), DraftId>,
}

impl ChainForest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: DraftId) -> &DraftNode {
        &self.nodes[id]
    }

    /// Non-leaf node under `parent`. An existing sibling with the same name
    /// and type is returned instead of creating a second one.
    pub fn environment(
        &mut self,
        parent: Option<DraftId>,
        name: impl Into<String>,
        node_type: NodeType,
        labels: Labels,
    ) -> DraftId {
        let name = name.into();
        let key = (parent, node_type, name.clone());
        if let Some(&existing) = self.siblings.get(&key) {
            return existing;
        }
        let id = self.push(DraftNode {
            name,
            node_type,
            labels,
            parent,
            target: None,
        });
        self.siblings.insert(key, id);
        id
    }

    /// Leaf wrapping `target` under `parent`.
    pub fn target(&mut self, parent: Option<DraftId>, target: Target, node_type: NodeType) -> DraftId {
        self.push(DraftNode {
            name: target.alias.clone(),
            node_type,
            labels: target.labels.clone(),
            parent,
            target: Some(target),
        })
    }

    fn push(&mut self, node: DraftNode) -> DraftId {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    /// Re-parent a node that currently has no parent.
    pub fn set_parent(&mut self, child: DraftId, parent: DraftId) {
        debug_assert!(child != parent);
        let node = &mut self.nodes[child];
        let previous = node.parent.replace(parent);
        if node.target.is_some() {
            return;
        }
        let old_key = (previous, node.node_type, node.name.clone());
        let new_key = (Some(parent), node.node_type, node.name.clone());
        if self.siblings.get(&old_key) == Some(&child) {
            self.siblings.remove(&old_key);
        }
        self.siblings.entry(new_key).or_insert(child);
    }

    /// Add a label. On leaves the target's labels follow.
    pub fn label(&mut self, id: DraftId, key: &str, value: &str) {
        let node = &mut self.nodes[id];
        node.labels.insert(key.to_string(), value.to_string());
        if let Some(target) = node.target.as_mut() {
            target.labels.insert(key.to_string(), value.to_string());
        }
    }

    /// Topmost ancestor of `id` (itself when it has no parent).
    pub fn root_of(&self, mut id: DraftId) -> DraftId {
        while let Some(parent) = self.nodes[id].parent {
            id = parent;
        }
        id
    }

    /// Ancestors of `id`, from the forest root down to its direct parent.
    pub fn ancestors(&self, id: DraftId) -> Vec<DraftId> {
        let mut out = Vec::new();
        let mut current = self.nodes[id].parent;
        while let Some(p) = current {
            out.push(p);
            current = self.nodes[p].parent;
        }
        out.reverse();
        out
    }

    /// Leaves in insertion order.
    pub fn leaves(&self) -> impl Iterator<Item = (DraftId, &Target)> {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(id, n)| n.target.as_ref().map(|t| (id, t)))
    }
}

/// Owner reference as found in object metadata.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OwnerRef {
    pub kind: String,
    pub name: String,
}

impl OwnerRef {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
        }
    }
}

/// Metadata of an owning object.
#[derive(Debug, Clone, PartialEq)]
pub struct OwnedObject {
    pub kind: String,
    pub name: String,
    pub labels: Labels,
    /// The object's own owner, if any.
    pub owner: Option<OwnerRef>,
}

/// Environment query for object metadata.
#[async_trait]
pub trait OwnerLookup: Send + Sync {
    /// `Ok(None)` when the object does not exist.
    async fn lookup(
        &self,
        namespace: &str,
        owner: &OwnerRef,
    ) -> Result<Option<OwnedObject>, BackendError>;
}

/// Walks owner references upward for one namespace. Owners are memoized on
/// (kind, name) for the lifetime of the resolver, so build one per
/// observation pass.
pub struct ChainResolver<'a> {
    lookup: &'a dyn OwnerLookup,
    namespace: String,
    known: HashMap<(String, String), DraftId>,
}

impl<'a> ChainResolver<'a> {
    pub fn new(lookup: &'a dyn OwnerLookup, namespace: impl Into<String>) -> Self {
        Self {
            lookup,
            namespace: namespace.into(),
            known: HashMap::new(),
        }
    }

    /// Hang `child` under the chain of owners starting at `owner` and return
    /// the topmost node reached.
    ///
    /// The chain ends at an unsupported owner kind or at the first owner that
    /// no longer exists; in the latter case the top node is labeled with the
    /// namespace.
    pub async fn resolve(
        &mut self,
        forest: &mut ChainForest,
        child: DraftId,
        owner: Option<OwnerRef>,
    ) -> Result<DraftId, BackendError> {
        let mut current = child;
        let mut next = owner;

        while let Some(owner) = next.take() {
            let Some(node_type) = NodeType::from_kube_kind(&owner.kind) else {
                debug!(kind = %owner.kind, name = %owner.name, "unsupported owner kind ends chain");
                break;
            };

            let key = (owner.kind.clone(), owner.name.clone());
            if let Some(&known) = self.known.get(&key) {
                forest.set_parent(current, known);
                return Ok(forest.root_of(known));
            }

            match self.lookup.lookup(&self.namespace, &owner).await? {
                Some(object) => {
                    let id = forest.environment(None, object.name, node_type, object.labels);
                    self.known.insert(key, id);
                    forest.set_parent(current, id);
                    current = id;
                    next = object.owner;
                }
                None => {
                    debug!(
                        namespace = %self.namespace,
                        kind = %owner.kind,
                        name = %owner.name,
                        "owner vanished, truncating chain"
                    );
                    forest.label(current, NAMESPACE_LABEL, &self.namespace);
                    break;
                }
            }
        }
        Ok(current)
    }
}
