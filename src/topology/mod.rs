//! The discovery tree.
//!
//! `Topology` is the one shared mutable resource of the engine. Mutations go
//! through a `TopologyTx`, which wraps a store transaction and records the
//! FOUND / MODIFIED / LOST events caused by the mutations. Events are
//! published only after the transaction commits; a dropped transaction
//! publishes nothing.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use crate::bus::{DiscoveryEvent, EventBus, EventKind};
use crate::connection::{resolve_with_timeout, JvmIdResolver, NoopJvmIdResolver};
use crate::error::{DiscoveryError, Result};
use crate::model::{KeyValue, Labels, NodeId, NodeRecord, NodeType, Target, TargetDto};
use crate::storage::{TopologyStore, TopologyTxn};

pub mod chain;
pub mod reconcile;

pub use chain::{ChainForest, ChainResolver, DraftId, DraftNode, OwnedObject, OwnerLookup, OwnerRef};
pub use reconcile::{reconcile, ReconcileOutcome};

/// Name of the root node.
pub const UNIVERSE: &str = "Universe";

/// Unit of serialized reconciliation: a whole realm, or one namespace of a
/// realm.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Scope {
    pub realm: String,
    pub namespace: Option<String>,
}

impl Scope {
    pub fn realm(realm: impl Into<String>) -> Self {
        Self {
            realm: realm.into(),
            namespace: None,
        }
    }

    pub fn namespace(realm: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            realm: realm.into(),
            namespace: Some(namespace.into()),
        }
    }

    /// Key used to serialize work on this scope.
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", self.realm, ns),
            None => f.write_str(&self.realm),
        }
    }
}

/// Handle to the discovery tree, shared by every backend.
#[derive(Clone)]
pub struct Topology {
    store: Arc<dyn TopologyStore>,
    bus: EventBus,
    resolver: Arc<dyn JvmIdResolver>,
    jvm_id_timeout: Duration,
}

impl Topology {
    pub fn new(store: Arc<dyn TopologyStore>, bus: EventBus) -> Self {
        Self {
            store,
            bus,
            resolver: Arc::new(NoopJvmIdResolver),
            jvm_id_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn JvmIdResolver>, timeout: Duration) -> Self {
        self.resolver = resolver;
        self.jvm_id_timeout = timeout;
        self
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn resolver(&self) -> &Arc<dyn JvmIdResolver> {
        &self.resolver
    }

    pub async fn begin(&self) -> Result<TopologyTx> {
        Ok(TopologyTx {
            txn: self.store.begin().await?,
            events: Vec::new(),
        })
    }

    /// Commit and then publish the events the transaction recorded.
    pub async fn commit(&self, tx: TopologyTx) -> Result<Vec<DiscoveryEvent>> {
        let TopologyTx { txn, events } = tx;
        txn.commit().await?;
        for event in &events {
            self.bus.publish(event.clone());
        }
        Ok(events)
    }

    /// Create the Universe node if it does not exist yet.
    pub async fn init(&self) -> Result<NodeRecord> {
        let mut tx = self.begin().await?;
        let universe = tx.universe().await?;
        self.commit(tx).await?;
        Ok(universe)
    }

    /// Resolve JVM ids for targets that have none, and store the ones found.
    /// Best-effort: failures are logged and skipped.
    pub async fn backfill_jvm_ids(&self, realm: &str, targets: &[Target]) -> Vec<Target> {
        let mut resolved = Vec::new();
        for target in targets.iter().filter(|t| t.jvm_id.is_none()) {
            let Some(jvm_id) =
                resolve_with_timeout(self.resolver.as_ref(), target, self.jvm_id_timeout).await
            else {
                continue;
            };
            match self.store_jvm_id(realm, target, jvm_id).await {
                Ok(Some(updated)) => resolved.push(updated),
                Ok(None) => {}
                Err(e) => warn!(
                    realm = %realm,
                    target = %target.connect_url,
                    error = %e,
                    "failed to store jvm id"
                ),
            }
        }
        resolved
    }

    async fn store_jvm_id(
        &self,
        realm: &str,
        target: &Target,
        jvm_id: String,
    ) -> Result<Option<Target>> {
        let mut tx = self.begin().await?;
        let Some(node) = tx.txn().node_by_url(&target.connect_url).await? else {
            return Ok(None);
        };
        let Some(mut current) = node.target.clone() else {
            return Ok(None);
        };
        current.jvm_id = Some(jvm_id);
        tx.update_target(&node, current.clone(), realm).await?;
        self.commit(tx).await?;
        debug!(realm = %realm, target = %current.connect_url, "jvm id resolved");
        Ok(Some(current))
    }

    /// Committed tree, rooted at the Universe.
    pub async fn tree(&self) -> Result<Option<TreeNode>> {
        let nodes = self.store.nodes().await?;
        Ok(TreeNode::build(nodes))
    }

    /// Every committed target with the id of its leaf node.
    pub async fn targets(&self) -> Result<Vec<(NodeId, Target)>> {
        let mut targets: Vec<(NodeId, Target)> = self
            .store
            .nodes()
            .await?
            .into_iter()
            .filter_map(|n| n.target.map(|t| (n.id, t)))
            .collect();
        targets.sort_by(|a, b| a.1.connect_url.cmp(&b.1.connect_url));
        Ok(targets)
    }

    pub async fn plugin_records(&self) -> Result<Vec<crate::model::PluginRecord>> {
        Ok(self.store.plugin_records().await?)
    }
}

/// A store transaction plus the events its mutations produced.
pub struct TopologyTx {
    txn: Box<dyn TopologyTxn>,
    events: Vec<DiscoveryEvent>,
}

impl TopologyTx {
    /// The underlying store transaction, for reads and for mutations that
    /// produce no events.
    pub fn txn(&mut self) -> &mut dyn TopologyTxn {
        self.txn.as_mut()
    }

    pub fn events(&self) -> &[DiscoveryEvent] {
        &self.events
    }

    /// The singleton root, created on first access.
    pub async fn universe(&mut self) -> Result<NodeRecord> {
        if let Some(root) = self.txn.root().await? {
            return Ok(root);
        }
        let root = NodeRecord::environment(None, UNIVERSE, NodeType::Universe, Labels::new());
        self.txn.insert_node(&root).await?;
        Ok(root)
    }

    /// First child of the Universe with this name.
    pub async fn realm(&mut self, name: &str) -> Result<Option<NodeRecord>> {
        let universe = self.universe().await?;
        Ok(self
            .txn
            .find_child(universe.id, name, NodeType::Realm)
            .await?)
    }

    pub async fn ensure_realm(&mut self, name: &str) -> Result<NodeRecord> {
        if let Some(realm) = self.realm(name).await? {
            return Ok(realm);
        }
        let universe = self.universe().await?;
        self.attach_environment(universe.id, name, NodeType::Realm, Labels::new())
            .await
    }

    /// First child of `parent` matching `predicate`.
    pub async fn child(
        &mut self,
        parent: NodeId,
        predicate: impl Fn(&NodeRecord) -> bool + Send,
    ) -> Result<Option<NodeRecord>> {
        Ok(self
            .txn
            .children(parent)
            .await?
            .into_iter()
            .find(|n| predicate(n)))
    }

    /// Create and persist a non-leaf node under `parent`.
    pub async fn attach_environment(
        &mut self,
        parent: NodeId,
        name: &str,
        node_type: NodeType,
        labels: Labels,
    ) -> Result<NodeRecord> {
        if node_type.is_leaf() {
            return Err(DiscoveryError::InvalidArgument(format!(
                "{} nodes must wrap a target",
                node_type
            )));
        }
        let node = NodeRecord::environment(Some(parent), name, node_type, labels);
        self.txn.insert_node(&node).await?;
        Ok(node)
    }

    /// Create and persist a leaf node wrapping `target`, recording FOUND.
    pub async fn attach_target(
        &mut self,
        parent: NodeId,
        target: Target,
        node_type: NodeType,
        realm: &str,
    ) -> Result<NodeRecord> {
        if target.alias.trim().is_empty() {
            return Err(DiscoveryError::InvalidArgument(format!(
                "target {} has a blank alias",
                target.connect_url
            )));
        }
        if !node_type.is_leaf() {
            return Err(DiscoveryError::InvalidArgument(format!(
                "{} is not a leaf node type",
                node_type
            )));
        }
        let node = NodeRecord::for_target(parent, target.clone(), node_type);
        self.txn.insert_node(&node).await?;
        self.record(EventKind::Found, realm, node.id, target);
        Ok(node)
    }

    /// Replace a leaf's target, recording MODIFIED.
    pub async fn update_target(
        &mut self,
        node: &NodeRecord,
        target: Target,
        realm: &str,
    ) -> Result<()> {
        self.txn.update_target(node.id, &target).await?;
        self.record(EventKind::Modified, realm, node.id, target);
        Ok(())
    }

    /// Delete a leaf node, recording LOST.
    pub async fn detach_target(&mut self, node: &NodeRecord, realm: &str) -> Result<()> {
        self.txn.delete_node(node.id).await?;
        if let Some(target) = &node.target {
            self.record(EventKind::Lost, realm, node.id, target.clone());
        }
        Ok(())
    }

    /// Delete a node and its subtree, recording LOST for every target in it.
    pub async fn delete_subtree(&mut self, id: NodeId, realm: &str) -> Result<()> {
        let leaves = self.txn.targets_under(id).await?;
        self.txn.delete_node(id).await?;
        for leaf in leaves {
            if let Some(target) = leaf.target {
                self.record(EventKind::Lost, realm, leaf.id, target);
            }
        }
        Ok(())
    }

    /// Delete `start` and then each ancestor left childless, stopping at
    /// `stop`, at a structural node, or at the first node that still has
    /// children.
    pub async fn prune(&mut self, start: Option<NodeId>, stop: NodeId) -> Result<usize> {
        let mut pruned = 0;
        let mut current = start;
        while let Some(id) = current {
            if id == stop {
                break;
            }
            let Some(node) = self.txn.node(id).await? else {
                break;
            };
            if node.node_type.is_structural() || !self.txn.children(id).await?.is_empty() {
                break;
            }
            self.txn.delete_node(id).await?;
            pruned += 1;
            current = node.parent;
        }
        Ok(pruned)
    }

    fn record(&mut self, kind: EventKind, realm: &str, node_id: NodeId, target: Target) {
        self.events.push(DiscoveryEvent {
            kind,
            realm: realm.to_string(),
            node_id,
            target,
        });
    }
}

/// Read-only view of a committed node and its descendants.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeNode {
    pub id: NodeId,
    pub name: String,
    pub node_type: NodeType,
    pub labels: Vec<KeyValue>,
    /// `None` for leaves, which can never have children.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<TreeNode>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<TargetDto>,
}

impl TreeNode {
    fn build(nodes: Vec<NodeRecord>) -> Option<TreeNode> {
        let mut by_parent: HashMap<Option<NodeId>, Vec<NodeRecord>> = HashMap::new();
        for node in nodes {
            by_parent.entry(node.parent).or_default().push(node);
        }
        let root = by_parent
            .remove(&None)?
            .into_iter()
            .find(|n| n.node_type == NodeType::Universe)?;
        Some(Self::assemble(root, &mut by_parent))
    }

    fn assemble(node: NodeRecord, by_parent: &mut HashMap<Option<NodeId>, Vec<NodeRecord>>) -> TreeNode {
        let children = if node.leaf {
            None
        } else {
            let mut kids = by_parent.remove(&Some(node.id)).unwrap_or_default();
            kids.sort_by(|a, b| (a.node_type.as_str(), &a.name).cmp(&(b.node_type.as_str(), &b.name)));
            Some(
                kids.into_iter()
                    .map(|k| Self::assemble(k, by_parent))
                    .collect(),
            )
        };
        TreeNode {
            id: node.id,
            name: node.name,
            node_type: node.node_type,
            labels: KeyValue::from_map(&node.labels),
            children,
            target: node.target.as_ref().map(TargetDto::from),
        }
    }

    /// Depth-first search by name and type.
    pub fn find(&self, name: &str, node_type: NodeType) -> Option<&TreeNode> {
        if self.name == name && self.node_type == node_type {
            return Some(self);
        }
        self.children
            .iter()
            .flatten()
            .find_map(|c| c.find(name, node_type))
    }

    pub fn child_count(&self) -> usize {
        self.children.as_ref().map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryTopologyStore;

    fn topology() -> Topology {
        Topology::new(Arc::new(MemoryTopologyStore::new()), EventBus::new())
    }

    #[tokio::test]
    async fn test_universe_is_created_once() {
        let topology = topology();
        let first = topology.init().await.unwrap();
        let second = topology.init().await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.node_type, NodeType::Universe);
    }

    #[tokio::test]
    async fn test_events_published_only_after_commit() {
        let topology = topology();
        let mut rx = topology.bus().receiver();

        let mut tx = topology.begin().await.unwrap();
        let realm = tx.ensure_realm("JDP").await.unwrap();
        tx.attach_target(realm.id, Target::new("u1", "a"), NodeType::Jvm, "JDP")
            .await
            .unwrap();
        assert_eq!(tx.events().len(), 1);
        assert!(rx.try_recv().is_err());

        topology.commit(tx).await.unwrap();
        let event = rx.try_recv().unwrap();
        assert_eq!(event.kind, EventKind::Found);
        assert_eq!(event.realm, "JDP");
    }

    #[tokio::test]
    async fn test_dropped_transaction_publishes_nothing() {
        let topology = topology();
        let mut rx = topology.bus().receiver();
        {
            let mut tx = topology.begin().await.unwrap();
            let realm = tx.ensure_realm("JDP").await.unwrap();
            tx.attach_target(realm.id, Target::new("u1", "a"), NodeType::Jvm, "JDP")
                .await
                .unwrap();
        }
        assert!(rx.try_recv().is_err());
        assert!(topology.tree().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_blank_alias_rejected() {
        let topology = topology();
        let mut tx = topology.begin().await.unwrap();
        let realm = tx.ensure_realm("JDP").await.unwrap();
        let result = tx
            .attach_target(realm.id, Target::new("u1", "  "), NodeType::Jvm, "JDP")
            .await;
        assert!(matches!(result, Err(DiscoveryError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_prune_stops_at_structural_node() {
        let topology = topology();
        let mut tx = topology.begin().await.unwrap();
        let realm = tx.ensure_realm("KubernetesApi").await.unwrap();
        let ns = tx
            .attach_environment(realm.id, "ns1", NodeType::Namespace, Labels::new())
            .await
            .unwrap();
        let deploy = tx
            .attach_environment(ns.id, "web", NodeType::Deployment, Labels::new())
            .await
            .unwrap();
        let pod = tx
            .attach_environment(deploy.id, "web-1", NodeType::Pod, Labels::new())
            .await
            .unwrap();

        let pruned = tx.prune(Some(pod.id), realm.id).await.unwrap();
        assert_eq!(pruned, 2);
        assert!(tx.txn().node(ns.id).await.unwrap().is_some());
        assert!(tx.txn().node(deploy.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_subtree_records_lost_for_each_target() {
        let topology = topology();
        let mut tx = topology.begin().await.unwrap();
        let realm = tx.ensure_realm("p").await.unwrap();
        let env = tx
            .attach_environment(realm.id, "env", NodeType::Environment, Labels::new())
            .await
            .unwrap();
        tx.attach_target(env.id, Target::new("u1", "a"), NodeType::Agent, "p")
            .await
            .unwrap();
        tx.attach_target(env.id, Target::new("u2", "b"), NodeType::Agent, "p")
            .await
            .unwrap();
        topology.commit(tx).await.unwrap();

        let mut tx = topology.begin().await.unwrap();
        tx.delete_subtree(realm.id, "p").await.unwrap();
        let events = topology.commit(tx).await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.kind == EventKind::Lost));
    }

    #[tokio::test]
    async fn test_tree_marks_leaves() {
        let topology = topology();
        let mut tx = topology.begin().await.unwrap();
        let realm = tx.ensure_realm("JDP").await.unwrap();
        tx.attach_target(realm.id, Target::new("u1", "a"), NodeType::Jvm, "JDP")
            .await
            .unwrap();
        topology.commit(tx).await.unwrap();

        let tree = topology.tree().await.unwrap().unwrap();
        let realm = tree.find("JDP", NodeType::Realm).unwrap();
        assert_eq!(realm.child_count(), 1);
        let leaf = tree.find("a", NodeType::Jvm).unwrap();
        assert!(leaf.children.is_none());
        assert_eq!(leaf.target.as_ref().unwrap().connect_url, "u1");
    }

    #[test]
    fn test_scope_key() {
        assert_eq!(Scope::realm("JDP").key(), "JDP");
        assert_eq!(Scope::namespace("KubernetesApi", "ns1").key(), "KubernetesApi/ns1");
    }
}
