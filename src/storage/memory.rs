//! In-process topology store.
//!
//! A transaction takes the single writer lock, works on a private copy of the
//! committed state and swaps it in on commit. Readers only ever see committed
//! snapshots.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use uuid::Uuid;

use super::{Result, StorageError, TopologyStore, TopologyTxn};
use crate::model::{Labels, NodeId, NodeRecord, NodeType, PluginRecord, Target};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    nodes: HashMap<NodeId, NodeRecord>,
    children: HashMap<NodeId, Vec<NodeId>>,
    root: Option<NodeId>,
    urls: HashMap<String, NodeId>,
    aliases: HashMap<String, NodeId>,
    plugins: BTreeMap<Uuid, PluginRecord>,
}

impl MemoryState {
    fn subtree(&self, root: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            out.push(id);
            if let Some(kids) = self.children.get(&id) {
                stack.extend(kids.iter().copied());
            }
        }
        out
    }

    fn forget_target(&mut self, target: &Target) {
        self.urls.remove(&target.connect_url);
        self.aliases.remove(&target.alias);
    }
}

/// In-memory topology store.
#[derive(Default)]
pub struct MemoryTopologyStore {
    committed: Arc<RwLock<Arc<MemoryState>>>,
    writer: Arc<Mutex<()>>,
    fail_on_commit: Arc<AtomicBool>,
}

impl MemoryTopologyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent commit fail. Test hook for abort semantics.
    pub fn set_fail_on_commit(&self, fail: bool) {
        self.fail_on_commit.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl TopologyStore for MemoryTopologyStore {
    async fn init_schema(&self) -> Result<()> {
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn TopologyTxn>> {
        let guard = Arc::clone(&self.writer).lock_owned().await;
        let state = (**self.committed.read().await).clone();
        Ok(Box::new(MemoryTxn {
            state,
            committed: Arc::clone(&self.committed),
            fail_on_commit: Arc::clone(&self.fail_on_commit),
            _guard: guard,
        }))
    }

    async fn nodes(&self) -> Result<Vec<NodeRecord>> {
        let state = Arc::clone(&*self.committed.read().await);
        Ok(state.nodes.values().cloned().collect())
    }

    async fn plugin_records(&self) -> Result<Vec<PluginRecord>> {
        let state = Arc::clone(&*self.committed.read().await);
        Ok(state.plugins.values().cloned().collect())
    }
}

struct MemoryTxn {
    state: MemoryState,
    committed: Arc<RwLock<Arc<MemoryState>>>,
    fail_on_commit: Arc<AtomicBool>,
    _guard: OwnedMutexGuard<()>,
}

#[async_trait]
impl TopologyTxn for MemoryTxn {
    async fn root(&mut self) -> Result<Option<NodeRecord>> {
        Ok(self.state.root.and_then(|id| self.state.nodes.get(&id).cloned()))
    }

    async fn node(&mut self, id: NodeId) -> Result<Option<NodeRecord>> {
        Ok(self.state.nodes.get(&id).cloned())
    }

    async fn children(&mut self, parent: NodeId) -> Result<Vec<NodeRecord>> {
        Ok(self
            .state
            .children
            .get(&parent)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.state.nodes.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn insert_node(&mut self, node: &NodeRecord) -> Result<()> {
        if self.state.nodes.contains_key(&node.id) {
            return Err(StorageError::Conflict(format!("node {} exists", node.id)));
        }
        match node.parent {
            Some(parent) => {
                let parent_node = self
                    .state
                    .nodes
                    .get(&parent)
                    .ok_or_else(|| StorageError::NotFound(format!("parent node {}", parent)))?;
                if parent_node.leaf {
                    return Err(StorageError::Conflict(format!(
                        "leaf node {} cannot have children",
                        parent
                    )));
                }
            }
            None => {
                if node.node_type != NodeType::Universe || self.state.root.is_some() {
                    return Err(StorageError::Conflict(
                        "only a single Universe node may be parentless".to_string(),
                    ));
                }
            }
        }
        if let Some(target) = &node.target {
            if self.state.urls.contains_key(&target.connect_url) {
                return Err(StorageError::Conflict(format!(
                    "target {} exists",
                    target.connect_url
                )));
            }
            if self.state.aliases.contains_key(&target.alias) {
                return Err(StorageError::Conflict(format!(
                    "alias {} is taken",
                    target.alias
                )));
            }
            self.state
                .urls
                .insert(target.connect_url.clone(), node.id);
            self.state.aliases.insert(target.alias.clone(), node.id);
        }

        match node.parent {
            Some(parent) => self.state.children.entry(parent).or_default().push(node.id),
            None => self.state.root = Some(node.id),
        }
        if !node.leaf {
            self.state.children.entry(node.id).or_default();
        }
        self.state.nodes.insert(node.id, node.clone());
        Ok(())
    }

    async fn update_labels(&mut self, id: NodeId, labels: &Labels) -> Result<()> {
        let node = self
            .state
            .nodes
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(format!("node {}", id)))?;
        node.labels = labels.clone();
        Ok(())
    }

    async fn update_target(&mut self, id: NodeId, target: &Target) -> Result<()> {
        let previous = self
            .state
            .nodes
            .get(&id)
            .and_then(|n| n.target.clone())
            .ok_or_else(|| StorageError::NotFound(format!("target node {}", id)))?;

        if previous.connect_url != target.connect_url {
            return Err(StorageError::Conflict(
                "a target's connect URL cannot change".to_string(),
            ));
        }
        if previous.alias != target.alias {
            if self.state.aliases.contains_key(&target.alias) {
                return Err(StorageError::Conflict(format!(
                    "alias {} is taken",
                    target.alias
                )));
            }
            self.state.aliases.remove(&previous.alias);
            self.state.aliases.insert(target.alias.clone(), id);
        }

        if let Some(node) = self.state.nodes.get_mut(&id) {
            node.name = target.alias.clone();
            node.labels = target.labels.clone();
            node.target = Some(target.clone());
        }
        Ok(())
    }

    async fn delete_node(&mut self, id: NodeId) -> Result<()> {
        let node = self
            .state
            .nodes
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("node {}", id)))?;

        let doomed = self.state.subtree(id);
        for nid in &doomed {
            if let Some(removed) = self.state.nodes.remove(nid) {
                if let Some(target) = &removed.target {
                    self.state.forget_target(target);
                }
            }
            self.state.children.remove(nid);
        }
        self.state
            .plugins
            .retain(|_, p| !doomed.contains(&p.realm));

        match node.parent {
            Some(parent) => {
                if let Some(kids) = self.state.children.get_mut(&parent) {
                    kids.retain(|k| *k != id);
                }
            }
            None => self.state.root = None,
        }
        Ok(())
    }

    async fn node_by_url(&mut self, connect_url: &str) -> Result<Option<NodeRecord>> {
        Ok(self
            .state
            .urls
            .get(connect_url)
            .and_then(|id| self.state.nodes.get(id).cloned()))
    }

    async fn node_by_alias(&mut self, alias: &str) -> Result<Option<NodeRecord>> {
        Ok(self
            .state
            .aliases
            .get(alias)
            .and_then(|id| self.state.nodes.get(id).cloned()))
    }

    async fn targets_under(&mut self, root: NodeId) -> Result<Vec<NodeRecord>> {
        Ok(self
            .state
            .subtree(root)
            .into_iter()
            .filter_map(|id| self.state.nodes.get(&id))
            .filter(|n| n.target.is_some())
            .cloned()
            .collect())
    }

    async fn plugins(&mut self) -> Result<Vec<PluginRecord>> {
        Ok(self.state.plugins.values().cloned().collect())
    }

    async fn plugin(&mut self, id: Uuid) -> Result<Option<PluginRecord>> {
        Ok(self.state.plugins.get(&id).cloned())
    }

    async fn insert_plugin(&mut self, plugin: &PluginRecord) -> Result<()> {
        if !self.state.nodes.contains_key(&plugin.realm) {
            return Err(StorageError::NotFound(format!("realm node {}", plugin.realm)));
        }
        if self.state.plugins.contains_key(&plugin.id) {
            return Err(StorageError::Conflict(format!("plugin {} exists", plugin.id)));
        }
        self.state.plugins.insert(plugin.id, plugin.clone());
        Ok(())
    }

    async fn delete_plugin(&mut self, id: Uuid) -> Result<()> {
        self.state
            .plugins
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(format!("plugin {}", id)))
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        if self.fail_on_commit.load(Ordering::SeqCst) {
            return Err(StorageError::Database("commit failed (injected)".to_string()));
        }
        let MemoryTxn {
            state, committed, ..
        } = *self;
        *committed.write().await = Arc::new(state);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn universe() -> NodeRecord {
        NodeRecord::environment(None, "Universe", NodeType::Universe, Labels::new())
    }

    #[tokio::test]
    async fn test_uncommitted_changes_are_discarded() {
        let store = MemoryTopologyStore::new();
        {
            let mut tx = store.begin().await.unwrap();
            tx.insert_node(&universe()).await.unwrap();
        }
        assert!(store.nodes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_commit_publishes_state() {
        let store = MemoryTopologyStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.insert_node(&universe()).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.nodes().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_connect_url_conflicts() {
        let store = MemoryTopologyStore::new();
        let mut tx = store.begin().await.unwrap();
        let root = universe();
        tx.insert_node(&root).await.unwrap();

        let a = NodeRecord::for_target(root.id, Target::new("u1", "a"), NodeType::Jvm);
        let b = NodeRecord::for_target(root.id, Target::new("u1", "b"), NodeType::Jvm);
        tx.insert_node(&a).await.unwrap();
        assert!(matches!(
            tx.insert_node(&b).await,
            Err(StorageError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_leaf_cannot_have_children() {
        let store = MemoryTopologyStore::new();
        let mut tx = store.begin().await.unwrap();
        let root = universe();
        tx.insert_node(&root).await.unwrap();
        let leaf = NodeRecord::for_target(root.id, Target::new("u1", "a"), NodeType::Jvm);
        tx.insert_node(&leaf).await.unwrap();

        let child = NodeRecord::environment(Some(leaf.id), "x", NodeType::Pod, Labels::new());
        assert!(matches!(
            tx.insert_node(&child).await,
            Err(StorageError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_cascades_subtree_and_plugins() {
        let store = MemoryTopologyStore::new();
        let mut tx = store.begin().await.unwrap();
        let root = universe();
        tx.insert_node(&root).await.unwrap();
        let realm = NodeRecord::environment(Some(root.id), "r", NodeType::Realm, Labels::new());
        tx.insert_node(&realm).await.unwrap();
        let leaf = NodeRecord::for_target(realm.id, Target::new("u1", "a"), NodeType::Jvm);
        tx.insert_node(&leaf).await.unwrap();
        tx.insert_plugin(&PluginRecord::builtin(realm.id, "r"))
            .await
            .unwrap();

        tx.delete_node(realm.id).await.unwrap();

        assert!(tx.node_by_url("u1").await.unwrap().is_none());
        assert!(tx.plugins().await.unwrap().is_empty());
        assert!(tx.children(root.id).await.unwrap().is_empty());
        tx.commit().await.unwrap();
        assert_eq!(store.nodes().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_injected_commit_failure_keeps_previous_state() {
        let store = MemoryTopologyStore::new();
        store.set_fail_on_commit(true);
        let mut tx = store.begin().await.unwrap();
        tx.insert_node(&universe()).await.unwrap();
        assert!(tx.commit().await.is_err());
        assert!(store.nodes().await.unwrap().is_empty());
    }
}
