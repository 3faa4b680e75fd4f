//! Diff-and-apply of one observed scope against the persisted tree.
//!
//! Runs in a single transaction. Removals are applied before additions so a
//! target that moved never exists twice. Any error drops the transaction;
//! the scope is retried on the backend's next cycle.

use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::{debug, info, warn};

use super::{ChainForest, DraftId, Scope, Topology, TopologyTx};
use crate::error::{DiscoveryError, Result};
use crate::model::{NodeId, NodeRecord, NodeType, Target};
use crate::storage::TopologyTxn;

/// What one reconciliation changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileOutcome {
    pub added: Vec<Target>,
    pub removed: Vec<Target>,
    pub modified: Vec<Target>,
    /// Connect URLs observed here but already present elsewhere in the tree.
    pub skipped: Vec<String>,
}

impl ReconcileOutcome {
    /// True when the tree was not mutated.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }
}

type PathSignature = Vec<(String, NodeType)>;

/// Make the persisted subtree of `scope` match `forest`.
///
/// Draft roots of the forest are attached under the scope node: the
/// Namespace node for namespaced scopes, else the realm node. Both are
/// created on first use and are never pruned.
pub async fn reconcile(
    topology: &Topology,
    scope: &Scope,
    forest: &ChainForest,
) -> Result<ReconcileOutcome> {
    let mut outcome = apply(topology, scope, forest).await?;

    if !outcome.added.is_empty() {
        let resolved = topology
            .backfill_jvm_ids(&scope.realm, &outcome.added)
            .await;
        outcome.modified.extend(resolved);
    }

    if outcome.is_empty() {
        debug!(scope = %scope, "scope unchanged");
    } else {
        info!(
            scope = %scope,
            added = outcome.added.len(),
            removed = outcome.removed.len(),
            modified = outcome.modified.len(),
            "reconciled scope"
        );
    }
    Ok(outcome)
}

async fn apply(topology: &Topology, scope: &Scope, forest: &ChainForest) -> Result<ReconcileOutcome> {
    let realm_name = scope.realm.as_str();
    let mut tx = topology.begin().await?;
    let realm = tx.ensure_realm(realm_name).await?;
    let scope_node = match &scope.namespace {
        None => realm,
        Some(ns) => match tx.txn().find_child(realm.id, ns, NodeType::Namespace).await? {
            Some(node) => node,
            None => {
                tx.attach_environment(realm.id, ns, NodeType::Namespace, Default::default())
                    .await?
            }
        },
    };

    let mut observed: Vec<(DraftId, &Target)> = Vec::new();
    let mut seen = HashSet::new();
    for (id, target) in forest.leaves() {
        if !seen.insert(target.connect_url.as_str()) {
            warn!(scope = %scope, target = %target.connect_url, "duplicate observation ignored");
            continue;
        }
        observed.push((id, target));
    }

    let mut persisted: BTreeMap<String, NodeRecord> = tx
        .txn()
        .targets_under(scope_node.id)
        .await?
        .into_iter()
        .filter_map(|n| n.target.as_ref().map(|t| (t.connect_url.clone(), n.clone())))
        .collect();

    let mut removals: Vec<NodeRecord> = Vec::new();
    let mut additions: Vec<(DraftId, Target)> = Vec::new();
    let mut unchanged: Vec<(DraftId, Target, NodeRecord)> = Vec::new();

    for (id, target) in observed {
        match persisted.remove(&target.connect_url) {
            None => additions.push((id, target.clone())),
            Some(node) => {
                let same_place = forest.node(id).node_type == node.node_type
                    && Some(draft_path(forest, id))
                        == stored_path(tx.txn(), &node, scope_node.id).await?;
                if same_place {
                    unchanged.push((id, target.clone(), node));
                } else {
                    debug!(scope = %scope, target = %target.connect_url, "target moved");
                    removals.push(node);
                    additions.push((id, target.clone()));
                }
            }
        }
    }
    removals.extend(persisted.into_values());

    let mut outcome = ReconcileOutcome::default();

    for node in &removals {
        tx.detach_target(node, realm_name).await?;
        tx.prune(node.parent, scope_node.id).await?;
        if let Some(target) = &node.target {
            outcome.removed.push(target.clone());
        }
    }

    let mut placed: HashMap<DraftId, NodeId> = HashMap::new();

    for (id, target) in additions {
        if tx.txn().node_by_url(&target.connect_url).await?.is_some() {
            warn!(
                scope = %scope,
                target = %target.connect_url,
                "target already present in another location, skipping"
            );
            outcome.skipped.push(target.connect_url);
            continue;
        }
        let parent = place_ancestors(&mut tx, forest, id, scope_node.id, &mut placed).await?;
        let target = with_unique_alias(tx.txn(), target, None).await?;
        tx.attach_target(parent, target.clone(), forest.node(id).node_type, realm_name)
            .await?;
        outcome.added.push(target);
    }

    for (id, observed, node) in unchanged {
        place_ancestors(&mut tx, forest, id, scope_node.id, &mut placed).await?;

        let Some(stored) = node.target.clone() else {
            continue;
        };
        let mut desired = observed;
        desired.jvm_id = stored.jvm_id.clone();
        if alias_candidates(&desired).contains(&stored.alias) {
            desired.alias = stored.alias.clone();
        } else {
            desired = with_unique_alias(tx.txn(), desired, Some(node.id)).await?;
        }
        if desired != stored {
            tx.update_target(&node, desired.clone(), realm_name).await?;
            outcome.modified.push(desired);
        }
    }

    topology.commit(tx).await?;
    Ok(outcome)
}

/// (name, type) of each draft ancestor, top-down.
fn draft_path(forest: &ChainForest, leaf: DraftId) -> PathSignature {
    forest
        .ancestors(leaf)
        .into_iter()
        .map(|id| {
            let node = forest.node(id);
            (node.name.clone(), node.node_type)
        })
        .collect()
}

/// (name, type) of each persisted ancestor between `scope` and the leaf,
/// top-down. `None` when the leaf is not below `scope`.
async fn stored_path(
    txn: &mut dyn TopologyTxn,
    leaf: &NodeRecord,
    scope: NodeId,
) -> Result<Option<PathSignature>> {
    let mut path = Vec::new();
    let mut current = leaf.parent;
    while let Some(id) = current {
        if id == scope {
            path.reverse();
            return Ok(Some(path));
        }
        let Some(node) = txn.node(id).await? else {
            return Ok(None);
        };
        path.push((node.name.clone(), node.node_type));
        current = node.parent;
    }
    Ok(None)
}

/// Persist (or find) the ancestors of a draft leaf, refreshing labels of
/// nodes that already exist. Returns the leaf's parent.
async fn place_ancestors(
    tx: &mut TopologyTx,
    forest: &ChainForest,
    leaf: DraftId,
    scope: NodeId,
    placed: &mut HashMap<DraftId, NodeId>,
) -> Result<NodeId> {
    let mut parent = scope;
    for draft in forest.ancestors(leaf) {
        if let Some(&id) = placed.get(&draft) {
            parent = id;
            continue;
        }
        let node = forest.node(draft);
        let id = match tx.txn().find_child(parent, &node.name, node.node_type).await? {
            Some(existing) => {
                if existing.labels != node.labels {
                    tx.txn().update_labels(existing.id, &node.labels).await?;
                }
                existing.id
            }
            None => {
                tx.attach_environment(parent, &node.name, node.node_type, node.labels.clone())
                    .await?
                    .id
            }
        };
        placed.insert(draft, id);
        parent = id;
    }
    Ok(parent)
}

/// Aliases tried, in order, when the observed alias is taken.
fn alias_candidates(target: &Target) -> Vec<String> {
    let mut candidates = vec![target.alias.clone()];
    if let Some(authority) = target.authority() {
        candidates.push(format!("{}@{}", target.alias, authority));
    }
    candidates.push(format!("{}@{}", target.alias, target.connect_url));
    candidates.push(target.connect_url.clone());
    candidates
}

/// Give `target` the first free alias candidate. `own` is the target's node
/// when it is already persisted.
async fn with_unique_alias(
    txn: &mut dyn TopologyTxn,
    mut target: Target,
    own: Option<NodeId>,
) -> Result<Target> {
    for candidate in alias_candidates(&target) {
        match txn.node_by_alias(&candidate).await? {
            Some(holder) if Some(holder.id) != own => continue,
            _ => {
                if candidate != target.alias {
                    debug!(alias = %target.alias, unique = %candidate, "alias taken, using suffix");
                }
                target.alias = candidate;
                return Ok(target);
            }
        }
    }
    Err(DiscoveryError::Conflict(format!(
        "no free alias for {}",
        target.connect_url
    )))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::bus::{EventBus, EventKind};
    use crate::connection::StaticJvmIdResolver;
    use crate::model::{jmx_service_url, Labels};
    use crate::storage::MemoryTopologyStore;

    const REALM: &str = "KubernetesApi";

    fn topology_with(store: Arc<MemoryTopologyStore>) -> Topology {
        Topology::new(store, EventBus::new())
    }

    fn topology() -> Topology {
        topology_with(Arc::new(MemoryTopologyStore::new()))
    }

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn jvm(host: &str, alias: &str) -> Target {
        Target::new(jmx_service_url(host, 9091), alias)
    }

    /// JVM -> Pod -> ReplicaSet -> Deployment for each (target, pod, deployment).
    fn cluster_forest(entries: &[(Target, &str, &str)]) -> ChainForest {
        let mut forest = ChainForest::new();
        for (target, pod, deployment) in entries {
            let deploy = forest.environment(None, *deployment, NodeType::Deployment, Labels::new());
            let rs = forest.environment(
                Some(deploy),
                format!("{}-rs", deployment),
                NodeType::ReplicaSet,
                Labels::new(),
            );
            let pod = forest.environment(Some(rs), *pod, NodeType::Pod, Labels::new());
            forest.target(Some(pod), target.clone(), NodeType::Jvm);
        }
        forest
    }

    fn flat_forest(targets: &[Target]) -> ChainForest {
        let mut forest = ChainForest::new();
        for t in targets {
            forest.target(None, t.clone(), NodeType::Jvm);
        }
        forest
    }

    #[tokio::test]
    async fn test_namespace_scenario_add_then_remove() {
        let topology = topology();
        let scope = Scope::namespace(REALM, "ns1");
        let a = jvm("host1", "A");
        let b = jvm("host2", "B");

        let first = cluster_forest(&[(a.clone(), "pod-a", "dep-a"), (b.clone(), "pod-b", "dep-b")]);
        let outcome = reconcile(&topology, &scope, &first).await.unwrap();
        assert_eq!(outcome.added.len(), 2);

        let tree = topology.tree().await.unwrap().unwrap();
        let ns = tree.find("ns1", NodeType::Namespace).unwrap();
        assert_eq!(ns.child_count(), 2);
        assert!(tree.find("A", NodeType::Jvm).is_some());

        let second = cluster_forest(&[(b.clone(), "pod-b", "dep-b")]);
        let outcome = reconcile(&topology, &scope, &second).await.unwrap();
        assert_eq!(outcome.removed, vec![a]);
        assert!(outcome.added.is_empty());

        let tree = topology.tree().await.unwrap().unwrap();
        let ns = tree.find("ns1", NodeType::Namespace).unwrap();
        assert_eq!(ns.child_count(), 1);
        assert!(tree.find("dep-a", NodeType::Deployment).is_none());
        assert!(tree.find("pod-a", NodeType::Pod).is_none());
        assert!(tree.find("dep-b", NodeType::Deployment).is_some());

        // Emptying the namespace keeps the Namespace node itself.
        reconcile(&topology, &scope, &ChainForest::new()).await.unwrap();
        let tree = topology.tree().await.unwrap().unwrap();
        let ns = tree.find("ns1", NodeType::Namespace).unwrap();
        assert_eq!(ns.child_count(), 0);
        assert!(tree.find(REALM, NodeType::Realm).is_some());
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let topology = topology();
        let scope = Scope::namespace(REALM, "ns1");
        let forest = cluster_forest(&[
            (jvm("h1", "a"), "p1", "d"),
            (jvm("h2", "b"), "p2", "d"),
        ]);

        let first = reconcile(&topology, &scope, &forest).await.unwrap();
        assert!(!first.is_empty());
        let before = topology.tree().await.unwrap();

        let mut rx = topology.bus().receiver();
        let second = reconcile(&topology, &scope, &forest).await.unwrap();
        assert!(second.is_empty());
        assert!(rx.try_recv().is_err());
        assert_eq!(topology.tree().await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_shared_deployment_is_persisted_once() {
        let topology = topology();
        let scope = Scope::namespace(REALM, "ns1");
        let forest = cluster_forest(&[
            (jvm("h1", "a"), "p1", "web"),
            (jvm("h2", "b"), "p2", "web"),
        ]);
        reconcile(&topology, &scope, &forest).await.unwrap();

        let tree = topology.tree().await.unwrap().unwrap();
        let ns = tree.find("ns1", NodeType::Namespace).unwrap();
        assert_eq!(ns.child_count(), 1);
        let rs = tree.find("web-rs", NodeType::ReplicaSet).unwrap();
        assert_eq!(rs.child_count(), 2);
    }

    #[tokio::test]
    async fn test_found_lost_sequence_tracks_last_event() {
        let topology = topology();
        let scope = Scope::realm("JDP");
        let t = jvm("h1", "a");
        let sequence = [true, false, false, true, true, false, true];

        for found in sequence {
            let forest = if found {
                flat_forest(&[t.clone()])
            } else {
                ChainForest::new()
            };
            reconcile(&topology, &scope, &forest).await.unwrap();
            let present = topology
                .targets()
                .await
                .unwrap()
                .iter()
                .any(|(_, x)| x.connect_url == t.connect_url);
            assert_eq!(present, found);
        }
    }

    #[tokio::test]
    async fn test_moved_target_is_removed_then_added() {
        let topology = topology();
        let scope = Scope::namespace(REALM, "ns1");
        let t = jvm("h1", "a");
        reconcile(&topology, &scope, &cluster_forest(&[(t.clone(), "p1", "old")]))
            .await
            .unwrap();

        let mut rx = topology.bus().receiver();
        let outcome = reconcile(&topology, &scope, &cluster_forest(&[(t.clone(), "p1", "new")]))
            .await
            .unwrap();
        assert_eq!(outcome.removed.len(), 1);
        assert_eq!(outcome.added.len(), 1);
        assert_eq!(rx.try_recv().unwrap().kind, EventKind::Lost);
        assert_eq!(rx.try_recv().unwrap().kind, EventKind::Found);

        let tree = topology.tree().await.unwrap().unwrap();
        assert!(tree.find("old", NodeType::Deployment).is_none());
        assert!(tree.find("new", NodeType::Deployment).is_some());
        assert_eq!(topology.targets().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_label_changes_are_refreshed() {
        let topology = topology();
        let scope = Scope::namespace(REALM, "ns1");
        let t = jvm("h1", "a");

        let mut forest = ChainForest::new();
        let d = forest.environment(None, "web", NodeType::Deployment, labels(&[("v", "1")]));
        forest.target(Some(d), t.clone(), NodeType::Jvm);
        reconcile(&topology, &scope, &forest).await.unwrap();

        let mut forest = ChainForest::new();
        let d = forest.environment(None, "web", NodeType::Deployment, labels(&[("v", "2")]));
        let relabeled = t.clone().with_labels(labels(&[("tier", "backend")]));
        forest.target(Some(d), relabeled.clone(), NodeType::Jvm);
        let outcome = reconcile(&topology, &scope, &forest).await.unwrap();

        assert_eq!(outcome.modified, vec![relabeled]);
        let tree = topology.tree().await.unwrap().unwrap();
        let web = tree.find("web", NodeType::Deployment).unwrap();
        assert_eq!(web.labels, crate::model::KeyValue::from_map(&labels(&[("v", "2")])));
    }

    #[tokio::test]
    async fn test_alias_collision_gets_authority_suffix() {
        let topology = topology();
        let first = jvm("h1", "app");
        let second = jvm("h2", "app");

        reconcile(&topology, &Scope::realm("JDP"), &flat_forest(&[first]))
            .await
            .unwrap();
        let outcome = reconcile(&topology, &Scope::realm("Podman"), &flat_forest(&[second.clone()]))
            .await
            .unwrap();
        assert_eq!(outcome.added[0].alias, "app@h2:9091");

        // Re-observing the same target keeps the suffixed alias quietly.
        let again = reconcile(&topology, &Scope::realm("Podman"), &flat_forest(&[second]))
            .await
            .unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_target_owned_elsewhere_is_skipped() {
        let topology = topology();
        let t = jvm("h1", "a");
        reconcile(&topology, &Scope::realm("JDP"), &flat_forest(&[t.clone()]))
            .await
            .unwrap();
        let outcome = reconcile(&topology, &Scope::realm("Podman"), &flat_forest(&[t.clone()]))
            .await
            .unwrap();
        assert!(outcome.added.is_empty());
        assert_eq!(outcome.skipped, vec![t.connect_url]);
    }

    #[tokio::test]
    async fn test_failed_commit_leaves_tree_untouched_and_retries() {
        let store = Arc::new(MemoryTopologyStore::new());
        let topology = topology_with(Arc::clone(&store));
        let scope = Scope::namespace(REALM, "ns1");
        let forest = cluster_forest(&[(jvm("h1", "a"), "p1", "d")]);

        let mut rx = topology.bus().receiver();
        store.set_fail_on_commit(true);
        assert!(reconcile(&topology, &scope, &forest).await.is_err());
        assert!(topology.tree().await.unwrap().is_none());
        assert!(rx.try_recv().is_err());

        store.set_fail_on_commit(false);
        let outcome = reconcile(&topology, &scope, &forest).await.unwrap();
        assert_eq!(outcome.added.len(), 1);
    }

    #[tokio::test]
    async fn test_jvm_id_backfill_emits_modified() {
        let resolver = Arc::new(StaticJvmIdResolver::new());
        let t = jvm("h1", "a");
        resolver.insert(t.connect_url.clone(), "jvm-123").await;
        let topology = topology().with_resolver(resolver, std::time::Duration::from_secs(1));

        let mut rx = topology.bus().receiver();
        let outcome = reconcile(&topology, &Scope::realm("JDP"), &flat_forest(&[t.clone()]))
            .await
            .unwrap();
        assert_eq!(outcome.modified.len(), 1);
        assert_eq!(outcome.modified[0].jvm_id.as_deref(), Some("jvm-123"));
        assert_eq!(rx.try_recv().unwrap().kind, EventKind::Found);
        assert_eq!(rx.try_recv().unwrap().kind, EventKind::Modified);

        // The stored id survives re-observation without the id.
        let again = reconcile(&topology, &Scope::realm("JDP"), &flat_forest(&[t]))
            .await
            .unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_scopes_do_not_touch_each_other() {
        let topology = topology();
        reconcile(
            &topology,
            &Scope::namespace(REALM, "ns1"),
            &cluster_forest(&[(jvm("h1", "a"), "p1", "d1")]),
        )
        .await
        .unwrap();
        reconcile(
            &topology,
            &Scope::namespace(REALM, "ns2"),
            &cluster_forest(&[(jvm("h2", "b"), "p2", "d2")]),
        )
        .await
        .unwrap();

        let outcome = reconcile(&topology, &Scope::namespace(REALM, "ns2"), &ChainForest::new())
            .await
            .unwrap();
        assert_eq!(outcome.removed.len(), 1);
        assert_eq!(topology.targets().await.unwrap().len(), 1);
    }
}
