//! Discovery plugins.
//!
//! External processes register a realm and a callback address, then publish
//! their subtree with the bearer token handed out at registration. The
//! callback is pinged at registration (admission), at startup and every
//! ping period; a plugin that stops answering is removed together with its
//! realm.
//!
//! First-party backends are represented by builtin records that own their
//! realm and cannot be deregistered.

pub mod callback;
pub mod token;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use callback::{Callback, CallbackClient, CallbackError};
pub use token::{Claims, TokenError, TokenGrant, TokenService};

use crate::bus::ScopeQueue;
use crate::discovery::BackendError;
use crate::error::{DiscoveryError, Result};
use crate::model::{annotation_keys, KeyValue, NodeType, PluginRecord, Target, TargetDto};
use crate::topology::{reconcile, ChainForest, DraftId, ReconcileOutcome, Scope, Topology};

/// Base path of plugin resources. A plugin's own resource is
/// `{DISCOVERY_PATH}/{id}`.
pub const DISCOVERY_PATH: &str = "/api/v4/discovery";

pub fn resource_path(id: Uuid) -> String {
    format!("{}/{}", DISCOVERY_PATH, id)
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub realm: String,
    pub callback: String,
    /// Present when refreshing an existing registration.
    #[serde(default)]
    pub id: Option<Uuid>,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub id: Uuid,
    pub token: String,
}

/// Caller details that end up in the token.
#[derive(Debug, Clone, Copy)]
pub struct Caller<'a> {
    pub address: &'a str,
    pub authorization: Option<&'a str>,
}

/// One node of a published plugin subtree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishedNode {
    pub name: String,
    pub node_type: String,
    #[serde(default)]
    pub labels: Vec<KeyValue>,
    #[serde(default)]
    pub children: Vec<PublishedNode>,
    #[serde(default)]
    pub target: Option<TargetDto>,
}

/// Plugin record as exposed over the API. Credentials never leave the
/// process.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginDto {
    pub id: Uuid,
    pub realm: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback: Option<String>,
    pub builtin: bool,
}

impl From<&PluginRecord> for PluginDto {
    fn from(record: &PluginRecord) -> Self {
        Self {
            id: record.id,
            realm: record.realm_name.clone(),
            callback: record.callback.clone(),
            builtin: record.builtin,
        }
    }
}

/// Turn a published subtree into a forest rooted at the plugin's realm.
pub fn published_forest(realm: &str, nodes: &[PublishedNode]) -> Result<ChainForest> {
    let mut forest = ChainForest::new();
    for node in nodes {
        add_published(&mut forest, None, realm, node)?;
    }
    Ok(forest)
}

fn add_published(
    forest: &mut ChainForest,
    parent: Option<DraftId>,
    realm: &str,
    node: &PublishedNode,
) -> Result<()> {
    let node_type: NodeType = node
        .node_type
        .parse()
        .map_err(|e: crate::model::UnknownNodeType| DiscoveryError::InvalidArgument(e.to_string()))?;
    if matches!(node_type, NodeType::Universe | NodeType::Realm) {
        return Err(DiscoveryError::InvalidArgument(format!(
            "plugins cannot publish {} nodes",
            node_type
        )));
    }
    let invalid = |msg: String| DiscoveryError::InvalidArgument(msg);

    if node_type.is_leaf() {
        let Some(dto) = node.target.as_ref() else {
            return Err(invalid(format!("{} node {} has no target", node_type, node.name)));
        };
        if !node.children.is_empty() {
            return Err(invalid(format!("{} node {} cannot have children", node_type, node.name)));
        }
        let target = Target::try_from(dto)
            .map_err(|e| invalid(e.to_string()))?
            .with_annotation(annotation_keys::REALM, realm);
        forest.target(parent, target, node_type);
        return Ok(());
    }

    if node.target.is_some() {
        return Err(invalid(format!("{} node {} cannot carry a target", node_type, node.name)));
    }
    let labels = KeyValue::to_map(&node.labels).map_err(|e| invalid(e.to_string()))?;
    let id = forest.environment(parent, node.name.clone(), node_type, labels);
    for child in &node.children {
        add_published(forest, Some(id), realm, child)?;
    }
    Ok(())
}

#[derive(Clone)]
pub struct PluginRegistry {
    topology: Topology,
    queue: ScopeQueue,
    tokens: Arc<TokenService>,
    callbacks: CallbackClient,
    ping_period: Duration,
}

impl PluginRegistry {
    pub fn new(
        topology: Topology,
        queue: ScopeQueue,
        tokens: Arc<TokenService>,
        callbacks: CallbackClient,
        ping_period: Duration,
    ) -> Self {
        Self {
            topology,
            queue,
            tokens,
            callbacks,
            ping_period,
        }
    }

    async fn on_scope<T, F>(&self, realm: &str, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.queue
            .run(&Scope::realm(realm).key(), fut)
            .await
            .map_err(|e| DiscoveryError::Backend(BackendError::Unavailable(e.to_string())))?
    }

    fn issue(&self, plugin: &PluginRecord, caller: Caller<'_>) -> Result<String> {
        let resource = resource_path(plugin.id);
        let plugin_id = plugin.id.to_string();
        Ok(self.tokens.issue(
            &TokenGrant {
                plugin_id: &plugin_id,
                realm: &plugin.realm_name,
                client_address: caller.address,
                authorization: caller.authorization,
                resource_path: &resource,
            },
            Utc::now(),
        )?)
    }

    /// Check `token` for the plugin's own resource and load the plugin.
    async fn authorize(&self, id: Uuid, token: &str) -> Result<PluginRecord> {
        self.tokens
            .validate(token, &resource_path(id), &id.to_string(), Some(Utc::now()))?;
        self.get(id).await
    }

    pub async fn get(&self, id: Uuid) -> Result<PluginRecord> {
        self.topology
            .plugin_records()
            .await?
            .into_iter()
            .find(|p| p.id == id)
            .ok_or_else(|| DiscoveryError::NotFound(format!("plugin {}", id)))
    }

    pub async fn list(&self) -> Result<Vec<PluginRecord>> {
        self.topology.plugin_records().await
    }

    /// Register a new plugin, or refresh the token of an existing one when
    /// the request carries its id and a valid token.
    pub async fn register(&self, request: RegisterRequest, caller: Caller<'_>) -> Result<Registration> {
        let realm = request.realm.trim().to_string();
        if realm.is_empty() {
            return Err(DiscoveryError::InvalidArgument("realm must not be blank".to_string()));
        }
        let callback = Callback::parse(&request.callback)?;

        if let (Some(id), Some(token)) = (request.id, request.token.as_deref()) {
            return self.refresh(id, token, &realm, &callback, caller).await;
        }

        self.callbacks
            .ping(&callback.url, callback.credential.as_ref())
            .await
            .map_err(|e| DiscoveryError::Admission(format!("callback {} unreachable: {}", callback.url, e)))?;

        let topology = self.topology.clone();
        let realm_name = realm.clone();
        let record = self
            .on_scope(&realm, async move {
                let mut tx = topology.begin().await?;
                if tx.realm(&realm_name).await?.is_some() {
                    return Err(DiscoveryError::Conflict(format!(
                        "realm {} is already registered",
                        realm_name
                    )));
                }
                let node = tx.ensure_realm(&realm_name).await?;
                let record = PluginRecord {
                    id: Uuid::new_v4(),
                    realm: node.id,
                    realm_name: realm_name.clone(),
                    callback: Some(callback.url),
                    credential: callback.credential,
                    builtin: false,
                };
                tx.txn().insert_plugin(&record).await?;
                topology.commit(tx).await?;
                Ok(record)
            })
            .await?;

        info!(plugin = %record.id, realm = %record.realm_name, "plugin registered");
        Ok(Registration {
            token: self.issue(&record, caller)?,
            id: record.id,
        })
    }

    async fn refresh(
        &self,
        id: Uuid,
        token: &str,
        realm: &str,
        callback: &Callback,
        caller: Caller<'_>,
    ) -> Result<Registration> {
        let record = self.authorize(id, token).await?;
        if record.builtin || record.realm_name != realm {
            return Err(DiscoveryError::Forbidden(format!(
                "plugin {} does not own realm {}",
                id, realm
            )));
        }
        if record.callback.as_deref() != Some(callback.url.as_str()) {
            return Err(DiscoveryError::Forbidden(format!(
                "plugin {} registered a different callback",
                id
            )));
        }
        self.callbacks
            .ping(&callback.url, record.credential.as_ref())
            .await
            .map_err(|e| DiscoveryError::Admission(format!("callback {} unreachable: {}", callback.url, e)))?;

        debug!(plugin = %id, "plugin token refreshed");
        Ok(Registration {
            token: self.issue(&record, caller)?,
            id,
        })
    }

    /// Replace the plugin's realm subtree with `nodes`.
    pub async fn publish(&self, id: Uuid, token: &str, nodes: Vec<PublishedNode>) -> Result<ReconcileOutcome> {
        let record = self.authorize(id, token).await?;
        if record.builtin {
            return Err(DiscoveryError::Forbidden(format!(
                "builtin realm {} is not published by plugins",
                record.realm_name
            )));
        }
        let forest = published_forest(&record.realm_name, &nodes)?;
        let topology = self.topology.clone();
        let scope = Scope::realm(record.realm_name.clone());
        let outcome = self
            .on_scope(&record.realm_name, async move { reconcile(&topology, &scope, &forest).await })
            .await?;
        debug!(
            plugin = %id,
            added = outcome.added.len(),
            removed = outcome.removed.len(),
            "plugin subtree published"
        );
        Ok(outcome)
    }

    pub async fn deregister(&self, id: Uuid, token: &str) -> Result<()> {
        let record = self.authorize(id, token).await?;
        if record.builtin {
            return Err(DiscoveryError::Forbidden(format!(
                "builtin plugin {} cannot be deregistered",
                record.realm_name
            )));
        }
        self.remove(record).await
    }

    async fn remove(&self, record: PluginRecord) -> Result<()> {
        let topology = self.topology.clone();
        let realm = record.realm_name.clone();
        self.on_scope(&realm, async move {
            let mut tx = topology.begin().await?;
            tx.txn().delete_plugin(record.id).await?;
            if tx.txn().node(record.realm).await?.is_some() {
                tx.delete_subtree(record.realm, &record.realm_name).await?;
            }
            topology.commit(tx).await?;
            info!(plugin = %record.id, realm = %record.realm_name, "plugin removed");
            Ok(())
        })
        .await
    }

    /// Builtin record owning `realm`, created with the realm if missing.
    pub async fn ensure_builtin(&self, realm: &str) -> Result<PluginRecord> {
        let mut tx = self.topology.begin().await?;
        if let Some(existing) = tx.txn().plugin_by_realm(realm).await? {
            return Ok(existing);
        }
        let node = tx.ensure_realm(realm).await?;
        let record = PluginRecord::builtin(node.id, realm);
        tx.txn().insert_plugin(&record).await?;
        self.topology.commit(tx).await?;
        debug!(realm = %realm, "builtin plugin record created");
        Ok(record)
    }

    /// Ping every non-builtin plugin and remove the ones that do not answer.
    /// Returns how many were removed.
    pub async fn prune_unreachable(&self) -> Result<usize> {
        let mut removed = 0;
        for record in self.list().await?.into_iter().filter(|p| !p.builtin) {
            let Some(callback) = record.callback.clone() else {
                continue;
            };
            if self
                .callbacks
                .ping(&callback, record.credential.as_ref())
                .await
                .is_ok()
            {
                continue;
            }
            warn!(plugin = %record.id, realm = %record.realm_name, "plugin unreachable, removing");
            self.remove(record).await?;
            removed += 1;
        }
        Ok(removed)
    }

    /// Re-verify plugins every ping period until `cancel` fires.
    pub fn spawn_reverification(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let period = registry.ping_period;
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match registry.prune_unreachable().await {
                            Ok(0) => {}
                            Ok(n) => info!(removed = n, "pruned unreachable plugins"),
                            Err(e) => warn!(error = %e, "plugin re-verification failed"),
                        }
                    }
                }
            }
            debug!("plugin re-verification stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;

    use super::*;
    use crate::bus::{EventBus, EventKind};
    use crate::model::realms;
    use crate::storage::memory::MemoryTopologyStore;

    const CALLER: Caller<'static> = Caller {
        address: "127.0.0.1",
        authorization: None,
    };

    async fn callback_server() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = Router::new().route("/", get(|| async { StatusCode::OK }));
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}/", addr)
    }

    fn dead_callback() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        format!("http://{}/", addr)
    }

    fn registry() -> (PluginRegistry, EventBus) {
        let bus = EventBus::new();
        let topology = Topology::new(Arc::new(MemoryTopologyStore::new()), bus.clone());
        let tokens = Arc::new(TokenService::generate(
            "http://localhost:8181",
            Duration::from_secs(600),
            Duration::from_secs(60),
        ));
        let registry = PluginRegistry::new(
            topology,
            ScopeQueue::new(),
            tokens,
            CallbackClient::new(Duration::from_millis(500)).unwrap(),
            Duration::from_secs(300),
        );
        (registry, bus)
    }

    fn request(realm: &str, callback: &str) -> RegisterRequest {
        RegisterRequest {
            realm: realm.to_string(),
            callback: callback.to_string(),
            ..Default::default()
        }
    }

    fn jvm(name: &str, url: &str) -> PublishedNode {
        PublishedNode {
            name: name.to_string(),
            node_type: "JVM".to_string(),
            target: Some(TargetDto {
                connect_url: url.to_string(),
                alias: name.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_get_reads_while_a_writer_is_open() {
        let (registry, _bus) = registry();
        let callback = callback_server().await;
        let registration = registry.register(request("ext", &callback), CALLER).await.unwrap();

        let _writer = registry.topology.begin().await.unwrap();
        let record = tokio::time::timeout(Duration::from_secs(1), registry.get(registration.id))
            .await
            .expect("get waited on the writer")
            .unwrap();
        assert_eq!(record.realm_name, "ext");
        assert!(matches!(
            registry.get(Uuid::new_v4()).await,
            Err(DiscoveryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_register_with_live_callback() {
        let (registry, _bus) = registry();
        let callback = callback_server().await;

        let registration = registry.register(request("ext", &callback), CALLER).await.unwrap();
        let record = registry.get(registration.id).await.unwrap();
        assert_eq!(record.realm_name, "ext");
        assert!(!record.builtin);
        assert!(registry
            .tokens
            .validate(
                &registration.token,
                &resource_path(registration.id),
                &registration.id.to_string(),
                Some(Utc::now())
            )
            .is_ok());
    }

    #[tokio::test]
    async fn test_register_with_dead_callback_stores_nothing() {
        let (registry, _bus) = registry();
        let err = registry
            .register(request("ext", &dead_callback()), CALLER)
            .await
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::Admission(_)));
        assert!(registry.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_realm_conflicts() {
        let (registry, _bus) = registry();
        let callback = callback_server().await;
        registry.register(request("ext", &callback), CALLER).await.unwrap();
        let err = registry.register(request("ext", &callback), CALLER).await.unwrap_err();
        assert!(matches!(err, DiscoveryError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_refresh_reissues_token_for_same_plugin() {
        let (registry, _bus) = registry();
        let callback = callback_server().await;
        let first = registry.register(request("ext", &callback), CALLER).await.unwrap();

        let refreshed = registry
            .register(
                RegisterRequest {
                    id: Some(first.id),
                    token: Some(first.token.clone()),
                    ..request("ext", &callback)
                },
                CALLER,
            )
            .await
            .unwrap();
        assert_eq!(refreshed.id, first.id);
        assert_eq!(registry.list().await.unwrap().len(), 1);

        let err = registry
            .register(
                RegisterRequest {
                    id: Some(first.id),
                    token: Some("garbage".to_string()),
                    ..request("ext", &callback)
                },
                CALLER,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_publish_replaces_subtree() {
        let (registry, bus) = registry();
        let callback = callback_server().await;
        let reg = registry.register(request("ext", &callback), CALLER).await.unwrap();
        let mut events = bus.receiver();

        let pod = PublishedNode {
            name: "pod-a".to_string(),
            node_type: "Pod".to_string(),
            children: vec![jvm("a", "service:jmx:rmi:///jndi/rmi://a:1/jmxrmi")],
            ..Default::default()
        };
        let outcome = registry
            .publish(reg.id, &reg.token, vec![pod, jvm("b", "service:jmx:rmi:///jndi/rmi://b:1/jmxrmi")])
            .await
            .unwrap();
        assert_eq!(outcome.added.len(), 2);
        assert_eq!(events.recv().await.unwrap().kind, EventKind::Found);

        let outcome = registry
            .publish(reg.id, &reg.token, vec![jvm("b", "service:jmx:rmi:///jndi/rmi://b:1/jmxrmi")])
            .await
            .unwrap();
        assert_eq!(outcome.removed.len(), 1);
        assert_eq!(outcome.removed[0].alias, "a");

        let tree = registry.topology.tree().await.unwrap().unwrap();
        let realm = tree.find("ext", NodeType::Realm).unwrap();
        assert_eq!(realm.child_count(), 1);
    }

    #[tokio::test]
    async fn test_publish_rejects_bad_token_and_unknown_types() {
        let (registry, _bus) = registry();
        let callback = callback_server().await;
        let a = registry.register(request("a", &callback), CALLER).await.unwrap();
        let b = registry.register(request("b", &callback), CALLER).await.unwrap();

        let err = registry.publish(a.id, &b.token, vec![]).await.unwrap_err();
        assert!(matches!(err, DiscoveryError::Unauthorized(_)));

        let bogus = PublishedNode {
            name: "x".to_string(),
            node_type: "Galaxy".to_string(),
            ..Default::default()
        };
        let err = registry.publish(a.id, &a.token, vec![bogus]).await.unwrap_err();
        assert!(matches!(err, DiscoveryError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_deregister_removes_realm_and_emits_lost() {
        let (registry, bus) = registry();
        let callback = callback_server().await;
        let reg = registry.register(request("ext", &callback), CALLER).await.unwrap();
        registry
            .publish(reg.id, &reg.token, vec![jvm("a", "service:jmx:rmi:///jndi/rmi://a:1/jmxrmi")])
            .await
            .unwrap();
        let mut events = bus.receiver();

        registry.deregister(reg.id, &reg.token).await.unwrap();
        assert_eq!(events.recv().await.unwrap().kind, EventKind::Lost);
        assert!(registry.list().await.unwrap().is_empty());
        let tree = registry.topology.tree().await.unwrap().unwrap();
        assert!(tree.find("ext", NodeType::Realm).is_none());
    }

    #[tokio::test]
    async fn test_builtin_cannot_be_deregistered() {
        let (registry, _bus) = registry();
        let builtin = registry.ensure_builtin(realms::JDP).await.unwrap();
        assert_eq!(registry.ensure_builtin(realms::JDP).await.unwrap().id, builtin.id);

        // A builtin has no token of its own; forge one with the registry's
        // keys to reach the builtin check.
        let token = registry
            .issue(&builtin, CALLER)
            .unwrap();
        let err = registry.deregister(builtin.id, &token).await.unwrap_err();
        assert!(matches!(err, DiscoveryError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_prune_removes_only_unreachable() {
        let (registry, _bus) = registry();
        let live = callback_server().await;
        registry.register(request("live", &live), CALLER).await.unwrap();
        registry.ensure_builtin(realms::JDP).await.unwrap();

        // Register against a live server, then point the record at a dead one.
        let dead = registry.register(request("dead", &live), CALLER).await.unwrap();
        let mut record = registry.get(dead.id).await.unwrap();
        {
            let mut tx = registry.topology.begin().await.unwrap();
            tx.txn().delete_plugin(record.id).await.unwrap();
            record.callback = Some(dead_callback());
            tx.txn().insert_plugin(&record).await.unwrap();
            registry.topology.commit(tx).await.unwrap();
        }

        assert_eq!(registry.prune_unreachable().await.unwrap(), 1);
        let remaining: Vec<String> = registry
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.realm_name)
            .collect();
        assert_eq!(remaining.len(), 2);
        assert!(!remaining.contains(&"dead".to_string()));
    }

    #[test]
    fn test_published_forest_shapes() {
        let nodes = vec![PublishedNode {
            name: "ns".to_string(),
            node_type: "Namespace".to_string(),
            labels: vec![KeyValue::new("team", "a")],
            children: vec![jvm("a", "u1"), jvm("b", "u2")],
            ..Default::default()
        }];
        let forest = published_forest("ext", &nodes).unwrap();
        assert_eq!(forest.len(), 3);
        let (_, target) = forest.leaves().next().unwrap();
        assert_eq!(
            target.annotations.cryostat.get(annotation_keys::REALM).map(String::as_str),
            Some("ext")
        );

        let leaf_with_children = PublishedNode {
            children: vec![jvm("c", "u3")],
            ..jvm("a", "u1")
        };
        assert!(published_forest("ext", &[leaf_with_children]).is_err());
        let realm = PublishedNode {
            name: "r".to_string(),
            node_type: "Realm".to_string(),
            ..Default::default()
        };
        assert!(published_forest("ext", &[realm]).is_err());
    }
}
