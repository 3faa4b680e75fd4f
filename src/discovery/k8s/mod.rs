//! Cluster API backend.
//!
//! Watches `Endpoints` in the configured namespaces (or cluster-wide with
//! `*`) through kube reflectors. Every add, update or delete requests a
//! reconciliation of the object's namespace; the driver's poll period acts
//! as the periodic forced resync.
//!
//! Each endpoint address on a JMX port becomes a JVM target. When the
//! address references a Pod, the Pod's owner references are followed up to
//! the top workload (Deployment, StatefulSet, ...), and the resulting chain
//! is attached under the Namespace node.

mod owners;

pub use owners::{controlling_owner, KubeOwnerLookup};

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Endpoints;
use kube::runtime::reflector::Store;
use kube::runtime::watcher::Event;
use kube::runtime::{reflector, watcher, WatchStreamExt};
use kube::{Api, Client, ResourceExt};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{BackendError, DiscoveryBackend, ReconcileTrigger};
use crate::config::{KubernetesConfig, NAMESPACE_ENV_VAR, POD_NAMESPACE_ENV_VAR};
use crate::model::{annotation_keys, jmx_service_url, realms, NodeType, Target};
use crate::topology::{ChainForest, ChainResolver, OwnerLookup, OwnerRef, Scope};

/// Watch every namespace.
pub const ALL_NAMESPACES: &str = "*";
/// The namespace this process runs in.
pub const OWN_NAMESPACE: &str = ".";

const SERVICE_ACCOUNT_NAMESPACE_FILE: &str =
    "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

/// Resolve `.` placeholders and de-duplicate. Returns `[*]` when the
/// wildcard is present.
pub fn resolve_namespaces(configured: &[String], own: &str) -> Vec<String> {
    if configured.iter().any(|ns| ns == ALL_NAMESPACES) {
        return vec![ALL_NAMESPACES.to_string()];
    }
    let resolved: BTreeSet<String> = configured
        .iter()
        .map(|ns| ns.trim())
        .filter(|ns| !ns.is_empty())
        .map(|ns| {
            if ns == OWN_NAMESPACE {
                own.to_string()
            } else {
                ns.to_string()
            }
        })
        .collect();
    resolved.into_iter().collect()
}

/// Namespace of this process: service-account file, then environment,
/// then `default`.
pub fn own_namespace() -> String {
    std::fs::read_to_string(SERVICE_ACCOUNT_NAMESPACE_FILE)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| std::env::var(POD_NAMESPACE_ENV_VAR).ok())
        .or_else(|| std::env::var(NAMESPACE_ENV_VAR).ok())
        .unwrap_or_else(|| "default".to_string())
}

/// One observed endpoint address.
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointTarget {
    pub target: Target,
    /// Object the address points at, usually a Pod.
    pub owner: Option<OwnerRef>,
}

/// Targets of one Endpoints object, keeping only ports allowed by name or
/// number.
pub fn endpoint_targets(
    endpoints: &Endpoints,
    namespace: &str,
    config: &KubernetesConfig,
) -> Vec<EndpointTarget> {
    let mut out = Vec::new();
    for subset in endpoints.subsets.iter().flatten() {
        let ports = subset.ports.iter().flatten().filter(|p| {
            let by_name = p
                .name
                .as_ref()
                .is_some_and(|n| config.port_names.iter().any(|allowed| allowed == n));
            let by_number = u16::try_from(p.port)
                .map(|n| config.port_numbers.contains(&n))
                .unwrap_or(false);
            by_name || by_number
        });
        for port in ports {
            let Ok(port_number) = u16::try_from(port.port) else {
                continue;
            };
            for address in subset.addresses.iter().flatten() {
                let target_ref = address.target_ref.as_ref();
                let owner = target_ref.and_then(|r| match (&r.kind, &r.name) {
                    (Some(kind), Some(name)) => Some(OwnerRef::new(kind.clone(), name.clone())),
                    _ => None,
                });
                let alias = target_ref
                    .and_then(|r| r.name.clone())
                    .or_else(|| address.hostname.clone())
                    .unwrap_or_else(|| address.ip.clone());

                let mut target = Target::new(jmx_service_url(&address.ip, port_number), alias)
                    .with_platform_annotations(endpoints.annotations().clone())
                    .with_annotation(annotation_keys::REALM, realms::KUBERNETES)
                    .with_annotation(annotation_keys::HOST, address.ip.clone())
                    .with_annotation(annotation_keys::PORT, port_number.to_string())
                    .with_annotation(annotation_keys::NAMESPACE, namespace);
                if let Some(owner) = owner.as_ref().filter(|o| o.kind == "Pod") {
                    target = target.with_annotation(annotation_keys::POD_NAME, owner.name.clone());
                }
                out.push(EndpointTarget { target, owner });
            }
        }
    }
    out
}

/// Build the forest of one namespace. Owner chains share nodes across all
/// targets of the pass.
pub async fn build_forest(
    namespace: &str,
    targets: Vec<EndpointTarget>,
    lookup: &dyn OwnerLookup,
) -> Result<ChainForest, BackendError> {
    let mut forest = ChainForest::new();
    let mut resolver = ChainResolver::new(lookup, namespace);
    for EndpointTarget { target, owner } in targets {
        let leaf = forest.target(None, target, NodeType::Jvm);
        resolver.resolve(&mut forest, leaf, owner).await?;

        // The pod's labels describe the JVM as well.
        if let Some(parent) = forest.node(leaf).parent {
            if forest.node(parent).node_type == NodeType::Pod {
                let labels = forest.node(parent).labels.clone();
                for (key, value) in &labels {
                    forest.label(leaf, key, value);
                }
            }
        }
    }
    Ok(forest)
}

pub struct KubeBackend {
    config: KubernetesConfig,
    client: OnceCell<Client>,
    /// Reflector caches keyed by watched namespace (`*` for cluster-wide).
    stores: Mutex<HashMap<String, Store<Endpoints>>>,
    /// Every namespace that ever held a watched Endpoints object.
    seen: Arc<Mutex<BTreeSet<String>>>,
}

impl KubeBackend {
    pub fn new(config: KubernetesConfig) -> Self {
        Self {
            config,
            client: OnceCell::new(),
            stores: Mutex::new(HashMap::new()),
            seen: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    /// Use an existing client instead of the inferred default.
    pub fn with_client(config: KubernetesConfig, client: Client) -> Self {
        let backend = Self::new(config);
        let _ = backend.client.set(client);
        backend
    }

    fn namespaces(&self) -> Vec<String> {
        resolve_namespaces(&self.config.namespaces, &own_namespace())
    }

    async fn client(&self) -> Result<&Client, BackendError> {
        self.client
            .get_or_try_init(|| async { Client::try_default().await.map_err(BackendError::from) })
            .await
    }

    fn store_for(&self, namespace: &str) -> Option<Store<Endpoints>> {
        let stores = match self.stores.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        stores
            .get(namespace)
            .or_else(|| stores.get(ALL_NAMESPACES))
            .cloned()
    }

    fn remember(seen: &Mutex<BTreeSet<String>>, namespace: &str) {
        match seen.lock() {
            Ok(mut guard) => guard.insert(namespace.to_string()),
            Err(poisoned) => poisoned.into_inner().insert(namespace.to_string()),
        };
    }
}

#[async_trait]
impl DiscoveryBackend for KubeBackend {
    fn realm(&self) -> &str {
        realms::KUBERNETES
    }

    fn enabled(&self) -> bool {
        self.config.enabled
    }

    async fn available(&self) -> bool {
        let client = match self.client().await {
            Ok(client) => client,
            Err(e) => {
                debug!(error = %e, "no cluster client");
                return false;
            }
        };
        match tokio::time::timeout(self.config.request_timeout(), client.apiserver_version()).await {
            Ok(Ok(version)) => {
                info!(version = %version.git_version, "cluster API reachable");
                true
            }
            Ok(Err(e)) => {
                debug!(error = %e, "cluster API unreachable");
                false
            }
            Err(_) => {
                debug!("cluster API version check timed out");
                false
            }
        }
    }

    fn poll_period(&self) -> Option<Duration> {
        Some(self.config.resync_period())
    }

    async fn scopes(&self) -> Vec<Scope> {
        let mut namespaces: BTreeSet<String> = self
            .namespaces()
            .into_iter()
            .filter(|ns| ns != ALL_NAMESPACES)
            .collect();
        match self.seen.lock() {
            Ok(seen) => namespaces.extend(seen.iter().cloned()),
            Err(poisoned) => namespaces.extend(poisoned.into_inner().iter().cloned()),
        }
        namespaces
            .into_iter()
            .map(|ns| Scope::namespace(realms::KUBERNETES, ns))
            .collect()
    }

    async fn observe(&self, scope: &Scope) -> Result<ChainForest, BackendError> {
        let Some(namespace) = scope.namespace.as_deref() else {
            return Err(BackendError::Malformed(format!("{} has no namespace", scope)));
        };
        let store = self
            .store_for(namespace)
            .ok_or_else(|| BackendError::Unavailable(format!("namespace {} is not watched", namespace)))?;

        // An unsynced cache would look like "everything vanished".
        tokio::time::timeout(self.config.request_timeout(), store.wait_until_ready())
            .await
            .map_err(|_| BackendError::Timeout(format!("cache for {} not synced", namespace)))?
            .map_err(|e| BackendError::Transient(e.to_string()))?;

        let targets: Vec<EndpointTarget> = store
            .state()
            .iter()
            .filter(|ep| ep.namespace().as_deref() == Some(namespace))
            .flat_map(|ep| endpoint_targets(ep, namespace, &self.config))
            .collect();

        let lookup = KubeOwnerLookup::new(self.client().await?.clone(), self.config.request_timeout());
        build_forest(namespace, targets, &lookup).await
    }

    async fn start(
        &self,
        trigger: ReconcileTrigger,
        cancel: CancellationToken,
    ) -> Result<(), BackendError> {
        let client = self.client().await?.clone();

        for namespace in self.namespaces() {
            let api: Api<Endpoints> = if namespace == ALL_NAMESPACES {
                Api::all(client.clone())
            } else {
                Api::namespaced(client.clone(), &namespace)
            };
            let (reader, writer) = reflector::store();
            match self.stores.lock() {
                Ok(mut stores) => stores.insert(namespace.clone(), reader.clone()),
                Err(poisoned) => poisoned.into_inner().insert(namespace.clone(), reader.clone()),
            };

            let stream = reflector(writer, watcher(api, watcher::Config::default()).default_backoff());
            let trigger = trigger.clone();
            let cancel = cancel.clone();
            let seen = Arc::clone(&self.seen);
            info!(namespace = %namespace, "starting Endpoints watcher");

            tokio::spawn(async move {
                let mut stream = std::pin::pin!(stream);
                loop {
                    let next = tokio::select! {
                        _ = cancel.cancelled() => break,
                        next = stream.next() => next,
                    };
                    let event = match next {
                        Some(Ok(event)) => event,
                        Some(Err(e)) => {
                            warn!(namespace = %namespace, error = %e, "Endpoints watch error");
                            continue;
                        }
                        None => break,
                    };
                    match event {
                        Event::Apply(ep) | Event::Delete(ep) => {
                            if let Some(ns) = ep.namespace() {
                                Self::remember(&seen, &ns);
                                trigger.request(Scope::namespace(realms::KUBERNETES, ns));
                            }
                        }
                        Event::InitApply(ep) => {
                            if let Some(ns) = ep.namespace() {
                                Self::remember(&seen, &ns);
                            }
                        }
                        Event::Init => debug!(namespace = %namespace, "Endpoints watcher initializing"),
                        Event::InitDone => {
                            debug!(namespace = %namespace, "Endpoints watcher synced");
                            let synced: Vec<String> = if namespace == ALL_NAMESPACES {
                                reader
                                    .state()
                                    .iter()
                                    .filter_map(|ep| ep.namespace())
                                    .collect::<BTreeSet<_>>()
                                    .into_iter()
                                    .collect()
                            } else {
                                vec![namespace.clone()]
                            };
                            for ns in synced {
                                trigger.request(Scope::namespace(realms::KUBERNETES, ns));
                            }
                        }
                    }
                }
                debug!(namespace = %namespace, "Endpoints watcher stopped");
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::{EndpointAddress, EndpointPort, EndpointSubset, ObjectReference};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;
    use crate::discovery::BackendError;
    use crate::topology::OwnedObject;

    fn address(ip: &str, pod: &str) -> EndpointAddress {
        EndpointAddress {
            ip: ip.to_string(),
            target_ref: Some(ObjectReference {
                kind: Some("Pod".to_string()),
                name: Some(pod.to_string()),
                namespace: Some("ns1".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn port(name: Option<&str>, number: i32) -> EndpointPort {
        EndpointPort {
            name: name.map(str::to_string),
            port: number,
            ..Default::default()
        }
    }

    fn endpoints(addresses: Vec<EndpointAddress>, ports: Vec<EndpointPort>) -> Endpoints {
        Endpoints {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("ns1".to_string()),
                ..Default::default()
            },
            subsets: Some(vec![EndpointSubset {
                addresses: Some(addresses),
                ports: Some(ports),
                ..Default::default()
            }]),
        }
    }

    struct Workloads;

    #[async_trait]
    impl OwnerLookup for Workloads {
        async fn lookup(
            &self,
            _namespace: &str,
            owner: &OwnerRef,
        ) -> Result<Option<OwnedObject>, BackendError> {
            let object = |kind: &str, labels: &[(&str, &str)], parent: Option<OwnerRef>| OwnedObject {
                kind: kind.to_string(),
                name: owner.name.clone(),
                labels: labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect::<BTreeMap<_, _>>(),
                owner: parent,
            };
            Ok(match (owner.kind.as_str(), owner.name.as_str()) {
                ("Pod", "web-1") | ("Pod", "web-2") => Some(object(
                    "Pod",
                    &[("app", "web")],
                    Some(OwnerRef::new("ReplicaSet", "web-7d9")),
                )),
                ("ReplicaSet", "web-7d9") => Some(object(
                    "ReplicaSet",
                    &[],
                    Some(OwnerRef::new("Deployment", "web")),
                )),
                ("Deployment", "web") => Some(object("Deployment", &[("tier", "front")], None)),
                _ => None,
            })
        }
    }

    fn config() -> KubernetesConfig {
        KubernetesConfig {
            enabled: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_resolve_namespaces() {
        let configured = vec![".".to_string(), "b".to_string(), "b".to_string()];
        assert_eq!(
            resolve_namespaces(&configured, "mine"),
            vec!["b".to_string(), "mine".to_string()]
        );
        let configured = vec!["a".to_string(), "*".to_string()];
        assert_eq!(resolve_namespaces(&configured, "mine"), vec!["*".to_string()]);
    }

    #[test]
    fn test_ports_filtered_by_name_and_number() {
        let ep = endpoints(
            vec![address("10.0.0.1", "web-1")],
            vec![
                port(Some("jfr-jmx"), 5555),
                port(None, 9091),
                port(Some("http"), 8080),
            ],
        );
        let targets = endpoint_targets(&ep, "ns1", &config());
        let urls: Vec<&str> = targets.iter().map(|t| t.target.connect_url.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "service:jmx:rmi:///jndi/rmi://10.0.0.1:5555/jmxrmi",
                "service:jmx:rmi:///jndi/rmi://10.0.0.1:9091/jmxrmi",
            ]
        );
        assert_eq!(targets[0].target.alias, "web-1");
        assert_eq!(targets[0].owner, Some(OwnerRef::new("Pod", "web-1")));
        assert_eq!(
            targets[0]
                .target
                .annotations
                .cryostat
                .get(annotation_keys::NAMESPACE)
                .map(String::as_str),
            Some("ns1")
        );
    }

    #[tokio::test]
    async fn test_forest_shares_workload_nodes() {
        let ep = endpoints(
            vec![address("10.0.0.1", "web-1"), address("10.0.0.2", "web-2")],
            vec![port(Some("jfr-jmx"), 9091)],
        );
        let targets = endpoint_targets(&ep, "ns1", &config());
        let forest = build_forest("ns1", targets, &Workloads).await.unwrap();

        let count = |t: NodeType| (0..forest.len()).filter(|&i| forest.node(i).node_type == t).count();
        assert_eq!(count(NodeType::Deployment), 1);
        assert_eq!(count(NodeType::ReplicaSet), 1);
        assert_eq!(count(NodeType::Pod), 2);
        assert_eq!(count(NodeType::Jvm), 2);

        let (leaf, target) = forest.leaves().next().unwrap();
        assert_eq!(target.labels.get("app").map(String::as_str), Some("web"));
        assert_eq!(forest.ancestors(leaf).len(), 3);
    }

    #[tokio::test]
    async fn test_address_without_target_ref_sits_under_namespace() {
        let mut addr = address("10.0.0.9", "unused");
        addr.target_ref = None;
        let ep = endpoints(vec![addr], vec![port(None, 9091)]);
        let targets = endpoint_targets(&ep, "ns1", &config());
        assert_eq!(targets[0].target.alias, "10.0.0.9");

        let forest = build_forest("ns1", targets, &Workloads).await.unwrap();
        assert_eq!(forest.len(), 1);
    }
}
