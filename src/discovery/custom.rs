//! Manually registered targets.
//!
//! Custom targets bypass discovery: they are validated against the
//! connection layer and attached directly under the `Custom Targets` realm.
//! Deletion is explicit. All mutations run on the realm's scope worker so
//! they never interleave with each other.

use http::uri::Authority;
use serde::Deserialize;
use tracing::{info, warn};

use super::BackendError;
use crate::bus::ScopeQueue;
use crate::config::CustomConfig;
use crate::error::{DiscoveryError, Result};
use crate::model::{jmx_service_url, realms, Labels, NodeId, NodeType, Target};
use crate::topology::{Scope, Topology};

const JMX_URL_PREFIX: &str = "service:jmx:";

/// Body of a custom target registration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomTargetRequest {
    /// A JMX service URL, any absolute URI, or `host:port`.
    pub connect_url: String,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub labels: Labels,
    #[serde(default)]
    pub annotations: Labels,
}

/// Expand `host:port` into a JMX service URL; accept any other absolute URI
/// unchanged.
pub fn expand_connect_url(raw: &str) -> Result<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(DiscoveryError::InvalidArgument(
            "connect URL must not be blank".to_string(),
        ));
    }
    if let Some((host, port)) = shorthand(raw) {
        let port: u16 = port.parse().map_err(|_| {
            DiscoveryError::InvalidArgument(format!("port out of range in {}", raw))
        })?;
        return Ok(jmx_service_url(host, port));
    }
    if raw.starts_with(JMX_URL_PREFIX) {
        return Ok(raw.to_string());
    }
    let uri: http::Uri = raw
        .parse()
        .map_err(|e| DiscoveryError::InvalidArgument(format!("invalid connect URL {}: {}", raw, e)))?;
    if uri.scheme().is_none() {
        return Err(DiscoveryError::InvalidArgument(format!(
            "connect URL {} is not absolute",
            raw
        )));
    }
    Ok(raw.to_string())
}

/// Split a bare `host:port` authority (IPv6 hosts bracketed) into its parts.
fn shorthand(raw: &str) -> Option<(&str, &str)> {
    let authority: Authority = raw.parse().ok()?;
    if authority.as_str().contains('@') {
        return None;
    }
    let host = authority.host();
    let port = raw.strip_prefix(host)?.strip_prefix(':')?;
    let numeric = !host.is_empty() && !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit());
    numeric.then(|| (&raw[..host.len()], port))
}

#[derive(Clone)]
pub struct CustomTargets {
    topology: Topology,
    queue: ScopeQueue,
    enabled: bool,
}

impl CustomTargets {
    pub fn new(topology: Topology, queue: ScopeQueue, config: &CustomConfig) -> Self {
        Self {
            topology,
            queue,
            enabled: config.enabled,
        }
    }

    fn scope() -> Scope {
        Scope::realm(realms::CUSTOM)
    }

    fn ensure_enabled(&self) -> Result<()> {
        if self.enabled {
            Ok(())
        } else {
            Err(DiscoveryError::Forbidden(
                "custom targets are disabled".to_string(),
            ))
        }
    }

    async fn on_scope<T, F>(&self, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.queue
            .run(&Self::scope().key(), fut)
            .await
            .map_err(|e| DiscoveryError::Backend(BackendError::Unavailable(e.to_string())))?
    }

    /// Validate and attach a target. Returns its leaf node id and the stored
    /// target, with the JVM id when it resolved in time.
    pub async fn create(&self, request: CustomTargetRequest) -> Result<(NodeId, Target)> {
        self.ensure_enabled()?;
        let connect_url = expand_connect_url(&request.connect_url)?;
        let alias = request
            .alias
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty())
            .unwrap_or_else(|| connect_url.clone());
        let target = Target::new(connect_url, alias)
            .with_labels(request.labels)
            .with_platform_annotations(request.annotations)
            .with_annotation(crate::model::annotation_keys::REALM, realms::CUSTOM);

        if let Err(reason) = self.topology.resolver().validate(&target).await {
            warn!(target = %target.connect_url, reason = %reason, "custom target rejected");
            return Err(DiscoveryError::InvalidArgument(format!(
                "cannot connect to {}: {}",
                target.connect_url, reason
            )));
        }

        let node_type = if target.connect_url.starts_with("http") {
            NodeType::Agent
        } else {
            NodeType::Jvm
        };
        let topology = self.topology.clone();
        let (id, target) = self
            .on_scope(async move {
                let mut tx = topology.begin().await?;
                if tx.txn().node_by_url(&target.connect_url).await?.is_some() {
                    return Err(DiscoveryError::Conflict(format!(
                        "target {} already exists",
                        target.connect_url
                    )));
                }
                if tx.txn().node_by_alias(&target.alias).await?.is_some() {
                    return Err(DiscoveryError::Conflict(format!(
                        "alias {} is already in use",
                        target.alias
                    )));
                }
                let realm = tx.ensure_realm(realms::CUSTOM).await?;
                let node = tx
                    .attach_target(realm.id, target.clone(), node_type, realms::CUSTOM)
                    .await?;
                topology.commit(tx).await?;
                Ok((node.id, target))
            })
            .await?;
        info!(target = %target.connect_url, alias = %target.alias, "custom target created");

        let resolved = self
            .topology
            .backfill_jvm_ids(realms::CUSTOM, std::slice::from_ref(&target))
            .await;
        Ok((id, resolved.into_iter().next().unwrap_or(target)))
    }

    /// Remove a custom target by its leaf node id.
    pub async fn delete(&self, id: NodeId) -> Result<Target> {
        self.ensure_enabled()?;
        let topology = self.topology.clone();
        let target = self
            .on_scope(async move {
                let mut tx = topology.begin().await?;
                let realm = tx.realm(realms::CUSTOM).await?;
                let node = tx.txn().node(id).await?;
                let (Some(realm), Some(node)) = (realm, node) else {
                    return Err(DiscoveryError::NotFound(format!("custom target {}", id)));
                };
                let Some(target) = node.target.clone() else {
                    return Err(DiscoveryError::NotFound(format!("custom target {}", id)));
                };
                if node.parent != Some(realm.id) {
                    return Err(DiscoveryError::NotFound(format!("custom target {}", id)));
                }
                tx.detach_target(&node, realms::CUSTOM).await?;
                topology.commit(tx).await?;
                Ok(target)
            })
            .await?;
        info!(target = %target.connect_url, "custom target deleted");
        Ok(target)
    }

    /// Targets under the custom realm.
    pub async fn list(&self) -> Result<Vec<(NodeId, Target)>> {
        let mut tx = self.topology.begin().await?;
        let Some(realm) = tx.realm(realms::CUSTOM).await? else {
            return Ok(Vec::new());
        };
        let mut out: Vec<(NodeId, Target)> = tx
            .txn()
            .children(realm.id)
            .await?
            .into_iter()
            .filter_map(|n| n.target.map(|t| (n.id, t)))
            .collect();
        out.sort_by(|a, b| a.1.alias.cmp(&b.1.alias));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::bus::{EventBus, EventKind};
    use crate::connection::StaticJvmIdResolver;
    use crate::storage::memory::MemoryTopologyStore;

    fn custom(resolver: StaticJvmIdResolver) -> (CustomTargets, EventBus) {
        let bus = EventBus::new();
        let topology = Topology::new(Arc::new(MemoryTopologyStore::new()), bus.clone())
            .with_resolver(Arc::new(resolver), Duration::from_secs(1));
        let targets = CustomTargets::new(topology, ScopeQueue::new(), &CustomConfig { enabled: true });
        (targets, bus)
    }

    fn request(url: &str, alias: &str) -> CustomTargetRequest {
        CustomTargetRequest {
            connect_url: url.to_string(),
            alias: Some(alias.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_expand_connect_url() {
        assert_eq!(
            expand_connect_url("localhost:9091").unwrap(),
            "service:jmx:rmi:///jndi/rmi://localhost:9091/jmxrmi"
        );
        let url = "service:jmx:rmi:///jndi/rmi://h:1/jmxrmi";
        assert_eq!(expand_connect_url(url).unwrap(), url);
        assert_eq!(expand_connect_url("http://agent:8080/").unwrap(), "http://agent:8080/");
        assert!(expand_connect_url("").is_err());
        assert!(expand_connect_url("host:99999").is_err());
        assert!(expand_connect_url("not a url").is_err());
        assert!(expand_connect_url("localhost").is_err());
    }

    #[test]
    fn test_expand_ipv6_shorthand() {
        assert_eq!(
            expand_connect_url("[::1]:9091").unwrap(),
            "service:jmx:rmi:///jndi/rmi://[::1]:9091/jmxrmi"
        );
        assert_eq!(
            expand_connect_url("10.0.0.7:9091").unwrap(),
            "service:jmx:rmi:///jndi/rmi://10.0.0.7:9091/jmxrmi"
        );
    }

    #[tokio::test]
    async fn test_create_attaches_under_custom_realm() {
        let resolver = StaticJvmIdResolver::new();
        resolver
            .insert("service:jmx:rmi:///jndi/rmi://app:9091/jmxrmi", "jvm-1")
            .await;
        let (custom, bus) = custom(resolver);
        let mut events = bus.receiver();

        let (id, target) = custom.create(request("app:9091", "app")).await.unwrap();
        assert_eq!(target.jvm_id.as_deref(), Some("jvm-1"));

        let listed = custom.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].0, id);

        assert_eq!(events.recv().await.unwrap().kind, EventKind::Found);
        assert_eq!(events.recv().await.unwrap().kind, EventKind::Modified);
    }

    #[tokio::test]
    async fn test_duplicate_url_and_alias_conflict() {
        let (custom, _bus) = custom(StaticJvmIdResolver::new());
        custom.create(request("a:1", "a")).await.unwrap();

        let err = custom.create(request("a:1", "other")).await.unwrap_err();
        assert!(matches!(err, DiscoveryError::Conflict(_)));
        let err = custom.create(request("b:1", "a")).await.unwrap_err();
        assert!(matches!(err, DiscoveryError::Conflict(_)));
        assert_eq!(custom.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_target_is_rejected() {
        let resolver = StaticJvmIdResolver::new();
        resolver
            .mark_unreachable("service:jmx:rmi:///jndi/rmi://down:9091/jmxrmi")
            .await;
        let (custom, _bus) = custom(resolver);

        let err = custom.create(request("down:9091", "down")).await.unwrap_err();
        assert!(matches!(err, DiscoveryError::InvalidArgument(_)));
        assert!(custom.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_emits_lost() {
        let (custom, bus) = custom(StaticJvmIdResolver::new());
        let (id, _) = custom.create(request("a:1", "a")).await.unwrap();
        let mut events = bus.receiver();

        let deleted = custom.delete(id).await.unwrap();
        assert_eq!(deleted.alias, "a");
        assert_eq!(events.recv().await.unwrap().kind, EventKind::Lost);
        assert!(custom.list().await.unwrap().is_empty());

        let err = custom.delete(id).await.unwrap_err();
        assert!(matches!(err, DiscoveryError::NotFound(_)));
    }
}
