//! Owner lookups against the cluster API.

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::core::v1::{Pod, ReplicationController};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::NamespaceResourceScope;
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;

use crate::discovery::BackendError;
use crate::topology::{OwnedObject, OwnerLookup, OwnerRef};

/// Reads workload metadata with typed, namespaced GETs.
pub struct KubeOwnerLookup {
    client: Client,
    timeout: Duration,
}

impl KubeOwnerLookup {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    async fn meta<K>(&self, namespace: &str, name: &str) -> Result<Option<ObjectMeta>, BackendError>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let object = tokio::time::timeout(self.timeout, api.get_opt(name))
            .await
            .map_err(|_| BackendError::Timeout(format!("get {} {}/{}", K::kind(&()), namespace, name)))??;
        Ok(object.map(|o| o.meta().clone()))
    }
}

#[async_trait]
impl OwnerLookup for KubeOwnerLookup {
    async fn lookup(
        &self,
        namespace: &str,
        owner: &OwnerRef,
    ) -> Result<Option<OwnedObject>, BackendError> {
        let name = owner.name.as_str();
        let meta = match owner.kind.as_str() {
            "Pod" => self.meta::<Pod>(namespace, name).await?,
            "ReplicaSet" => self.meta::<ReplicaSet>(namespace, name).await?,
            "Deployment" => self.meta::<Deployment>(namespace, name).await?,
            "StatefulSet" => self.meta::<StatefulSet>(namespace, name).await?,
            "DaemonSet" => self.meta::<DaemonSet>(namespace, name).await?,
            "ReplicationController" => {
                self.meta::<ReplicationController>(namespace, name).await?
            }
            _ => return Ok(None),
        };
        Ok(meta.map(|meta| OwnedObject {
            kind: owner.kind.clone(),
            name: meta.name.clone().unwrap_or_else(|| owner.name.clone()),
            labels: meta.labels.clone().unwrap_or_default(),
            owner: controlling_owner(meta.owner_references.as_deref().unwrap_or_default()),
        }))
    }
}

/// The controller reference if one is marked, else the first reference.
pub fn controlling_owner(refs: &[OwnerReference]) -> Option<OwnerRef> {
    refs.iter()
        .find(|r| r.controller == Some(true))
        .or_else(|| refs.first())
        .map(|r| OwnerRef::new(r.kind.clone(), r.name.clone()))
}
