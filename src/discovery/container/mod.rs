//! Container runtime backends.
//!
//! Podman and Docker expose the same list/inspect API shape over a Unix
//! socket and differ only in socket location and URL prefix. Only containers
//! labeled `io.cryostat.discovery=true` are listed.
//!
//! A container's target comes from its labels:
//! - `io.cryostat.jmxUrl`: full connect URL, used as is
//! - `io.cryostat.jmxHost` / `io.cryostat.jmxPort`: host and port; without
//!   a host label the container's own hostname is read by inspecting it
//!
//! Containers that belong to a pod are grouped under a Pod node.

pub mod client;

use std::collections::BTreeMap;
use std::os::unix::fs::FileTypeExt;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};
use url::form_urlencoded;

use self::client::SocketClient;
use super::{BackendError, DiscoveryBackend};
use crate::config::ContainerConfig;
use crate::model::{annotation_keys, jmx_service_url, realms, Labels, NodeType, Target};
use crate::topology::{ChainForest, Scope};

pub const DISCOVERY_LABEL: &str = "io.cryostat.discovery";
pub const JMX_URL_LABEL: &str = "io.cryostat.jmxUrl";
pub const JMX_HOST_LABEL: &str = "io.cryostat.jmxHost";
pub const JMX_PORT_LABEL: &str = "io.cryostat.jmxPort";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerRuntime {
    Podman,
    Docker,
}

impl ContainerRuntime {
    pub fn realm(&self) -> &'static str {
        match self {
            ContainerRuntime::Podman => realms::PODMAN,
            ContainerRuntime::Docker => realms::DOCKER,
        }
    }

    fn api_prefix(&self) -> &'static str {
        match self {
            ContainerRuntime::Podman => "/v3.0.0/libpod",
            ContainerRuntime::Docker => "/v1.41",
        }
    }

    pub fn list_uri(&self) -> String {
        let filter = format!(r#"{{"label":["{}=true"]}}"#, DISCOVERY_LABEL);
        let query = form_urlencoded::Serializer::new(String::new())
            .append_pair("filters", &filter)
            .finish();
        format!("{}/containers/json?{}", self.api_prefix(), query)
    }

    pub fn inspect_uri(&self, id: &str) -> String {
        format!("{}/containers/{}/json", self.api_prefix(), id)
    }
}

/// Entry of the container list response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerSummary {
    pub id: String,
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default)]
    pub labels: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub pod_name: Option<String>,
}

impl ContainerSummary {
    /// First name without Docker's leading slash, else the id.
    pub fn alias(&self) -> String {
        self.names
            .first()
            .map(|n| n.trim_start_matches('/').to_string())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| self.id.clone())
    }

    fn label(&self, key: &str) -> Option<&str> {
        self.labels
            .as_ref()
            .and_then(|l| l.get(key))
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ContainerInspect {
    #[serde(rename = "Config")]
    config: InspectConfig,
}

#[derive(Debug, Clone, Deserialize)]
struct InspectConfig {
    #[serde(rename = "Hostname", default)]
    hostname: String,
}

pub struct ContainerBackend {
    runtime: ContainerRuntime,
    config: ContainerConfig,
    client: SocketClient,
}

impl ContainerBackend {
    pub fn new(runtime: ContainerRuntime, config: ContainerConfig) -> Self {
        let socket = match runtime {
            ContainerRuntime::Podman => config.podman_socket(),
            ContainerRuntime::Docker => config.docker_socket(),
        };
        let client = SocketClient::new(socket, config.request_timeout());
        Self {
            runtime,
            config,
            client,
        }
    }

    pub fn socket(&self) -> PathBuf {
        self.client.path().to_path_buf()
    }

    /// Build the target for one container. `Ok(None)` when its labels do
    /// not describe a usable JMX endpoint.
    async fn target_for(&self, container: &ContainerSummary) -> Result<Option<Target>, BackendError> {
        let alias = container.alias();
        let mut target = if let Some(url) = container.label(JMX_URL_LABEL) {
            Target::new(url, alias.clone())
        } else {
            let Some(raw_port) = container.label(JMX_PORT_LABEL) else {
                debug!(container = %alias, "no JMX port label, ignoring container");
                return Ok(None);
            };
            let port: u16 = match raw_port.parse() {
                Ok(port) => port,
                Err(_) => {
                    warn!(container = %alias, port = %raw_port, "invalid JMX port label");
                    return Ok(None);
                }
            };
            let host = match container.label(JMX_HOST_LABEL) {
                Some(host) => host.to_string(),
                None => {
                    let inspect: ContainerInspect = self
                        .client
                        .get_json(&self.runtime.inspect_uri(&container.id))
                        .await?;
                    if inspect.config.hostname.is_empty() {
                        warn!(container = %alias, "container has no hostname");
                        return Ok(None);
                    }
                    inspect.config.hostname
                }
            };
            Target::new(jmx_service_url(&host, port), alias.clone())
                .with_annotation(annotation_keys::HOST, host)
                .with_annotation(annotation_keys::PORT, port.to_string())
        };

        target.labels = container.labels.clone().unwrap_or_default();
        target = target
            .with_annotation(annotation_keys::REALM, self.runtime.realm())
            .with_annotation(annotation_keys::CONTAINER_NAME, alias);
        if let Some(pod) = container.pod_name.as_deref().filter(|p| !p.is_empty()) {
            target = target.with_annotation(annotation_keys::POD_NAME, pod);
        }
        Ok(Some(target))
    }
}

#[async_trait]
impl DiscoveryBackend for ContainerBackend {
    fn realm(&self) -> &str {
        self.runtime.realm()
    }

    fn enabled(&self) -> bool {
        self.config.enabled
    }

    async fn available(&self) -> bool {
        match tokio::fs::metadata(self.client.path()).await {
            Ok(meta) => meta.file_type().is_socket(),
            Err(_) => false,
        }
    }

    fn poll_period(&self) -> Option<Duration> {
        Some(self.config.poll_period())
    }

    async fn scopes(&self) -> Vec<Scope> {
        vec![Scope::realm(self.runtime.realm())]
    }

    async fn observe(&self, _scope: &Scope) -> Result<ChainForest, BackendError> {
        let containers: Vec<ContainerSummary> =
            self.client.get_json(&self.runtime.list_uri()).await?;

        let mut forest = ChainForest::new();
        for container in &containers {
            let Some(target) = self.target_for(container).await? else {
                continue;
            };
            let parent = container
                .pod_name
                .as_deref()
                .filter(|p| !p.is_empty())
                .map(|pod| forest.environment(None, pod, NodeType::Pod, Labels::new()));
            forest.target(parent, target, NodeType::Jvm);
        }
        debug!(
            realm = %self.runtime.realm(),
            containers = containers.len(),
            targets = forest.leaves().count(),
            "observed containers"
        );
        Ok(forest)
    }
}
