//! Per-backend discovery configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Environment variable carrying the runtime directory of rootless podman.
pub const XDG_RUNTIME_DIR_ENV_VAR: &str = "XDG_RUNTIME_DIR";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub jdp: JdpConfig,
    pub podman: ContainerConfig,
    pub docker: ContainerConfig,
    pub kubernetes: KubernetesConfig,
    pub custom: CustomConfig,
}

/// Local multicast (JDP) listener.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JdpConfig {
    pub enabled: bool,
    pub group: String,
    pub port: u16,
    /// A JVM is lost after this many missed broadcast intervals.
    pub expiry_factor: u32,
}

impl Default for JdpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            group: "224.0.23.178".to_string(),
            port: 7095,
            expiry_factor: 3,
        }
    }
}

/// Container runtime socket poller. Shared by podman and docker.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    pub enabled: bool,
    /// Unix socket of the runtime API. Falls back to the runtime's
    /// well-known location when unset.
    pub socket_path: Option<PathBuf>,
    pub poll_period_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            socket_path: None,
            poll_period_secs: 10,
            request_timeout_secs: 5,
        }
    }
}

impl ContainerConfig {
    pub fn poll_period(&self) -> Duration {
        Duration::from_secs(self.poll_period_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    /// Configured socket, else `$XDG_RUNTIME_DIR/podman/podman.sock`.
    pub fn podman_socket(&self) -> PathBuf {
        self.socket_path.clone().unwrap_or_else(|| {
            let runtime_dir = std::env::var(XDG_RUNTIME_DIR_ENV_VAR)
                .unwrap_or_else(|_| "/run".to_string());
            PathBuf::from(runtime_dir).join("podman").join("podman.sock")
        })
    }

    /// Configured socket, else `/var/run/docker.sock`.
    pub fn docker_socket(&self) -> PathBuf {
        self.socket_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("/var/run/docker.sock"))
    }
}

/// Cluster API watcher.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KubernetesConfig {
    pub enabled: bool,
    /// Namespaces to watch. `*` watches all namespaces, `.` the namespace
    /// this process runs in.
    pub namespaces: Vec<String>,
    /// Endpoint port names that carry JMX.
    pub port_names: Vec<String>,
    /// Endpoint port numbers that carry JMX.
    pub port_numbers: Vec<u16>,
    pub resync_period_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            namespaces: vec![".".to_string()],
            port_names: vec!["jfr-jmx".to_string()],
            port_numbers: vec![9091],
            resync_period_secs: 30,
            request_timeout_secs: 10,
        }
    }
}

impl KubernetesConfig {
    pub fn resync_period(&self) -> Duration {
        Duration::from_secs(self.resync_period_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

/// Manually declared targets.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CustomConfig {
    pub enabled: bool,
}

impl Default for CustomConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}
