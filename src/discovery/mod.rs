//! Discovery backends.
//!
//! Each backend observes one environment and describes what it sees for a
//! scope as a `ChainForest`. The generic `DiscoveryDriver` decides when to
//! observe (poll ticks, environment notifications) and funnels every
//! observation through the per-scope queue into `topology::reconcile`.
//!
//! Backends:
//! - `jdp::JdpBackend`: JDP multicast announcements
//! - `container::ContainerBackend`: podman / docker API over a Unix socket
//! - `k8s::KubeBackend`: Endpoints in watched namespaces (feature `k8s`)
//!
//! Custom targets and plugins are not polled; see `custom` and
//! `crate::plugins`.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::topology::{ChainForest, Scope};

pub mod container;
pub mod custom;
pub mod driver;
pub mod jdp;
#[cfg(feature = "k8s")]
pub mod k8s;

pub use driver::DiscoveryDriver;

/// Failure to observe an environment. Never turns into LOST events.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("environment unavailable: {0}")]
    Unavailable(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[cfg(feature = "k8s")]
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Handle through which a backend asks for one of its scopes to be
/// reconciled. Requests for a scope that is already waiting are coalesced.
#[derive(Debug, Clone)]
pub struct ReconcileTrigger {
    tx: mpsc::UnboundedSender<Scope>,
}

impl ReconcileTrigger {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Scope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Returns false once the driver has stopped.
    pub fn request(&self, scope: Scope) -> bool {
        self.tx.send(scope).is_ok()
    }
}

/// One discovery source.
#[async_trait]
pub trait DiscoveryBackend: Send + Sync + 'static {
    /// Realm this backend's targets live under.
    fn realm(&self) -> &str;

    /// Configuration gate.
    fn enabled(&self) -> bool;

    /// Environment precondition, e.g. a socket file or reachable API.
    async fn available(&self) -> bool;

    /// Period of full reconciliations over `scopes()`. `None` for backends
    /// driven only by `start` notifications.
    fn poll_period(&self) -> Option<Duration>;

    /// Every scope this backend currently owns.
    async fn scopes(&self) -> Vec<Scope>;

    /// Current view of one scope. Performs no store access.
    async fn observe(&self, scope: &Scope) -> Result<ChainForest, BackendError>;

    /// Start environment watches that call `trigger` on change. They must
    /// end when `cancel` fires.
    async fn start(
        &self,
        _trigger: ReconcileTrigger,
        _cancel: CancellationToken,
    ) -> Result<(), BackendError> {
        Ok(())
    }

    /// Release resources after the driver loop ends.
    async fn stop(&self) {}
}
