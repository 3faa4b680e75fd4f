//! Discovery event bus.
//!
//! This module contains:
//! - `DiscoveryEvent`: FOUND / MODIFIED / LOST notification for one target
//! - `EventBus`: in-process fan-out over a tokio broadcast channel
//! - `EventHandler` trait: for reacting to committed events
//! - `scoped::ScopeQueue`: ordered per-scope execution of reconciliation work

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::model::{NodeId, Target};

pub mod scoped;

pub use scoped::{ScopeClosed, ScopeQueue};

/// Channel capacity for broadcast.
const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Found,
    Modified,
    Lost,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Found => "FOUND",
            EventKind::Modified => "MODIFIED",
            EventKind::Lost => "LOST",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A committed change to one target.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryEvent {
    pub kind: EventKind,
    /// Name of the realm the target lives (or lived) in.
    pub realm: String,
    /// Leaf node that wraps (or wrapped) the target.
    pub node_id: NodeId,
    pub target: Target,
}

/// Handler for processing events from the bus.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: Arc<DiscoveryEvent>) -> BoxFuture<'static, ()>;
}

/// In-memory event bus using a tokio broadcast channel.
///
/// Only committed events are published. Delivery is best-effort: a
/// subscriber that falls more than `CHANNEL_CAPACITY` events behind skips
/// the oldest ones.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Arc<DiscoveryEvent>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Publish to all current subscribers. Having none is not an error.
    pub fn publish(&self, event: DiscoveryEvent) {
        let kind = event.kind;
        let url = event.target.connect_url.clone();
        match self.sender.send(Arc::new(event)) {
            Ok(receivers) => {
                debug!(kind = %kind, target = %url, receivers, "published discovery event")
            }
            Err(_) => debug!(kind = %kind, target = %url, "no subscribers for discovery event"),
        }
    }

    /// Raw receiver, for callers that drive the channel themselves.
    pub fn receiver(&self) -> broadcast::Receiver<Arc<DiscoveryEvent>> {
        self.sender.subscribe()
    }

    /// Spawn a consumer task delivering every event to `handler`, in
    /// publish order. `realm` restricts delivery to one realm.
    pub fn subscribe(
        &self,
        realm: Option<String>,
        handler: Box<dyn EventHandler>,
    ) -> JoinHandle<()> {
        let mut receiver = self.sender.subscribe();
        info!(realm = ?realm, "discovery event consumer started");

        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => {
                        if realm.as_deref().is_some_and(|r| r != event.realm) {
                            continue;
                        }
                        handler.handle(event).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        error!(skipped = n, "discovery event consumer lagged, skipped events");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("event bus closed, stopping consumer");
                        break;
                    }
                }
            }
        })
    }
}

/// Logs every event. Stands in for the notification fan-out.
pub struct LoggingEventHandler;

impl EventHandler for LoggingEventHandler {
    fn handle(&self, event: Arc<DiscoveryEvent>) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            info!(
                kind = %event.kind,
                realm = %event.realm,
                target = %event.target.connect_url,
                alias = %event.target.alias,
                jvm_id = ?event.target.jvm_id,
                "discovery event"
            );
        })
    }
}
