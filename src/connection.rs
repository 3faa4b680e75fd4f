//! Seam to the connection layer that opens management connections to
//! targets.
//!
//! The discovery engine only needs one thing from it: the JVM id of a newly
//! found target. Resolution is best-effort; `None` leaves the id unset.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::model::Target;

/// Resolves the JVM identifier of a target.
#[async_trait]
pub trait JvmIdResolver: Send + Sync + 'static {
    async fn jvm_id(&self, target: &Target) -> Option<String>;

    /// Check that the target accepts connections at all. Custom targets are
    /// admitted only when this succeeds.
    async fn validate(&self, target: &Target) -> Result<(), String> {
        let _ = target;
        Ok(())
    }
}

/// Resolver for deployments without a connection layer: never resolves an
/// id and admits every target.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopJvmIdResolver;

#[async_trait]
impl JvmIdResolver for NoopJvmIdResolver {
    async fn jvm_id(&self, _target: &Target) -> Option<String> {
        None
    }
}

/// Fixed table of ids keyed by connect URL. URLs listed in `unreachable`
/// fail validation.
#[derive(Debug, Default, Clone)]
pub struct StaticJvmIdResolver {
    ids: Arc<RwLock<HashMap<String, String>>>,
    unreachable: Arc<RwLock<Vec<String>>>,
}

impl StaticJvmIdResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, connect_url: impl Into<String>, jvm_id: impl Into<String>) {
        self.ids
            .write()
            .await
            .insert(connect_url.into(), jvm_id.into());
    }

    pub async fn mark_unreachable(&self, connect_url: impl Into<String>) {
        self.unreachable.write().await.push(connect_url.into());
    }
}

#[async_trait]
impl JvmIdResolver for StaticJvmIdResolver {
    async fn jvm_id(&self, target: &Target) -> Option<String> {
        self.ids.read().await.get(&target.connect_url).cloned()
    }

    async fn validate(&self, target: &Target) -> Result<(), String> {
        if self
            .unreachable
            .read()
            .await
            .iter()
            .any(|u| *u == target.connect_url)
        {
            return Err(format!("{} is not reachable", target.connect_url));
        }
        Ok(())
    }
}

/// Resolve with a deadline. A timeout counts as "no id".
pub async fn resolve_with_timeout(
    resolver: &dyn JvmIdResolver,
    target: &Target,
    timeout: Duration,
) -> Option<String> {
    match tokio::time::timeout(timeout, resolver.jvm_id(target)).await {
        Ok(id) => id,
        Err(_) => {
            debug!(target = %target.connect_url, "jvm id resolution timed out");
            None
        }
    }
}
