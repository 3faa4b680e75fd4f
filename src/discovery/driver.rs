//! Generic reconciliation driver shared by every polled backend.

use std::future;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{DiscoveryBackend, ReconcileTrigger};
use crate::bus::ScopeQueue;
use crate::topology::{reconcile, ReconcileOutcome, Scope, Topology};

pub struct DiscoveryDriver {
    topology: Topology,
    queue: ScopeQueue,
    cancel: CancellationToken,
}

impl DiscoveryDriver {
    pub fn new(topology: Topology, queue: ScopeQueue, cancel: CancellationToken) -> Self {
        Self {
            topology,
            queue,
            cancel,
        }
    }

    /// Start the loop for `backend`. Returns `None` when the backend is
    /// disabled or its environment is unavailable; it then stays idle.
    pub async fn spawn(&self, backend: Arc<dyn DiscoveryBackend>) -> Option<JoinHandle<()>> {
        let realm = backend.realm().to_string();
        if !backend.enabled() {
            info!(realm = %realm, "discovery backend disabled");
            return None;
        }
        if !backend.available().await {
            warn!(realm = %realm, "discovery backend environment unavailable, staying idle");
            return None;
        }

        let (trigger, mut requests) = ReconcileTrigger::channel();
        if let Err(e) = backend.start(trigger, self.cancel.child_token()).await {
            warn!(realm = %realm, error = %e, "discovery backend failed to start");
            return None;
        }
        info!(realm = %realm, poll_period = ?backend.poll_period(), "discovery backend started");

        let topology = self.topology.clone();
        let queue = self.queue.clone();
        let cancel = self.cancel.clone();

        Some(tokio::spawn(async move {
            let mut ticker = backend.poll_period().map(|period| {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                interval
            });

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    Some(scope) = requests.recv() => {
                        submit(&queue, &topology, &backend, scope);
                    }
                    _ = tick(&mut ticker) => {
                        for scope in backend.scopes().await {
                            submit(&queue, &topology, &backend, scope);
                        }
                    }
                }
            }

            backend.stop().await;
            info!(realm = %backend.realm(), "discovery backend stopped");
        }))
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => future::pending::<()>().await,
    }
}

fn submit(
    queue: &ScopeQueue,
    topology: &Topology,
    backend: &Arc<dyn DiscoveryBackend>,
    scope: Scope,
) {
    let key = scope.key();
    let topology = topology.clone();
    let backend = Arc::clone(backend);
    let queued = queue.submit_coalesced(&key, async move {
        let _ = run_cycle(&topology, backend.as_ref(), &scope).await;
    });
    if !queued {
        debug!(scope = %key, "reconciliation already pending, coalesced");
    }
}

/// Observe one scope and reconcile it. Observation failures skip the cycle
/// and leave the tree untouched; apply failures roll back and are retried
/// on the next cycle.
pub async fn run_cycle(
    topology: &Topology,
    backend: &dyn DiscoveryBackend,
    scope: &Scope,
) -> Option<ReconcileOutcome> {
    let forest = match backend.observe(scope).await {
        Ok(forest) => forest,
        Err(e) => {
            warn!(scope = %scope, error = %e, "observation failed, skipping cycle");
            return None;
        }
    };
    match reconcile(topology, scope, &forest).await {
        Ok(outcome) => Some(outcome),
        Err(e) => {
            error!(scope = %scope, error = %e, "reconciliation failed, will retry next cycle");
            None
        }
    }
}
