//! Ordered, per-scope execution.
//!
//! Work submitted for the same scope key runs one job at a time in
//! submission order. Different scope keys each get their own worker task
//! and run in parallel.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

type Job = BoxFuture<'static, ()>;

/// The scope's worker is gone. Only happens while shutting down.
#[derive(Debug, Clone, thiserror::Error)]
#[error("scope worker for {0} is closed")]
pub struct ScopeClosed(pub String);

struct ScopeWorker {
    jobs: mpsc::UnboundedSender<Job>,
    /// A coalesced job is queued and has not started yet.
    pending: Arc<AtomicBool>,
}

#[derive(Default, Clone)]
pub struct ScopeQueue {
    workers: Arc<Mutex<HashMap<String, ScopeWorker>>>,
}

impl ScopeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn spawn_worker(scope: &str) -> ScopeWorker {
        let (jobs, mut rx) = mpsc::unbounded_channel::<Job>();
        let name = scope.to_string();
        tokio::spawn(async move {
            debug!(scope = %name, "scope worker started");
            while let Some(job) = rx.recv().await {
                job.await;
            }
            debug!(scope = %name, "scope worker stopped");
        });
        ScopeWorker {
            jobs,
            pending: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Enqueue a job, replacing a worker whose task has died.
    fn enqueue(&self, scope: &str, make: impl FnOnce(Arc<AtomicBool>) -> Option<Job>) -> bool {
        let mut workers = match self.workers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let worker = workers
            .entry(scope.to_string())
            .or_insert_with(|| Self::spawn_worker(scope));
        if worker.jobs.is_closed() {
            *worker = Self::spawn_worker(scope);
        }
        match make(Arc::clone(&worker.pending)) {
            Some(job) => worker.jobs.send(job).is_ok(),
            None => false,
        }
    }

    /// Run `fut` on the scope's worker and wait for its result.
    pub async fn run<T, F>(&self, scope: &str, fut: F) -> Result<T, ScopeClosed>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::pin(async move {
            let _ = tx.send(fut.await);
        });
        if !self.enqueue(scope, |_| Some(job)) {
            return Err(ScopeClosed(scope.to_string()));
        }
        rx.await.map_err(|_| ScopeClosed(scope.to_string()))
    }

    /// Queue `fut` unless a coalesced job for this scope is already waiting
    /// to start. A job that is already running does not absorb new
    /// submissions, so a change observed mid-run is never lost.
    ///
    /// Returns whether a new job was queued.
    pub fn submit_coalesced<F>(&self, scope: &str, fut: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.enqueue(scope, move |pending| {
            if pending.swap(true, Ordering::SeqCst) {
                return None;
            }
            let job: Job = Box::pin(async move {
                pending.store(false, Ordering::SeqCst);
                fut.await;
            });
            Some(job)
        })
    }

    /// Known scope keys.
    pub fn scopes(&self) -> Vec<String> {
        match self.workers.lock() {
            Ok(guard) => guard.keys().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().keys().cloned().collect(),
        }
    }
}
