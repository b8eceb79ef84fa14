//! Controller: event intake, periodic resync, and the worker pool.

use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use warpfleet_state::ChangeEvent;

use crate::cancel::Cancellation;
use crate::directory::{ClusterDirectory, UpgradeGroupStore};
use crate::notifier;
use crate::queue::WorkQueue;
use crate::reconciler::{Action, Reconciler};

pub struct Controller<D, S> {
    reconciler: Arc<Reconciler<D, S>>,
    queue: Arc<WorkQueue>,
}

impl<D, S> Controller<D, S>
where
    D: ClusterDirectory + 'static,
    S: UpgradeGroupStore + 'static,
{
    pub fn new(reconciler: Reconciler<D, S>) -> Self {
        let config = reconciler.config();
        let queue = WorkQueue::new(config.backoff_base(), config.backoff_max());
        Self {
            reconciler: Arc::new(reconciler),
            queue,
        }
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    /// Run until `shutdown` turns true or the event channel closes.
    ///
    /// Every upgrade group is enqueued on start and on every resync tick.
    /// In-flight reconciles see the shutdown through their cancellation and
    /// are awaited before this returns.
    pub async fn run(
        self,
        mut events: broadcast::Receiver<ChangeEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let config = self.reconciler.config().clone();
        info!(workers = config.workers, "rollout controller starting");

        let mut workers = JoinSet::new();
        for id in 0..config.workers {
            let reconciler = Arc::clone(&self.reconciler);
            let queue = Arc::clone(&self.queue);
            let shutdown = shutdown.clone();
            workers.spawn(async move {
                run_worker(id, reconciler, queue, shutdown).await;
            });
        }

        let mut resync = tokio::time::interval(config.resync_interval());
        loop {
            tokio::select! {
                _ = resync.tick() => {
                    self.enqueue_all().await;
                }
                received = events.recv() => match received {
                    Ok(event) => self.enqueue_affected(event).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "change events dropped, resyncing");
                        self.enqueue_all().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("change event channel closed");
                        break;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("shutdown requested");
                        break;
                    }
                }
            }
        }

        self.queue.shut_down();
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "worker task failed");
            }
        }
        info!("rollout controller stopped");
    }

    async fn enqueue_all(&self) {
        let reconciler = Arc::clone(&self.reconciler);
        let listed =
            tokio::task::spawn_blocking(move || reconciler.groups().list_upgrade_groups(None))
                .await;
        match listed {
            Ok(Ok(groups)) => {
                debug!(count = groups.len(), "resync");
                for group in &groups {
                    self.queue.add(&group.metadata.key());
                }
            }
            Ok(Err(e)) => error!(error = %e, "failed to list upgrade groups"),
            Err(e) => error!(error = %e, "resync task failed"),
        }
    }

    async fn enqueue_affected(&self, event: ChangeEvent) {
        let reconciler = Arc::clone(&self.reconciler);
        let mapped = tokio::task::spawn_blocking(move || {
            notifier::affected_groups(&event, reconciler.directory(), reconciler.groups())
        })
        .await;
        match mapped {
            Ok(Ok(keys)) => {
                for key in &keys {
                    self.queue.add(key);
                }
            }
            Ok(Err(e)) => {
                warn!(error = %e, "failed to map change event, resyncing");
                self.enqueue_all().await;
            }
            Err(e) => error!(error = %e, "event mapping task failed"),
        }
    }
}

async fn run_worker<D, S>(
    id: usize,
    reconciler: Arc<Reconciler<D, S>>,
    queue: Arc<WorkQueue>,
    shutdown: watch::Receiver<bool>,
) where
    D: ClusterDirectory + 'static,
    S: UpgradeGroupStore + 'static,
{
    debug!(worker = id, "worker started");
    let timeout = reconciler.config().reconcile_timeout();

    while let Some(key) = queue.get().await {
        let cancel = Cancellation::new(timeout, shutdown.clone());
        let task_reconciler = Arc::clone(&reconciler);
        let task_key = key.clone();
        let result =
            tokio::task::spawn_blocking(move || task_reconciler.reconcile(&task_key, &cancel))
                .await;

        match result {
            Ok(Ok(Action::AwaitChange)) => queue.forget(&key),
            Ok(Ok(Action::Requeue(delay))) => {
                queue.forget(&key);
                queue.add_after(&key, delay);
            }
            Ok(Err(e)) if e.is_cancelled() && *shutdown.borrow() => {
                debug!(group = %key, "reconcile cancelled by shutdown");
            }
            Ok(Err(e)) => {
                let delay = queue.add_rate_limited(&key);
                warn!(
                    group = %key,
                    error = %e,
                    retry_ms = delay.as_millis() as u64,
                    "reconcile failed"
                );
            }
            Err(e) => {
                let delay = queue.add_rate_limited(&key);
                error!(
                    group = %key,
                    error = %e,
                    retry_ms = delay.as_millis() as u64,
                    "reconcile task panicked"
                );
            }
        }
        queue.done(&key);
    }
    debug!(worker = id, "worker stopped");
}
