//! Queue consumer.
//!
//! Polls the run queue, dispatches claimed messages to worker invocations
//! under a concurrency cap, and enforces the per-invocation deadline. A
//! worker that overruns its deadline is cancelled cooperatively and the run
//! ends in a terminal state either way; crashes are covered by lease expiry
//! and redelivery.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::queue::RunQueue;
use crate::config::DispatcherSettings;
use crate::ingest::IngestWorker;
use crate::store::{RunCounterSnapshot, RunStatus, TenantStore};

pub struct Dispatcher {
    queue: Arc<dyn RunQueue>,
    store: Arc<dyn TenantStore>,
    worker: Arc<IngestWorker>,
    settings: DispatcherSettings,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<dyn RunQueue>,
        store: Arc<dyn TenantStore>,
        worker: Arc<IngestWorker>,
        settings: DispatcherSettings,
    ) -> Self {
        Self {
            queue,
            store,
            worker,
            settings,
        }
    }

    /// Main dispatch loop; call from a spawned task.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            max_concurrent = self.settings.max_concurrent,
            "Dispatcher starting"
        );

        let semaphore = Arc::new(Semaphore::new(self.settings.max_concurrent.max(1)));
        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut ticker = tokio::time::interval(self.settings.poll_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    // Reap finished invocations without blocking the loop.
                    while tasks.try_join_next().is_some() {}
                    self.sweep_leases();
                    self.dispatch_available(&semaphore, &mut tasks, &shutdown);
                }
                _ = shutdown.cancelled() => {
                    info!("Dispatcher shutting down");
                    break;
                }
            }
        }

        // In-flight workers see the cancelled token, finish their terminal
        // writes, and ack.
        while tasks.join_next().await.is_some() {}
        info!("Dispatcher stopped");
    }

    fn sweep_leases(&self) {
        let now = now_secs();
        let retry_delay = self.settings.retry_backoff.as_secs() as i64;
        match self.queue.release_expired_leases(now, retry_delay) {
            Ok(sweep) => {
                if sweep.released > 0 {
                    warn!(count = sweep.released, "Released expired queue leases");
                }
                for descriptor in sweep.dead {
                    warn!(
                        tenant = %descriptor.tenant_id,
                        run_id = %descriptor.run_id,
                        "Run message dead-lettered"
                    );
                    // The worker never reached a terminal write; the ledger
                    // must not show the run in flight forever.
                    if let Err(e) = self.store.finish_run(
                        &descriptor.tenant_id,
                        &descriptor.run_id,
                        RunStatus::Failed,
                        &RunCounterSnapshot::default(),
                        &[],
                        0,
                        Some("delivery failed after all attempts"),
                        now,
                    ) {
                        error!(run_id = %descriptor.run_id, error = %e, "Failed to fail dead-lettered run");
                    }
                }
            }
            Err(e) => error!(error = %e, "Lease sweep failed"),
        }
    }

    fn dispatch_available(
        &self,
        semaphore: &Arc<Semaphore>,
        tasks: &mut JoinSet<()>,
        shutdown: &CancellationToken,
    ) {
        loop {
            if shutdown.is_cancelled() {
                return;
            }
            let Ok(permit) = Arc::clone(semaphore).try_acquire_owned() else {
                return;
            };

            let claimed = match self
                .queue
                .claim_next(now_secs(), self.settings.visibility_timeout.as_secs() as i64)
            {
                Ok(Some(claimed)) => claimed,
                Ok(None) => return,
                Err(e) => {
                    error!(error = %e, "Queue claim failed");
                    return;
                }
            };

            info!(
                tenant = %claimed.descriptor.tenant_id,
                run_id = %claimed.descriptor.run_id,
                attempt = claimed.attempt,
                "Dispatching run"
            );

            let queue = Arc::clone(&self.queue);
            let worker = Arc::clone(&self.worker);
            let worker_timeout = self.settings.worker_timeout;
            let shutdown = shutdown.clone();

            tasks.spawn(async move {
                let _permit = permit;
                let cancel = shutdown.child_token();

                // Deadline enforcement: cancel cooperatively, then let the
                // worker drain in-flight feeds and write its terminal state.
                let deadline = {
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(worker_timeout).await;
                        cancel.cancel();
                    })
                };

                let report = worker.run(&claimed.descriptor, cancel).await;
                deadline.abort();

                info!(
                    run_id = %report.run_id,
                    status = report.status.as_str(),
                    "Run delivery complete"
                );
                if let Err(e) = queue.ack(claimed.message_id) {
                    error!(run_id = %report.run_id, error = %e, "Failed to ack run message");
                }
            });
        }
    }
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}
