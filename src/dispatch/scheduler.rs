//! Periodic run scheduler.
//!
//! On every poll tick, enumerates tenants and enqueues one scheduled run
//! each under a bounded enqueue concurrency; a separate, less frequent tick
//! does the same for GC runs. A tenant whose enqueue fails gets the failure
//! recorded in its own ledger and never blocks the others.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::enqueue_run;
use super::queue::RunQueue;
use crate::config::{DispatcherSettings, SchedulerSettings};
use crate::store::{RunType, TenantStore};

pub struct Scheduler {
    store: Arc<dyn TenantStore>,
    queue: Arc<dyn RunQueue>,
    settings: SchedulerSettings,
    dispatcher_settings: DispatcherSettings,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn TenantStore>,
        queue: Arc<dyn RunQueue>,
        settings: SchedulerSettings,
        dispatcher_settings: DispatcherSettings,
    ) -> Self {
        Self {
            store,
            queue,
            settings,
            dispatcher_settings,
        }
    }

    /// Main scheduler loop; call from a spawned task.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            poll_interval_secs = self.settings.poll_interval.as_secs(),
            gc_interval_secs = self.settings.gc_interval.as_secs(),
            "Scheduler starting"
        );

        let mut poll_ticker = tokio::time::interval(self.settings.poll_interval);
        let mut gc_ticker = tokio::time::interval(self.settings.gc_interval);
        // Skip the immediate ticks; the first real runs happen one interval
        // after startup.
        poll_ticker.tick().await;
        gc_ticker.tick().await;

        loop {
            tokio::select! {
                _ = poll_ticker.tick() => {
                    self.enqueue_all(RunType::Scheduled).await;
                }
                _ = gc_ticker.tick() => {
                    self.enqueue_all(RunType::Gc).await;
                }
                _ = shutdown.cancelled() => {
                    info!("Scheduler shutting down");
                    break;
                }
            }
        }
    }

    /// Enqueue one run of `run_type` for every tenant.
    pub async fn enqueue_all(&self, run_type: RunType) {
        let tenant_ids = match self.store.list_tenant_ids() {
            Ok(ids) => ids,
            Err(e) => {
                error!(error = %e, "Failed to enumerate tenants");
                return;
            }
        };
        info!(
            tenants = tenant_ids.len(),
            run_type = run_type.as_str(),
            "Scheduler tick"
        );

        let max_attempts = self.dispatcher_settings.max_attempts;
        stream::iter(tenant_ids)
            .for_each_concurrent(self.settings.enqueue_concurrency.max(1), |tenant_id| {
                let store = Arc::clone(&self.store);
                let queue = Arc::clone(&self.queue);
                async move {
                    match enqueue_run(
                        store.as_ref(),
                        queue.as_ref(),
                        &tenant_id,
                        run_type,
                        max_attempts,
                    ) {
                        Ok(descriptor) => {
                            info!(
                                tenant = %tenant_id,
                                run_id = %descriptor.run_id,
                                run_type = run_type.as_str(),
                                "Run enqueued"
                            );
                        }
                        Err(e) => {
                            warn!(tenant = %tenant_id, error = %e, "Failed to enqueue run");
                        }
                    }
                }
            })
            .await;
    }
}
