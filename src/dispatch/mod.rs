//! Run scheduling and dispatch.
//!
//! The scheduler decides when runs should happen, the durable queue carries
//! them, and the dispatcher turns claimed messages into worker invocations.

mod dispatcher;
mod queue;
mod scheduler;

pub use dispatcher::Dispatcher;
pub use queue::{LeaseSweep, QueuedRun, RunQueue, SqliteRunQueue};
pub use scheduler::Scheduler;

use anyhow::Result;

use crate::ingest::RunDescriptor;
use crate::store::{FetchRun, RunType, TenantStore};

/// Create a ledger entry in `enqueued` and push the matching message.
///
/// On queue failure the ledger entry moves to `enqueue_failed` and the error
/// is returned; the next scheduler tick will try again for that tenant with
/// a fresh run.
pub fn enqueue_run(
    store: &dyn TenantStore,
    queue: &dyn RunQueue,
    tenant_id: &str,
    run_type: RunType,
    max_attempts: u32,
) -> Result<RunDescriptor> {
    let now = chrono::Utc::now().timestamp();
    let run_id = uuid::Uuid::new_v4().to_string();

    let run = FetchRun::new_enqueued(run_id.clone(), run_type, now);
    store.insert_run(tenant_id, &run)?;

    let descriptor = RunDescriptor {
        tenant_id: tenant_id.to_string(),
        run_type,
        run_id: run_id.clone(),
    };

    if let Err(e) = queue.enqueue(&descriptor, max_attempts, now) {
        store.mark_run_enqueue_failed(tenant_id, &run_id, &e.to_string(), now)?;
        return Err(e);
    }

    Ok(descriptor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{RunStatus, SqliteTenantStore, Tenant};
    use std::sync::Arc;
    use tempfile::TempDir;

    struct FailingQueue;

    impl RunQueue for FailingQueue {
        fn enqueue(&self, _: &RunDescriptor, _: u32, _: i64) -> Result<i64> {
            anyhow::bail!("queue unavailable")
        }
        fn claim_next(&self, _: i64, _: i64) -> Result<Option<QueuedRun>> {
            Ok(None)
        }
        fn ack(&self, _: i64) -> Result<()> {
            Ok(())
        }
        fn nack_retry(&self, _: i64, _: i64, _: &str) -> Result<()> {
            Ok(())
        }
        fn release_expired_leases(&self, _: i64, _: i64) -> Result<LeaseSweep> {
            Ok(LeaseSweep::default())
        }
        fn pending_count(&self) -> Result<usize> {
            Ok(0)
        }
    }

    #[test]
    fn test_enqueue_failure_recorded_in_ledger() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SqliteTenantStore::new(dir.path().join("store.db")).unwrap());
        store
            .create_tenant(&Tenant {
                id: "t1".to_string(),
                display_name: "T1".to_string(),
                api_key_hash: "h".to_string(),
                created_at: 0,
            })
            .unwrap();

        let result = enqueue_run(store.as_ref(), &FailingQueue, "t1", RunType::Scheduled, 3);
        assert!(result.is_err());

        let runs = store.list_recent_runs("t1", 10).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::EnqueueFailed);
        assert!(runs[0].error.as_deref().unwrap().contains("queue unavailable"));
    }
}
