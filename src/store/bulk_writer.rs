//! Bounded-concurrency bulk writer.
//!
//! Every store write a run produces flows through one of these. The writer
//! is owned by exactly one worker invocation; [`BulkWriter::close`] is a
//! barrier that must complete before the terminal run status is written so
//! the persisted counters reflect actual commits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::ErrorCode;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::warn;

use super::models::{Company, JobRecord};
use super::TenantStore;
use crate::ingest::{ErrorSamples, RunCounters};

/// Default bound on concurrent store writes per worker.
pub const JOB_WRITE_CONCURRENCY: usize = 25;

/// Attempts per write before the failure is surfaced to the run.
pub const WRITE_RETRY_ATTEMPTS: u32 = 5;

const RETRY_BASE: Duration = Duration::from_millis(50);

/// One unit of work for the writer.
pub enum WriteOp {
    /// Create-or-merge of a job document. `exists` carries the upsert
    /// engine's batched-read verdict; a create that loses the race to a
    /// concurrent run falls back to a merge and counts as updated.
    Job { record: JobRecord, exists: bool },
    Company(Company),
}

pub struct BulkWriter {
    store: Arc<dyn TenantStore>,
    tenant_id: String,
    reset_saved: bool,
    semaphore: Arc<Semaphore>,
    counters: Arc<RunCounters>,
    samples: Arc<ErrorSamples>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl BulkWriter {
    pub fn new(
        store: Arc<dyn TenantStore>,
        tenant_id: &str,
        concurrency: usize,
        reset_saved: bool,
        counters: Arc<RunCounters>,
        samples: Arc<ErrorSamples>,
    ) -> Self {
        Self {
            store,
            tenant_id: tenant_id.to_string(),
            reset_saved,
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
            counters,
            samples,
            handles: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Queue one write. Returns immediately; the write happens on a spawned
    /// task once a concurrency permit is available.
    pub fn submit(&self, op: WriteOp) {
        if self.closed.load(Ordering::SeqCst) {
            warn!("Write submitted after close; dropping");
            return;
        }

        let store = Arc::clone(&self.store);
        let tenant_id = self.tenant_id.clone();
        let reset_saved = self.reset_saved;
        let semaphore = Arc::clone(&self.semaphore);
        let counters = Arc::clone(&self.counters);
        let samples = Arc::clone(&self.samples);

        let handle = tokio::spawn(async move {
            let _permit = semaphore.acquire().await.expect("writer semaphore closed");
            perform_with_retry(&*store, &tenant_id, reset_saved, op, &counters, &samples).await;
        });

        self.handles.lock().unwrap().push(handle);
    }

    /// Flush barrier: waits for every queued write to commit or fail.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock().unwrap());
        for handle in handles {
            let _ = handle.await;
        }
    }
}

async fn perform_with_retry(
    store: &dyn TenantStore,
    tenant_id: &str,
    reset_saved: bool,
    op: WriteOp,
    counters: &RunCounters,
    samples: &ErrorSamples,
) {
    let now = chrono::Utc::now().timestamp();
    let mut attempt: u32 = 0;

    loop {
        let result = match &op {
            WriteOp::Job { record, exists } => {
                if *exists {
                    store
                        .merge_job(tenant_id, record, now, reset_saved)
                        .map(|_| JobWrite::Updated)
                } else {
                    match store.try_create_job(tenant_id, record, now) {
                        Ok(true) => Ok(JobWrite::Added),
                        // Lost the create race to a concurrent run.
                        Ok(false) => store
                            .merge_job(tenant_id, record, now, reset_saved)
                            .map(|_| JobWrite::Updated),
                        Err(e) => Err(e),
                    }
                }
            }
            WriteOp::Company(company) => store
                .upsert_company(tenant_id, company)
                .map(|_| JobWrite::Other),
        };

        match result {
            Ok(JobWrite::Added) => {
                counters.incr_added();
                return;
            }
            Ok(JobWrite::Updated) => {
                counters.incr_updated();
                return;
            }
            Ok(JobWrite::Other) => return,
            Err(e) => {
                attempt += 1;
                if is_transient(&e) && attempt < WRITE_RETRY_ATTEMPTS {
                    let backoff = RETRY_BASE * 2u32.pow(attempt - 1);
                    tokio::time::sleep(backoff).await;
                    continue;
                }

                let url = match &op {
                    WriteOp::Job { record, .. } => record
                        .canonical_url
                        .clone()
                        .unwrap_or_else(|| record.doc_id()),
                    WriteOp::Company(company) => company.url.clone(),
                };
                warn!(url = %url, attempts = attempt, error = %e, "Store write failed");
                counters.incr_errors();
                samples.record(&url, &format!("write failed: {}", e));
                return;
            }
        }
    }
}

enum JobWrite {
    Added,
    Updated,
    Other,
}

/// Whether a store error is worth retrying.
///
/// The sqlite equivalents of the transient classes: a busy or locked
/// database. Constraint and type errors are permanent and fail the write.
fn is_transient(error: &anyhow::Error) -> bool {
    match error.downcast_ref::<rusqlite::Error>() {
        Some(rusqlite::Error::SqliteFailure(e, _)) => {
            matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
        }
        _ => false,
    }
}
