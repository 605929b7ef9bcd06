//! Add-vs-update-vs-skip decisions for a batch of normalized postings.
//!
//! The engine performs exactly one batched existence read per batch and
//! routes every resulting write through the bulk writer. Postings without a
//! parseable freshness timestamp never reach the engine; the worker routes
//! them to `no_timestamp` beforehand.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use tracing::debug;

use super::RunCounters;
use crate::store::{BulkWriter, JobRecord, TenantStore, WriteOp};

pub struct UpsertEngine {
    store: Arc<dyn TenantStore>,
    counters: Arc<RunCounters>,
}

impl UpsertEngine {
    pub fn new(store: Arc<dyn TenantStore>, counters: Arc<RunCounters>) -> Self {
        Self { store, counters }
    }

    /// Upsert one feed's candidates.
    ///
    /// Decisions per posting:
    /// - absent from the batched read: create (race falls back to merge in
    ///   the writer and counts as updated);
    /// - present with stored freshness >= incoming: skipped, no write;
    /// - present and strictly older: merge write.
    ///
    /// Duplicate identities within the batch collapse to the first
    /// occurrence so a run writes each identity at most once.
    pub async fn upsert_batch(
        &self,
        tenant_id: &str,
        jobs: Vec<JobRecord>,
        writer: &BulkWriter,
    ) -> Result<()> {
        if jobs.is_empty() {
            return Ok(());
        }

        let mut seen: HashSet<String> = HashSet::with_capacity(jobs.len());
        let mut batch: Vec<JobRecord> = Vec::with_capacity(jobs.len());
        for job in jobs {
            if seen.insert(job.doc_id()) {
                batch.push(job);
            }
        }

        let doc_ids: Vec<String> = batch.iter().map(|j| j.doc_id()).collect();
        let existing = self.store.multi_get_job_freshness(tenant_id, &doc_ids)?;
        debug!(
            tenant = %tenant_id,
            batch = batch.len(),
            existing = existing.len(),
            "Upsert batch read"
        );

        for job in batch {
            match existing.get(&job.doc_id()) {
                None => writer.submit(WriteOp::Job {
                    record: job,
                    exists: false,
                }),
                Some(stored) => {
                    let prev = stored.unwrap_or(i64::MIN);
                    if job.source_updated_ms <= prev {
                        self.counters.incr_skipped_unchanged();
                    } else {
                        writer.submit(WriteOp::Job {
                            record: job,
                            exists: true,
                        });
                    }
                }
            }
        }

        Ok(())
    }
}
