//! Retention sweeps.
//!
//! Prunes stale jobs, old run records, and companies that no feed has
//! touched recently. Deletes run in bounded loops: each pass removes at most
//! `batch_limit` documents and the loop stops as soon as a pass comes back
//! short, or at the safety cap.

use anyhow::{bail, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::GcSettings;
use crate::store::TenantStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct GcSummary {
    pub jobs_deleted: usize,
    pub runs_deleted: usize,
    pub companies_deleted: usize,
}

/// Run all retention sweeps for one tenant.
pub fn collect_tenant(
    store: &dyn TenantStore,
    tenant_id: &str,
    settings: &GcSettings,
    cancel: &CancellationToken,
) -> Result<GcSummary> {
    let now = chrono::Utc::now();
    let job_cutoff_ms = (now - settings.job_retention).timestamp_millis();
    let run_cutoff = (now - settings.run_retention).timestamp();
    let company_cutoff = (now - settings.company_retention).timestamp();

    let mut summary = GcSummary::default();

    summary.jobs_deleted = bounded_delete(settings, cancel, "jobs", |limit| {
        store.delete_jobs_updated_before(tenant_id, job_cutoff_ms, limit)
    })?;
    summary.runs_deleted = bounded_delete(settings, cancel, "runs", |limit| {
        store.delete_runs_created_before(tenant_id, run_cutoff, limit)
    })?;
    summary.companies_deleted = bounded_delete(settings, cancel, "companies", |limit| {
        store.delete_companies_seen_before(tenant_id, company_cutoff, limit)
    })?;

    info!(
        tenant = %tenant_id,
        jobs = summary.jobs_deleted,
        runs = summary.runs_deleted,
        companies = summary.companies_deleted,
        "GC sweep complete"
    );

    Ok(summary)
}

fn bounded_delete<F>(
    settings: &GcSettings,
    cancel: &CancellationToken,
    collection: &str,
    mut delete_batch: F,
) -> Result<usize>
where
    F: FnMut(usize) -> Result<usize>,
{
    let mut total = 0;
    for _ in 0..settings.max_loops {
        if cancel.is_cancelled() {
            bail!("GC cancelled while sweeping {}", collection);
        }
        let deleted = delete_batch(settings.batch_limit)?;
        total += deleted;
        debug!(collection = collection, deleted = deleted, "GC batch");
        if deleted < settings.batch_limit {
            return Ok(total);
        }
    }
    Ok(total)
}
