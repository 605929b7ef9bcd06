//! Tenant document store.
//!
//! The single source of truth: tenants with their feeds, companies, jobs,
//! and the append-only run ledger. The trait keeps callers off the concrete
//! database; [`SqliteTenantStore`] is the production implementation.

mod bulk_writer;
mod models;
mod schema;
mod sqlite_store;

pub use bulk_writer::{BulkWriter, WriteOp, JOB_WRITE_CONCURRENCY, WRITE_RETRY_ATTEMPTS};
pub use models::{
    job_doc_id, Company, ErrorSample, Feed, FetchRun, JobRecord, RunCounterSnapshot, RunStatus,
    RunType, StoredJob, Tenant,
};
pub use schema::{StoreSchema, BASE_DB_VERSION, STORE_VERSIONED_SCHEMAS};
pub use sqlite_store::SqliteTenantStore;

use std::collections::HashMap;

use anyhow::Result;

/// Chunk size for the batched existence read in the upsert engine.
pub const MULTI_GET_CHUNK: usize = 450;

pub trait TenantStore: Send + Sync {
    // === Tenants ===

    fn create_tenant(&self, tenant: &Tenant) -> Result<()>;
    fn get_tenant(&self, tenant_id: &str) -> Result<Option<Tenant>>;
    fn find_tenant_by_api_key_hash(&self, hash: &str) -> Result<Option<Tenant>>;
    fn list_tenant_ids(&self) -> Result<Vec<String>>;

    // === Feeds ===

    fn upsert_feed(&self, tenant_id: &str, feed: &Feed) -> Result<()>;
    fn get_feed(&self, tenant_id: &str, feed_id: &str) -> Result<Option<Feed>>;
    fn list_feeds(&self, tenant_id: &str) -> Result<Vec<Feed>>;
    /// Feeds eligible for ingestion: active and not archived.
    fn list_active_feeds(&self, tenant_id: &str) -> Result<Vec<Feed>>;
    /// Returns false when the feed does not exist.
    fn archive_feed(&self, tenant_id: &str, feed_id: &str, archived_at: i64) -> Result<bool>;
    fn restore_feed(&self, tenant_id: &str, feed_id: &str) -> Result<bool>;
    fn set_feed_last_error(
        &self,
        tenant_id: &str,
        feed_id: &str,
        error: Option<&str>,
    ) -> Result<()>;

    // === Companies ===

    fn upsert_company(&self, tenant_id: &str, company: &Company) -> Result<()>;
    fn get_company(&self, tenant_id: &str, company_key: &str) -> Result<Option<Company>>;
    fn delete_companies_seen_before(
        &self,
        tenant_id: &str,
        cutoff: i64,
        limit: usize,
    ) -> Result<usize>;

    // === Jobs ===

    /// Batched existence read for the upsert engine.
    ///
    /// Returns a map of doc id to stored `source_updated_ms` for the ids
    /// that exist; absent ids are simply not in the map. Implementations
    /// must not issue more than one query per [`MULTI_GET_CHUNK`] ids.
    fn multi_get_job_freshness(
        &self,
        tenant_id: &str,
        doc_ids: &[String],
    ) -> Result<HashMap<String, Option<i64>>>;

    /// Atomic create. Returns false when the document already exists.
    fn try_create_job(&self, tenant_id: &str, job: &JobRecord, now: i64) -> Result<bool>;

    /// Merge write of the ingest-owned fields.
    ///
    /// Never touches `created_at`, `first_seen_at`, or (unless `reset_saved`)
    /// the `saved` bookmark bit, and must not regress a stored
    /// `source_updated_ms` that is already newer than the incoming one.
    fn merge_job(&self, tenant_id: &str, job: &JobRecord, now: i64, reset_saved: bool)
        -> Result<()>;

    fn get_job(&self, tenant_id: &str, doc_id: &str) -> Result<Option<StoredJob>>;
    fn count_jobs(&self, tenant_id: &str) -> Result<usize>;
    fn delete_jobs_updated_before(
        &self,
        tenant_id: &str,
        cutoff_ms: i64,
        limit: usize,
    ) -> Result<usize>;

    // === Run ledger ===

    fn insert_run(&self, tenant_id: &str, run: &FetchRun) -> Result<()>;
    fn get_run(&self, tenant_id: &str, run_id: &str) -> Result<Option<FetchRun>>;
    /// Most recent runs by creation time, newest first.
    fn list_recent_runs(&self, tenant_id: &str, limit: usize) -> Result<Vec<FetchRun>>;
    fn mark_run_running(
        &self,
        tenant_id: &str,
        run_id: &str,
        started_at: i64,
        feeds_count: u64,
    ) -> Result<()>;
    /// Heartbeat merge of in-progress counters.
    fn heartbeat_run(
        &self,
        tenant_id: &str,
        run_id: &str,
        counters: &RunCounterSnapshot,
        updated_at: i64,
    ) -> Result<()>;
    /// Terminal merge. Returns false (and writes nothing) when the run is
    /// already in a terminal state, so terminal statuses never regress.
    #[allow(clippy::too_many_arguments)]
    fn finish_run(
        &self,
        tenant_id: &str,
        run_id: &str,
        status: RunStatus,
        counters: &RunCounterSnapshot,
        error_samples: &[ErrorSample],
        duration_ms: i64,
        error: Option<&str>,
        finished_at: i64,
    ) -> Result<bool>;
    fn mark_run_enqueue_failed(
        &self,
        tenant_id: &str,
        run_id: &str,
        error: &str,
        at: i64,
    ) -> Result<()>;
    /// Marks a run `skipped_lock_active`; returns false if already terminal.
    fn mark_run_skipped(
        &self,
        tenant_id: &str,
        run_id: &str,
        reason: &str,
        at: i64,
    ) -> Result<bool>;
    /// A non-terminal run for the tenant touched since `lease_cutoff`, if any.
    fn find_active_run(
        &self,
        tenant_id: &str,
        exclude_run_id: &str,
        lease_cutoff: i64,
    ) -> Result<Option<String>>;
    /// Startup recovery: mark runs left `running` by a dead process failed.
    fn mark_stale_runs_failed(&self, now: i64) -> Result<usize>;
    fn delete_runs_created_before(
        &self,
        tenant_id: &str,
        cutoff: i64,
        limit: usize,
    ) -> Result<usize>;
}
