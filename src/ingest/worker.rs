//! The per-tenant run worker.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::counters::{ErrorSamples, RunCounters};
use super::fetcher::FeedFetcher;
use super::upsert::UpsertEngine;
use crate::config::{GcSettings, IngestionSettings};
use crate::feeds::{self, Source};
use crate::filter::{self, FilterReason};
use crate::gc;
use crate::normalize;
use crate::store::{
    BulkWriter, Company, ErrorSample, Feed, JobRecord, RunCounterSnapshot, RunStatus, RunType,
    TenantStore, WriteOp,
};

/// What the dispatcher hands a worker invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunDescriptor {
    pub tenant_id: String,
    pub run_type: RunType,
    pub run_id: String,
}

/// Terminal summary of one worker invocation.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerReport {
    pub run_id: String,
    pub status: RunStatus,
    pub counters: RunCounterSnapshot,
    pub error_samples: Vec<ErrorSample>,
    pub duration_ms: i64,
}

pub struct IngestWorker {
    store: Arc<dyn TenantStore>,
    fetcher: Arc<FeedFetcher>,
    settings: IngestionSettings,
    gc_settings: GcSettings,
}

impl IngestWorker {
    pub fn new(
        store: Arc<dyn TenantStore>,
        settings: IngestionSettings,
        gc_settings: GcSettings,
    ) -> Self {
        let fetcher = Arc::new(FeedFetcher::new(
            settings.fetch_timeout,
            settings.fetch_retries,
            settings.fetch_backoff,
        ));
        Self {
            store,
            fetcher,
            settings,
            gc_settings,
        }
    }

    /// Execute one run to a terminal ledger status.
    ///
    /// Idempotent with respect to the ledger: a descriptor whose run is
    /// already terminal is a no-op, so at-least-once delivery is safe.
    pub async fn run(&self, descriptor: &RunDescriptor, cancel: CancellationToken) -> WorkerReport {
        let started = std::time::Instant::now();

        match self.run_inner(descriptor, cancel).await {
            Ok(report) => report,
            Err(e) => {
                // An error escaping the run body is fatal for the run, never
                // for the process: persist failed and report it.
                error!(
                    tenant = %descriptor.tenant_id,
                    run_id = %descriptor.run_id,
                    error = %e,
                    "Run failed"
                );
                let duration_ms = started.elapsed().as_millis() as i64;
                let counters = RunCounterSnapshot::default();
                let message = e.to_string();
                if let Err(persist_err) = self.store.finish_run(
                    &descriptor.tenant_id,
                    &descriptor.run_id,
                    RunStatus::Failed,
                    &counters,
                    &[],
                    duration_ms,
                    Some(&message),
                    now_secs(),
                ) {
                    error!(
                        run_id = %descriptor.run_id,
                        error = %persist_err,
                        "Failed to persist failed run status"
                    );
                }
                WorkerReport {
                    run_id: descriptor.run_id.clone(),
                    status: RunStatus::Failed,
                    counters,
                    error_samples: vec![],
                    duration_ms,
                }
            }
        }
    }

    async fn run_inner(
        &self,
        descriptor: &RunDescriptor,
        cancel: CancellationToken,
    ) -> Result<WorkerReport> {
        let tenant_id = &descriptor.tenant_id;
        let run_id = &descriptor.run_id;
        let started = std::time::Instant::now();

        // Redelivery of a finished run is a no-op.
        if let Some(existing) = self.store.get_run(tenant_id, run_id)? {
            if existing.status.is_terminal() {
                info!(
                    tenant = %tenant_id,
                    run_id = %run_id,
                    status = existing.status.as_str(),
                    "Run already terminal, skipping"
                );
                return Ok(WorkerReport {
                    run_id: run_id.clone(),
                    status: existing.status,
                    counters: existing.counters,
                    error_samples: existing.error_samples,
                    duration_ms: existing.duration_ms.unwrap_or(0),
                });
            }
        }

        if self.settings.run_lock_enabled {
            let lease_cutoff = now_secs() - self.settings.run_lock_lease.as_secs() as i64;
            if let Some(holder) = self.store.find_active_run(tenant_id, run_id, lease_cutoff)? {
                let reason = format!("run {} is still active for this tenant", holder);
                info!(tenant = %tenant_id, run_id = %run_id, holder = %holder, "Skipping run, lock active");
                self.store
                    .mark_run_skipped(tenant_id, run_id, &reason, now_secs())?;
                return Ok(WorkerReport {
                    run_id: run_id.clone(),
                    status: RunStatus::SkippedLockActive,
                    counters: RunCounterSnapshot::default(),
                    error_samples: vec![],
                    duration_ms: started.elapsed().as_millis() as i64,
                });
            }
        }

        if descriptor.run_type == RunType::Gc {
            return self.run_gc(descriptor, cancel, started).await;
        }

        let feeds = self
            .store
            .list_active_feeds(tenant_id)
            .context("Failed to load feeds")?;
        info!(
            tenant = %tenant_id,
            run_id = %run_id,
            feeds = feeds.len(),
            "Starting ingestion run"
        );

        self.store
            .mark_run_running(tenant_id, run_id, now_secs(), feeds.len() as u64)?;

        let counters = Arc::new(RunCounters::new());
        counters.set_feeds_count(feeds.len() as u64);
        let samples = Arc::new(ErrorSamples::default());

        let writer = Arc::new(BulkWriter::new(
            Arc::clone(&self.store),
            tenant_id,
            self.settings.write_concurrency,
            self.settings.reset_saved_on_ingest,
            Arc::clone(&counters),
            Arc::clone(&samples),
        ));
        let engine = Arc::new(UpsertEngine::new(
            Arc::clone(&self.store),
            Arc::clone(&counters),
        ));

        // Heartbeat: periodic merge of in-progress counters, stopped on
        // every exit path by the guard below.
        let _heartbeat = HeartbeatGuard::spawn(
            Arc::clone(&self.store),
            tenant_id.clone(),
            run_id.clone(),
            Arc::clone(&counters),
            self.settings.heartbeat_interval,
            cancel.clone(),
        );

        let semaphore = Arc::new(Semaphore::new(self.settings.feed_concurrency.max(1)));
        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut deadline_hit = false;

        for feed in feeds {
            // On deadline: stop starting new feeds, let in-flight ones drain.
            if cancel.is_cancelled() {
                deadline_hit = true;
                break;
            }

            let permit = tokio::select! {
                permit = Arc::clone(&semaphore).acquire_owned() => {
                    permit.expect("feed semaphore closed")
                }
                _ = cancel.cancelled() => {
                    deadline_hit = true;
                    break;
                }
            };

            let ctx = FeedContext {
                store: Arc::clone(&self.store),
                fetcher: Arc::clone(&self.fetcher),
                engine: Arc::clone(&engine),
                writer: Arc::clone(&writer),
                counters: Arc::clone(&counters),
                samples: Arc::clone(&samples),
                tenant_id: tenant_id.clone(),
                window_ms: self.settings.window.as_millis() as i64,
                cancel: cancel.clone(),
            };
            tasks.spawn(async move {
                let _permit = permit;
                ctx.process_feed(feed).await;
            });
        }

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "Feed task panicked");
                counters.incr_errors();
            }
        }

        // Barrier: all pending writes commit before the terminal status, so
        // the persisted counters reflect what actually landed.
        writer.close().await;

        let final_counters = counters.snapshot();
        let final_samples = samples.snapshot();
        let duration_ms = started.elapsed().as_millis() as i64;

        let (status, error) = if deadline_hit {
            (
                RunStatus::Failed,
                Some("worker deadline exceeded before all feeds were processed".to_string()),
            )
        } else if final_counters.errors_count > 0 {
            (RunStatus::DoneWithErrors, None)
        } else {
            (RunStatus::Done, None)
        };

        self.store.finish_run(
            tenant_id,
            run_id,
            status,
            &final_counters,
            &final_samples,
            duration_ms,
            error.as_deref(),
            now_secs(),
        )?;

        info!(
            tenant = %tenant_id,
            run_id = %run_id,
            status = status.as_str(),
            found = final_counters.found,
            added = final_counters.added,
            updated = final_counters.updated,
            errors = final_counters.errors_count,
            duration_ms = duration_ms,
            "Run finished"
        );

        Ok(WorkerReport {
            run_id: run_id.clone(),
            status,
            counters: final_counters,
            error_samples: final_samples,
            duration_ms,
        })
    }

    async fn run_gc(
        &self,
        descriptor: &RunDescriptor,
        cancel: CancellationToken,
        started: std::time::Instant,
    ) -> Result<WorkerReport> {
        let tenant_id = &descriptor.tenant_id;
        let run_id = &descriptor.run_id;

        self.store.mark_run_running(tenant_id, run_id, now_secs(), 0)?;

        let result = gc::collect_tenant(
            self.store.as_ref(),
            tenant_id,
            &self.gc_settings,
            &cancel,
        );
        let duration_ms = started.elapsed().as_millis() as i64;
        let counters = RunCounterSnapshot::default();

        let (status, error) = match &result {
            Ok(summary) => {
                info!(
                    tenant = %tenant_id,
                    run_id = %run_id,
                    jobs_deleted = summary.jobs_deleted,
                    runs_deleted = summary.runs_deleted,
                    companies_deleted = summary.companies_deleted,
                    "GC run finished"
                );
                (RunStatus::Done, None)
            }
            Err(e) => (RunStatus::Failed, Some(e.to_string())),
        };

        self.store.finish_run(
            tenant_id,
            run_id,
            status,
            &counters,
            &[],
            duration_ms,
            error.as_deref(),
            now_secs(),
        )?;

        Ok(WorkerReport {
            run_id: run_id.clone(),
            status,
            counters,
            error_samples: vec![],
            duration_ms,
        })
    }
}

struct FeedContext {
    store: Arc<dyn TenantStore>,
    fetcher: Arc<FeedFetcher>,
    engine: Arc<UpsertEngine>,
    writer: Arc<BulkWriter>,
    counters: Arc<RunCounters>,
    samples: Arc<ErrorSamples>,
    tenant_id: String,
    window_ms: i64,
    cancel: CancellationToken,
}

impl FeedContext {
    /// Process one feed end to end. Errors are recovered locally: they feed
    /// the counters and the sample buffer but never abort the run.
    async fn process_feed(&self, feed: Feed) {
        let source = feed.resolved_source();
        debug!(
            tenant = %self.tenant_id,
            feed = %feed.id,
            url = %feed.url,
            source = %source,
            "Processing feed"
        );

        let payload = match self.fetcher.fetch_json(&feed.url, &self.cancel).await {
            Ok(payload) => payload,
            Err(e) => {
                self.record_feed_error(&feed, &e.to_string()).await;
                return;
            }
        };

        let raw_postings = feeds::extract_postings(source, &payload);
        let now_ms = chrono::Utc::now().timestamp_millis();
        let mut candidates: Vec<JobRecord> = Vec::new();
        let company_key = feeds::company_key(source, &feed.url, &feed.id);

        for raw in &raw_postings {
            let posting = match feeds::to_uniform(source, raw) {
                Ok(p) => p,
                Err(e) => {
                    debug!(feed = %feed.id, error = %e, "Skipping malformed posting");
                    continue;
                }
            };

            let outcome = filter::evaluate(source, &posting, now_ms, self.window_ms);
            match outcome.reason {
                FilterReason::WrongLocation => continue,
                FilterReason::NoTimestamp => {
                    self.counters.add_found(1);
                    self.counters.incr_no_timestamp();
                }
                FilterReason::TooOld => {
                    self.counters.add_found(1);
                    self.counters.incr_skipped_old();
                }
                FilterReason::Keep => {
                    self.counters.add_found(1);
                    self.counters.incr_candidates();
                    let (iso, ms) = outcome.effective.expect("kept posting has an instant");
                    candidates.push(build_record(
                        &company_key,
                        source,
                        posting,
                        outcome.state_codes.into_iter().collect(),
                        iso,
                        ms,
                    ));
                }
            }
        }

        if let Err(e) = self
            .engine
            .upsert_batch(&self.tenant_id, candidates, &self.writer)
            .await
        {
            self.record_feed_error(&feed, &format!("upsert failed: {}", e)).await;
            return;
        }

        self.writer.submit(WriteOp::Company(Company {
            company_key,
            company_name: feed.company.clone(),
            url: feed.url.clone(),
            source,
            last_seen_at: now_secs(),
        }));

        if feed.last_error.is_some() {
            if let Err(e) = self.store.set_feed_last_error(&self.tenant_id, &feed.id, None) {
                warn!(feed = %feed.id, error = %e, "Failed to clear feed error");
            }
        }
    }

    async fn record_feed_error(&self, feed: &Feed, message: &str) {
        warn!(
            tenant = %self.tenant_id,
            feed = %feed.id,
            url = %feed.url,
            error = %message,
            "Feed failed"
        );
        self.counters.incr_errors();
        self.samples.record(&feed.url, message);
        if let Err(e) = self
            .store
            .set_feed_last_error(&self.tenant_id, &feed.id, Some(message))
        {
            warn!(feed = %feed.id, error = %e, "Failed to record feed error");
        }
    }
}

fn build_record(
    company_key: &str,
    source: Source,
    posting: crate::feeds::UniformPosting,
    state_codes: Vec<String>,
    source_updated_iso: String,
    source_updated_ms: i64,
) -> JobRecord {
    let location_text = posting.location_text();
    JobRecord {
        company_key: company_key.to_string(),
        upstream_id: posting.upstream_id,
        title: posting.title,
        canonical_url: posting.canonical_url,
        apply_url: posting.apply_url,
        location_text: (!location_text.is_empty()).then_some(location_text),
        state_codes,
        remote: posting.is_remote,
        source,
        metadata: normalize::normalize_metadata(&posting.metadata),
        content_html: posting.content_html.as_deref().map(normalize::clean_content),
        source_updated_iso,
        source_updated_ms,
    }
}

/// Aborts the heartbeat task when dropped, which covers every exit path of
/// the run body including errors.
struct HeartbeatGuard {
    handle: JoinHandle<()>,
}

impl HeartbeatGuard {
    fn spawn(
        store: Arc<dyn TenantStore>,
        tenant_id: String,
        run_id: String,
        counters: Arc<RunCounters>,
        interval: std::time::Duration,
        cancel: CancellationToken,
    ) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // Skip the immediate tick; the running-state write just happened.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let snapshot = counters.snapshot();
                        if let Err(e) =
                            store.heartbeat_run(&tenant_id, &run_id, &snapshot, now_secs())
                        {
                            warn!(run_id = %run_id, error = %e, "Heartbeat write failed");
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        });
        Self { handle }
    }
}

impl Drop for HeartbeatGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FetchRun, SqliteTenantStore, Tenant};
    use tempfile::TempDir;

    fn make_worker(settings: IngestionSettings) -> (Arc<SqliteTenantStore>, IngestWorker, TempDir) {
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
        let worker = IngestWorker::new(
            Arc::clone(&store) as Arc<dyn TenantStore>,
            settings,
            GcSettings::default(),
        );
        (store, worker, dir)
    }

    fn descriptor(run_id: &str) -> RunDescriptor {
        RunDescriptor {
            tenant_id: "t1".to_string(),
            run_type: RunType::Manual,
            run_id: run_id.to_string(),
        }
    }

    #[tokio::test]
    async fn test_run_with_no_feeds_completes_done() {
        let (store, worker, _dir) = make_worker(IngestionSettings::default());
        let run = FetchRun::new_enqueued("r1".to_string(), RunType::Manual, now_secs());
        store.insert_run("t1", &run).unwrap();

        let report = worker.run(&descriptor("r1"), CancellationToken::new()).await;
        assert_eq!(report.status, RunStatus::Done);
        assert_eq!(report.counters.found, 0);

        let stored = store.get_run("t1", "r1").unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Done);
        assert!(stored.duration_ms.is_some());
    }

    #[tokio::test]
    async fn test_redelivery_of_terminal_run_is_noop() {
        let (store, worker, _dir) = make_worker(IngestionSettings::default());
        let run = FetchRun::new_enqueued("r1".to_string(), RunType::Manual, now_secs());
        store.insert_run("t1", &run).unwrap();

        let first = worker.run(&descriptor("r1"), CancellationToken::new()).await;
        assert_eq!(first.status, RunStatus::Done);
        let finished_at = store.get_run("t1", "r1").unwrap().unwrap().finished_at;

        let second = worker.run(&descriptor("r1"), CancellationToken::new()).await;
        assert_eq!(second.status, RunStatus::Done);
        assert_eq!(
            store.get_run("t1", "r1").unwrap().unwrap().finished_at,
            finished_at
        );
    }

    #[tokio::test]
    async fn test_concurrent_run_skipped_when_lock_enabled() {
        let (store, worker, _dir) = make_worker(IngestionSettings::default());

        // A non-terminal run holds the lock.
        let holder = FetchRun::new_enqueued("r1".to_string(), RunType::Scheduled, now_secs());
        store.insert_run("t1", &holder).unwrap();
        store.mark_run_running("t1", "r1", now_secs(), 0).unwrap();

        let blocked = FetchRun::new_enqueued("r2".to_string(), RunType::Manual, now_secs());
        store.insert_run("t1", &blocked).unwrap();

        let report = worker.run(&descriptor("r2"), CancellationToken::new()).await;
        assert_eq!(report.status, RunStatus::SkippedLockActive);

        let stored = store.get_run("t1", "r2").unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::SkippedLockActive);
        assert!(stored.skip_reason.unwrap().contains("r1"));
    }

    #[tokio::test]
    async fn test_lock_disabled_by_config() {
        let settings = IngestionSettings {
            run_lock_enabled: false,
            ..Default::default()
        };
        let (store, worker, _dir) = make_worker(settings);

        let holder = FetchRun::new_enqueued("r1".to_string(), RunType::Scheduled, now_secs());
        store.insert_run("t1", &holder).unwrap();
        store.mark_run_running("t1", "r1", now_secs(), 0).unwrap();

        let run = FetchRun::new_enqueued("r2".to_string(), RunType::Manual, now_secs());
        store.insert_run("t1", &run).unwrap();

        let report = worker.run(&descriptor("r2"), CancellationToken::new()).await;
        assert_eq!(report.status, RunStatus::Done);
    }

    #[tokio::test]
    async fn test_unreachable_feed_yields_done_with_errors() {
        let settings = IngestionSettings {
            fetch_timeout: std::time::Duration::from_millis(500),
            fetch_retries: 0,
            fetch_backoff: std::time::Duration::from_millis(1),
            ..Default::default()
        };
        let (store, worker, _dir) = make_worker(settings);

        store
            .upsert_feed(
                "t1",
                &Feed {
                    id: "f1".to_string(),
                    company: "Acme".to_string(),
                    // Nothing listens here; connection is refused immediately.
                    url: "http://127.0.0.1:9/feed".to_string(),
                    active: true,
                    archived_at: None,
                    source: Some(Source::Greenhouse),
                    last_error: None,
                    created_at: 0,
                },
            )
            .unwrap();

        let run = FetchRun::new_enqueued("r1".to_string(), RunType::Manual, now_secs());
        store.insert_run("t1", &run).unwrap();

        let report = worker.run(&descriptor("r1"), CancellationToken::new()).await;
        assert_eq!(report.status, RunStatus::DoneWithErrors);
        assert_eq!(report.counters.errors_count, 1);
        assert_eq!(report.error_samples.len(), 1);

        let feed = store.get_feed("t1", "f1").unwrap().unwrap();
        assert!(feed.last_error.is_some());
    }

    #[tokio::test]
    async fn test_cancelled_run_fails_without_starting_feeds() {
        let (store, worker, _dir) = make_worker(IngestionSettings::default());
        store
            .upsert_feed(
                "t1",
                &Feed {
                    id: "f1".to_string(),
                    company: "Acme".to_string(),
                    url: "http://127.0.0.1:9/feed".to_string(),
                    active: true,
                    archived_at: None,
                    source: None,
                    last_error: None,
                    created_at: 0,
                },
            )
            .unwrap();
        let run = FetchRun::new_enqueued("r1".to_string(), RunType::Manual, now_secs());
        store.insert_run("t1", &run).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = worker.run(&descriptor("r1"), cancel).await;
        assert_eq!(report.status, RunStatus::Failed);

        let stored = store.get_run("t1", "r1").unwrap().unwrap();
        assert!(stored.error.unwrap().contains("deadline"));
    }

    #[tokio::test]
    async fn test_gc_run_type_uses_state_machine() {
        let (store, worker, _dir) = make_worker(IngestionSettings::default());
        let run = FetchRun::new_enqueued("g1".to_string(), RunType::Gc, now_secs());
        store.insert_run("t1", &run).unwrap();

        let report = worker
            .run(
                &RunDescriptor {
                    tenant_id: "t1".to_string(),
                    run_type: RunType::Gc,
                    run_id: "g1".to_string(),
                },
                CancellationToken::new(),
            )
            .await;
        assert_eq!(report.status, RunStatus::Done);
        assert_eq!(
            store.get_run("t1", "g1").unwrap().unwrap().status,
            RunStatus::Done
        );
    }
}
