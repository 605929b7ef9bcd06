use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use super::models::{
    Company, ErrorSample, Feed, FetchRun, JobRecord, RunCounterSnapshot, RunStatus, RunType,
    StoredJob, Tenant,
};
use super::schema::{BASE_DB_VERSION, STORE_VERSIONED_SCHEMAS};
use super::{TenantStore, MULTI_GET_CHUNK};
use crate::feeds::Source;

const TERMINAL_STATUSES_SQL: &str =
    "('done', 'done_with_errors', 'failed', 'enqueue_failed', 'skipped_lock_active')";

pub struct SqliteTenantStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteTenantStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref();
        let conn = Connection::open(path).context("Failed to open store database")?;
        conn.execute("PRAGMA foreign_keys = ON;", [])?;

        let raw_version: i64 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;

        if raw_version == 0 {
            info!("Creating new store database at {:?}", path);
            Self::initialize_schema(&conn)?;
        } else {
            let db_version = raw_version - BASE_DB_VERSION as i64;
            if db_version < 1 {
                anyhow::bail!("Store database version {} is invalid", db_version);
            }
            let current = STORE_VERSIONED_SCHEMAS.last().unwrap().version as i64;
            if db_version < current {
                info!(
                    "Migrating store database from version {} to {}",
                    db_version, current
                );
                Self::run_migrations(&conn, db_version as usize)?;
            }
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<()> {
        for schema in STORE_VERSIONED_SCHEMAS.iter() {
            conn.execute_batch(schema.up)
                .with_context(|| format!("Failed to run schema version {}", schema.version))?;
        }
        let last = STORE_VERSIONED_SCHEMAS.last().expect("No schemas defined");
        conn.execute(
            &format!("PRAGMA user_version = {}", BASE_DB_VERSION + last.version),
            [],
        )?;
        Ok(())
    }

    fn run_migrations(conn: &Connection, from_version: usize) -> Result<()> {
        for schema in STORE_VERSIONED_SCHEMAS.iter() {
            if schema.version > from_version {
                info!("Running store migration to version {}", schema.version);
                conn.execute_batch(schema.up).with_context(|| {
                    format!("Failed to run migration to version {}", schema.version)
                })?;
                conn.execute(
                    &format!("PRAGMA user_version = {}", BASE_DB_VERSION + schema.version),
                    [],
                )?;
            }
        }
        Ok(())
    }

    fn row_to_feed(row: &rusqlite::Row) -> rusqlite::Result<Feed> {
        let source_str: Option<String> = row.get("source")?;
        Ok(Feed {
            id: row.get("id")?,
            company: row.get("company")?,
            url: row.get("url")?,
            active: row.get::<_, i64>("active")? != 0,
            archived_at: row.get("archived_at")?,
            source: source_str.as_deref().and_then(Source::parse),
            last_error: row.get("last_error")?,
            created_at: row.get("created_at")?,
        })
    }

    fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<StoredJob> {
        let state_codes: String = row.get("state_codes")?;
        let metadata: String = row.get("metadata")?;
        let source_str: String = row.get("source")?;
        Ok(StoredJob {
            doc_id: row.get("doc_id")?,
            company_key: row.get("company_key")?,
            upstream_id: row.get("upstream_id")?,
            title: row.get("title")?,
            canonical_url: row.get("canonical_url")?,
            apply_url: row.get("apply_url")?,
            location_text: row.get("location_text")?,
            state_codes: serde_json::from_str(&state_codes).unwrap_or_default(),
            remote: row.get::<_, i64>("remote")? != 0,
            source: Source::parse(&source_str).unwrap_or(Source::Unknown),
            metadata: serde_json::from_str(&metadata).unwrap_or_default(),
            content_html: row.get("content_html")?,
            source_updated_iso: row.get("source_updated_iso")?,
            source_updated_ms: row.get("source_updated_ms")?,
            saved: row.get::<_, i64>("saved")? != 0,
            created_at: row.get("created_at")?,
            first_seen_at: row.get("first_seen_at")?,
            last_seen_at: row.get("last_seen_at")?,
        })
    }

    fn row_to_run(row: &rusqlite::Row) -> rusqlite::Result<FetchRun> {
        let status_str: String = row.get("status")?;
        let type_str: String = row.get("run_type")?;
        let samples: String = row.get("error_samples")?;
        Ok(FetchRun {
            run_id: row.get("run_id")?,
            run_type: RunType::parse(&type_str).unwrap_or(RunType::Manual),
            status: RunStatus::parse(&status_str).unwrap_or(RunStatus::Failed),
            created_at: row.get("created_at")?,
            enqueued_at: row.get("enqueued_at")?,
            started_at: row.get("started_at")?,
            finished_at: row.get("finished_at")?,
            updated_at: row.get("updated_at")?,
            duration_ms: row.get("duration_ms")?,
            counters: RunCounterSnapshot {
                feeds_count: row.get::<_, i64>("feeds_count")? as u64,
                found: row.get::<_, i64>("found")? as u64,
                candidates: row.get::<_, i64>("candidates")? as u64,
                added: row.get::<_, i64>("added")? as u64,
                updated: row.get::<_, i64>("updated")? as u64,
                skipped_old: row.get::<_, i64>("skipped_old")? as u64,
                skipped_unchanged: row.get::<_, i64>("skipped_unchanged")? as u64,
                no_timestamp: row.get::<_, i64>("no_timestamp")? as u64,
                writes: row.get::<_, i64>("writes")? as u64,
                errors_count: row.get::<_, i64>("errors_count")? as u64,
            },
            error_samples: serde_json::from_str(&samples).unwrap_or_default(),
            error: row.get("error")?,
            skip_reason: row.get("skip_reason")?,
        })
    }
}

impl TenantStore for SqliteTenantStore {
    fn create_tenant(&self, tenant: &Tenant) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO tenants (id, display_name, api_key_hash, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                tenant.id,
                tenant.display_name,
                tenant.api_key_hash,
                tenant.created_at
            ],
        )
        .context("Failed to create tenant")?;
        Ok(())
    }

    fn get_tenant(&self, tenant_id: &str) -> Result<Option<Tenant>> {
        let conn = self.conn.lock().unwrap();
        let tenant = conn
            .query_row(
                "SELECT id, display_name, api_key_hash, created_at FROM tenants WHERE id = ?1",
                params![tenant_id],
                |row| {
                    Ok(Tenant {
                        id: row.get(0)?,
                        display_name: row.get(1)?,
                        api_key_hash: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(tenant)
    }

    fn find_tenant_by_api_key_hash(&self, hash: &str) -> Result<Option<Tenant>> {
        let conn = self.conn.lock().unwrap();
        let tenant = conn
            .query_row(
                "SELECT id, display_name, api_key_hash, created_at
                 FROM tenants WHERE api_key_hash = ?1",
                params![hash],
                |row| {
                    Ok(Tenant {
                        id: row.get(0)?,
                        display_name: row.get(1)?,
                        api_key_hash: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(tenant)
    }

    fn list_tenant_ids(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT id FROM tenants ORDER BY id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    fn upsert_feed(&self, tenant_id: &str, feed: &Feed) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO feeds (tenant_id, id, company, url, active, archived_at, source, last_error, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT (tenant_id, id) DO UPDATE SET
                 company = excluded.company,
                 url = excluded.url,
                 active = excluded.active,
                 archived_at = excluded.archived_at,
                 source = excluded.source",
            params![
                tenant_id,
                feed.id,
                feed.company,
                feed.url,
                feed.active as i64,
                feed.archived_at,
                feed.source.map(|s| s.as_str()),
                feed.last_error,
                feed.created_at
            ],
        )?;
        Ok(())
    }

    fn get_feed(&self, tenant_id: &str, feed_id: &str) -> Result<Option<Feed>> {
        let conn = self.conn.lock().unwrap();
        let feed = conn
            .query_row(
                "SELECT id, company, url, active, archived_at, source, last_error, created_at
                 FROM feeds WHERE tenant_id = ?1 AND id = ?2",
                params![tenant_id, feed_id],
                Self::row_to_feed,
            )
            .optional()?;
        Ok(feed)
    }

    fn list_feeds(&self, tenant_id: &str) -> Result<Vec<Feed>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, company, url, active, archived_at, source, last_error, created_at
             FROM feeds WHERE tenant_id = ?1 ORDER BY created_at, id",
        )?;
        let feeds = stmt
            .query_map(params![tenant_id], Self::row_to_feed)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(feeds)
    }

    fn list_active_feeds(&self, tenant_id: &str) -> Result<Vec<Feed>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, company, url, active, archived_at, source, last_error, created_at
             FROM feeds
             WHERE tenant_id = ?1 AND active = 1 AND archived_at IS NULL
             ORDER BY created_at, id",
        )?;
        let feeds = stmt
            .query_map(params![tenant_id], Self::row_to_feed)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(feeds)
    }

    fn archive_feed(&self, tenant_id: &str, feed_id: &str, archived_at: i64) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE feeds SET archived_at = ?3 WHERE tenant_id = ?1 AND id = ?2",
            params![tenant_id, feed_id, archived_at],
        )?;
        Ok(changed > 0)
    }

    fn restore_feed(&self, tenant_id: &str, feed_id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE feeds SET archived_at = NULL, active = 1 WHERE tenant_id = ?1 AND id = ?2",
            params![tenant_id, feed_id],
        )?;
        Ok(changed > 0)
    }

    fn set_feed_last_error(
        &self,
        tenant_id: &str,
        feed_id: &str,
        error: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE feeds SET last_error = ?3 WHERE tenant_id = ?1 AND id = ?2",
            params![tenant_id, feed_id, error],
        )?;
        Ok(())
    }

    fn upsert_company(&self, tenant_id: &str, company: &Company) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO companies (tenant_id, company_key, company_name, url, source, last_seen_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (tenant_id, company_key) DO UPDATE SET
                 company_name = excluded.company_name,
                 url = excluded.url,
                 source = excluded.source,
                 last_seen_at = excluded.last_seen_at",
            params![
                tenant_id,
                company.company_key,
                company.company_name,
                company.url,
                company.source.as_str(),
                company.last_seen_at
            ],
        )?;
        Ok(())
    }

    fn get_company(&self, tenant_id: &str, company_key: &str) -> Result<Option<Company>> {
        let conn = self.conn.lock().unwrap();
        let company = conn
            .query_row(
                "SELECT company_key, company_name, url, source, last_seen_at
                 FROM companies WHERE tenant_id = ?1 AND company_key = ?2",
                params![tenant_id, company_key],
                |row| {
                    let source: String = row.get(3)?;
                    Ok(Company {
                        company_key: row.get(0)?,
                        company_name: row.get(1)?,
                        url: row.get(2)?,
                        source: Source::parse(&source).unwrap_or(Source::Unknown),
                        last_seen_at: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(company)
    }

    fn delete_companies_seen_before(
        &self,
        tenant_id: &str,
        cutoff: i64,
        limit: usize,
    ) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute(
            "DELETE FROM companies WHERE rowid IN (
                 SELECT rowid FROM companies
                 WHERE tenant_id = ?1 AND last_seen_at < ?2 LIMIT ?3
             )",
            params![tenant_id, cutoff, limit as i64],
        )?;
        Ok(deleted)
    }

    fn multi_get_job_freshness(
        &self,
        tenant_id: &str,
        doc_ids: &[String],
    ) -> Result<HashMap<String, Option<i64>>> {
        let conn = self.conn.lock().unwrap();
        let mut out = HashMap::with_capacity(doc_ids.len());

        for chunk in doc_ids.chunks(MULTI_GET_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "SELECT doc_id, source_updated_ms FROM jobs
                 WHERE tenant_id = ? AND doc_id IN ({})",
                placeholders
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut values: Vec<&dyn rusqlite::ToSql> = vec![&tenant_id];
            for id in chunk {
                values.push(id);
            }
            let rows = stmt.query_map(values.as_slice(), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Option<i64>>(1)?))
            })?;
            for row in rows {
                let (doc_id, ms) = row?;
                out.insert(doc_id, ms);
            }
        }

        Ok(out)
    }

    fn try_create_job(&self, tenant_id: &str, job: &JobRecord, now: i64) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "INSERT OR IGNORE INTO jobs (
                 tenant_id, doc_id, company_key, upstream_id, title, canonical_url, apply_url,
                 location_text, state_codes, remote, source, metadata, content_html,
                 source_updated_iso, source_updated_ms, saved, created_at, first_seen_at, last_seen_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, 0, ?16, ?16, ?16)",
            params![
                tenant_id,
                job.doc_id(),
                job.company_key,
                job.upstream_id,
                job.title,
                job.canonical_url,
                job.apply_url,
                job.location_text,
                serde_json::to_string(&job.state_codes)?,
                job.remote as i64,
                job.source.as_str(),
                serde_json::to_string(&job.metadata)?,
                job.content_html,
                job.source_updated_iso,
                job.source_updated_ms,
                now
            ],
        )?;
        Ok(changed > 0)
    }

    fn merge_job(
        &self,
        tenant_id: &str,
        job: &JobRecord,
        now: i64,
        reset_saved: bool,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let saved_clause = if reset_saved { ", saved = 0" } else { "" };
        // The freshness guard makes the merge a compare-and-merge: a racing
        // run that already stored a newer instant wins and this write is a
        // no-op, so stored source_updated_ms only ever advances.
        let sql = format!(
            "UPDATE jobs SET
                 title = ?3, canonical_url = ?4, apply_url = ?5, location_text = ?6,
                 state_codes = ?7, remote = ?8, source = ?9, metadata = ?10,
                 content_html = ?11, source_updated_iso = ?12, source_updated_ms = ?13,
                 last_seen_at = ?14{}
             WHERE tenant_id = ?1 AND doc_id = ?2
               AND (source_updated_ms IS NULL OR source_updated_ms <= ?13)",
            saved_clause
        );
        conn.execute(
            &sql,
            params![
                tenant_id,
                job.doc_id(),
                job.title,
                job.canonical_url,
                job.apply_url,
                job.location_text,
                serde_json::to_string(&job.state_codes)?,
                job.remote as i64,
                job.source.as_str(),
                serde_json::to_string(&job.metadata)?,
                job.content_html,
                job.source_updated_iso,
                job.source_updated_ms,
                now
            ],
        )?;
        Ok(())
    }

    fn get_job(&self, tenant_id: &str, doc_id: &str) -> Result<Option<StoredJob>> {
        let conn = self.conn.lock().unwrap();
        let job = conn
            .query_row(
                "SELECT doc_id, company_key, upstream_id, title, canonical_url, apply_url,
                        location_text, state_codes, remote, source, metadata, content_html,
                        source_updated_iso, source_updated_ms, saved, created_at, first_seen_at,
                        last_seen_at
                 FROM jobs WHERE tenant_id = ?1 AND doc_id = ?2",
                params![tenant_id, doc_id],
                Self::row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    fn count_jobs(&self, tenant_id: &str) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE tenant_id = ?1",
            params![tenant_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn delete_jobs_updated_before(
        &self,
        tenant_id: &str,
        cutoff_ms: i64,
        limit: usize,
    ) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute(
            "DELETE FROM jobs WHERE rowid IN (
                 SELECT rowid FROM jobs
                 WHERE tenant_id = ?1 AND source_updated_ms IS NOT NULL AND source_updated_ms < ?2
                 LIMIT ?3
             )",
            params![tenant_id, cutoff_ms, limit as i64],
        )?;
        Ok(deleted)
    }

    fn insert_run(&self, tenant_id: &str, run: &FetchRun) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO fetch_runs (
                 tenant_id, run_id, run_type, status, created_at, enqueued_at, started_at,
                 finished_at, updated_at, duration_ms, error_samples, error, skip_reason
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                tenant_id,
                run.run_id,
                run.run_type.as_str(),
                run.status.as_str(),
                run.created_at,
                run.enqueued_at,
                run.started_at,
                run.finished_at,
                run.updated_at,
                run.duration_ms,
                serde_json::to_string(&run.error_samples)?,
                run.error,
                run.skip_reason
            ],
        )
        .context("Failed to insert run")?;
        Ok(())
    }

    fn get_run(&self, tenant_id: &str, run_id: &str) -> Result<Option<FetchRun>> {
        let conn = self.conn.lock().unwrap();
        let run = conn
            .query_row(
                "SELECT * FROM fetch_runs WHERE tenant_id = ?1 AND run_id = ?2",
                params![tenant_id, run_id],
                Self::row_to_run,
            )
            .optional()?;
        Ok(run)
    }

    fn list_recent_runs(&self, tenant_id: &str, limit: usize) -> Result<Vec<FetchRun>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT * FROM fetch_runs WHERE tenant_id = ?1
             ORDER BY created_at DESC, run_id DESC LIMIT ?2",
        )?;
        let runs = stmt
            .query_map(params![tenant_id, limit as i64], Self::row_to_run)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(runs)
    }

    fn mark_run_running(
        &self,
        tenant_id: &str,
        run_id: &str,
        started_at: i64,
        feeds_count: u64,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            &format!(
                "UPDATE fetch_runs SET status = 'running', started_at = ?3, updated_at = ?3,
                     feeds_count = ?4
                 WHERE tenant_id = ?1 AND run_id = ?2 AND status NOT IN {}",
                TERMINAL_STATUSES_SQL
            ),
            params![tenant_id, run_id, started_at, feeds_count as i64],
        )?;
        Ok(())
    }

    fn heartbeat_run(
        &self,
        tenant_id: &str,
        run_id: &str,
        counters: &RunCounterSnapshot,
        updated_at: i64,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        // A heartbeat may interleave with the terminal write; the guard keeps
        // it from resurrecting a finished run.
        conn.execute(
            &format!(
                "UPDATE fetch_runs SET updated_at = ?3,
                     feeds_count = ?4, found = ?5, candidates = ?6, added = ?7, updated = ?8,
                     skipped_old = ?9, skipped_unchanged = ?10, no_timestamp = ?11, writes = ?12,
                     errors_count = ?13
                 WHERE tenant_id = ?1 AND run_id = ?2 AND status NOT IN {}",
                TERMINAL_STATUSES_SQL
            ),
            params![
                tenant_id,
                run_id,
                updated_at,
                counters.feeds_count as i64,
                counters.found as i64,
                counters.candidates as i64,
                counters.added as i64,
                counters.updated as i64,
                counters.skipped_old as i64,
                counters.skipped_unchanged as i64,
                counters.no_timestamp as i64,
                counters.writes as i64,
                counters.errors_count as i64
            ],
        )?;
        Ok(())
    }

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
    ) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            &format!(
                "UPDATE fetch_runs SET status = ?3, finished_at = ?4, updated_at = ?4,
                     duration_ms = ?5, error = ?6, error_samples = ?7,
                     feeds_count = ?8, found = ?9, candidates = ?10, added = ?11, updated = ?12,
                     skipped_old = ?13, skipped_unchanged = ?14, no_timestamp = ?15, writes = ?16,
                     errors_count = ?17
                 WHERE tenant_id = ?1 AND run_id = ?2 AND status NOT IN {}",
                TERMINAL_STATUSES_SQL
            ),
            params![
                tenant_id,
                run_id,
                status.as_str(),
                finished_at,
                duration_ms,
                error,
                serde_json::to_string(error_samples)?,
                counters.feeds_count as i64,
                counters.found as i64,
                counters.candidates as i64,
                counters.added as i64,
                counters.updated as i64,
                counters.skipped_old as i64,
                counters.skipped_unchanged as i64,
                counters.no_timestamp as i64,
                counters.writes as i64,
                counters.errors_count as i64
            ],
        )?;
        Ok(changed > 0)
    }

    fn mark_run_enqueue_failed(
        &self,
        tenant_id: &str,
        run_id: &str,
        error: &str,
        at: i64,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            &format!(
                "UPDATE fetch_runs SET status = 'enqueue_failed', finished_at = ?3,
                     updated_at = ?3, error = ?4
                 WHERE tenant_id = ?1 AND run_id = ?2 AND status NOT IN {}",
                TERMINAL_STATUSES_SQL
            ),
            params![tenant_id, run_id, at, error],
        )?;
        Ok(())
    }

    fn mark_run_skipped(
        &self,
        tenant_id: &str,
        run_id: &str,
        reason: &str,
        at: i64,
    ) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            &format!(
                "UPDATE fetch_runs SET status = 'skipped_lock_active', finished_at = ?3,
                     updated_at = ?3, skip_reason = ?4
                 WHERE tenant_id = ?1 AND run_id = ?2 AND status NOT IN {}",
                TERMINAL_STATUSES_SQL
            ),
            params![tenant_id, run_id, at, reason],
        )?;
        Ok(changed > 0)
    }

    fn find_active_run(
        &self,
        tenant_id: &str,
        exclude_run_id: &str,
        lease_cutoff: i64,
    ) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        // Only a run that actually started holds the lock; an enqueued run
        // waiting for dispatch must not block delivery.
        let run_id = conn
            .query_row(
                "SELECT run_id FROM fetch_runs
                 WHERE tenant_id = ?1 AND run_id != ?2 AND status = 'running'
                   AND COALESCE(updated_at, started_at, created_at) >= ?3
                 ORDER BY created_at DESC LIMIT 1",
                params![tenant_id, exclude_run_id, lease_cutoff],
                |row| row.get(0),
            )
            .optional()?;
        Ok(run_id)
    }

    fn mark_stale_runs_failed(&self, now: i64) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count = conn.execute(
            "UPDATE fetch_runs SET status = 'failed', finished_at = ?1, updated_at = ?1,
                 error = 'Run was interrupted (server restart)'
             WHERE status = 'running'",
            params![now],
        )?;
        Ok(count)
    }

    fn delete_runs_created_before(
        &self,
        tenant_id: &str,
        cutoff: i64,
        limit: usize,
    ) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute(
            "DELETE FROM fetch_runs WHERE rowid IN (
                 SELECT rowid FROM fetch_runs
                 WHERE tenant_id = ?1 AND created_at < ?2 LIMIT ?3
             )",
            params![tenant_id, cutoff, limit as i64],
        )?;
        Ok(deleted)
    }
}
