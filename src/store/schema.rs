/// Raw-SQL schema definition for the document store database.
///
/// Versions are applied in order on a fresh database and replayed from the
/// recorded version on an existing one.
pub struct StoreSchema {
    pub version: usize,
    pub up: &'static str,
}

/// Offset added to schema versions in `PRAGMA user_version` so that a plain
/// sqlite file with a small user_version is never mistaken for one of ours.
pub const BASE_DB_VERSION: usize = 88888;

pub const STORE_VERSIONED_SCHEMAS: &[StoreSchema] = &[StoreSchema {
    version: 1,
    up: r#"
        CREATE TABLE tenants (
            id TEXT PRIMARY KEY,
            display_name TEXT NOT NULL,
            api_key_hash TEXT NOT NULL UNIQUE,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE feeds (
            tenant_id TEXT NOT NULL,
            id TEXT NOT NULL,
            company TEXT NOT NULL,
            url TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            archived_at INTEGER,
            source TEXT,
            last_error TEXT,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (tenant_id, id)
        );

        CREATE TABLE companies (
            tenant_id TEXT NOT NULL,
            company_key TEXT NOT NULL,
            company_name TEXT NOT NULL,
            url TEXT NOT NULL,
            source TEXT NOT NULL,
            last_seen_at INTEGER NOT NULL,
            PRIMARY KEY (tenant_id, company_key)
        );

        CREATE INDEX idx_companies_last_seen ON companies(tenant_id, last_seen_at);

        CREATE TABLE jobs (
            tenant_id TEXT NOT NULL,
            doc_id TEXT NOT NULL,
            company_key TEXT NOT NULL,
            upstream_id TEXT NOT NULL,
            title TEXT NOT NULL,
            canonical_url TEXT,
            apply_url TEXT,
            location_text TEXT,
            state_codes TEXT NOT NULL DEFAULT '[]',
            remote INTEGER NOT NULL DEFAULT 0,
            source TEXT NOT NULL,
            metadata TEXT NOT NULL DEFAULT '{}',
            content_html TEXT,
            source_updated_iso TEXT,
            source_updated_ms INTEGER,
            saved INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            first_seen_at INTEGER NOT NULL,
            last_seen_at INTEGER NOT NULL,
            PRIMARY KEY (tenant_id, doc_id)
        );

        CREATE INDEX idx_jobs_source_updated ON jobs(tenant_id, source_updated_ms);

        CREATE TABLE fetch_runs (
            tenant_id TEXT NOT NULL,
            run_id TEXT NOT NULL,
            run_type TEXT NOT NULL,
            status TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            enqueued_at INTEGER,
            started_at INTEGER,
            finished_at INTEGER,
            updated_at INTEGER,
            duration_ms INTEGER,
            feeds_count INTEGER NOT NULL DEFAULT 0,
            found INTEGER NOT NULL DEFAULT 0,
            candidates INTEGER NOT NULL DEFAULT 0,
            added INTEGER NOT NULL DEFAULT 0,
            updated INTEGER NOT NULL DEFAULT 0,
            skipped_old INTEGER NOT NULL DEFAULT 0,
            skipped_unchanged INTEGER NOT NULL DEFAULT 0,
            no_timestamp INTEGER NOT NULL DEFAULT 0,
            writes INTEGER NOT NULL DEFAULT 0,
            errors_count INTEGER NOT NULL DEFAULT 0,
            error_samples TEXT NOT NULL DEFAULT '[]',
            error TEXT,
            skip_reason TEXT,
            PRIMARY KEY (tenant_id, run_id)
        );

        CREATE INDEX idx_fetch_runs_created ON fetch_runs(tenant_id, created_at DESC);
        CREATE INDEX idx_fetch_runs_status ON fetch_runs(status);
    "#,
}];
