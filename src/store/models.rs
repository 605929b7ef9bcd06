//! Persisted entity models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::feeds::Source;
use crate::normalize::JobMetadata;

/// An isolated namespace owned by one end user.
#[derive(Debug, Clone)]
pub struct Tenant {
    pub id: String,
    pub display_name: String,
    /// Hex sha-256 of the tenant API key; the key itself is never stored.
    pub api_key_hash: String,
    pub created_at: i64,
}

/// A subscription to one upstream board endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct Feed {
    pub id: String,
    /// Display company name shown in the UI.
    pub company: String,
    pub url: String,
    pub active: bool,
    pub archived_at: Option<i64>,
    /// Declared source tag; when absent the variant is detected from the URL.
    pub source: Option<Source>,
    pub last_error: Option<String>,
    pub created_at: i64,
}

impl Feed {
    /// Whether this feed may contribute jobs to a run.
    pub fn contributes(&self) -> bool {
        self.active && self.archived_at.is_none()
    }

    /// The board variant for this feed: declared tag, else URL detection.
    pub fn resolved_source(&self) -> Source {
        self.source.unwrap_or_else(|| Source::detect(&self.url))
    }
}

/// A logical posting issuer derived from a feed.
#[derive(Debug, Clone, Serialize)]
pub struct Company {
    pub company_key: String,
    pub company_name: String,
    pub url: String,
    pub source: Source,
    pub last_seen_at: i64,
}

/// A normalized posting ready for the upsert engine.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub company_key: String,
    pub upstream_id: String,
    pub title: String,
    pub canonical_url: Option<String>,
    pub apply_url: Option<String>,
    pub location_text: Option<String>,
    pub state_codes: Vec<String>,
    pub remote: bool,
    pub source: Source,
    pub metadata: JobMetadata,
    pub content_html: Option<String>,
    pub source_updated_iso: String,
    /// Epoch milliseconds; the comparison key for freshness everywhere.
    pub source_updated_ms: i64,
}

impl JobRecord {
    /// Document id within the tenant's jobs collection.
    pub fn doc_id(&self) -> String {
        job_doc_id(&self.company_key, &self.upstream_id)
    }

    pub fn source_updated_ts(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.source_updated_ms)
    }
}

pub fn job_doc_id(company_key: &str, upstream_id: &str) -> String {
    format!("{}__{}", company_key, upstream_id)
}

/// A job as read back from the store.
#[derive(Debug, Clone, Serialize)]
pub struct StoredJob {
    pub doc_id: String,
    pub company_key: String,
    pub upstream_id: String,
    pub title: String,
    pub canonical_url: Option<String>,
    pub apply_url: Option<String>,
    pub location_text: Option<String>,
    pub state_codes: Vec<String>,
    pub remote: bool,
    pub source: Source,
    pub metadata: JobMetadata,
    pub content_html: Option<String>,
    pub source_updated_iso: Option<String>,
    pub source_updated_ms: Option<i64>,
    pub saved: bool,
    pub created_at: i64,
    pub first_seen_at: i64,
    pub last_seen_at: i64,
}

/// How a run came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunType {
    Scheduled,
    Manual,
    Gc,
}

impl RunType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunType::Scheduled => "scheduled",
            RunType::Manual => "manual",
            RunType::Gc => "gc",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(RunType::Scheduled),
            "manual" => Some(RunType::Manual),
            "gc" => Some(RunType::Gc),
            _ => None,
        }
    }
}

/// Run state machine.
///
/// `Enqueued` is the initial state; the terminal states are reached exactly
/// once and never regress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Enqueued,
    EnqueueFailed,
    Running,
    Done,
    DoneWithErrors,
    Failed,
    SkippedLockActive,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Enqueued => "enqueued",
            RunStatus::EnqueueFailed => "enqueue_failed",
            RunStatus::Running => "running",
            RunStatus::Done => "done",
            RunStatus::DoneWithErrors => "done_with_errors",
            RunStatus::Failed => "failed",
            RunStatus::SkippedLockActive => "skipped_lock_active",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "enqueued" => Some(RunStatus::Enqueued),
            "enqueue_failed" => Some(RunStatus::EnqueueFailed),
            "running" => Some(RunStatus::Running),
            "done" => Some(RunStatus::Done),
            "done_with_errors" => Some(RunStatus::DoneWithErrors),
            "failed" => Some(RunStatus::Failed),
            "skipped_lock_active" => Some(RunStatus::SkippedLockActive),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Done
                | RunStatus::DoneWithErrors
                | RunStatus::Failed
                | RunStatus::EnqueueFailed
                | RunStatus::SkippedLockActive
        )
    }
}

/// One bounded error sample on a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorSample {
    pub url: String,
    pub message: String,
}

/// Point-in-time counter values persisted on a run document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounterSnapshot {
    pub feeds_count: u64,
    pub found: u64,
    pub candidates: u64,
    pub added: u64,
    pub updated: u64,
    pub skipped_old: u64,
    pub skipped_unchanged: u64,
    pub no_timestamp: u64,
    pub writes: u64,
    pub errors_count: u64,
}

/// One per-tenant ingestion attempt in the append-only ledger.
#[derive(Debug, Clone, Serialize)]
pub struct FetchRun {
    pub run_id: String,
    pub run_type: RunType,
    pub status: RunStatus,
    pub created_at: i64,
    pub enqueued_at: Option<i64>,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub updated_at: Option<i64>,
    pub duration_ms: Option<i64>,
    #[serde(flatten)]
    pub counters: RunCounterSnapshot,
    pub error_samples: Vec<ErrorSample>,
    pub error: Option<String>,
    pub skip_reason: Option<String>,
}

impl FetchRun {
    /// A fresh ledger entry in the initial state.
    pub fn new_enqueued(run_id: String, run_type: RunType, now: i64) -> Self {
        Self {
            run_id,
            run_type,
            status: RunStatus::Enqueued,
            created_at: now,
            enqueued_at: Some(now),
            started_at: None,
            finished_at: None,
            updated_at: None,
            duration_ms: None,
            counters: RunCounterSnapshot::default(),
            error_samples: Vec::new(),
            error: None,
            skip_reason: None,
        }
    }
}
