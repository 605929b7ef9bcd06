//! Shared test infrastructure: a scriptable stub upstream board server and
//! a fully wired app around temp databases.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::{
    extract::State,
    http::{StatusCode, Uri},
    response::{IntoResponse, Response},
    Json, Router,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use jobfeed_server::config::{DispatcherSettings, GcSettings, IngestionSettings};
use jobfeed_server::dispatch::{RunQueue, SqliteRunQueue};
use jobfeed_server::feeds::Source;
use jobfeed_server::ingest::{IngestWorker, RunDescriptor, WorkerReport};
use jobfeed_server::server::{hash_api_key, make_router, ServerConfig, ServerState};
use jobfeed_server::store::{
    Feed, FetchRun, RunType, SqliteTenantStore, Tenant, TenantStore,
};

pub const TENANT: &str = "tenant-1";
pub const API_KEY: &str = "test-api-key-123";
pub const ADMIN_TOKEN: &str = "admin-token-456";

type ScriptedResponses = Arc<Mutex<HashMap<String, VecDeque<(u16, serde_json::Value)>>>>;

/// A stub upstream board server.
///
/// Each path carries a queue of scripted responses; the queue pops until one
/// response remains, which then repeats. Unknown paths return 404.
pub struct UpstreamServer {
    pub base_url: String,
    responses: ScriptedResponses,
    handle: tokio::task::JoinHandle<()>,
}

impl UpstreamServer {
    pub async fn spawn() -> Self {
        let responses: ScriptedResponses = Arc::new(Mutex::new(HashMap::new()));
        let router = Router::new()
            .fallback(respond_scripted)
            .with_state(Arc::clone(&responses));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self {
            base_url: format!("http://{}", addr),
            responses,
            handle,
        }
    }

    /// Serve `body` with status 200 on every request to `path`.
    pub fn serve(&self, path: &str, body: serde_json::Value) {
        self.script(path, vec![(200, body)]);
    }

    /// Script a response sequence for `path`; the last entry repeats.
    pub fn script(&self, path: &str, sequence: Vec<(u16, serde_json::Value)>) {
        self.responses
            .lock()
            .unwrap()
            .insert(path.to_string(), sequence.into_iter().collect());
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Drop for UpstreamServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn respond_scripted(State(responses): State<ScriptedResponses>, uri: Uri) -> Response {
    let path = uri.path().to_string();
    let mut map = responses.lock().unwrap();
    match map.get_mut(&path) {
        Some(queue) => {
            let (status, body) = if queue.len() > 1 {
                queue.pop_front().unwrap()
            } else {
                match queue.front() {
                    Some(entry) => entry.clone(),
                    None => return StatusCode::NOT_FOUND.into_response(),
                }
            };
            let status = StatusCode::from_u16(status).unwrap();
            (status, Json(body)).into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// A fully wired app over temp databases with test-friendly timings.
pub struct TestApp {
    pub store: Arc<SqliteTenantStore>,
    pub queue: Arc<SqliteRunQueue>,
    pub ingestion: IngestionSettings,
    _dir: TempDir,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_settings(fast_settings())
    }

    pub fn with_settings(ingestion: IngestionSettings) -> Self {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SqliteTenantStore::new(dir.path().join("store.db")).unwrap());
        let queue = Arc::new(SqliteRunQueue::new(dir.path().join("queue.db")).unwrap());

        store
            .create_tenant(&Tenant {
                id: TENANT.to_string(),
                display_name: "Test Tenant".to_string(),
                api_key_hash: hash_api_key(API_KEY),
                created_at: chrono::Utc::now().timestamp(),
            })
            .unwrap();

        Self {
            store,
            queue,
            ingestion,
            _dir: dir,
        }
    }

    pub fn worker(&self) -> IngestWorker {
        IngestWorker::new(
            Arc::clone(&self.store) as Arc<dyn TenantStore>,
            self.ingestion.clone(),
            GcSettings::default(),
        )
    }

    /// Add an active feed. The stub server lives on 127.0.0.1, so the board
    /// variant must be declared rather than detected from the URL.
    pub fn add_feed(&self, feed_id: &str, company: &str, url: &str, source: Source) {
        self.store
            .upsert_feed(
                TENANT,
                &Feed {
                    id: feed_id.to_string(),
                    company: company.to_string(),
                    url: url.to_string(),
                    active: true,
                    archived_at: None,
                    source: Some(source),
                    last_error: None,
                    created_at: chrono::Utc::now().timestamp(),
                },
            )
            .unwrap();
    }

    /// Create a manual run, execute it to a terminal state, and return the
    /// report together with the persisted ledger entry.
    pub async fn run_manual(
        &self,
    ) -> (WorkerReport, jobfeed_server::store::FetchRun) {
        let run_id = uuid::Uuid::new_v4().to_string();
        let run = FetchRun::new_enqueued(
            run_id.clone(),
            RunType::Manual,
            chrono::Utc::now().timestamp(),
        );
        self.store.insert_run(TENANT, &run).unwrap();

        let worker = self.worker();
        let report = worker
            .run(
                &RunDescriptor {
                    tenant_id: TENANT.to_string(),
                    run_type: RunType::Manual,
                    run_id: run_id.clone(),
                },
                CancellationToken::new(),
            )
            .await;
        let stored = self.store.get_run(TENANT, &run_id).unwrap().unwrap();
        (report, stored)
    }

    /// Spawn the API server on an ephemeral port and return its base URL.
    pub async fn spawn_api(&self) -> String {
        let state = ServerState {
            config: ServerConfig {
                admin_token: Some(ADMIN_TOKEN.to_string()),
                run_max_attempts: 3,
                worker_timeout: Duration::from_secs(30),
            },
            start_time: Instant::now(),
            store: Arc::clone(&self.store) as Arc<dyn TenantStore>,
            queue: Arc::clone(&self.queue) as Arc<dyn RunQueue>,
            worker: Arc::new(self.worker()),
        };
        let router = make_router(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }
}

fn fast_settings() -> IngestionSettings {
    IngestionSettings {
        fetch_timeout: Duration::from_secs(5),
        fetch_backoff: Duration::from_millis(5),
        heartbeat_interval: Duration::from_millis(200),
        ..Default::default()
    }
}

pub fn fast_dispatcher_settings() -> DispatcherSettings {
    DispatcherSettings {
        poll_interval: Duration::from_millis(20),
        ..Default::default()
    }
}

// === Payload fixtures ===

pub fn minutes_ago_iso(minutes: i64) -> String {
    (chrono::Utc::now() - chrono::Duration::minutes(minutes)).to_rfc3339()
}

pub fn greenhouse_job(
    id: u64,
    title: &str,
    location: &str,
    updated_minutes_ago: i64,
) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "title": title,
        "absolute_url": format!("https://boards.greenhouse.io/acme/jobs/{}", id),
        "updated_at": minutes_ago_iso(updated_minutes_ago),
        "first_published": minutes_ago_iso(updated_minutes_ago + 60),
        "location": {"name": location},
        "metadata": [],
        "content": "<p>Do the work.</p>"
    })
}

pub fn greenhouse_payload(jobs: Vec<serde_json::Value>) -> serde_json::Value {
    serde_json::json!({ "jobs": jobs })
}

pub fn ashby_job(
    id: &str,
    title: &str,
    location: &str,
    is_remote: bool,
    published_minutes_ago: i64,
) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "title": title,
        "jobUrl": format!("https://jobs.ashbyhq.com/acme/{}", id),
        "applyUrl": format!("https://jobs.ashbyhq.com/acme/{}/apply", id),
        "publishedAt": minutes_ago_iso(published_minutes_ago),
        "location": location,
        "isRemote": is_remote,
        "descriptionHtml": "<p>Do the work.</p>"
    })
}

pub fn ashby_payload(jobs: Vec<serde_json::Value>) -> serde_json::Value {
    serde_json::json!({ "jobs": jobs })
}
