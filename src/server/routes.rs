use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::auth::{AdminAuth, TenantSession};
use super::state::ServerState;
use crate::dispatch::enqueue_run;
use crate::feeds::Source;
use crate::ingest::RunDescriptor;
use crate::store::{Feed, FetchRun, RunType};

#[derive(Serialize)]
pub(crate) struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_secs: u64,
}

pub async fn health(State(state): State<ServerState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

pub async fn poll_now(session: TenantSession, State(state): State<ServerState>) -> Response {
    match enqueue_run(
        state.store.as_ref(),
        state.queue.as_ref(),
        &session.tenant_id,
        RunType::Manual,
        state.config.run_max_attempts,
    ) {
        Ok(descriptor) => {
            info!(tenant = %session.tenant_id, run_id = %descriptor.run_id, "Manual run enqueued");
            (
                StatusCode::ACCEPTED,
                Json(json!({ "run_id": descriptor.run_id, "status": "enqueued" })),
            )
                .into_response()
        }
        Err(e) => {
            error!(tenant = %session.tenant_id, error = %e, "Manual enqueue failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

#[derive(Deserialize)]
pub struct RunsQuery {
    limit: Option<usize>,
}

pub async fn list_runs(
    session: TenantSession,
    State(state): State<ServerState>,
    Query(query): Query<RunsQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(20).min(100);
    match state.store.list_recent_runs(&session.tenant_id, limit) {
        Ok(runs) => Json(runs).into_response(),
        Err(e) => internal_error(e),
    }
}

pub async fn get_run(
    session: TenantSession,
    State(state): State<ServerState>,
    Path(run_id): Path<String>,
) -> Response {
    match state.store.get_run(&session.tenant_id, &run_id) {
        Ok(Some(run)) => Json(run).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => internal_error(e),
    }
}

pub async fn list_feeds(session: TenantSession, State(state): State<ServerState>) -> Response {
    match state.store.list_feeds(&session.tenant_id) {
        Ok(feeds) => Json(feeds).into_response(),
        Err(e) => internal_error(e),
    }
}

#[derive(Deserialize)]
pub struct AddFeedBody {
    pub company: String,
    pub url: String,
    pub source: Option<Source>,
}

pub async fn add_feed(
    session: TenantSession,
    State(state): State<ServerState>,
    Json(body): Json<AddFeedBody>,
) -> Response {
    let parsed = match url::Url::parse(&body.url) {
        Ok(u) if matches!(u.scheme(), "http" | "https") => u,
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "url must be http(s)" })),
            )
                .into_response()
        }
    };
    if body.company.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "company must not be empty" })),
        )
            .into_response();
    }

    let feed = Feed {
        id: uuid::Uuid::new_v4().to_string(),
        company: body.company.trim().to_string(),
        url: parsed.to_string(),
        active: true,
        archived_at: None,
        source: body.source,
        last_error: None,
        created_at: chrono::Utc::now().timestamp(),
    };

    match state.store.upsert_feed(&session.tenant_id, &feed) {
        Ok(()) => (StatusCode::CREATED, Json(feed)).into_response(),
        Err(e) => internal_error(e),
    }
}

pub async fn archive_feed(
    session: TenantSession,
    State(state): State<ServerState>,
    Path(feed_id): Path<String>,
) -> Response {
    let now = chrono::Utc::now().timestamp();
    match state.store.archive_feed(&session.tenant_id, &feed_id, now) {
        Ok(true) => StatusCode::OK.into_response(),
        Ok(false) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => internal_error(e),
    }
}

pub async fn restore_feed(
    session: TenantSession,
    State(state): State<ServerState>,
    Path(feed_id): Path<String>,
) -> Response {
    match state.store.restore_feed(&session.tenant_id, &feed_id) {
        Ok(true) => StatusCode::OK.into_response(),
        Ok(false) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => internal_error(e),
    }
}

#[derive(Deserialize)]
pub struct SyncNowQuery {
    tenant_id: String,
}

/// Internal: run one tenant synchronously and return the summary.
pub async fn run_sync_now(
    _admin: AdminAuth,
    State(state): State<ServerState>,
    Query(query): Query<SyncNowQuery>,
) -> Response {
    match state.store.get_tenant(&query.tenant_id) {
        Ok(Some(_)) => {}
        Ok(None) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("unknown tenant: {}", query.tenant_id) })),
            )
                .into_response()
        }
        Err(e) => return internal_error(e),
    }

    let now = chrono::Utc::now().timestamp();
    let run_id = uuid::Uuid::new_v4().to_string();
    let run = FetchRun::new_enqueued(run_id.clone(), RunType::Manual, now);
    if let Err(e) = state.store.insert_run(&query.tenant_id, &run) {
        return internal_error(e);
    }

    let cancel = CancellationToken::new();
    let deadline = {
        let cancel = cancel.clone();
        let timeout = state.config.worker_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            cancel.cancel();
        })
    };

    let descriptor = RunDescriptor {
        tenant_id: query.tenant_id.clone(),
        run_type: RunType::Manual,
        run_id,
    };
    let report = state.worker.run(&descriptor, cancel).await;
    deadline.abort();

    Json(report).into_response()
}

fn internal_error(e: anyhow::Error) -> Response {
    error!(error = %e, "Request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": e.to_string() })),
    )
        .into_response()
}
