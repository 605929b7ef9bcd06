use axum::extract::FromRef;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::dispatch::RunQueue;
use crate::ingest::IngestWorker;
use crate::store::TenantStore;

pub type GuardedStore = Arc<dyn TenantStore>;
pub type GuardedQueue = Arc<dyn RunQueue>;
pub type GuardedWorker = Arc<IngestWorker>;

/// Server-level knobs the handlers need.
#[derive(Clone)]
pub struct ServerConfig {
    /// Token guarding the internal operator routes; None disables them.
    pub admin_token: Option<String>,
    /// Attempt budget stamped on messages enqueued through the API.
    pub run_max_attempts: u32,
    /// Deadline for synchronous internal runs.
    pub worker_timeout: Duration,
}

#[derive(Clone)]
pub struct ServerState {
    pub config: ServerConfig,
    pub start_time: Instant,
    pub store: GuardedStore,
    pub queue: GuardedQueue,
    pub worker: GuardedWorker,
}

impl FromRef<ServerState> for GuardedStore {
    fn from_ref(input: &ServerState) -> Self {
        input.store.clone()
    }
}

impl FromRef<ServerState> for GuardedQueue {
    fn from_ref(input: &ServerState) -> Self {
        input.queue.clone()
    }
}

impl FromRef<ServerState> for GuardedWorker {
    fn from_ref(input: &ServerState) -> Self {
        input.worker.clone()
    }
}

impl FromRef<ServerState> for ServerConfig {
    fn from_ref(input: &ServerState) -> Self {
        input.config.clone()
    }
}
