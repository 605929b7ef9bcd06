//! Jobfeed Server Library
//!
//! Multi-tenant job-board feed ingestion: a scheduler fans out per-tenant
//! runs onto a durable queue, workers fetch and normalize upstream postings,
//! and an upsert engine keeps each tenant's job store fresh. This library
//! exposes the internal modules for testing and reuse.

pub mod config;
pub mod dispatch;
pub mod feeds;
pub mod filter;
pub mod gc;
pub mod ingest;
pub mod normalize;
pub mod server;
pub mod store;

// Re-export commonly used types for convenience
pub use config::{AppConfig, CliConfig};
pub use dispatch::{Dispatcher, RunQueue, Scheduler, SqliteRunQueue};
pub use ingest::{IngestWorker, RunDescriptor, WorkerReport};
pub use server::{make_router, run_server, ServerState};
pub use store::{SqliteTenantStore, TenantStore};
