//! Per-tenant ingestion.
//!
//! The worker orchestrates one run: fetch every active feed with bounded
//! concurrency, route postings through the adapters, the filter, and the
//! normalizer, upsert candidates through the bulk writer, and keep the run
//! ledger current with a heartbeat and a single terminal write.

mod counters;
mod fetcher;
mod upsert;
mod worker;

pub use counters::{ErrorSamples, RunCounters, ERROR_SAMPLE_LIMIT};
pub use fetcher::{FeedFetcher, FetchError, FETCH_RETRIES, RETRYABLE_STATUSES};
pub use upsert::UpsertEngine;
pub use worker::{IngestWorker, RunDescriptor, WorkerReport};
