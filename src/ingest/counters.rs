//! Per-run counters and the bounded error-sample buffer.
//!
//! Counters are plain atomics shared between the feed tasks, the bulk
//! writer, and the heartbeat. The heartbeat snapshots them; the terminal
//! write uses the final snapshot.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::store::{ErrorSample, RunCounterSnapshot};

/// How many error samples a run document retains.
pub const ERROR_SAMPLE_LIMIT: usize = 8;

#[derive(Debug, Default)]
pub struct RunCounters {
    feeds_count: AtomicU64,
    found: AtomicU64,
    candidates: AtomicU64,
    added: AtomicU64,
    updated: AtomicU64,
    skipped_old: AtomicU64,
    skipped_unchanged: AtomicU64,
    no_timestamp: AtomicU64,
    writes: AtomicU64,
    errors_count: AtomicU64,
}

impl RunCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_feeds_count(&self, count: u64) {
        self.feeds_count.store(count, Ordering::Relaxed);
    }

    pub fn add_found(&self, n: u64) {
        self.found.fetch_add(n, Ordering::Relaxed);
    }

    pub fn incr_candidates(&self) {
        self.candidates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_added(&self) {
        self.added.fetch_add(1, Ordering::Relaxed);
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_updated(&self) {
        self.updated.fetch_add(1, Ordering::Relaxed);
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_skipped_old(&self) {
        self.skipped_old.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_skipped_unchanged(&self) {
        self.skipped_unchanged.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_no_timestamp(&self) {
        self.no_timestamp.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_errors(&self) {
        self.errors_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn errors(&self) -> u64 {
        self.errors_count.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> RunCounterSnapshot {
        RunCounterSnapshot {
            feeds_count: self.feeds_count.load(Ordering::Relaxed),
            found: self.found.load(Ordering::Relaxed),
            candidates: self.candidates.load(Ordering::Relaxed),
            added: self.added.load(Ordering::Relaxed),
            updated: self.updated.load(Ordering::Relaxed),
            skipped_old: self.skipped_old.load(Ordering::Relaxed),
            skipped_unchanged: self.skipped_unchanged.load(Ordering::Relaxed),
            no_timestamp: self.no_timestamp.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            errors_count: self.errors_count.load(Ordering::Relaxed),
        }
    }
}

/// Bounded ring of error samples; oldest entries drop silently once full.
///
/// Diagnostics only, never durability: losing a sample is fine, unbounded
/// run documents are not.
#[derive(Debug)]
pub struct ErrorSamples {
    samples: Mutex<VecDeque<ErrorSample>>,
    cap: usize,
}

impl Default for ErrorSamples {
    fn default() -> Self {
        Self::new(ERROR_SAMPLE_LIMIT)
    }
}

impl ErrorSamples {
    pub fn new(cap: usize) -> Self {
        Self {
            samples: Mutex::new(VecDeque::with_capacity(cap)),
            cap,
        }
    }

    pub fn record(&self, url: &str, message: &str) {
        let mut samples = self.samples.lock().unwrap();
        if samples.len() == self.cap {
            samples.pop_front();
        }
        samples.push_back(ErrorSample {
            url: url.to_string(),
            message: message.to_string(),
        });
    }

    pub fn snapshot(&self) -> Vec<ErrorSample> {
        self.samples.lock().unwrap().iter().cloned().collect()
    }
}
