//! Durable run queue.
//!
//! Carries one run descriptor per message with at-least-once delivery.
//! Claiming a message puts a lease on it; a worker that dies without acking
//! has its lease expire, after which the message is redelivered until its
//! attempt budget runs out and it is dead-lettered.

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use crate::ingest::RunDescriptor;
use crate::store::{RunType, BASE_DB_VERSION};

/// A claimed message handed to the dispatcher.
#[derive(Debug, Clone)]
pub struct QueuedRun {
    pub message_id: i64,
    pub descriptor: RunDescriptor,
    /// Delivery attempt this claim represents, 1-based.
    pub attempt: u32,
    pub max_attempts: u32,
}

/// Messages dead-lettered while releasing expired leases.
#[derive(Debug, Default)]
pub struct LeaseSweep {
    pub released: usize,
    pub dead: Vec<RunDescriptor>,
}

pub trait RunQueue: Send + Sync {
    /// Append a message. `max_attempts` of 1 gives the strict no-retry
    /// variant.
    fn enqueue(&self, descriptor: &RunDescriptor, max_attempts: u32, now: i64) -> Result<i64>;

    /// Atomically claim the oldest visible pending message, putting a lease
    /// on it until `now + lease_secs`.
    fn claim_next(&self, now: i64, lease_secs: i64) -> Result<Option<QueuedRun>>;

    /// Successful delivery; the message is gone.
    fn ack(&self, message_id: i64) -> Result<()>;

    /// Failed delivery; make the message visible again at `visible_at`.
    fn nack_retry(&self, message_id: i64, visible_at: i64, error: &str) -> Result<()>;

    /// Reset expired leases to pending, dead-lettering messages that are out
    /// of attempts. Released messages become visible again after
    /// `retry_delay` seconds.
    fn release_expired_leases(&self, now: i64, retry_delay: i64) -> Result<LeaseSweep>;

    fn pending_count(&self) -> Result<usize>;
}

const QUEUE_SCHEMA_VERSION: usize = 1;

const QUEUE_SCHEMA: &str = r#"
    CREATE TABLE run_queue (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        tenant_id TEXT NOT NULL,
        run_type TEXT NOT NULL,
        run_id TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        attempts INTEGER NOT NULL DEFAULT 0,
        max_attempts INTEGER NOT NULL,
        visible_at INTEGER NOT NULL,
        leased_until INTEGER,
        enqueued_at INTEGER NOT NULL,
        last_error TEXT
    );

    CREATE INDEX idx_run_queue_claim ON run_queue(status, visible_at, enqueued_at);
    CREATE INDEX idx_run_queue_leases ON run_queue(status, leased_until);
"#;

pub struct SqliteRunQueue {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRunQueue {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref();
        let conn = Connection::open(path).context("Failed to open queue database")?;

        let raw_version: i64 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
        if raw_version == 0 {
            info!("Creating new queue database at {:?}", path);
            conn.execute_batch(QUEUE_SCHEMA)
                .context("Failed to create queue schema")?;
            conn.execute(
                &format!(
                    "PRAGMA user_version = {}",
                    BASE_DB_VERSION + QUEUE_SCHEMA_VERSION
                ),
                [],
            )?;
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

impl RunQueue for SqliteRunQueue {
    fn enqueue(&self, descriptor: &RunDescriptor, max_attempts: u32, now: i64) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO run_queue (tenant_id, run_type, run_id, max_attempts, visible_at, enqueued_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![
                descriptor.tenant_id,
                descriptor.run_type.as_str(),
                descriptor.run_id,
                max_attempts.max(1),
                now
            ],
        )
        .context("Failed to enqueue run")?;
        Ok(conn.last_insert_rowid())
    }

    fn claim_next(&self, now: i64, lease_secs: i64) -> Result<Option<QueuedRun>> {
        let conn = self.conn.lock().unwrap();

        let row = conn
            .query_row(
                "SELECT id, tenant_id, run_type, run_id, attempts, max_attempts
                 FROM run_queue
                 WHERE status = 'pending' AND visible_at <= ?1
                 ORDER BY enqueued_at, id LIMIT 1",
                params![now],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, u32>(4)?,
                        row.get::<_, u32>(5)?,
                    ))
                },
            )
            .optional()?;

        let Some((id, tenant_id, run_type, run_id, attempts, max_attempts)) = row else {
            return Ok(None);
        };

        // The same connection serializes claims; the status guard keeps a
        // lost race harmless anyway.
        let changed = conn.execute(
            "UPDATE run_queue
             SET status = 'leased', attempts = attempts + 1, leased_until = ?2
             WHERE id = ?1 AND status = 'pending'",
            params![id, now + lease_secs],
        )?;
        if changed == 0 {
            return Ok(None);
        }

        Ok(Some(QueuedRun {
            message_id: id,
            descriptor: RunDescriptor {
                tenant_id,
                run_type: RunType::parse(&run_type).unwrap_or(RunType::Manual),
                run_id,
            },
            attempt: attempts + 1,
            max_attempts,
        }))
    }

    fn ack(&self, message_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM run_queue WHERE id = ?1", params![message_id])?;
        Ok(())
    }

    fn nack_retry(&self, message_id: i64, visible_at: i64, error: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE run_queue
             SET status = 'pending', leased_until = NULL, visible_at = ?2, last_error = ?3
             WHERE id = ?1 AND attempts < max_attempts",
            params![message_id, visible_at, error],
        )?;
        if changed == 0 {
            conn.execute(
                "UPDATE run_queue SET status = 'dead', last_error = ?2 WHERE id = ?1",
                params![message_id, error],
            )?;
        }
        Ok(())
    }

    fn release_expired_leases(&self, now: i64, retry_delay: i64) -> Result<LeaseSweep> {
        let conn = self.conn.lock().unwrap();
        let mut sweep = LeaseSweep::default();

        // Out-of-attempts messages become dead letters.
        {
            let mut stmt = conn.prepare(
                "SELECT tenant_id, run_type, run_id FROM run_queue
                 WHERE status = 'leased' AND leased_until < ?1 AND attempts >= max_attempts",
            )?;
            let dead = stmt.query_map(params![now], |row| {
                Ok(RunDescriptor {
                    tenant_id: row.get(0)?,
                    run_type: RunType::parse(&row.get::<_, String>(1)?)
                        .unwrap_or(RunType::Manual),
                    run_id: row.get(2)?,
                })
            })?;
            for descriptor in dead {
                sweep.dead.push(descriptor?);
            }
        }
        conn.execute(
            "UPDATE run_queue SET status = 'dead', last_error = 'lease expired, out of attempts'
             WHERE status = 'leased' AND leased_until < ?1 AND attempts >= max_attempts",
            params![now],
        )?;

        sweep.released = conn.execute(
            "UPDATE run_queue SET status = 'pending', leased_until = NULL, visible_at = ?2
             WHERE status = 'leased' AND leased_until < ?1",
            params![now, now + retry_delay],
        )?;

        Ok(sweep)
    }

    fn pending_count(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM run_queue WHERE status = 'pending'",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}
