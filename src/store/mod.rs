//! The single persistent, transactional store shared by every subsystem.
//!
//! Backed by SQLite in WAL mode, wrapped in a `tokio::sync::Mutex` so the
//! policy-engine-plus-audit-write segment for one request is fully
//! serialized with respect to any other request, as required by the
//! concurrency model: gapless audit sequence numbers and consistent bucket
//! state both depend on this.

pub mod anomaly;
pub mod audit;
pub mod circuit_breaker;
pub mod confirmation;
pub mod kv;
pub mod quarantine;
pub mod rate_limiter;
pub mod rules;

use crate::error::StoreError;
use rusqlite::Connection;
use std::path::Path;
use tokio::sync::Mutex;

pub struct Store {
    pub(crate) conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the store at the given path.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Sqlite(format!("create dir: {e}")))?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory store, primarily for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Default on-disk location: `$XDG_DATA_HOME/toolsentinel/sentinel.db`.
    pub fn default_path() -> std::path::PathBuf {
        let base = dirs::data_dir().unwrap_or_else(|| std::path::PathBuf::from("."));
        base.join("toolsentinel").join("sentinel.db")
    }

    fn init_schema(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY);
             INSERT OR IGNORE INTO schema_version (version) VALUES (1);

             CREATE TABLE IF NOT EXISTS config (
                 key TEXT PRIMARY KEY,
                 value TEXT NOT NULL
             );

             CREATE TABLE IF NOT EXISTS rules (
                 id TEXT PRIMARY KEY,
                 name TEXT NOT NULL,
                 priority INTEGER NOT NULL,
                 action TEXT NOT NULL,
                 enabled INTEGER NOT NULL DEFAULT 1,
                 tool_pattern TEXT,
                 host_pattern TEXT,
                 agent_pattern TEXT,
                 argument_pattern TEXT,
                 rate_limit_json TEXT,
                 schedule_json TEXT,
                 created_at INTEGER NOT NULL,
                 updated_at INTEGER NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_rules_priority ON rules(priority, created_at);

             CREATE TABLE IF NOT EXISTS audit_log (
                 sequence_number INTEGER PRIMARY KEY,
                 timestamp INTEGER NOT NULL,
                 tool TEXT NOT NULL,
                 host TEXT NOT NULL,
                 agent TEXT NOT NULL,
                 arguments_json TEXT NOT NULL,
                 verdict TEXT NOT NULL,
                 action TEXT NOT NULL,
                 matched_rule_id TEXT,
                 risk_score REAL NOT NULL,
                 risk_factors_json TEXT NOT NULL,
                 mode TEXT NOT NULL,
                 response_status TEXT,
                 error_message TEXT,
                 hash TEXT NOT NULL UNIQUE,
                 previous_hash TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_audit_tool_host_agent ON audit_log(tool, host, agent);
             CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_log(timestamp);

             CREATE TABLE IF NOT EXISTS anomaly_baselines (
                 tool TEXT NOT NULL,
                 host TEXT NOT NULL,
                 frequency_mean REAL NOT NULL DEFAULT 0,
                 frequency_stddev REAL NOT NULL DEFAULT 0,
                 hourly_distribution_json TEXT NOT NULL,
                 argument_fingerprints_json TEXT NOT NULL,
                 tool_bigrams_json TEXT NOT NULL,
                 error_rate_mean REAL NOT NULL DEFAULT 0,
                 error_rate_stddev REAL NOT NULL DEFAULT 0,
                 last_updated INTEGER NOT NULL,
                 sample_count INTEGER NOT NULL DEFAULT 0,
                 PRIMARY KEY (tool, host)
             );

             CREATE TABLE IF NOT EXISTS rate_limit_buckets (
                 rule_id TEXT NOT NULL,
                 tool TEXT NOT NULL,
                 host TEXT NOT NULL,
                 agent TEXT NOT NULL,
                 tokens REAL NOT NULL,
                 last_refill INTEGER NOT NULL,
                 created_at INTEGER NOT NULL,
                 PRIMARY KEY (rule_id, tool, host, agent)
             );

             CREATE TABLE IF NOT EXISTS circuit_breakers (
                 host TEXT PRIMARY KEY,
                 state TEXT NOT NULL DEFAULT 'closed',
                 failure_count INTEGER NOT NULL DEFAULT 0,
                 last_failure INTEGER,
                 last_success INTEGER,
                 opened_at INTEGER,
                 half_open_at INTEGER
             );

             CREATE TABLE IF NOT EXISTS quarantine (
                 scope TEXT NOT NULL,
                 target TEXT NOT NULL,
                 reason TEXT NOT NULL,
                 created_at INTEGER NOT NULL,
                 expires_at INTEGER,
                 created_by TEXT,
                 PRIMARY KEY (scope, target)
             );

             CREATE TABLE IF NOT EXISTS confirmation_tokens (
                 token TEXT PRIMARY KEY,
                 tool TEXT NOT NULL,
                 host TEXT NOT NULL,
                 agent TEXT NOT NULL,
                 arguments_json TEXT NOT NULL,
                 created_at INTEGER NOT NULL,
                 expires_at INTEGER NOT NULL,
                 used INTEGER NOT NULL DEFAULT 0
             );

             CREATE TABLE IF NOT EXISTS alerts (
                 id TEXT PRIMARY KEY,
                 sequence_number INTEGER NOT NULL,
                 created_at INTEGER NOT NULL,
                 delivered INTEGER NOT NULL DEFAULT 0,
                 payload_json TEXT NOT NULL
             );",
        )?;
        Ok(())
    }
}
