//! Persistence (ambient stack addition, grounded on the teacher's
//! `SqliteMemoryStore`): durable storage for ledger entries and audit
//! records, backed by SQLite with an in-memory fallback when the backing
//! file can't be opened. A storage failure never escapes as a fatal
//! error — callers see `Error::StorageUnavailable` and are expected to
//! degrade to an in-process-only mode, emitting `storage:error` once.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};

fn initialize_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS ledger_entries (
            id TEXT PRIMARY KEY,
            user_id TEXT,
            model_id TEXT NOT NULL,
            input_tokens INTEGER NOT NULL,
            output_tokens INTEGER NOT NULL,
            cost REAL NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS audit_records (
            sequence INTEGER PRIMARY KEY,
            event_type TEXT NOT NULL,
            payload TEXT NOT NULL,
            prev_hash TEXT NOT NULL,
            hash TEXT NOT NULL,
            created_at TEXT NOT NULL,
            pruned INTEGER NOT NULL DEFAULT 0
        );
        CREATE TABLE IF NOT EXISTS cache_entries (
            cache_key TEXT PRIMARY KEY,
            model_id TEXT NOT NULL,
            normalized_prompt TEXT NOT NULL,
            original_prompt TEXT NOT NULL,
            response_text TEXT NOT NULL,
            input_tokens INTEGER NOT NULL,
            output_tokens INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            last_accessed TEXT NOT NULL,
            access_count INTEGER NOT NULL
        );",
    )
}

/// A durably-recorded cost ledger row.
#[derive(Debug, Clone)]
pub struct LedgerRow {
    pub id: String,
    pub user_id: Option<String>,
    pub model_id: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
    pub created_at: DateTime<Utc>,
}

/// A durably-recorded audit row, persisted exactly as appended.
#[derive(Debug, Clone)]
pub struct AuditRow {
    pub sequence: i64,
    pub event_type: String,
    pub payload: Value,
    pub prev_hash: String,
    pub hash: String,
    pub created_at: DateTime<Utc>,
    pub pruned: bool,
}

/// A durably-recorded semantic cache entry (spec.md §6 `cache.persist`).
#[derive(Debug, Clone)]
pub struct CacheRow {
    pub cache_key: String,
    pub model_id: String,
    pub normalized_prompt: String,
    pub original_prompt: String,
    pub response_text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub access_count: u64,
}

enum Backend {
    Sqlite(Arc<Mutex<Connection>>),
    /// Degraded mode: an open file/connection couldn't be established.
    /// Rows are accepted but lost on process exit; every write still
    /// succeeds from the caller's point of view; read paths return
    /// empty results.
    InMemoryFallback,
}

/// Persistence handle. Cheap to clone; shares the underlying connection.
#[derive(Clone)]
pub struct Persistence {
    backend: Arc<Backend>,
}

impl Persistence {
    /// Open (or create) a SQLite-backed store at `path`. Never fails:
    /// if the file can't be opened, falls back to in-memory degraded
    /// mode and the caller should emit a one-time `storage:error`.
    pub fn open(path: impl AsRef<Path>) -> Self {
        match Connection::open(path) {
            Ok(conn) => match initialize_schema(&conn) {
                Ok(()) => Self {
                    backend: Arc::new(Backend::Sqlite(Arc::new(Mutex::new(conn)))),
                },
                Err(_) => Self {
                    backend: Arc::new(Backend::InMemoryFallback),
                },
            },
            Err(_) => Self {
                backend: Arc::new(Backend::InMemoryFallback),
            },
        }
    }

    pub fn in_memory() -> Self {
        let conn = Connection::open_in_memory().expect("sqlite in-memory open cannot fail");
        initialize_schema(&conn).expect("schema init on a fresh in-memory db cannot fail");
        Self {
            backend: Arc::new(Backend::Sqlite(Arc::new(Mutex::new(conn)))),
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(*self.backend, Backend::InMemoryFallback)
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        match &*self.backend {
            Backend::Sqlite(conn) => {
                let conn = conn
                    .lock()
                    .map_err(|e| Error::storage_unavailable(format!("connection lock poisoned: {e}")))?;
                f(&conn).map_err(|e| Error::storage_unavailable(e.to_string()))
            }
            Backend::InMemoryFallback => Err(Error::storage_unavailable(
                "persistence running in degraded in-memory fallback mode",
            )),
        }
    }

    pub fn insert_ledger_row(&self, row: &LedgerRow) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO ledger_entries (id, user_id, model_id, input_tokens, output_tokens, cost, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    row.id,
                    row.user_id,
                    row.model_id,
                    row.input_tokens as i64,
                    row.output_tokens as i64,
                    row.cost,
                    row.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    pub fn ledger_rows_for_user(&self, user_id: &str) -> Result<Vec<LedgerRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, model_id, input_tokens, output_tokens, cost, created_at
                 FROM ledger_entries WHERE user_id = ?1 ORDER BY created_at ASC",
            )?;
            let rows = stmt
                .query_map(params![user_id], |r| {
                    Ok(LedgerRow {
                        id: r.get(0)?,
                        user_id: r.get(1)?,
                        model_id: r.get(2)?,
                        input_tokens: r.get::<_, i64>(3)? as u64,
                        output_tokens: r.get::<_, i64>(4)? as u64,
                        cost: r.get(5)?,
                        created_at: r
                            .get::<_, String>(6)?
                            .parse()
                            .unwrap_or_else(|_| Utc::now()),
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    pub fn append_audit_row(
        &self,
        event_type: &str,
        payload: &Value,
        prev_hash: &str,
        hash: &str,
    ) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO audit_records (event_type, payload, prev_hash, hash, created_at, pruned)
                 VALUES (?1, ?2, ?3, ?4, ?5, 0)",
                params![
                    event_type,
                    payload.to_string(),
                    prev_hash,
                    hash,
                    Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn latest_audit_hash(&self) -> Result<Option<String>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT hash FROM audit_records ORDER BY sequence DESC LIMIT 1",
                [],
                |r| r.get(0),
            )
            .optional()
        })
    }

    /// Upsert a cache entry (spec.md §6 `cache.persist`).
    pub fn upsert_cache_row(&self, row: &CacheRow) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO cache_entries
                    (cache_key, model_id, normalized_prompt, original_prompt, response_text,
                     input_tokens, output_tokens, created_at, last_accessed, access_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(cache_key) DO UPDATE SET
                    response_text = excluded.response_text,
                    input_tokens = excluded.input_tokens,
                    output_tokens = excluded.output_tokens,
                    last_accessed = excluded.last_accessed,
                    access_count = excluded.access_count",
                params![
                    row.cache_key,
                    row.model_id,
                    row.normalized_prompt,
                    row.original_prompt,
                    row.response_text,
                    row.input_tokens as i64,
                    row.output_tokens as i64,
                    row.created_at.to_rfc3339(),
                    row.last_accessed.to_rfc3339(),
                    row.access_count as i64,
                ],
            )?;
            Ok(())
        })
    }

    pub fn delete_cache_row(&self, cache_key: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM cache_entries WHERE cache_key = ?1", params![cache_key])?;
            Ok(())
        })
    }

    pub fn all_cache_rows(&self) -> Result<Vec<CacheRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT cache_key, model_id, normalized_prompt, original_prompt, response_text,
                        input_tokens, output_tokens, created_at, last_accessed, access_count
                 FROM cache_entries",
            )?;
            let rows = stmt
                .query_map([], |r| {
                    Ok(CacheRow {
                        cache_key: r.get(0)?,
                        model_id: r.get(1)?,
                        normalized_prompt: r.get(2)?,
                        original_prompt: r.get(3)?,
                        response_text: r.get(4)?,
                        input_tokens: r.get::<_, i64>(5)? as u64,
                        output_tokens: r.get::<_, i64>(6)? as u64,
                        created_at: r.get::<_, String>(7)?.parse().unwrap_or_else(|_| Utc::now()),
                        last_accessed: r.get::<_, String>(8)?.parse().unwrap_or_else(|_| Utc::now()),
                        access_count: r.get::<_, i64>(9)? as u64,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    pub fn clear_cache_rows(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM cache_entries", [])?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn in_memory_store_round_trips_ledger_rows() {
        let store = Persistence::in_memory();
        let row = LedgerRow {
            id: "r1".to_string(),
            user_id: Some("alice".to_string()),
            model_id: "gpt-4o".to_string(),
            input_tokens: 100,
            output_tokens: 50,
            cost: 0.01,
            created_at: Utc::now(),
        };
        store.insert_ledger_row(&row).unwrap();
        let rows = store.ledger_rows_for_user("alice").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].model_id, "gpt-4o");
    }

    #[test]
    fn degraded_mode_never_panics_on_write() {
        let store = Persistence {
            backend: Arc::new(Backend::InMemoryFallback),
        };
        assert!(store.is_degraded());
        let row = LedgerRow {
            id: "r1".to_string(),
            user_id: None,
            model_id: "gpt-4o".to_string(),
            input_tokens: 1,
            output_tokens: 1,
            cost: 0.0,
            created_at: Utc::now(),
        };
        assert!(store.insert_ledger_row(&row).is_err());
    }

    #[test]
    fn cache_rows_round_trip_and_upsert() {
        let store = Persistence::in_memory();
        let now = Utc::now();
        let row = CacheRow {
            cache_key: "k1".to_string(),
            model_id: "gpt-4o".to_string(),
            normalized_prompt: "what is rust".to_string(),
            original_prompt: "What is Rust?".to_string(),
            response_text: "A systems language.".to_string(),
            input_tokens: 10,
            output_tokens: 20,
            created_at: now,
            last_accessed: now,
            access_count: 0,
        };
        store.upsert_cache_row(&row).unwrap();
        assert_eq!(store.all_cache_rows().unwrap().len(), 1);

        let mut updated = row.clone();
        updated.access_count = 5;
        store.upsert_cache_row(&updated).unwrap();
        let rows = store.all_cache_rows().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].access_count, 5);

        store.delete_cache_row("k1").unwrap();
        assert!(store.all_cache_rows().unwrap().is_empty());
    }

    #[test]
    fn audit_rows_chain_hash_pointers() {
        let store = Persistence::in_memory();
        assert_eq!(store.latest_audit_hash().unwrap(), None);
        store
            .append_audit_row("request:allowed", &json!({"id": 1}), "genesis", "h1")
            .unwrap();
        assert_eq!(store.latest_audit_hash().unwrap(), Some("h1".to_string()));
    }
}
