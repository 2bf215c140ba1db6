//! Sequence high-water marks.
//!
//! The generator persists the last number it issued for each session before
//! handing it out. After a restart it resumes from the stored mark, so a
//! number a client has already seen is never reissued for new content.
//!
//! [`MemoryWatermarks`] keeps marks for the process lifetime (tests, mock
//! mode). [`SqliteWatermarks`] survives restarts.

use std::collections::HashMap;
use std::path::Path;

use docket_core::SessionId;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;

use crate::errors::Result;

/// Storage for the last sequence number issued per session.
pub trait WatermarkStore: Send + Sync {
    /// The last number issued for `session_id`, or `0` if none.
    fn load(&self, session_id: &SessionId) -> Result<u64>;

    /// Record `sequence` as issued. Called before the number is returned.
    fn persist(&self, session_id: &SessionId, sequence: u64) -> Result<()>;

    /// Forget a session's mark once the session is disposed for good.
    fn remove(&self, session_id: &SessionId) -> Result<()>;
}

/// In-process watermark store.
#[derive(Debug, Default)]
pub struct MemoryWatermarks {
    marks: Mutex<HashMap<SessionId, u64>>,
}

impl MemoryWatermarks {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl WatermarkStore for MemoryWatermarks {
    fn load(&self, session_id: &SessionId) -> Result<u64> {
        Ok(self.marks.lock().get(session_id).copied().unwrap_or(0))
    }

    fn persist(&self, session_id: &SessionId, sequence: u64) -> Result<()> {
        let _ = self.marks.lock().insert(session_id.clone(), sequence);
        Ok(())
    }

    fn remove(&self, session_id: &SessionId) -> Result<()> {
        let _ = self.marks.lock().remove(session_id);
        Ok(())
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sequence_watermarks (
    session_id  TEXT PRIMARY KEY,
    last_issued INTEGER NOT NULL,
    updated_at  TEXT NOT NULL
);";

/// `SQLite`-backed watermark store.
///
/// One connection behind a mutex. Writes are a single-row upsert, so the
/// cost per issued number is one small write.
pub struct SqliteWatermarks {
    conn: Mutex<Connection>,
}

impl SqliteWatermarks {
    /// Open (creating if needed) a file-backed store.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;\
             PRAGMA busy_timeout = 5000;\
             PRAGMA synchronous = NORMAL;",
        )?;
        debug!(?path, "opened watermark store");
        Self::with_connection(conn)
    }

    /// In-memory store, for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

// SQLite integers are signed; the full u64 range is stored bit-for-bit.
fn to_db(sequence: u64) -> i64 {
    sequence as i64
}

fn from_db(raw: i64) -> u64 {
    raw as u64
}

impl WatermarkStore for SqliteWatermarks {
    fn load(&self, session_id: &SessionId) -> Result<u64> {
        let raw: Option<i64> = self
            .conn
            .lock()
            .query_row(
                "SELECT last_issued FROM sequence_watermarks WHERE session_id = ?1",
                params![session_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(raw.map_or(0, from_db))
    }

    fn persist(&self, session_id: &SessionId, sequence: u64) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let _ = self.conn.lock().execute(
            "INSERT INTO sequence_watermarks (session_id, last_issued, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(session_id) DO UPDATE
             SET last_issued = excluded.last_issued, updated_at = excluded.updated_at",
            params![session_id.as_str(), to_db(sequence), now],
        )?;
        Ok(())
    }

    fn remove(&self, session_id: &SessionId) -> Result<()> {
        let _ = self.conn.lock().execute(
            "DELETE FROM sequence_watermarks WHERE session_id = ?1",
            params![session_id.as_str()],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(s: &str) -> SessionId {
        SessionId::parse(s).unwrap()
    }

    fn exercise(store: &dyn WatermarkStore) {
        let a = sid("a");
        assert_eq!(store.load(&a).unwrap(), 0);
        store.persist(&a, 5).unwrap();
        store.persist(&a, 6).unwrap();
        assert_eq!(store.load(&a).unwrap(), 6);
        assert_eq!(store.load(&sid("b")).unwrap(), 0);
        store.remove(&a).unwrap();
        assert_eq!(store.load(&a).unwrap(), 0);
    }

    #[test]
    fn memory_store_round_trip() {
        exercise(&MemoryWatermarks::new());
    }

    #[test]
    fn sqlite_store_round_trip() {
        exercise(&SqliteWatermarks::open_in_memory().unwrap());
    }

    #[test]
    fn sqlite_store_keeps_full_u64_range() {
        let store = SqliteWatermarks::open_in_memory().unwrap();
        let a = sid("a");
        store.persist(&a, u64::MAX - 1).unwrap();
        assert_eq!(store.load(&a).unwrap(), u64::MAX - 1);
    }

    #[test]
    fn sqlite_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("marks.db");
        {
            let store = SqliteWatermarks::open(&path).unwrap();
            store.persist(&sid("job-1"), 42).unwrap();
        }
        let store = SqliteWatermarks::open(&path).unwrap();
        assert_eq!(store.load(&sid("job-1")).unwrap(), 42);
    }
}
