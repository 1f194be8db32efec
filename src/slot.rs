//! # Persistence Slot
//!
//! A tiny key/value store for the two values that must survive a reload:
//! the session identifier and the last known position.
//!
//! Two backends ship with the crate:
//! - [`MemorySlot`] - process-local, for tests and hosts without storage
//! - [`SqliteSlot`] - a single-table SQLite database (feature `persistence`)

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{Result, TrackerError};
use crate::Position;

/// Key under which the session identifier is stored.
pub const SESSION_ID_KEY: &str = "sessionId";

/// Key under which the last known position is stored (JSON-encoded).
pub const LAST_POSITION_KEY: &str = "lastKnownPosition";

/// Key/value storage owned by the host.
pub trait PersistenceSlot: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
}

/// Store a position under [`LAST_POSITION_KEY`].
pub fn store_position(slot: &dyn PersistenceSlot, position: &Position) -> Result<()> {
    let json = serde_json::to_string(position).map_err(TrackerError::persistence)?;
    slot.set(LAST_POSITION_KEY, &json)
}

/// Load the position stored under [`LAST_POSITION_KEY`], if any.
///
/// A value that no longer parses is treated as absent.
pub fn load_position(slot: &dyn PersistenceSlot) -> Result<Option<Position>> {
    Ok(slot
        .get(LAST_POSITION_KEY)?
        .and_then(|raw| serde_json::from_str(&raw).ok()))
}

// ============================================================================
// In-memory slot
// ============================================================================

/// Process-local slot backed by a map.
#[derive(Debug, Default)]
pub struct MemorySlot {
    entries: Mutex<HashMap<String, String>>,
    writes: Mutex<HashMap<String, u32>>,
}

impl MemorySlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of writes made to a key since creation.
    pub fn write_count(&self, key: &str) -> u32 {
        self.writes
            .lock()
            .map(|w| w.get(key).copied().unwrap_or(0))
            .unwrap_or(0)
    }
}

impl PersistenceSlot for MemorySlot {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.lock().map_err(TrackerError::persistence)?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.lock().map_err(TrackerError::persistence)?;
        entries.insert(key.to_string(), value.to_string());
        drop(entries);

        let mut writes = self.writes.lock().map_err(TrackerError::persistence)?;
        *writes.entry(key.to_string()).or_insert(0) += 1;
        Ok(())
    }
}

// ============================================================================
// SQLite slot
// ============================================================================

#[cfg(feature = "persistence")]
pub use sqlite::SqliteSlot;

#[cfg(feature = "persistence")]
mod sqlite {
    use std::sync::Mutex;

    use log::info;
    use rusqlite::{params, Connection, OptionalExtension};

    use super::PersistenceSlot;
    use crate::error::{Result, TrackerError};

    /// Slot persisted in a SQLite database file.
    pub struct SqliteSlot {
        db: Mutex<Connection>,
    }

    impl SqliteSlot {
        /// Open (or create) the slot database at the given path.
        pub fn new(db_path: &str) -> Result<Self> {
            let db = Connection::open(db_path)?;
            Self::init_schema(&db)?;
            info!("[SqliteSlot] Opened {}", db_path);

            Ok(Self { db: Mutex::new(db) })
        }

        /// Create an in-memory database (for testing).
        pub fn in_memory() -> Result<Self> {
            Self::new(":memory:")
        }

        fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS slot (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL,
                    updated_at INTEGER DEFAULT (strftime('%s', 'now'))
                );
                "#,
            )
        }
    }

    impl PersistenceSlot for SqliteSlot {
        fn get(&self, key: &str) -> Result<Option<String>> {
            let db = self.db.lock().map_err(TrackerError::persistence)?;
            let value = db
                .query_row(
                    "SELECT value FROM slot WHERE key = ?1",
                    params![key],
                    |row| row.get::<_, String>(0),
                )
                .optional()?;
            Ok(value)
        }

        fn set(&self, key: &str, value: &str) -> Result<()> {
            let db = self.db.lock().map_err(TrackerError::persistence)?;
            db.execute(
                "INSERT INTO slot (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value,
                 updated_at = strftime('%s', 'now')",
                params![key, value],
            )?;
            Ok(())
        }
    }
}
