//! SQLite-backed persistence.
//!
//! One file holds the log, the snapshots and the checkpoint. The connection
//! runs with `synchronous=FULL` so a returned append has reached the disk.

use crate::error::{StorageError, StorageResult};
use crate::persistence::{Checkpoint, PersistedState, Persistence, Snapshot};
use crate::wal::WalEntry;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tandem_types::EntityId;
use tracing::debug;

/// Persistent store backed by SQLite.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Opens (or creates) a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        Self::with_connection(Connection::open(path)?)
    }

    /// Opens an in-memory store (for testing).
    pub fn open_in_memory() -> StorageResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> StorageResult<Self> {
        conn.pragma_update(None, "synchronous", "FULL")?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StorageError::poisoned())
    }

    fn init_schema(&self) -> StorageResult<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS wal (
                wal_offset INTEGER PRIMARY KEY,
                op_id TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL,
                entry TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS snapshots (
                entity_id TEXT PRIMARY KEY,
                entity_type TEXT NOT NULL,
                state TEXT NOT NULL,
                covered_offset INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            ",
        )?;
        Ok(())
    }
}

fn to_i64(offset: u64) -> StorageResult<i64> {
    i64::try_from(offset).map_err(|_| StorageError::InvalidData(format!("offset {offset} out of range")))
}

impl Persistence for SqliteStore {
    fn load(&self) -> StorageResult<PersistedState> {
        let conn = self.lock()?;

        let mut stmt = conn.prepare("SELECT entry FROM wal ORDER BY wal_offset")?;
        let wal = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .map(|raw| Ok(serde_json::from_str::<WalEntry>(&raw?)?))
            .collect::<StorageResult<Vec<_>>>()?;

        let mut stmt = conn.prepare(
            "SELECT entity_id, entity_type, state, covered_offset FROM snapshots ORDER BY entity_id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        let snapshots = rows
            .into_iter()
            .map(|(id, entity_type, state, covered)| {
                Ok(Snapshot {
                    entity_id: EntityId::parse(&id)
                        .map_err(|e| StorageError::InvalidData(format!("bad entity id {id}: {e}")))?,
                    entity_type,
                    state: serde_json::from_str(&state)?,
                    covered_offset: covered as u64,
                })
            })
            .collect::<StorageResult<Vec<_>>>()?;

        let checkpoint = conn
            .query_row("SELECT value FROM meta WHERE key = 'checkpoint'", [], |row| {
                row.get::<_, String>(0)
            })
            .optional()?
            .map(|raw| serde_json::from_str::<Checkpoint>(&raw))
            .transpose()?
            .unwrap_or_default();

        let last_offset = conn
            .query_row("SELECT value FROM meta WHERE key = 'last_offset'", [], |row| {
                row.get::<_, String>(0)
            })
            .optional()?
            .map(|raw| {
                raw.parse::<u64>()
                    .map_err(|_| StorageError::InvalidData(format!("bad last_offset {raw}")))
            })
            .transpose()?
            .unwrap_or(0);

        debug!(entries = wal.len(), snapshots = snapshots.len(), "sqlite state loaded");
        Ok(PersistedState {
            snapshots,
            checkpoint,
            wal,
            last_offset,
        })
    }

    fn append_wal(&self, entry: &WalEntry) -> StorageResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO wal (wal_offset, op_id, status, entry) VALUES (?1, ?2, ?3, ?4)",
            params![
                to_i64(entry.offset())?,
                entry.id().to_string(),
                entry.status.as_str(),
                serde_json::to_string(entry)?,
            ],
        )?;
        tx.execute(
            "INSERT INTO meta (key, value) VALUES ('last_offset', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![entry.offset().to_string()],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn update_wal(&self, entry: &WalEntry) -> StorageResult<()> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE wal SET status = ?2, entry = ?3 WHERE wal_offset = ?1",
            params![
                to_i64(entry.offset())?,
                entry.status.as_str(),
                serde_json::to_string(entry)?,
            ],
        )?;
        if changed == 0 {
            return Err(StorageError::EntryNotFound(entry.id()));
        }
        Ok(())
    }

    fn remove_wal(&self, offsets: &[u64]) -> StorageResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare("DELETE FROM wal WHERE wal_offset = ?1")?;
            for offset in offsets {
                stmt.execute(params![to_i64(*offset)?])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn commit(&self, snapshots: &[Snapshot], checkpoint: &Checkpoint) -> StorageResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO snapshots (entity_id, entity_type, state, covered_offset)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(entity_id) DO UPDATE SET
                    entity_type = excluded.entity_type,
                    state = excluded.state,
                    covered_offset = excluded.covered_offset",
            )?;
            for snapshot in snapshots {
                stmt.execute(params![
                    snapshot.entity_id.to_string(),
                    snapshot.entity_type,
                    serde_json::to_string(&snapshot.state)?,
                    to_i64(snapshot.covered_offset)?,
                ])?;
            }
        }
        tx.execute(
            "INSERT INTO meta (key, value) VALUES ('checkpoint', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![serde_json::to_string(checkpoint)?],
        )?;
        tx.commit()?;
        debug!(
            snapshots = snapshots.len(),
            cursor = checkpoint.remote_cursor,
            "sqlite commit"
        );
        Ok(())
    }
}
