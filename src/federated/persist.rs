//! Snapshot persistence.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};

use super::snapshot::{SyncSnapshot, SNAPSHOT_VERSION};

/// Trait for snapshot storage backends.
pub trait SnapshotStore: Send + Sync {
  /// Load the snapshot for a collection. Unreadable or outdated snapshots are `None`.
  fn load(&self, collection_id: &str) -> Result<Option<SyncSnapshot>>;

  /// Replace the snapshot for a collection.
  fn save(&self, collection_id: &str, snapshot: &SyncSnapshot) -> Result<()>;

  /// Forget the snapshot for a collection.
  fn clear(&self, collection_id: &str) -> Result<()>;
}

/// Process-local snapshots, gone with the process.
#[derive(Default)]
pub struct MemorySnapshotStore {
  snapshots: Mutex<HashMap<String, SyncSnapshot>>,
}

impl MemorySnapshotStore {
  pub fn new() -> Self {
    Self::default()
  }
}

impl SnapshotStore for MemorySnapshotStore {
  fn load(&self, collection_id: &str) -> Result<Option<SyncSnapshot>> {
    let snapshots = self
      .snapshots
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(
      snapshots
        .get(collection_id)
        .filter(|s| s.version == SNAPSHOT_VERSION)
        .cloned(),
    )
  }

  fn save(&self, collection_id: &str, snapshot: &SyncSnapshot) -> Result<()> {
    self
      .snapshots
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?
      .insert(collection_id.to_string(), snapshot.clone());
    Ok(())
  }

  fn clear(&self, collection_id: &str) -> Result<()> {
    self
      .snapshots
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?
      .remove(collection_id);
    Ok(())
  }
}

/// A token unique to this process start.
pub fn new_session_token() -> String {
  let mut hasher = Sha256::new();
  hasher.update(std::process::id().to_le_bytes());
  hasher.update(Utc::now().to_rfc3339().as_bytes());
  hex::encode(hasher.finalize())
}

/// SQLite-based snapshot storage, bound to one session.
///
/// Opening with a session token other than the stored one drops every
/// snapshot, so a fresh process start always begins with a full fetch.
pub struct SqliteSnapshotStore {
  conn: Mutex<Connection>,
}

impl SqliteSnapshotStore {
  /// Open or create the snapshot database at `path`.
  pub fn open(path: &Path, session_token: &str) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create snapshot directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open snapshot database at {}: {}", path.display(), e))?;
    Self::with_connection(conn, session_token)
  }

  pub fn open_in_memory(session_token: &str) -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory snapshot database: {}", e))?;
    Self::with_connection(conn, session_token)
  }

  fn with_connection(conn: Connection, session_token: &str) -> Result<Self> {
    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;
    store.start_session(session_token)?;
    Ok(store)
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(SNAPSHOT_SCHEMA)
      .map_err(|e| eyre!("Failed to run snapshot migrations: {}", e))?;

    Ok(())
  }

  fn start_session(&self, token: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let previous: Option<String> = conn
      .query_row("SELECT token FROM session WHERE id = 1", [], |row| row.get(0))
      .ok();
    if previous.as_deref() == Some(token) {
      return Ok(());
    }

    let cleared = conn
      .execute("DELETE FROM sync_snapshots", [])
      .map_err(|e| eyre!("Failed to clear snapshots: {}", e))?;
    conn
      .execute(
        "INSERT OR REPLACE INTO session (id, token, started_at) VALUES (1, ?, ?)",
        params![token, Utc::now().to_rfc3339()],
      )
      .map_err(|e| eyre!("Failed to record session: {}", e))?;

    if cleared > 0 {
      info!(cleared, "New session, dropped persisted snapshots");
    }
    Ok(())
  }
}

/// Schema for snapshot tables.
const SNAPSHOT_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS session (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    token TEXT NOT NULL,
    started_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sync_snapshots (
    collection_id TEXT PRIMARY KEY,
    version INTEGER NOT NULL,
    data BLOB NOT NULL,
    saved_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl SnapshotStore for SqliteSnapshotStore {
  fn load(&self, collection_id: &str) -> Result<Option<SyncSnapshot>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let row: Option<(u32, Vec<u8>)> = conn
      .query_row(
        "SELECT version, data FROM sync_snapshots WHERE collection_id = ?",
        params![collection_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .ok();

    let Some((version, data)) = row else {
      return Ok(None);
    };
    if version != SNAPSHOT_VERSION {
      debug!(collection = %collection_id, version, "Ignoring snapshot from another version");
      return Ok(None);
    }

    match serde_json::from_slice::<SyncSnapshot>(&data) {
      Ok(snapshot) if snapshot.version == SNAPSHOT_VERSION => Ok(Some(snapshot)),
      Ok(_) => Ok(None),
      Err(e) => {
        debug!(collection = %collection_id, error = %e, "Ignoring unreadable snapshot");
        Ok(None)
      }
    }
  }

  fn save(&self, collection_id: &str, snapshot: &SyncSnapshot) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let data =
      serde_json::to_vec(snapshot).map_err(|e| eyre!("Failed to serialize snapshot: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO sync_snapshots (collection_id, version, data, saved_at)
         VALUES (?, ?, ?, datetime('now'))",
        params![collection_id, snapshot.version, data],
      )
      .map_err(|e| eyre!("Failed to store snapshot: {}", e))?;

    Ok(())
  }

  fn clear(&self, collection_id: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "DELETE FROM sync_snapshots WHERE collection_id = ?",
        params![collection_id],
      )
      .map_err(|e| eyre!("Failed to clear snapshot: {}", e))?;

    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::federated::snapshot::tests::listed;
  use chrono::Duration;

  fn snapshot() -> SyncSnapshot {
    SyncSnapshot::from_listing(&[listed("h1", 1), listed("h2", 2)], Duration::hours(1))
  }

  #[test]
  fn test_sqlite_round_trip_and_clear() {
    let store = SqliteSnapshotStore::open_in_memory("session-a").unwrap();
    assert!(store.load("catalog").unwrap().is_none());

    let saved = snapshot();
    store.save("catalog", &saved).unwrap();
    assert_eq!(store.load("catalog").unwrap(), Some(saved));

    store.clear("catalog").unwrap();
    assert!(store.load("catalog").unwrap().is_none());
  }

  #[test]
  fn test_new_session_drops_snapshots() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("snapshots.db");

    {
      let store = SqliteSnapshotStore::open(&path, "session-a").unwrap();
      store.save("catalog", &snapshot()).unwrap();
    }
    {
      let store = SqliteSnapshotStore::open(&path, "session-a").unwrap();
      assert!(store.load("catalog").unwrap().is_some());
    }
    let store = SqliteSnapshotStore::open(&path, "session-b").unwrap();
    assert!(store.load("catalog").unwrap().is_none());
  }

  #[test]
  fn test_version_mismatch_loads_as_absent() {
    let store = SqliteSnapshotStore::open_in_memory("s").unwrap();
    let mut old = snapshot();
    old.version = SNAPSHOT_VERSION + 1;
    store.save("catalog", &old).unwrap();
    assert!(store.load("catalog").unwrap().is_none());

    let memory = MemorySnapshotStore::new();
    memory.save("catalog", &old).unwrap();
    assert!(memory.load("catalog").unwrap().is_none());
  }

  #[test]
  fn test_session_tokens_differ() {
    let a = new_session_token();
    assert_eq!(a.len(), 64);
    std::thread::sleep(std::time::Duration::from_millis(2));
    assert_ne!(a, new_session_token());
  }
}
