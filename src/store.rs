//! Partitioned key/value store
//!
//! One SQLite table keyed by partition name, values kept as JSON text. The store never
//! looks inside a value. All blocking SQLite work runs on the tokio blocking pool.
//!
//! Reads never fail from the caller's point of view: [`PersistentStore::get`] reports
//! a read error as absence. [`PersistentStore::read`] keeps the distinction for
//! diagnostics.

use crate::config::StoreConfig;
use crate::error::{MirrorError, Result};
use crate::host::HostEnvironment;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Schema version this build reads and writes (`PRAGMA user_version`).
pub const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS partitions (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);
"#;

const UPSERT: &str = "INSERT INTO partitions (key, value, updated_at) VALUES (?1, ?2, ?3)
     ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at";

/// Result of a read that keeps "absent" and "failed" apart.
#[derive(Debug)]
pub enum ReadOutcome<T> {
    Found(T),
    Absent,
    Failed(MirrorError),
}

impl<T> ReadOutcome<T> {
    pub fn into_option(self) -> Option<T> {
        match self {
            ReadOutcome::Found(v) => Some(v),
            ReadOutcome::Absent | ReadOutcome::Failed(_) => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ReadOutcome::Failed(_))
    }
}

#[derive(Debug, Clone)]
enum Location {
    File(PathBuf),
    Memory,
}

#[derive(Debug, Clone, Copy)]
enum Access {
    Read,
    Write,
}

impl Access {
    fn error(self, message: impl Display) -> MirrorError {
        match self {
            Access::Read => MirrorError::ReadFailure(message.to_string()),
            Access::Write => MirrorError::WriteFailure(message.to_string()),
        }
    }
}

fn unavailable(e: impl Display) -> MirrorError {
    MirrorError::StorageUnavailable(e.to_string())
}

/// Async partitioned key/value store over SQLite
pub struct PersistentStore {
    location: Location,
    conn: Arc<Mutex<Option<Connection>>>,
    host: Arc<dyn HostEnvironment>,
    request_persistence: bool,
    persistence_asked: AtomicBool,
    persistence_granted: AtomicBool,
}

impl PersistentStore {
    /// Store backed by the database file at `path`. Nothing is opened until [`init`](Self::init).
    pub fn new(path: impl AsRef<Path>, host: Arc<dyn HostEnvironment>) -> Self {
        Self::with_location(Location::File(path.as_ref().to_path_buf()), host, true)
    }

    /// Memory-only store; contents vanish with the process.
    pub fn in_memory(host: Arc<dyn HostEnvironment>) -> Self {
        Self::with_location(Location::Memory, host, false)
    }

    fn with_location(location: Location, host: Arc<dyn HostEnvironment>, request_persistence: bool) -> Self {
        Self {
            location,
            conn: Arc::new(Mutex::new(None)),
            host,
            request_persistence,
            persistence_asked: AtomicBool::new(false),
            persistence_granted: AtomicBool::new(false),
        }
    }

    /// Open the configured database, degrading to a memory-only session when it
    /// cannot be opened and `memory_fallback` is set.
    pub async fn open_or_memory(config: &StoreConfig, host: Arc<dyn HostEnvironment>) -> Result<Self> {
        let mut store = Self::new(&config.path, Arc::clone(&host));
        store.request_persistence = config.request_persistence;

        match store.init().await {
            Ok(()) => Ok(store),
            Err(MirrorError::StorageUnavailable(reason)) if config.memory_fallback => {
                warn!(
                    "Database at {} unavailable ({}); continuing without persistence",
                    config.path.display(),
                    reason
                );
                let memory = Self::in_memory(host);
                memory.init().await?;
                Ok(memory)
            }
            Err(e) => Err(e),
        }
    }

    /// Open (creating if absent) the database. Calling it again is a no-op.
    pub async fn init(&self) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }

        let conn = Arc::clone(&self.conn);
        let location = self.location.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            if guard.is_none() {
                *guard = Some(open_connection(&location)?);
            }
            Ok::<_, MirrorError>(())
        })
        .await
        .map_err(unavailable)??;

        debug!("Partition store open ({})", self.describe());
        self.ask_for_persistence();
        Ok(())
    }

    fn ask_for_persistence(&self) {
        if !self.request_persistence || self.persistence_asked.swap(true, Ordering::SeqCst) {
            return;
        }
        let granted = self.host.request_persistence();
        self.persistence_granted.store(granted, Ordering::SeqCst);
        if granted {
            info!("Host granted persistent storage");
        } else {
            warn!("Host declined persistent storage; data may be evicted under pressure");
        }
    }

    pub fn is_open(&self) -> bool {
        self.conn.lock().is_some()
    }

    /// `false` when this session degraded to memory-only storage
    pub fn is_persistent(&self) -> bool {
        matches!(self.location, Location::File(_))
    }

    pub fn persistence_granted(&self) -> bool {
        self.persistence_granted.load(Ordering::SeqCst)
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.location {
            Location::File(p) => Some(p),
            Location::Memory => None,
        }
    }

    fn describe(&self) -> String {
        match &self.location {
            Location::File(p) => p.display().to_string(),
            Location::Memory => "memory".to_string(),
        }
    }

    /// Run `f` against the open connection on the blocking pool.
    ///
    /// Every call first checks the on-disk schema version. A newer version means
    /// another process upgraded the file: the connection is closed and the host reloads.
    async fn with_conn<R, F>(&self, access: Access, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<R> + Send + 'static,
    {
        if !self.is_open() {
            self.init().await.map_err(|e| access.error(e))?;
        }

        let conn = Arc::clone(&self.conn);
        let outcome = tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            let found = match guard.as_ref() {
                Some(c) => schema_version(c).map_err(|e| access.error(e))?,
                None => return Err(access.error("store is closed")),
            };
            if found > SCHEMA_VERSION {
                *guard = None;
                return Err(MirrorError::VersionConflict {
                    found,
                    expected: SCHEMA_VERSION,
                });
            }
            match guard.as_mut() {
                Some(c) => f(c),
                None => Err(access.error("store is closed")),
            }
        })
        .await
        .map_err(|e| access.error(format!("storage task failed: {e}")))?;

        if let Err(MirrorError::VersionConflict { found, expected }) = &outcome {
            error!(
                "Database schema moved to {} under us (expected {}); closing and reloading",
                found, expected
            );
            self.host.reload();
        }
        outcome
    }

    /// Read a partition, keeping absence and failure apart.
    pub async fn read<T: DeserializeOwned>(&self, key: &str) -> ReadOutcome<T> {
        let owned_key = key.to_string();
        let raw = self
            .with_conn(Access::Read, move |conn| {
                conn.query_row(
                    "SELECT value FROM partitions WHERE key = ?1",
                    params![owned_key],
                    |row| row.get::<_, String>(0),
                )
                .optional()
                .map_err(|e| Access::Read.error(e))
            })
            .await;

        match raw {
            Ok(Some(text)) => match serde_json::from_str(&text) {
                Ok(value) => ReadOutcome::Found(value),
                Err(e) => ReadOutcome::Failed(Access::Read.error(format!("partition {key}: {e}"))),
            },
            Ok(None) => ReadOutcome::Absent,
            Err(e) => ReadOutcome::Failed(e),
        }
    }

    /// Stored value for `key`, or `None` when absent or unreadable. Never fails.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.read(key).await {
            ReadOutcome::Failed(e) => {
                warn!("Treating unreadable partition {} as absent: {}", key, e);
                None
            }
            outcome => outcome.into_option(),
        }
    }

    /// Insert or replace a partition value.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let text = serde_json::to_string(value).map_err(|e| Access::Write.error(e))?;
        let owned_key = key.to_string();
        let now = chrono::Utc::now().timestamp_millis();
        self.with_conn(Access::Write, move |conn| {
            conn.execute(UPSERT, params![owned_key, text, now])
                .map_err(|e| Access::Write.error(e))?;
            Ok(())
        })
        .await?;
        debug!("Wrote partition {}", key);
        Ok(())
    }

    /// Delete a partition. Deleting a missing key succeeds.
    pub async fn remove(&self, key: &str) -> Result<()> {
        let owned_key = key.to_string();
        self.with_conn(Access::Write, move |conn| {
            conn.execute("DELETE FROM partitions WHERE key = ?1", params![owned_key])
                .map_err(|e| Access::Write.error(e))?;
            Ok(())
        })
        .await
    }

    /// All partition keys currently stored, sorted.
    pub async fn get_all_keys(&self) -> Result<Vec<String>> {
        self.with_conn(Access::Read, |conn| {
            let mut stmt = conn
                .prepare("SELECT key FROM partitions ORDER BY key")
                .map_err(|e| Access::Read.error(e))?;
            let keys = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(|e| Access::Read.error(e))?
                .collect::<rusqlite::Result<Vec<String>>>()
                .map_err(|e| Access::Read.error(e))?;
            Ok(keys)
        })
        .await
    }

    /// Write every pair in one transaction; either all land or none do.
    pub async fn set_bulk(&self, entries: BTreeMap<String, Value>) -> Result<()> {
        let count = entries.len();
        self.with_conn(Access::Write, move |conn| write_all(conn, &entries, false))
            .await?;
        debug!("Bulk wrote {} partitions", count);
        Ok(())
    }

    /// Replace the whole partition set with `entries` in one transaction.
    pub async fn replace_all(&self, entries: BTreeMap<String, Value>) -> Result<()> {
        let count = entries.len();
        self.with_conn(Access::Write, move |conn| write_all(conn, &entries, true))
            .await?;
        info!("Replaced local state with {} partitions", count);
        Ok(())
    }

    /// Every partition value as of one instant.
    pub async fn snapshot(&self) -> Result<BTreeMap<String, Value>> {
        self.with_conn(Access::Read, |conn| {
            let tx = conn.transaction().map_err(|e| Access::Read.error(e))?;
            let rows = {
                let mut stmt = tx
                    .prepare("SELECT key, value FROM partitions ORDER BY key")
                    .map_err(|e| Access::Read.error(e))?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
                    .map_err(|e| Access::Read.error(e))?
                    .collect::<rusqlite::Result<Vec<(String, String)>>>()
                    .map_err(|e| Access::Read.error(e))?;
                rows
            };
            tx.commit().map_err(|e| Access::Read.error(e))?;

            let mut data = BTreeMap::new();
            for (key, text) in rows {
                let value = serde_json::from_str(&text)
                    .map_err(|e| Access::Read.error(format!("partition {key}: {e}")))?;
                data.insert(key, value);
            }
            Ok(data)
        })
        .await
    }

    /// Close the connection and destroy the database. The next operation starts
    /// from an empty store.
    pub async fn clear_all(&self) -> Result<()> {
        let conn = Arc::clone(&self.conn);
        let location = self.location.clone();
        tokio::task::spawn_blocking(move || {
            close(&mut conn.lock());
            if let Location::File(path) = &location {
                remove_database_files(path)?;
            }
            Ok::<(), MirrorError>(())
        })
        .await
        .map_err(|e| Access::Write.error(format!("storage task failed: {e}")))??;

        info!("Partition store destroyed ({})", self.describe());
        Ok(())
    }

    /// Destroy the database and reopen it holding only `keep`.
    ///
    /// The replacement file is built beside the old one and renamed over it, so a
    /// crash leaves either the old database or the new one, never an empty store.
    pub async fn reset_to(&self, keep: BTreeMap<String, Value>) -> Result<()> {
        let conn = Arc::clone(&self.conn);
        let location = self.location.clone();
        let count = keep.len();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            close(&mut guard);
            let fresh = match &location {
                Location::File(path) => {
                    let staging = sibling(path, ".reset");
                    remove_database_files(&staging)?;
                    {
                        let mut staged = open_connection(&Location::File(staging.clone()))
                            .map_err(|e| Access::Write.error(e))?;
                        write_all(&mut staged, &keep, true)?;
                        if let Err((_, e)) = staged.close() {
                            return Err(Access::Write.error(e));
                        }
                    }
                    remove_sidecars(path)?;
                    std::fs::rename(&staging, path).map_err(|e| Access::Write.error(e))?;
                    open_connection(&location).map_err(|e| Access::Write.error(e))?
                }
                Location::Memory => {
                    let mut memory = open_connection(&location).map_err(|e| Access::Write.error(e))?;
                    write_all(&mut memory, &keep, true)?;
                    memory
                }
            };
            *guard = Some(fresh);
            Ok(())
        })
        .await
        .map_err(|e| Access::Write.error(format!("storage task failed: {e}")))??;

        info!("Partition store reset ({}), kept {} partitions", self.describe(), count);
        Ok(())
    }
}

fn close(slot: &mut Option<Connection>) {
    if let Some(c) = slot.take() {
        if let Err((_, e)) = c.close() {
            warn!("Closing database before wipe failed: {}", e);
        }
    }
}

/// `path` with `suffix` appended to its file name
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn remove_if_present(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Access::Write.error(e)),
    }
}

/// Journal files SQLite keeps next to the database
fn remove_sidecars(path: &Path) -> Result<()> {
    for suffix in ["-journal", "-wal", "-shm"] {
        remove_if_present(&sibling(path, suffix))?;
    }
    Ok(())
}

fn remove_database_files(path: &Path) -> Result<()> {
    remove_sidecars(path)?;
    remove_if_present(path)
}

fn open_connection(location: &Location) -> Result<Connection> {
    let conn = match location {
        Location::File(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(unavailable)?;
            }
            Connection::open(path).map_err(unavailable)?
        }
        Location::Memory => Connection::open_in_memory().map_err(unavailable)?,
    };
    conn.busy_timeout(Duration::from_secs(5)).map_err(unavailable)?;
    apply_schema(&conn)?;
    Ok(conn)
}

fn apply_schema(conn: &Connection) -> Result<()> {
    let current = schema_version(conn).map_err(unavailable)?;
    if current > SCHEMA_VERSION {
        return Err(MirrorError::StorageUnavailable(format!(
            "database schema version {current} is newer than supported {SCHEMA_VERSION}"
        )));
    }

    if current < SCHEMA_VERSION {
        let tx = conn.unchecked_transaction().map_err(unavailable)?;
        tx.execute_batch(SCHEMA).map_err(unavailable)?;
        tx.pragma_update(None, "user_version", SCHEMA_VERSION)
            .map_err(unavailable)?;
        tx.commit().map_err(unavailable)?;
    }
    Ok(())
}

fn schema_version(conn: &Connection) -> rusqlite::Result<i64> {
    conn.query_row("PRAGMA user_version", [], |row| row.get(0))
}

fn write_all(conn: &mut Connection, entries: &BTreeMap<String, Value>, replace: bool) -> Result<()> {
    let now = chrono::Utc::now().timestamp_millis();
    let tx = conn.transaction().map_err(|e| Access::Write.error(e))?;
    if replace {
        tx.execute("DELETE FROM partitions", [])
            .map_err(|e| Access::Write.error(e))?;
    }
    {
        let mut stmt = tx.prepare(UPSERT).map_err(|e| Access::Write.error(e))?;
        for (key, value) in entries {
            let text = serde_json::to_string(value).map_err(|e| Access::Write.error(e))?;
            stmt.execute(params![key, text, now])
                .map_err(|e| Access::Write.error(format!("partition {key}: {e}")))?;
        }
    }
    tx.commit().map_err(|e| Access::Write.error(e))
}
