//! One-time bridge from the legacy synchronous key/value storage
//!
//! ```text
//! NotChecked ──detect──▶ NeedsMigration ──bridge──▶ Bridging ──▶ Done
//!      │                       │
//!      │                       └──start_fresh──────────────────▶ Done
//!      └────detect──▶ NoLegacyData ──finish────────────────────▶ Done
//! ```
//!
//! Once the migration marker is written, detection always lands on `Done`, even if
//! the legacy keys are still physically present.

use crate::error::{MirrorError, Result};
use crate::host::HostEnvironment;
use crate::partition::PartitionKey;
use crate::store::PersistentStore;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// The old synchronous string-keyed storage.
pub trait LegacyStorage: Send + Sync {
    fn get_item(&self, key: &str) -> Result<Option<String>>;
    fn set_item(&self, key: &str, value: &str) -> Result<()>;
}

/// Legacy storage held in memory, for hosts that load it themselves.
#[derive(Debug, Default)]
pub struct MemoryLegacyStorage {
    items: Mutex<HashMap<String, String>>,
}

impl MemoryLegacyStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LegacyStorage for MemoryLegacyStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>> {
        Ok(self.items.lock().get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        self.items.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Legacy storage kept in an `ItemTable(key, value)` SQLite file.
pub struct ItemTableStorage {
    conn: Mutex<Connection>,
}

impl ItemTableStorage {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| MirrorError::StorageUnavailable(format!("legacy store {}: {}", path.display(), e)))?;
        conn.execute_batch("CREATE TABLE IF NOT EXISTS ItemTable (key TEXT UNIQUE ON CONFLICT REPLACE, value BLOB)")
            .map_err(|e| MirrorError::StorageUnavailable(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl LegacyStorage for ItemTableStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>> {
        self.conn
            .lock()
            .query_row("SELECT value FROM ItemTable WHERE key = ?1", params![key], |row| {
                row.get::<_, String>(0)
            })
            .optional()
            .map_err(|e| MirrorError::ReadFailure(e.to_string()))
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "INSERT INTO ItemTable (key, value) VALUES (?1, ?2)",
                params![key, value],
            )
            .map_err(|e| MirrorError::WriteFailure(e.to_string()))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    NotChecked,
    /// Legacy data found and the new store is empty; the host must offer the choice
    NeedsMigration,
    NoLegacyData,
    Bridging,
    Done,
}

/// What a successful bridge copied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeReport {
    pub copied: Vec<String>,
    /// Keys whose legacy value was not JSON and was carried over as a plain string
    pub raw_fallbacks: Vec<String>,
}

pub struct LegacyBridge {
    store: Arc<PersistentStore>,
    legacy: Arc<dyn LegacyStorage>,
    host: Arc<dyn HostEnvironment>,
    state: Mutex<BridgeState>,
}

impl LegacyBridge {
    pub fn new(
        store: Arc<PersistentStore>,
        legacy: Arc<dyn LegacyStorage>,
        host: Arc<dyn HostEnvironment>,
    ) -> Self {
        Self {
            store,
            legacy,
            host,
            state: Mutex::new(BridgeState::NotChecked),
        }
    }

    pub fn state(&self) -> BridgeState {
        *self.state.lock()
    }

    fn transition(&self, next: BridgeState) {
        let mut state = self.state.lock();
        debug!("Legacy bridge {:?} -> {:?}", *state, next);
        *state = next;
    }

    pub async fn marker_set(&self) -> bool {
        self.store
            .get::<bool>(PartitionKey::MigrationMarker.as_str())
            .await
            .unwrap_or(false)
    }

    fn has_legacy_data(&self) -> bool {
        PartitionKey::legacy_keys().any(|key| match self.legacy.get_item(key.as_str()) {
            Ok(Some(_)) => true,
            Ok(None) => false,
            Err(e) => {
                warn!("Legacy key {} unreadable during detection: {}", key, e);
                false
            }
        })
    }

    /// Decide whether migration must be offered.
    pub async fn detect(&self) -> Result<BridgeState> {
        let next = if self.marker_set().await {
            BridgeState::Done
        } else if self.store.get_all_keys().await?.is_empty() && self.has_legacy_data() {
            info!("Legacy data found and store is empty; migration needed");
            BridgeState::NeedsMigration
        } else {
            BridgeState::NoLegacyData
        };
        self.transition(next);
        Ok(next)
    }

    /// Copy every legacy key into the store in one bulk write, mark migration
    /// complete and ask the host to reload.
    ///
    /// On failure the marker stays unset so the bridge can be offered again.
    pub async fn bridge(&self) -> Result<BridgeReport> {
        let current = self.state();
        if current != BridgeState::NeedsMigration {
            return Err(MirrorError::MigrationFailure(format!(
                "bridge not offered in state {current:?}"
            )));
        }
        self.transition(BridgeState::Bridging);

        let report = match self.copy_legacy().await {
            Ok(report) => report,
            Err(e) => {
                error!("Legacy migration aborted, marker left unset: {}", e);
                self.transition(BridgeState::NeedsMigration);
                return Err(MirrorError::MigrationFailure(e.to_string()));
            }
        };

        if let Err(e) = self.store.set(PartitionKey::MigrationMarker.as_str(), &true).await {
            error!("Legacy data copied but marker write failed: {}", e);
            self.transition(BridgeState::NeedsMigration);
            return Err(MirrorError::MigrationFailure(e.to_string()));
        }

        info!(
            "Migrated {} legacy partitions ({} kept as raw strings)",
            report.copied.len(),
            report.raw_fallbacks.len()
        );
        self.transition(BridgeState::Done);
        self.host.reload();
        Ok(report)
    }

    async fn copy_legacy(&self) -> Result<BridgeReport> {
        let mut entries = BTreeMap::new();
        let mut report = BridgeReport::default();

        for key in PartitionKey::legacy_keys() {
            let Some(raw) = self.legacy.get_item(key.as_str())? else {
                continue;
            };
            let value = match serde_json::from_str::<Value>(&raw) {
                Ok(value) => value,
                Err(_) => {
                    report.raw_fallbacks.push(key.as_str().to_string());
                    Value::String(raw)
                }
            };
            report.copied.push(key.as_str().to_string());
            entries.insert(key.as_str().to_string(), value);
        }

        self.store.set_bulk(entries).await?;
        Ok(report)
    }

    /// Abandon the legacy data and never offer migration again.
    pub async fn start_fresh(&self) -> Result<()> {
        self.store
            .set(PartitionKey::MigrationMarker.as_str(), &true)
            .await?;
        info!("Starting fresh; legacy data abandoned");
        self.transition(BridgeState::Done);
        Ok(())
    }

    /// Close out a detection that found nothing to migrate.
    pub fn finish(&self) -> BridgeState {
        let mut state = self.state.lock();
        if *state == BridgeState::NoLegacyData {
            *state = BridgeState::Done;
        }
        *state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_table_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = ItemTableStorage::open(&dir.path().join("legacy.db")).unwrap();

        assert_eq!(storage.get_item("settings").unwrap(), None);
        storage.set_item("settings", r#"{"units":"lb"}"#).unwrap();
        storage.set_item("settings", r#"{"units":"kg"}"#).unwrap();
        assert_eq!(
            storage.get_item("settings").unwrap().as_deref(),
            Some(r#"{"units":"kg"}"#)
        );
    }

    #[test]
    fn test_memory_legacy_storage() {
        let storage = MemoryLegacyStorage::new();
        storage.set_item("pantry", "[]").unwrap();
        assert_eq!(storage.get_item("pantry").unwrap().as_deref(), Some("[]"));
        assert_eq!(storage.get_item("history").unwrap(), None);
    }
}
