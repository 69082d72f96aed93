//! Partition key registry and typed partition handles

use crate::error::Result;
use crate::store::PersistentStore;
use crate::worker::SyncHandle;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// Every named slice of persisted application state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PartitionKey {
    History,
    Settings,
    Templates,
    Trash,
    Library,
    DeletedExercises,
    ActiveSession,
    NutritionLog,
    NutritionProfile,
    NarrativeNotes,
    Pantry,
    Biometrics,
    MorphologyScans,
    EquipmentOffsets,
    MigrationMarker,
}

impl PartitionKey {
    pub const ALL: [PartitionKey; 15] = [
        PartitionKey::History,
        PartitionKey::Settings,
        PartitionKey::Templates,
        PartitionKey::Trash,
        PartitionKey::Library,
        PartitionKey::DeletedExercises,
        PartitionKey::ActiveSession,
        PartitionKey::NutritionLog,
        PartitionKey::NutritionProfile,
        PartitionKey::NarrativeNotes,
        PartitionKey::Pantry,
        PartitionKey::Biometrics,
        PartitionKey::MorphologyScans,
        PartitionKey::EquipmentOffsets,
        PartitionKey::MigrationMarker,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PartitionKey::History => "history",
            PartitionKey::Settings => "settings",
            PartitionKey::Templates => "templates",
            PartitionKey::Trash => "trash",
            PartitionKey::Library => "library",
            PartitionKey::DeletedExercises => "deleted-exercises",
            PartitionKey::ActiveSession => "active-session",
            PartitionKey::NutritionLog => "nutrition-log",
            PartitionKey::NutritionProfile => "nutrition-profile",
            PartitionKey::NarrativeNotes => "narrative-notes",
            PartitionKey::Pantry => "pantry",
            PartitionKey::Biometrics => "biometrics",
            PartitionKey::MorphologyScans => "morphology-scans",
            PartitionKey::EquipmentOffsets => "equipment-offsets",
            PartitionKey::MigrationMarker => "migration-marker",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.as_str() == s)
    }

    /// Mutations of a synced partition schedule a mirror upload.
    pub fn is_synced(&self) -> bool {
        !matches!(self, PartitionKey::MigrationMarker)
    }

    /// Whether application code may hold a handle for this key. The migration marker
    /// is written only by the legacy bridge and never reverts.
    pub fn is_app_owned(&self) -> bool {
        !matches!(self, PartitionKey::MigrationMarker)
    }

    /// Keys the old synchronous storage may still hold.
    pub fn legacy_keys() -> impl Iterator<Item = PartitionKey> {
        Self::ALL
            .into_iter()
            .filter(|k| *k != PartitionKey::MigrationMarker)
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serializes writes to one partition across every handle that shares it
pub type WriteLock = Arc<tokio::sync::Mutex<()>>;

/// Typed accessor for one partition.
///
/// Writes through handles sharing a [`WriteLock`] are serialized, and each successful
/// write to a synced partition asks the sync worker for an upload. There is no
/// handle for the migration marker.
pub struct PartitionHandle<T> {
    key: PartitionKey,
    store: Arc<PersistentStore>,
    sync: Option<SyncHandle>,
    write_lock: WriteLock,
    _marker: PhantomData<fn() -> T>,
}

impl<T> PartitionHandle<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Handle with a write lock of its own. `None` for keys that are not app-owned.
    pub fn new(key: PartitionKey, store: Arc<PersistentStore>, sync: Option<SyncHandle>) -> Option<Self> {
        Self::shared(key, store, sync, WriteLock::default())
    }

    pub fn shared(
        key: PartitionKey,
        store: Arc<PersistentStore>,
        sync: Option<SyncHandle>,
        write_lock: WriteLock,
    ) -> Option<Self> {
        if !key.is_app_owned() {
            return None;
        }
        Some(Self {
            key,
            store,
            sync,
            write_lock,
            _marker: PhantomData,
        })
    }

    pub fn key(&self) -> PartitionKey {
        self.key
    }

    /// Current value, or `None` when absent or unreadable
    pub async fn load(&self) -> Option<T> {
        self.store.get(self.key.as_str()).await
    }

    pub async fn save(&self, value: &T) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.store.set(self.key.as_str(), value).await?;
        self.signal();
        Ok(())
    }

    pub async fn clear(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.store.remove(self.key.as_str()).await?;
        self.signal();
        Ok(())
    }

    fn signal(&self) {
        if !self.key.is_synced() {
            return;
        }
        if let Some(sync) = &self.sync {
            sync.request_sync();
        }
    }
}
