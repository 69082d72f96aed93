//! Service container and boot sequence
//!
//! Everything is built once at startup and handed to consumers explicitly, so tests
//! can swap any collaborator for a fake.

use crate::auth::IdentityProvider;
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::Result;
use crate::host::HostEnvironment;
use crate::legacy::{BridgeReport, BridgeState, LegacyBridge, LegacyStorage};
use crate::mirror::SyncClient;
use crate::partition::{PartitionHandle, PartitionKey, WriteLock};
use crate::remote::RemoteObjectStore;
use crate::status::{SyncStatus, SyncStatusController};
use crate::store::PersistentStore;
use crate::worker::{SyncHandle, SyncRequest, SyncWorker};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// External collaborators supplied by the embedding application
#[derive(Clone)]
pub struct Collaborators {
    pub host: Arc<dyn HostEnvironment>,
    pub legacy: Arc<dyn LegacyStorage>,
    pub identity: Arc<dyn IdentityProvider>,
    pub remote: Arc<dyn RemoteObjectStore>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    pub fn new(
        host: Arc<dyn HostEnvironment>,
        legacy: Arc<dyn LegacyStorage>,
        identity: Arc<dyn IdentityProvider>,
        remote: Arc<dyn RemoteObjectStore>,
    ) -> Self {
        Self {
            host,
            legacy,
            identity,
            remote,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

pub struct Services {
    config: Config,
    host: Arc<dyn HostEnvironment>,
    store: Arc<PersistentStore>,
    bridge: LegacyBridge,
    sync: Arc<SyncClient>,
    status: Arc<SyncStatusController>,
    handle: SyncHandle,
    worker: JoinHandle<()>,
    write_locks: HashMap<PartitionKey, WriteLock>,
}

/// Result of the boot sequence
pub struct Boot {
    pub services: Services,
    /// Outcome of legacy detection. `NeedsMigration` means the host must offer the
    /// bridge/start-fresh choice before the application is ready.
    pub migration: BridgeState,
}

impl Boot {
    pub fn is_ready(&self) -> bool {
        self.migration != BridgeState::NeedsMigration
    }
}

impl Services {
    /// Open the store, check for legacy data, try silent authorization and settle the
    /// initial sync status.
    pub async fn boot(config: Config, collaborators: Collaborators) -> Result<Boot> {
        let Collaborators {
            host,
            legacy,
            identity,
            remote,
            clock,
        } = collaborators;

        let store = Arc::new(PersistentStore::open_or_memory(&config.store, Arc::clone(&host)).await?);
        if !store.is_persistent() {
            warn!("Running without persistence for this session");
        }

        let bridge = LegacyBridge::new(Arc::clone(&store), legacy, Arc::clone(&host));
        let migration = match bridge.detect().await {
            Ok(state) => state,
            Err(e) => {
                warn!("Legacy detection failed, assuming nothing to migrate: {}", e);
                BridgeState::NoLegacyData
            }
        };
        if migration == BridgeState::NoLegacyData {
            bridge.finish();
        }

        let sync = Arc::new(SyncClient::new(Arc::clone(&store), identity, remote, clock, &config));
        let online = host.is_online();
        let status = Arc::new(
            SyncStatusController::from_settings(
                Arc::clone(&sync),
                &store,
                &config.sync.enabled_setting,
                online,
            )
            .await,
        );

        if status.is_enabled() && online {
            if let Err(e) = sync.authorize(false).await {
                info!("Silent authorization unavailable at boot: {}", e);
            }
        }

        let (handle, worker) = SyncWorker::spawn(Arc::clone(&status), config.sync.debounce());
        let initial = status.evaluate().await;
        info!("Boot complete (migration: {:?}, sync: {})", migration, initial);

        Ok(Boot {
            services: Services {
                config,
                host,
                store,
                bridge,
                sync,
                status,
                handle,
                worker,
                write_locks: PartitionKey::ALL
                    .into_iter()
                    .map(|key| (key, WriteLock::default()))
                    .collect(),
            },
            migration,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<PersistentStore> {
        &self.store
    }

    pub fn sync(&self) -> &Arc<SyncClient> {
        &self.sync
    }

    pub fn status(&self) -> &Arc<SyncStatusController> {
        &self.status
    }

    pub fn migration_state(&self) -> BridgeState {
        self.bridge.state()
    }

    /// Typed accessor for one partition, wired to the sync worker. Every handle for
    /// the same key shares one write lock. `None` for the migration marker.
    pub fn partition<T>(&self, key: PartitionKey) -> Option<PartitionHandle<T>>
    where
        T: Serialize + DeserializeOwned,
    {
        let lock = self.write_locks.get(&key).cloned().unwrap_or_default();
        PartitionHandle::shared(key, Arc::clone(&self.store), Some(self.handle.clone()), lock)
    }

    pub fn request_sync(&self) -> SyncRequest {
        self.handle.request_sync()
    }

    /// Copy legacy data into the store. The host is asked to reload on success.
    pub async fn bridge(&self) -> Result<BridgeReport> {
        self.bridge.bridge().await
    }

    pub async fn start_fresh(&self) -> Result<()> {
        self.bridge.start_fresh().await
    }

    /// Interactive consent, then an immediate status evaluation.
    pub async fn connect(&self) -> Result<SyncStatus> {
        self.sync.authorize(true).await?;
        Ok(self.status.evaluate().await)
    }

    pub async fn disconnect(&self) -> SyncStatus {
        self.sync.disconnect();
        self.status.evaluate().await
    }

    /// Replace local state with the remote mirror, then ask the host to reload.
    pub async fn restore_from_mirror(&self) -> Result<Option<i64>> {
        let restored = self.sync.restore_from_mirror().await?;
        if restored.is_some() {
            self.reload_host();
        }
        Ok(restored)
    }

    /// Destroy every local partition. A completed migration is remembered.
    ///
    /// Sync is halted first so nothing uploads the emptied store over the remote
    /// mirror. It stays off until the host enables it again.
    pub async fn hard_reset(&self) -> Result<()> {
        self.status.halt().await;

        let mut keep = BTreeMap::new();
        if self.bridge.marker_set().await {
            keep.insert(PartitionKey::MigrationMarker.as_str().to_string(), Value::Bool(true));
        }
        self.store.reset_to(keep).await?;
        info!("Local state reset");
        self.reload_host();
        Ok(())
    }

    fn reload_host(&self) {
        self.host.reload();
    }

    /// Stop the sync worker. It exits after its queued request once every
    /// partition handle is dropped as well.
    pub async fn shutdown(self) {
        let Services { handle, worker, .. } = self;
        drop(handle);
        if let Err(e) = worker.await {
            warn!("Sync worker ended abnormally: {}", e);
        }
    }
}
