//! Remote mirror synchronization
//!
//! The remote side holds exactly one document per account: a full snapshot of every
//! partition. Uploads overwrite it whole, so the last upload to land wins.

use crate::auth::{IdentityProvider, Token, TokenManager};
use crate::clock::Clock;
use crate::config::{Config, RemoteConfig};
use crate::error::{MirrorError, Result};
use crate::multipart;
use crate::partition::PartitionKey;
use crate::remote::RemoteObjectStore;
use crate::store::PersistentStore;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Version tag written into every uploaded document
pub const MIRROR_VERSION: &str = "1.0";

/// Wire format of the remote mirror
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MirrorDocument {
    pub version: String,
    /// Epoch ms at which the snapshot was taken
    pub last_updated: i64,
    pub data: BTreeMap<String, Value>,
}

pub struct SyncClient {
    store: Arc<PersistentStore>,
    tokens: TokenManager,
    remote: Arc<dyn RemoteObjectStore>,
    clock: Arc<dyn Clock>,
    config: RemoteConfig,
    last_synced_at: RwLock<Option<i64>>,
}

impl SyncClient {
    pub fn new(
        store: Arc<PersistentStore>,
        identity: Arc<dyn IdentityProvider>,
        remote: Arc<dyn RemoteObjectStore>,
        clock: Arc<dyn Clock>,
        config: &Config,
    ) -> Self {
        Self {
            store,
            tokens: TokenManager::new(identity, Arc::clone(&clock), &config.auth),
            remote,
            clock,
            config: config.remote.clone(),
            last_synced_at: RwLock::new(None),
        }
    }

    pub async fn authorize(&self, interactive: bool) -> Result<Token> {
        self.tokens.authorize(interactive).await
    }

    /// Pure freshness check; no I/O.
    pub fn has_valid_token(&self) -> bool {
        self.tokens.has_valid_token()
    }

    pub fn disconnect(&self) {
        self.tokens.disconnect();
    }

    /// Epoch ms of the last successful upload in this process
    pub fn last_synced_at(&self) -> Option<i64> {
        *self.last_synced_at.read()
    }

    fn bearer(&self) -> Result<String> {
        self.tokens
            .valid_token()
            .map(|t| t.access_token)
            .ok_or(MirrorError::NotAuthorized)
    }

    /// Drop the cached token when the remote side rejected it.
    fn observe<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(MirrorError::NotAuthorized) = &result {
            self.tokens.invalidate();
        }
        result
    }

    /// Identifier of the mirror object, or `None` if this account has none yet.
    pub async fn find_mirror_file(&self) -> Result<Option<String>> {
        let token = self.bearer()?;
        let found = self
            .remote
            .find_object(&token, &self.config.mirror_name, &self.config.folder)
            .await;
        self.observe(found)
    }

    /// Snapshot every partition and overwrite the remote mirror with it.
    ///
    /// Returns the `lastUpdated` timestamp written into the document.
    pub async fn upload_mirror(&self) -> Result<i64> {
        match self.try_upload().await {
            Ok(timestamp) => {
                *self.last_synced_at.write() = Some(timestamp);
                info!("Mirror uploaded (lastUpdated {})", timestamp);
                Ok(timestamp)
            }
            Err(e) => {
                warn!("Mirror upload failed: {}", e);
                Err(as_upload_failure(e))
            }
        }
    }

    async fn try_upload(&self) -> Result<i64> {
        let token = self.bearer()?;
        let data = self.store.snapshot().await?;
        let timestamp = self.clock.now_ms();

        let document = MirrorDocument {
            version: MIRROR_VERSION.to_string(),
            last_updated: timestamp,
            data,
        };
        let document = serde_json::to_value(&document)?;

        match self.find_mirror_file().await? {
            Some(id) => {
                let body = multipart::encode(&json!({ "name": self.config.mirror_name }), &document)?;
                let updated = self.remote.update_object(&token, &id, body).await;
                self.observe(updated)?;
                debug!("Updated mirror object {}", id);
            }
            None => {
                let metadata = json!({
                    "name": self.config.mirror_name,
                    "parents": [self.config.folder],
                });
                let body = multipart::encode(&metadata, &document)?;
                let created = self.remote.create_object(&token, body).await;
                let id = self.observe(created)?;
                info!("Created mirror object {}", id);
            }
        }
        Ok(timestamp)
    }

    /// Fetch and parse the mirror. Any failure reads as "no mirror".
    pub async fn download_mirror(&self) -> Option<MirrorDocument> {
        let token = match self.bearer() {
            Ok(token) => token,
            Err(_) => {
                debug!("Skipping mirror download: not authorized");
                return None;
            }
        };

        let id = match self.find_mirror_file().await {
            Ok(Some(id)) => id,
            Ok(None) => {
                debug!("No mirror exists for this account");
                return None;
            }
            Err(e) => {
                warn!("Mirror lookup failed: {}", e);
                return None;
            }
        };

        let fetched = self.remote.fetch_object(&token, &id).await;
        let bytes = match self.observe(fetched) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Mirror fetch failed: {}", e);
                return None;
            }
        };

        match serde_json::from_slice::<MirrorDocument>(&bytes) {
            Ok(document) => Some(document),
            Err(e) => {
                warn!("Mirror content is not a mirror document: {}", e);
                None
            }
        }
    }

    /// Replace local partitions with the mirror's contents.
    ///
    /// Returns the restored document's `lastUpdated`, or `None` when there was
    /// nothing to restore. A completed migration stays completed.
    pub async fn restore_from_mirror(&self) -> Result<Option<i64>> {
        let Some(document) = self.download_mirror().await else {
            return Ok(None);
        };

        let marker = PartitionKey::MigrationMarker.as_str();
        let mut data = document.data;
        if self.store.get::<bool>(marker).await.unwrap_or(false) {
            data.insert(marker.to_string(), Value::Bool(true));
        }

        self.store.replace_all(data).await?;
        info!("Restored local state from mirror (lastUpdated {})", document.last_updated);
        Ok(Some(document.last_updated))
    }
}

fn as_upload_failure(e: MirrorError) -> MirrorError {
    match e {
        MirrorError::UploadFailure { .. } => e,
        MirrorError::NotAuthorized => MirrorError::UploadFailure {
            status: Some(401),
            message: e.to_string(),
        },
        MirrorError::Remote { status, message } => MirrorError::UploadFailure {
            status: Some(status),
            message,
        },
        MirrorError::Http(ref inner) => MirrorError::UploadFailure {
            status: inner.status().map(|s| s.as_u16()),
            message: inner.to_string(),
        },
        other => MirrorError::UploadFailure {
            status: None,
            message: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_wire_names() {
        let mut data = BTreeMap::new();
        data.insert("pantry".to_string(), json!(["rice"]));
        let document = MirrorDocument {
            version: MIRROR_VERSION.to_string(),
            last_updated: 1_700_000_000_000,
            data,
        };

        let value = serde_json::to_value(&document).unwrap();
        assert_eq!(value["version"], "1.0");
        assert_eq!(value["lastUpdated"], 1_700_000_000_000i64);
        assert_eq!(value["data"]["pantry"], json!(["rice"]));
    }

    #[test]
    fn test_remote_errors_become_upload_failures() {
        let mapped = as_upload_failure(MirrorError::Remote {
            status: 403,
            message: "quota".into(),
        });
        assert!(matches!(
            mapped,
            MirrorError::UploadFailure { status: Some(403), .. }
        ));

        let mapped = as_upload_failure(MirrorError::NotAuthorized);
        assert!(matches!(
            mapped,
            MirrorError::UploadFailure { status: Some(401), .. }
        ));
    }
}
