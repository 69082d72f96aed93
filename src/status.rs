//! Sync status state machine
//!
//! The status is derived from three inputs (feature toggle, connectivity, token
//! validity) plus the outcome of the last upload attempt. `Transmitting` is the only
//! state with a side effect: entering it starts an upload. Uploads run one at a time
//! behind an async gate, and an upload whose evaluation was superseded before it got
//! through the gate never starts.

use crate::error::MirrorError;
use crate::mirror::SyncClient;
use crate::partition::PartitionKey;
use crate::store::PersistentStore;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Disconnected,
    Pending,
    Transmitting,
    Connected,
    Error,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncStatus::Disconnected => "disconnected",
            SyncStatus::Pending => "pending",
            SyncStatus::Transmitting => "transmitting",
            SyncStatus::Connected => "connected",
            SyncStatus::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
struct Inputs {
    enabled: bool,
    online: bool,
    /// Bumped by every evaluation; an upload result only lands if it is still current
    epoch: u64,
}

pub struct SyncStatusController {
    client: Arc<SyncClient>,
    inputs: Mutex<Inputs>,
    status: watch::Sender<SyncStatus>,
    last_error: Mutex<Option<String>>,
    upload_gate: tokio::sync::Mutex<()>,
}

impl SyncStatusController {
    pub fn new(client: Arc<SyncClient>, enabled: bool, online: bool) -> Self {
        let initial = if enabled {
            SyncStatus::Pending
        } else {
            SyncStatus::Disconnected
        };
        let (status, _) = watch::channel(initial);

        Self {
            client,
            inputs: Mutex::new(Inputs {
                enabled,
                online,
                epoch: 0,
            }),
            status,
            last_error: Mutex::new(None),
            upload_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Controller whose toggle comes from the boolean `field` of the settings partition.
    /// A missing partition or field means disabled.
    pub async fn from_settings(
        client: Arc<SyncClient>,
        store: &PersistentStore,
        field: &str,
        online: bool,
    ) -> Self {
        let settings: Option<Value> = store.get(PartitionKey::Settings.as_str()).await;
        let enabled = settings
            .as_ref()
            .and_then(|s| s.get(field))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        debug!("Sync enabled in settings: {}", enabled);
        Self::new(client, enabled, online)
    }

    pub fn status(&self) -> SyncStatus {
        *self.status.borrow()
    }

    /// Observe status changes without blocking the controller.
    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub fn is_enabled(&self) -> bool {
        self.inputs.lock().enabled
    }

    pub fn is_online(&self) -> bool {
        self.inputs.lock().online
    }

    /// Message of the most recent failed upload, cleared by the next success
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    pub async fn set_enabled(&self, enabled: bool) -> SyncStatus {
        self.inputs.lock().enabled = enabled;
        info!("Sync {}", if enabled { "enabled" } else { "disabled" });
        self.evaluate().await
    }

    /// Record connectivity. Coming back online with sync enabled and no usable token
    /// tries one silent grant first, so an expired or revoked token recovers without
    /// a consent prompt.
    pub async fn set_online(&self, online: bool) -> SyncStatus {
        let (changed, enabled) = {
            let mut inputs = self.inputs.lock();
            let changed = std::mem::replace(&mut inputs.online, online) != online;
            (changed, inputs.enabled)
        };
        if changed {
            info!("Network {}", if online { "online" } else { "offline" });
        }
        if changed && online && enabled && !self.client.has_valid_token() {
            if let Err(e) = self.client.authorize(false).await {
                info!("Silent re-authorization failed: {}", e);
            }
        }
        self.evaluate().await
    }

    /// Disable sync and wait out any upload already past the gate. Evaluations that
    /// were queued or mid-flight when this is called upload nothing afterwards.
    pub async fn halt(&self) -> SyncStatus {
        {
            let mut inputs = self.inputs.lock();
            inputs.enabled = false;
            inputs.epoch += 1;
            self.publish(SyncStatus::Disconnected);
        }
        let _idle = self.upload_gate.lock().await;
        info!("Sync halted");
        SyncStatus::Disconnected
    }

    /// A synced partition changed.
    pub async fn notify_mutation(&self) -> SyncStatus {
        self.evaluate().await
    }

    /// Re-derive the status from the current inputs, uploading if everything allows it.
    pub async fn evaluate(&self) -> SyncStatus {
        let (epoch, next) = {
            let mut inputs = self.inputs.lock();
            inputs.epoch += 1;
            let next = if !inputs.enabled {
                SyncStatus::Disconnected
            } else if !inputs.online || !self.client.has_valid_token() {
                SyncStatus::Pending
            } else {
                SyncStatus::Transmitting
            };
            self.publish(next);
            (inputs.epoch, next)
        };

        if next != SyncStatus::Transmitting {
            return next;
        }

        let _gate = self.upload_gate.lock().await;
        if self.inputs.lock().epoch != epoch {
            debug!("Evaluation {} superseded before upload", epoch);
            return self.status();
        }
        let outcome = self.client.upload_mirror().await;

        let inputs = self.inputs.lock();
        if inputs.epoch != epoch {
            debug!("Discarding upload result from superseded evaluation {}", epoch);
            return self.status();
        }
        let next = self.record(outcome.err());
        self.publish(next);
        next
    }

    fn record(&self, failure: Option<MirrorError>) -> SyncStatus {
        match failure {
            None => {
                *self.last_error.lock() = None;
                SyncStatus::Connected
            }
            Some(e) => {
                warn!("Sync attempt failed: {}", e);
                *self.last_error.lock() = Some(e.to_string());
                SyncStatus::Error
            }
        }
    }

    fn publish(&self, next: SyncStatus) {
        let previous = self.status.send_replace(next);
        if previous != next {
            debug!("Sync status {} -> {}", previous, next);
        }
    }
}
