//! mirrorkeep - local-first partitioned storage with a single-document cloud mirror
//!
//! Application state lives in named partitions inside an embedded SQLite store. A
//! one-time bridge pulls data over from the old synchronous storage, and the whole
//! partition set is mirrored to one remote JSON document per account.

pub mod auth;
pub mod clock;
pub mod config;
pub mod error;
pub mod host;
pub mod legacy;
pub mod logging;
pub mod mirror;
pub mod multipart;
pub mod partition;
pub mod remote;
pub mod services;
pub mod status;
pub mod store;
pub mod worker;

// Re-export commonly used types
pub use auth::{IdentityProvider, Token, TokenGrant};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use error::{MirrorError, Result};
pub use host::{DetachedHost, HostEnvironment};
pub use legacy::{BridgeReport, BridgeState, LegacyBridge, LegacyStorage};
pub use mirror::{MirrorDocument, SyncClient, MIRROR_VERSION};
pub use partition::{PartitionHandle, PartitionKey};
pub use remote::{HttpObjectStore, RemoteObjectStore};
pub use services::{Boot, Collaborators, Services};
pub use status::{SyncStatus, SyncStatusController};
pub use store::{PersistentStore, ReadOutcome};
pub use worker::{SyncHandle, SyncRequest, SyncWorker};
