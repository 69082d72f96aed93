//! Fakes shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use mirrorkeep::config::Config;
use mirrorkeep::multipart::{self, MultipartBody};
use mirrorkeep::{
    Clock, DetachedHost, IdentityProvider, ManualClock, MirrorError, PersistentStore,
    RemoteObjectStore, Result, SyncClient, TokenGrant,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

pub const ACCOUNT: &str = "lifter@example.com";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantMode {
    Grant,
    Fail,
    /// Never completes
    Hang,
}

/// Identity provider with scripted behaviour for each grant kind
pub struct FakeIdentity {
    token: String,
    ttl_secs: u64,
    silent: Mutex<GrantMode>,
    interactive: Mutex<GrantMode>,
    pub silent_calls: AtomicUsize,
    pub interactive_calls: AtomicUsize,
    pub last_hint: Mutex<Option<String>>,
}

impl FakeIdentity {
    pub fn new(token: &str, ttl_secs: u64) -> Self {
        Self {
            token: token.to_string(),
            ttl_secs,
            silent: Mutex::new(GrantMode::Grant),
            interactive: Mutex::new(GrantMode::Grant),
            silent_calls: AtomicUsize::new(0),
            interactive_calls: AtomicUsize::new(0),
            last_hint: Mutex::new(None),
        }
    }

    pub fn set_silent(&self, mode: GrantMode) {
        *self.silent.lock() = mode;
    }

    pub fn set_interactive(&self, mode: GrantMode) {
        *self.interactive.lock() = mode;
    }

    async fn grant(&self, mode: GrantMode, hint: Option<&str>) -> Result<TokenGrant> {
        *self.last_hint.lock() = hint.map(str::to_string);
        match mode {
            GrantMode::Grant => Ok(TokenGrant {
                access_token: self.token.clone(),
                expires_in_seconds: self.ttl_secs,
                account_hint: Some(ACCOUNT.to_string()),
            }),
            GrantMode::Fail => Err(MirrorError::Remote {
                status: 400,
                message: "interaction_required".into(),
            }),
            GrantMode::Hang => std::future::pending::<Result<TokenGrant>>().await,
        }
    }
}

#[async_trait]
impl IdentityProvider for FakeIdentity {
    async fn grant_interactive(&self, hint: Option<&str>) -> Result<TokenGrant> {
        self.interactive_calls.fetch_add(1, Ordering::SeqCst);
        let mode = *self.interactive.lock();
        self.grant(mode, hint).await
    }

    async fn grant_silent(&self, hint: Option<&str>) -> Result<TokenGrant> {
        self.silent_calls.fetch_add(1, Ordering::SeqCst);
        let mode = *self.silent.lock();
        self.grant(mode, hint).await
    }
}

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub name: String,
    pub parents: Vec<String>,
    pub content: Vec<u8>,
}

/// One multipart upload as the remote saw it
#[derive(Debug, Clone)]
pub struct UploadRecord {
    pub id: String,
    pub created: bool,
    pub metadata: Value,
}

/// In-memory object store speaking the same multipart bodies as the real one
#[derive(Default)]
pub struct FakeRemote {
    objects: Mutex<BTreeMap<String, StoredObject>>,
    uploads: Mutex<Vec<UploadRecord>>,
    next_id: AtomicUsize,
    fail_uploads: Mutex<Option<u16>>,
    rejected_token: Mutex<Option<String>>,
    gate: Mutex<Option<Arc<Semaphore>>>,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every upload with `status` until cleared with `None`.
    pub fn fail_uploads(&self, status: Option<u16>) {
        *self.fail_uploads.lock() = status;
    }

    /// Treat `token` as revoked.
    pub fn reject_token(&self, token: &str) {
        *self.rejected_token.lock() = Some(token.to_string());
    }

    /// Uploads wait for a permit on the returned semaphore.
    pub fn hold_uploads(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    pub fn uploads(&self) -> Vec<UploadRecord> {
        self.uploads.lock().clone()
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.lock().len()
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().len()
    }

    /// Place an object directly, bypassing the upload path.
    pub fn insert_raw(&self, name: &str, folder: &str, content: &[u8]) -> String {
        let id = self.allocate_id();
        self.objects.lock().insert(
            id.clone(),
            StoredObject {
                name: name.to_string(),
                parents: vec![folder.to_string()],
                content: content.to_vec(),
            },
        );
        id
    }

    /// Parsed content of the object called `name`
    pub fn document(&self, name: &str) -> Option<Value> {
        self.objects
            .lock()
            .values()
            .find(|o| o.name == name)
            .and_then(|o| serde_json::from_slice(&o.content).ok())
    }

    fn allocate_id(&self) -> String {
        format!("obj-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn check_token(&self, token: &str) -> Result<()> {
        if token.is_empty() || self.rejected_token.lock().as_deref() == Some(token) {
            return Err(MirrorError::NotAuthorized);
        }
        Ok(())
    }

    async fn admit_upload(&self) -> Result<()> {
        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        match *self.fail_uploads.lock() {
            Some(status) => Err(MirrorError::Remote {
                status,
                message: "injected failure".into(),
            }),
            None => Ok(()),
        }
    }
}

fn unpack(body: &MultipartBody) -> Result<(Value, Vec<u8>)> {
    let (metadata, document) = multipart::decode(&body.boundary, &body.bytes)?;
    Ok((metadata, serde_json::to_vec(&document)?))
}

#[async_trait]
impl RemoteObjectStore for FakeRemote {
    async fn find_object(&self, token: &str, name: &str, folder: &str) -> Result<Option<String>> {
        self.check_token(token)?;
        Ok(self
            .objects
            .lock()
            .iter()
            .find(|(_, o)| o.name == name && o.parents.iter().any(|p| p == folder))
            .map(|(id, _)| id.clone()))
    }

    async fn create_object(&self, token: &str, body: MultipartBody) -> Result<String> {
        self.check_token(token)?;
        self.admit_upload().await?;
        let (metadata, content) = unpack(&body)?;

        let id = self.allocate_id();
        let object = StoredObject {
            name: metadata["name"].as_str().unwrap_or_default().to_string(),
            parents: metadata["parents"]
                .as_array()
                .map(|p| p.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                .unwrap_or_default(),
            content,
        };
        self.objects.lock().insert(id.clone(), object);
        self.uploads.lock().push(UploadRecord {
            id: id.clone(),
            created: true,
            metadata,
        });
        Ok(id)
    }

    async fn update_object(&self, token: &str, id: &str, body: MultipartBody) -> Result<()> {
        self.check_token(token)?;
        self.admit_upload().await?;
        let (metadata, content) = unpack(&body)?;

        {
            let mut objects = self.objects.lock();
            let object = objects.get_mut(id).ok_or_else(|| MirrorError::Remote {
                status: 404,
                message: format!("no object {id}"),
            })?;
            object.content = content;
        }
        self.uploads.lock().push(UploadRecord {
            id: id.to_string(),
            created: false,
            metadata,
        });
        Ok(())
    }

    async fn fetch_object(&self, token: &str, id: &str) -> Result<Vec<u8>> {
        self.check_token(token)?;
        self.objects
            .lock()
            .get(id)
            .map(|o| o.content.clone())
            .ok_or_else(|| MirrorError::Remote {
                status: 404,
                message: format!("no object {id}"),
            })
    }
}

/// Config whose store lives under `dir`, with no debounce
pub fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.store.path = dir.join("store.sqlite3");
    config.sync.debounce_ms = 0;
    config
}

/// A sync client over a memory store and fakes
pub struct Harness {
    pub config: Config,
    pub host: Arc<DetachedHost>,
    pub store: Arc<PersistentStore>,
    pub identity: Arc<FakeIdentity>,
    pub remote: Arc<FakeRemote>,
    pub clock: Arc<ManualClock>,
    pub client: Arc<SyncClient>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(Config::default()).await
    }

    pub async fn with_config(config: Config) -> Self {
        let host = Arc::new(DetachedHost::new());
        let store = Arc::new(PersistentStore::in_memory(host.clone()));
        store.init().await.unwrap();

        let identity = Arc::new(FakeIdentity::new("tok-1", 3600));
        let remote = Arc::new(FakeRemote::new());
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let client = Arc::new(SyncClient::new(
            store.clone(),
            identity.clone(),
            remote.clone(),
            clock.clone() as Arc<dyn Clock>,
            &config,
        ));

        Self {
            config,
            host,
            store,
            identity,
            remote,
            clock,
            client,
        }
    }

    pub fn mirror(&self) -> Option<Value> {
        self.remote.document(&self.config.remote.mirror_name)
    }
}
