//! Host environment collaborator
//!
//! The embedding application owns process lifecycle. The store and the legacy bridge
//! ask it for a best-effort durable-storage grant and for a full reload so every
//! reader re-hydrates from the store. Boot also asks whether the network is up.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub trait HostEnvironment: Send + Sync {
    /// Ask the host to protect our data from eviction. `false` is not an error.
    fn request_persistence(&self) -> bool;

    /// Tear down in-memory state and start again from the store.
    fn reload(&self);

    /// Connectivity at boot; later changes arrive through the status controller.
    fn is_online(&self) -> bool {
        true
    }
}

/// Host used when the embedding application does not supply one.
///
/// Grants nothing and records reload requests so the caller can act on them
/// at a convenient point in its own loop.
#[derive(Debug, Default)]
pub struct DetachedHost {
    reloads: AtomicUsize,
    persist_granted: AtomicBool,
}

impl DetachedHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Host that answers the persistence request with `granted`.
    pub fn with_persistence(granted: bool) -> Self {
        Self {
            reloads: AtomicUsize::new(0),
            persist_granted: AtomicBool::new(granted),
        }
    }

    /// Number of reloads requested so far
    pub fn reload_requests(&self) -> usize {
        self.reloads.load(Ordering::SeqCst)
    }
}

impl HostEnvironment for DetachedHost {
    fn request_persistence(&self) -> bool {
        self.persist_granted.load(Ordering::SeqCst)
    }

    fn reload(&self) {
        tracing::info!("Host reload requested");
        self.reloads.fetch_add(1, Ordering::SeqCst);
    }
}
