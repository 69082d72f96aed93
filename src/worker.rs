//! Coalescing sync worker
//!
//! Mutations send a "sync requested" signal; one background task turns bursts of
//! them into single evaluations. The channel holds one pending request, so there is
//! never more than one upload in flight plus one follow-up queued behind it.

use crate::status::SyncStatusController;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// What happened to a sync request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncRequest {
    Queued,
    /// A request was already waiting; this one rides along with it
    Coalesced,
    /// The worker has stopped
    Closed,
}

#[derive(Debug, Clone)]
pub struct SyncHandle {
    tx: mpsc::Sender<()>,
}

impl SyncHandle {
    /// Ask for an upload. Never blocks.
    pub fn request_sync(&self) -> SyncRequest {
        match self.tx.try_send(()) {
            Ok(()) => SyncRequest::Queued,
            Err(TrySendError::Full(())) => SyncRequest::Coalesced,
            Err(TrySendError::Closed(())) => SyncRequest::Closed,
        }
    }
}

pub struct SyncWorker;

impl SyncWorker {
    /// Spawn the worker on the current runtime. It stops once every handle is dropped.
    pub fn spawn(controller: Arc<SyncStatusController>, debounce: Duration) -> (SyncHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(1);
        let task = tokio::spawn(run(controller, debounce, rx));
        (SyncHandle { tx }, task)
    }
}

async fn run(controller: Arc<SyncStatusController>, debounce: Duration, mut rx: mpsc::Receiver<()>) {
    debug!("Sync worker started (debounce {:?})", debounce);
    while rx.recv().await.is_some() {
        if !debounce.is_zero() {
            tokio::time::sleep(debounce).await;
        }
        while rx.try_recv().is_ok() {
            trace!("Coalesced queued sync request");
        }
        let status = controller.notify_mutation().await;
        debug!("Sync pass finished: {}", status);
    }
    debug!("Sync worker stopped");
}
