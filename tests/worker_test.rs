//! Coalescing sync worker tests

mod common;

use common::Harness;
use mirrorkeep::{SyncRequest, SyncStatus, SyncStatusController, SyncWorker};
use std::sync::Arc;
use std::time::Duration;

async fn connected_controller() -> (Harness, Arc<SyncStatusController>) {
    let h = Harness::new().await;
    h.client.authorize(false).await.unwrap();
    let controller = Arc::new(SyncStatusController::new(h.client.clone(), true, true));
    (h, controller)
}

async fn wait_for_uploads(h: &Harness, count: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while h.remote.upload_count() < count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_burst_becomes_one_upload() {
    let (h, controller) = connected_controller().await;
    let (handle, _worker) = SyncWorker::spawn(controller.clone(), Duration::from_millis(50));

    assert_eq!(handle.request_sync(), SyncRequest::Queued);
    for _ in 0..4 {
        assert_eq!(handle.request_sync(), SyncRequest::Coalesced);
    }

    wait_for_uploads(&h, 1).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.remote.upload_count(), 1);
    assert_eq!(controller.status(), SyncStatus::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_upload_waits_for_debounce() {
    let (h, controller) = connected_controller().await;
    let mut rx = controller.subscribe();
    let (handle, _worker) = SyncWorker::spawn(controller.clone(), Duration::from_millis(1500));

    handle.request_sync();
    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert_eq!(h.remote.upload_count(), 0);

    rx.wait_for(|s| *s == SyncStatus::Connected).await.unwrap();
    assert_eq!(h.remote.upload_count(), 1);
}

#[tokio::test]
async fn test_one_follow_up_queued_behind_inflight_upload() {
    let (h, controller) = connected_controller().await;
    let gate = h.remote.hold_uploads();
    let mut rx = controller.subscribe();
    let (handle, _worker) = SyncWorker::spawn(controller.clone(), Duration::ZERO);

    assert_eq!(handle.request_sync(), SyncRequest::Queued);
    rx.wait_for(|s| *s == SyncStatus::Transmitting).await.unwrap();

    // The worker is busy uploading; one request waits, the rest ride along
    assert_eq!(handle.request_sync(), SyncRequest::Queued);
    assert_eq!(handle.request_sync(), SyncRequest::Coalesced);
    assert_eq!(handle.request_sync(), SyncRequest::Coalesced);

    gate.add_permits(2);
    wait_for_uploads(&h, 2).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.remote.upload_count(), 2);
}

#[tokio::test]
async fn test_worker_stops_when_handles_dropped() {
    let (_h, controller) = connected_controller().await;
    let (handle, worker) = SyncWorker::spawn(controller, Duration::ZERO);
    let spare = handle.clone();

    drop(handle);
    assert_eq!(spare.request_sync(), SyncRequest::Queued);
    drop(spare);

    tokio::time::timeout(Duration::from_secs(5), worker)
        .await
        .unwrap()
        .unwrap();
}
