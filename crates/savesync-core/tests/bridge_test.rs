//! Integration tests for the worker bridge: call forwarding, progress
//! proxying, lifecycle and teardown.

use std::sync::Arc;

use futures::future::join_all;

use savesync_core::bridge::{
    BridgeClient, BridgeError, BridgeOptions, BridgeState, ContextTracker, TransferBuffer, WorkerBridge,
};
use savesync_core::harness::{HarnessError, Provenance};
use savesync_test_utils::{CountingSaveLoader, PANIC_PREFIX, init_tracing};

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

fn spawn(loader: CountingSaveLoader) -> (WorkerBridge<CountingSaveLoader>, ContextTracker) {
    init_tracing();
    let tracker = ContextTracker::default();
    let options = BridgeOptions::named("bridge-test").with_tracker(tracker.clone());
    let bridge = WorkerBridge::spawn(loader, options).unwrap();
    (bridge, tracker)
}

fn buffer(bytes: &[u8]) -> TransferBuffer {
    TransferBuffer::from(bytes.to_vec())
}

async fn wait_for_exit(tracker: &ContextTracker) {
    for _ in 0..100 {
        if tracker.outstanding() == 0 {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("worker context still alive");
}

fn crashing_input() -> TransferBuffer {
    let mut bytes = PANIC_PREFIX.to_vec();
    bytes.extend_from_slice(b" save");
    TransferBuffer::from(bytes)
}

// ---------------------------------------------------------------------------
// Save operations
// ---------------------------------------------------------------------------

#[tokio::test]
async fn parse_installs_result_and_frees_previous() {
    let loader = CountingSaveLoader::new();
    let probe = loader.probe();
    let (bridge, _tracker) = spawn(loader);

    bridge.stage(buffer(b"one"), Provenance::LocalFile).await.unwrap();
    let first = bridge.parse().await.unwrap();
    assert_eq!(first["label"], "one");
    assert_eq!(bridge.staged_len().await.unwrap(), None, "parse consumes the stash");

    let second = bridge.parse_bytes(buffer(b"two"), Provenance::RemoteUrl).await.unwrap();
    assert_eq!(second["label"], "two");
    assert_eq!(probe.frees(), vec!["one".to_string()]);
    assert_eq!(bridge.metadata().await.unwrap()["label"], "two");

    bridge.release().await;
    assert_eq!(probe.frees(), vec!["one".to_string(), "two".to_string()]);
}

#[tokio::test]
async fn melt_leaves_stash_in_place() {
    let (bridge, _tracker) = spawn(CountingSaveLoader::new());

    bridge.stage(buffer(b"save"), Provenance::FilesystemHandle).await.unwrap();
    let melted = bridge.melt().await.unwrap();
    assert_eq!(melted.as_slice(), b"melted:save");
    assert_eq!(bridge.staged_len().await.unwrap(), Some(4));

    let again = bridge.melt().await.unwrap();
    assert_eq!(again, melted);

    let taken = bridge.take().await.unwrap();
    assert_eq!(taken.into_vec(), b"save".to_vec());
    assert_eq!(bridge.staged_len().await.unwrap(), None);

    let err = bridge.take().await.unwrap_err();
    assert!(matches!(err, BridgeError::Harness(HarnessError::EmptyStash)));

    bridge.release().await;
}

#[tokio::test]
async fn metadata_without_result_is_an_error() {
    let (bridge, _tracker) = spawn(CountingSaveLoader::new());
    let err = bridge.metadata().await.unwrap_err();
    assert!(matches!(err, BridgeError::Harness(HarnessError::NoActiveResult)));
    bridge.release().await;
}

#[tokio::test]
async fn tokens_are_forwarded_to_the_module() {
    let loader = CountingSaveLoader::new();
    let probe = loader.probe();
    let (bridge, _tracker) = spawn(loader);

    bridge.set_tokens(buffer(b"tokens")).await.unwrap();
    assert_eq!(probe.tokens().as_deref(), Some(&b"tokens"[..]));
    bridge.release().await;
}

#[tokio::test]
async fn failed_initialization_is_retried_by_the_next_call() {
    let loader = CountingSaveLoader::new().failing_first(1);
    let probe = loader.probe();
    let (bridge, _tracker) = spawn(loader);

    bridge.stage(buffer(b"x"), Provenance::LocalFile).await.unwrap();
    let err = bridge.parse().await.unwrap_err();
    assert!(matches!(err, BridgeError::Harness(HarnessError::ModuleLoad(_))));

    // The failed call never reached `take`, so the stash is still there.
    assert_eq!(bridge.parse().await.unwrap()["label"], "x");
    assert_eq!(probe.loads(), 2);
    bridge.release().await;
}

#[tokio::test]
async fn concurrent_calls_share_one_module() {
    let loader = CountingSaveLoader::new();
    let probe = loader.probe();
    let (bridge, _tracker) = spawn(loader);

    let calls = (0..10).map(|i| {
        let bridge = &bridge;
        async move {
            bridge
                .parse_bytes(buffer(format!("save-{i}").as_bytes()), Provenance::LocalFile)
                .await
        }
    });
    let outcomes = join_all(calls).await;

    assert!(outcomes.iter().all(Result::is_ok));
    assert_eq!(probe.loads(), 1);
    assert_eq!(probe.frees().len(), 9, "all but the last result are freed");
    bridge.release().await;
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

#[tokio::test]
async fn progress_is_delivered_in_order_before_completion() {
    let (bridge, _tracker) = spawn(CountingSaveLoader::new());

    let mut seen = Vec::new();
    let outcome = bridge
        .call_with_progress(
            |_harness, progress| {
                Box::pin(async move {
                    for percent in [10, 40, 70, 100] {
                        progress.report(percent);
                        tokio::task::yield_now().await;
                    }
                    Ok("done")
                })
            },
            |percent| seen.push(percent),
        )
        .await
        .unwrap();

    assert_eq!(outcome, "done");
    assert_eq!(seen, vec![10, 40, 70, 100]);
    bridge.release().await;
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn release_tears_down_the_worker() {
    let (bridge, tracker) = spawn(CountingSaveLoader::new());
    bridge.stage(buffer(b"x"), Provenance::LocalFile).await.unwrap();
    assert_eq!(bridge.state(), BridgeState::Ready);
    assert_eq!(tracker.outstanding(), 1);

    bridge.release().await;
    assert_eq!(bridge.state(), BridgeState::Released);
    assert_eq!(tracker.outstanding(), 0);

    let err = bridge.stage(buffer(b"y"), Provenance::LocalFile).await.unwrap_err();
    assert!(matches!(err, BridgeError::Released(_)));

    bridge.release().await;
    assert_eq!(tracker.outstanding(), 0);
}

#[tokio::test]
async fn dropped_bridge_still_exits_its_worker() {
    let (bridge, tracker) = spawn(CountingSaveLoader::new());
    bridge.stage(buffer(b"x"), Provenance::LocalFile).await.unwrap();
    drop(bridge);

    wait_for_exit(&tracker).await;
}

#[tokio::test]
async fn worker_panic_releases_the_bridge() {
    let (bridge, tracker) = spawn(CountingSaveLoader::new());
    bridge.parse_bytes(buffer(b"ok"), Provenance::LocalFile).await.unwrap();
    assert!(bridge.is_alive());

    let err = bridge
        .parse_bytes(crashing_input(), Provenance::LocalFile)
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::WorkerGone(_)), "unexpected error: {err:?}");

    wait_for_exit(&tracker).await;
    assert_eq!(bridge.state(), BridgeState::Released);
    assert!(!bridge.is_alive());

    let err = bridge.stage(buffer(b"y"), Provenance::LocalFile).await.unwrap_err();
    assert!(matches!(err, BridgeError::Released(_)));

    // Reaps the dead thread; safe to call after the worker is gone.
    bridge.release().await;
    bridge.release().await;
}

#[tokio::test]
async fn client_replaces_a_worker_that_died() {
    init_tracing();
    let tracker = ContextTracker::default();
    let client = BridgeClient::new(
        CountingSaveLoader::new(),
        BridgeOptions::named("client-crash-test").with_tracker(tracker.clone()),
    );

    let first = client.get().await.unwrap();
    let err = first
        .parse_bytes(crashing_input(), Provenance::RemoteUrl)
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::WorkerGone(_)));
    wait_for_exit(&tracker).await;
    assert_eq!(client.state().await, BridgeState::Released);

    let second = client.get().await.unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    let parsed = second
        .parse_bytes(buffer(b"fine"), Provenance::RemoteUrl)
        .await
        .unwrap();
    assert_eq!(parsed["label"], "fine");
    assert_eq!(tracker.outstanding(), 1);

    client.release().await;
    assert_eq!(tracker.outstanding(), 0);
}

#[tokio::test]
async fn client_is_lazy_and_respawns_after_release() {
    init_tracing();
    let tracker = ContextTracker::default();
    let client = BridgeClient::new(
        CountingSaveLoader::new(),
        BridgeOptions::named("client-test").with_tracker(tracker.clone()),
    );
    assert_eq!(client.state().await, BridgeState::Uncreated);
    assert_eq!(tracker.outstanding(), 0);

    let first = client.get().await.unwrap();
    let same = client.get().await.unwrap();
    assert!(Arc::ptr_eq(&first, &same));
    assert_eq!(tracker.outstanding(), 1);

    client.release().await;
    assert_eq!(client.state().await, BridgeState::Uncreated);
    assert_eq!(first.state(), BridgeState::Released);
    assert_eq!(tracker.outstanding(), 0);

    let fresh = client.get().await.unwrap();
    assert!(!Arc::ptr_eq(&first, &fresh));
    fresh.stage(buffer(b"z"), Provenance::LocalFile).await.unwrap();
    client.release().await;
    assert_eq!(tracker.outstanding(), 0);
}
