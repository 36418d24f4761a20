mod common;

use quotakeeper::telemetry::{GovernorEvent, MemorySink, RefreshEvent};
use quotakeeper::{refresh_fn, Clock, FetchError, QuotaGovernor, Snapshot, SystemClock};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn counting_source(
    calls: Arc<AtomicUsize>,
    buckets: Arc<Mutex<Vec<String>>>,
) -> impl quotakeeper::RefreshSource + 'static {
    refresh_fn(move |bucket: String| {
        let calls = calls.clone();
        let buckets = buckets.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            buckets.lock().unwrap().push(bucket);
            Ok::<_, FetchError>(Snapshot::new(5000, 4000, SystemClock.now_secs() + 3_600))
        }
    })
}

#[tokio::test]
async fn idle_bucket_is_refreshed() {
    let sink = MemorySink::new();
    let governor = QuotaGovernor::builder().sink(sink.clone()).build();
    let calls = Arc::new(AtomicUsize::new(0));

    governor
        .start_refresh(Duration::from_millis(20), "core", counting_source(calls.clone(), Arc::default()))
        .unwrap();

    assert!(common::eventually(Duration::from_secs(2), || calls.load(Ordering::SeqCst) >= 2).await);
    assert_eq!(governor.bucket("core").unwrap().remaining, Some(4000));
    assert!(common::eventually(Duration::from_secs(1), || {
        sink.events()
            .iter()
            .any(|e| matches!(e, GovernorEvent::Refresh(RefreshEvent::Completed { .. })))
    })
    .await);
    governor.stop_refresh();
}

#[tokio::test]
async fn organic_traffic_suppresses_refresh() {
    let governor = QuotaGovernor::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let reset = SystemClock.now_secs() + 3_600;

    governor
        .start_refresh(Duration::from_millis(250), "core", counting_source(calls.clone(), Arc::default()))
        .unwrap();

    for remaining in (4_900..4_925).rev() {
        governor.apply_external_snapshot("core", Snapshot::new(5000, remaining, reset));
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    governor.stop_refresh();
}

#[tokio::test]
async fn stop_halts_polling_and_is_idempotent() {
    let governor = QuotaGovernor::new();
    let calls = Arc::new(AtomicUsize::new(0));
    governor.stop_refresh();

    governor
        .start_refresh(Duration::from_millis(15), "core", counting_source(calls.clone(), Arc::default()))
        .unwrap();
    assert!(common::eventually(Duration::from_secs(2), || calls.load(Ordering::SeqCst) >= 1).await);

    governor.stop_refresh();
    governor.stop_refresh();
    assert!(!governor.refresh_running());

    let settled = calls.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), settled);
}

#[tokio::test]
async fn restarting_swaps_bucket_and_interval() {
    let governor = QuotaGovernor::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let buckets = Arc::new(Mutex::new(Vec::new()));

    governor
        .start_refresh(Duration::from_secs(3_600), "core", counting_source(calls.clone(), buckets.clone()))
        .unwrap();
    governor
        .start_refresh(Duration::from_millis(20), "search", counting_source(calls.clone(), buckets.clone()))
        .unwrap();
    assert!(governor.refresh_running());

    assert!(common::eventually(Duration::from_secs(2), || calls.load(Ordering::SeqCst) >= 1).await);
    assert!(buckets.lock().unwrap().iter().all(|b| b == "search"));
    assert!(governor.bucket("search").is_some());
    governor.shutdown();
    assert!(!governor.refresh_running());
}

#[tokio::test]
async fn fetch_failures_are_reported_and_polling_continues() {
    let sink = MemorySink::new();
    let governor = QuotaGovernor::builder().sink(sink.clone()).build();
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();

    governor
        .start_refresh(
            Duration::from_millis(15),
            "core",
            refresh_fn(move |_bucket| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<Snapshot, FetchError>("upstream unavailable".into())
                }
            }),
        )
        .unwrap();

    assert!(common::eventually(Duration::from_secs(2), || attempts.load(Ordering::SeqCst) >= 2).await);
    assert!(governor.bucket("core").is_none());
    assert!(sink.events().iter().any(|e| matches!(
        e,
        GovernorEvent::Refresh(RefreshEvent::Failed { error, .. }) if error == "upstream unavailable"
    )));
    governor.stop_refresh();
}

#[test]
fn starting_outside_a_runtime_fails() {
    let governor = QuotaGovernor::new();
    let source = refresh_fn(|_bucket| async { Ok::<_, FetchError>(Snapshot::default()) });
    assert!(governor.start_refresh(Duration::from_secs(1), "core", source).is_err());
}
