//! Compile-time prelude coverage test.
use quotakeeper::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tower::service_fn;
use tower_layer::Layer;
use tower_service::Service;

#[tokio::test]
async fn prelude_reexports_core_types() {
    let config = GovernorConfig::builder()
        .throttle(ThrottleConfig::new(0.1, 5, Duration::from_secs(1)).expect("valid throttle"))
        .build()
        .expect("valid config");
    let governor = Arc::new(QuotaGovernor::builder().config(config).sink(MemorySink::new()).build());
    let layer = QuotaLayer::with_options(governor.clone(), CallOptions::bucket("core"));

    let mut svc = layer.layer(service_fn(|_req: ()| async {
        Ok::<_, std::io::Error>(Snapshot::new(60, 59, 1_700_000_000))
    }));
    let snapshot = svc.call(()).await.expect("service call failed");

    assert_eq!(snapshot.quota_snapshot(), Some(snapshot));
    let state: BucketState = governor.bucket("core").expect("bucket recorded");
    assert_eq!(state.limit, 60);
}
