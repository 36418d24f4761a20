//! Tower middleware that runs every request through a [`QuotaGovernor`].

use crate::config::CallOptions;
use crate::error::GovernorError;
use crate::governor::QuotaGovernor;
use crate::snapshot::ReportsQuota;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// A layer that gates requests on a governor bucket and records the quota
/// reading each response carries.
#[derive(Clone, Debug)]
pub struct QuotaLayer {
    governor: Arc<QuotaGovernor>,
    options: CallOptions,
}

impl QuotaLayer {
    /// Gate on the governor's default bucket.
    pub fn new(governor: Arc<QuotaGovernor>) -> Self {
        Self { governor, options: CallOptions::default() }
    }

    /// Gate on `options.bucket`, honoring its wait bound and throttle override.
    pub fn with_options(governor: Arc<QuotaGovernor>, options: CallOptions) -> Self {
        Self { governor, options }
    }
}

impl<S> Layer<S> for QuotaLayer {
    type Service = QuotaService<S>;

    fn layer(&self, service: S) -> Self::Service {
        QuotaService { inner: service, governor: self.governor.clone(), options: self.options.clone() }
    }
}

/// Middleware service produced by [`QuotaLayer`].
#[derive(Clone, Debug)]
pub struct QuotaService<S> {
    inner: S,
    governor: Arc<QuotaGovernor>,
    options: CallOptions,
}

impl<S, Req> Service<Req> for QuotaService<S>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Response: ReportsQuota + Send + 'static,
    S::Error: Send + 'static,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = GovernorError<S::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(GovernorError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let governor = self.governor.clone();
        let options = self.options.clone();
        // take the service that was driven to readiness
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            governor.execute(options, move || inner.call(req)).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::sleeper::TrackingSleeper;
    use crate::snapshot::Snapshot;
    use std::convert::Infallible;
    use std::time::Duration;
    use tower::ServiceExt;

    #[derive(Clone)]
    struct Upstream {
        remaining: i64,
    }

    impl Service<&'static str> for Upstream {
        type Response = (String, Snapshot);
        type Error = Infallible;
        type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Infallible>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, req: &'static str) -> Self::Future {
            let snapshot = Snapshot::new(60, self.remaining, 2_000);
            Box::pin(async move { Ok((req.to_uppercase(), snapshot)) })
        }
    }

    fn governor() -> (Arc<QuotaGovernor>, TrackingSleeper) {
        let clock = ManualClock::at_secs(1_000);
        let sleeper = TrackingSleeper::with_clock(clock.clone());
        let governor = QuotaGovernor::builder().clock(clock).sleeper(sleeper.clone()).build();
        (Arc::new(governor), sleeper)
    }

    #[tokio::test]
    async fn responses_update_the_bucket() {
        let (governor, _) = governor();
        let layer = QuotaLayer::with_options(governor.clone(), CallOptions::bucket("search"));
        let service = layer.layer(Upstream { remaining: 42 });

        let (body, _) = service.oneshot("hello").await.unwrap();

        assert_eq!(body, "HELLO");
        assert_eq!(governor.bucket("search").unwrap().remaining, Some(42));
    }

    #[tokio::test]
    async fn killswitch_short_circuits_the_inner_service() {
        let (governor, _) = governor();
        governor.arm_killswitch(Duration::from_secs(30), Some("secondary rate limit"));
        let service = QuotaLayer::new(governor.clone()).layer(Upstream { remaining: 1 });

        let err = service.oneshot("hello").await.unwrap_err();

        assert!(err.is_killswitch());
        assert!(governor.bucket("core").is_none());
    }

    #[tokio::test]
    async fn low_quota_waits_before_calling() {
        let (governor, sleeper) = governor();
        governor.apply_external_snapshot("core", Snapshot::new(60, 3, 1_010));
        let service = QuotaLayer::new(governor.clone()).layer(Upstream { remaining: 59 });

        service.oneshot("hello").await.unwrap();

        assert_eq!(sleeper.calls(), vec![Duration::from_secs(15)]);
        assert_eq!(governor.bucket("core").unwrap().remaining, Some(59));
    }
}
