use crate::error::AdmissionDenied;
use crate::rate_limit::{
    Decision, FixedWindowGuard, PolicyTable, Quota, RequestDescriptor, TokenBucketGuard,
};
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use http::{Request, Response, StatusCode};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

fn set_quota_headers(headers: &mut http::HeaderMap, quota: Quota) {
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(quota.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(quota.reset_at_ms));
}

impl AdmissionDenied {
    /// Render the denial as a 429 response with `Retry-After` and rate-limit headers.
    ///
    /// Body: `{"statusCode":429,"message":...}`.
    pub fn to_response<B: From<String>>(&self) -> Response<B> {
        let body = serde_json::json!({ "statusCode": 429, "message": self.message }).to_string();
        let mut response = Response::new(B::from(body));
        *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;

        let headers = response.headers_mut();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(RETRY_AFTER, HeaderValue::from(self.retry_after_secs()));
        set_quota_headers(headers, Quota { remaining: 0, reset_at_ms: self.reset_at_ms });
        response
    }
}

#[derive(Debug, Default)]
struct Admission {
    fixed_window: Option<FixedWindowGuard>,
    token_bucket: Option<TokenBucketGuard>,
    policies: PolicyTable,
}

impl Admission {
    /// Fixed window first, then the route's bucket. Returns the quota to advertise.
    ///
    /// Exempt prefixes only bypass the fixed window; a bucket policy attached to
    /// an exempt route is still enforced.
    async fn admit(&self, req: &RequestDescriptor) -> Result<Option<Quota>, AdmissionDenied> {
        let mut quota = None;
        if let Some(fixed_window) = &self.fixed_window {
            match fixed_window.check_or_allow(req).await {
                Decision::Denied(denied) => return Err(denied),
                decision => quota = decision.quota(),
            }
        }

        if let (Some(bucket), Some(policy)) =
            (&self.token_bucket, self.policies.resolve(req.route_or_path()))
        {
            let outcome = bucket.check(policy, req).await?;
            quota = Quota::tightest(quota, outcome.quota());
        }
        Ok(quota)
    }
}

/// A layer that runs the admission guards in front of an HTTP service.
#[derive(Clone, Debug)]
pub struct AdmissionLayer {
    admission: Arc<Admission>,
}

impl AdmissionLayer {
    /// Layer protecting the routes in `policies`. Add guards with the `with_*` methods.
    pub fn new(policies: PolicyTable) -> Self {
        Self { admission: Arc::new(Admission { policies, ..Admission::default() }) }
    }

    /// Count every request against `guard` first.
    pub fn with_fixed_window(self, guard: FixedWindowGuard) -> Self {
        self.map(|admission| Admission { fixed_window: Some(guard), ..admission })
    }

    /// Enforce route policies with `guard`.
    pub fn with_token_bucket(self, guard: TokenBucketGuard) -> Self {
        self.map(|admission| Admission { token_bucket: Some(guard), ..admission })
    }

    fn map(self, f: impl FnOnce(Admission) -> Admission) -> Self {
        let admission = Arc::try_unwrap(self.admission).unwrap_or_else(|shared| Admission {
            fixed_window: shared.fixed_window.clone(),
            token_bucket: shared.token_bucket.clone(),
            policies: shared.policies.clone(),
        });
        Self { admission: Arc::new(f(admission)) }
    }
}

impl<S> Layer<S> for AdmissionLayer {
    type Service = AdmissionService<S>;

    fn layer(&self, service: S) -> Self::Service {
        AdmissionService { inner: service, admission: self.admission.clone() }
    }
}

/// Middleware service that admits or rejects HTTP requests.
///
/// Denials short-circuit with a 429 response; the inner service is never called and
/// the error type is the inner service's own.
#[derive(Clone, Debug)]
pub struct AdmissionService<S> {
    inner: S,
    admission: Arc<Admission>,
}

impl<S, ReqB, ResB> Service<Request<ReqB>> for AdmissionService<S>
where
    S: Service<Request<ReqB>, Response = Response<ResB>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    ReqB: Send + 'static,
    ResB: From<String> + Send + 'static,
{
    type Response = Response<ResB>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqB>) -> Self::Future {
        let admission = self.admission.clone();
        // Take the service that was driven to readiness; leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let descriptor = RequestDescriptor::from(&req);
            match admission.admit(&descriptor).await {
                Ok(quota) => {
                    let mut response = inner.call(req).await?;
                    if let Some(quota) = quota {
                        set_quota_headers(response.headers_mut(), quota);
                    }
                    Ok(response)
                }
                Err(denied) => {
                    tracing::debug!(
                        path = %descriptor.path,
                        identity = %descriptor.identity(),
                        denied_by = ?denied.denied_by,
                        "request denied"
                    );
                    Ok(denied.to_response())
                }
            }
        })
    }
}
