//! Rate limiting middleware.
//!
//! A tower [`Layer`] that runs the admission pipeline in front of every
//! request: resolve the client identity, match the path to a policy,
//! consult the counter store, and either pass the request through with
//! rate limit headers attached or answer with a terminal 429.

use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::response::{IntoResponse, Response};
use futures::future::BoxFuture;
use http::{HeaderMap, HeaderValue, Request, StatusCode};
use tower::{Layer, Service};

use crate::ratelimit::decision::{DecisionEngine, RateLimitDecision};
use crate::ratelimit::identity::{AuthContext, IdentityResolver};
use crate::ratelimit::policy::{PolicyTable, RouteClass};
use crate::store::{
    epoch_now, increment_with_retry, CounterKey, CounterStore, RetryPolicy, StoreStatus,
};

/// Shared state of the admission pipeline.
struct Gate {
    resolver: IdentityResolver,
    policies: PolicyTable,
    engine: DecisionEngine,
    store: Arc<dyn CounterStore>,
    retry: RetryPolicy,
}

/// Tower layer installing the rate limiter in front of a service.
#[derive(Clone)]
pub struct RateLimitLayer {
    gate: Arc<Gate>,
}

impl RateLimitLayer {
    /// Create a layer with the default store retry bounds.
    pub fn new(
        store: Arc<dyn CounterStore>,
        policies: PolicyTable,
        resolver: IdentityResolver,
    ) -> Self {
        Self::with_retry(store, policies, resolver, RetryPolicy::default())
    }

    /// Create a layer with explicit store retry bounds.
    pub fn with_retry(
        store: Arc<dyn CounterStore>,
        policies: PolicyTable,
        resolver: IdentityResolver,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            gate: Arc::new(Gate {
                resolver,
                policies,
                engine: DecisionEngine::new(),
                store,
                retry,
            }),
        }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimit<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimit {
            inner,
            gate: self.gate.clone(),
        }
    }
}

/// The middleware service produced by [`RateLimitLayer`].
#[derive(Clone)]
pub struct RateLimit<S> {
    inner: S,
    gate: Arc<Gate>,
}

impl<S> Service<Request<Body>> for RateLimit<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        let gate = self.gate.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let auth = request.extensions().get::<AuthContext>().cloned();
            let identity = gate.resolver.resolve(request.headers(), auth.as_ref());
            let policy = gate.policies.resolve(request.uri().path());
            let now = epoch_now();

            // No in-process lock is held across this round trip; atomicity
            // for the shared counter lives in the store.
            let status = if identity.bypass || policy.class.is_unlimited() {
                StoreStatus::Skipped
            } else {
                let key = CounterKey::new(&identity.key, policy.class, now, policy.window);
                increment_with_retry(gate.store.as_ref(), &key, policy.window, &gate.retry).await
            };

            let decision = gate.engine.decide(&identity, policy, status, now);

            if decision.allowed {
                let mut response = inner.call(request).await?;
                attach_headers(response.headers_mut(), &decision);
                Ok(response)
            } else {
                Ok(deny_response(policy.class, &decision))
            }
        })
    }
}

/// Attach `X-RateLimit-*` headers to a limited-class response.
fn attach_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    if decision.bypass {
        return;
    }
    headers.insert("x-ratelimit-limit", HeaderValue::from(decision.limit));
    headers.insert("x-ratelimit-remaining", HeaderValue::from(decision.remaining));
    headers.insert("x-ratelimit-reset", HeaderValue::from(decision.reset_at));
}

/// Build the terminal 429 response for a denied request.
fn deny_response(class: RouteClass, decision: &RateLimitDecision) -> Response {
    let retry_after = decision.retry_after.unwrap_or(1);
    let body = serde_json::json!({
        "error": class.deny_message(),
        "retryAfter": retry_after,
    });

    let mut response = (StatusCode::TOO_MANY_REQUESTS, axum::Json(body)).into_response();
    let headers = response.headers_mut();
    headers.insert("retry-after", HeaderValue::from(retry_after));
    attach_headers(headers, decision);
    response
}
