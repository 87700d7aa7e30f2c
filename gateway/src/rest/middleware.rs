//! The request gateway. Layered in this order, outermost first:
//! [`log_requests`], [`require_api_key`], [`rate_limit`], then panic
//! recovery around the handlers.

use crate::errors::{Error, Result};
use crate::metrics::{
    HTTP_FORBIDDEN_TOTAL, HTTP_PANICS_TOTAL, HTTP_RATE_LIMITED_TOTAL, HTTP_REQUESTS_TOTAL,
};
use crate::rest::error::ApiError;
use crate::rest::ratelimit::RateLimiter;
use axum::{
    body::{Body, HttpBody},
    extract::{ConnectInfo, Request, State},
    http::{header::USER_AGENT, Method},
    middleware::Next,
    response::{IntoResponse, Response},
};
use sha2::{Digest, Sha256};
use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;
use subtle::ConstantTimeEq;
use tracing::{debug, error, info, warn};

pub const API_KEY_HEADER: &str = "X-API-Key";

/// Bodies larger than this are not captured in debug logs
const MAX_LOGGED_BODY: usize = 64 * 1024;

/// The configured API key, kept only as a digest.
///
/// Comparing fixed-size digests in constant time makes the check independent
/// of both the secret's and the presented value's length.
#[derive(Clone)]
pub struct ApiKey {
    digest: [u8; 32],
}

impl ApiKey {
    pub fn new(secret: &str) -> Result<Self> {
        if secret.is_empty() {
            return Err(Error::Configuration("API key must not be empty".to_string()));
        }
        Ok(Self {
            digest: Sha256::digest(secret.as_bytes()).into(),
        })
    }

    pub fn verify(&self, presented: &[u8]) -> bool {
        let digest: [u8; 32] = Sha256::digest(presented).into();
        digest.as_slice().ct_eq(self.digest.as_slice()).into()
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(<redacted>)")
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LogConfig {
    /// Also log request and response bodies
    pub capture_bodies: bool,
}

pub async fn log_requests(State(config): State<LogConfig>, request: Request, next: Next) -> Response {
    let started = Instant::now();
    HTTP_REQUESTS_TOTAL.inc();

    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let client_ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "-".to_string());
    let user_agent = request
        .headers()
        .get(USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("-")
        .to_string();

    let request = if config.capture_bodies {
        let (parts, body) = request.into_parts();
        let body = capture(body, &method, &path, "HTTP request body").await;
        Request::from_parts(parts, body)
    } else {
        request
    };

    let response = next.run(request).await;

    let response = if config.capture_bodies {
        let (parts, body) = response.into_parts();
        let body = capture(body, &method, &path, "HTTP response body").await;
        Response::from_parts(parts, body)
    } else {
        response
    };

    info!(
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = started.elapsed().as_secs_f64() * 1000.0,
        client_ip = %client_ip,
        user_agent = %user_agent,
        "HTTP request"
    );

    response
}

/// Logs `body` at debug level and hands back an equivalent body.
///
/// Only bodies whose size is known to fit [`MAX_LOGGED_BODY`] are buffered;
/// anything else passes through untouched with just its size logged.
async fn capture(body: Body, method: &Method, path: &str, message: &str) -> Body {
    let hint = body.size_hint();
    let fits = hint
        .upper()
        .is_some_and(|upper| upper <= MAX_LOGGED_BODY as u64);
    if !fits {
        debug!(method = %method, path = %path, body = %format!("<{} bytes>", hint.lower()), "{}", message);
        return body;
    }

    match axum::body::to_bytes(body, MAX_LOGGED_BODY).await {
        Ok(bytes) => {
            debug!(method = %method, path = %path, body = %String::from_utf8_lossy(&bytes), "{}", message);
            Body::from(bytes)
        }
        Err(e) => {
            warn!(method = %method, path = %path, "Failed to capture body: {}", e);
            Body::empty()
        }
    }
}

/// Rejects the request with 403 unless `X-API-Key` matches. Nothing
/// downstream runs for a rejected request.
pub async fn require_api_key(State(key): State<ApiKey>, request: Request, next: Next) -> Response {
    let authorized = request
        .headers()
        .get(API_KEY_HEADER)
        .is_some_and(|value| key.verify(value.as_bytes()));

    if !authorized {
        HTTP_FORBIDDEN_TOTAL.inc();
        warn!(path = %request.uri().path(), "Rejected request with invalid API key");
        return ApiError::Forbidden.into_response();
    }

    next.run(request).await
}

/// Admits the request only if a token is available; never waits.
pub async fn rate_limit(State(limiter): State<RateLimiter>, request: Request, next: Next) -> Response {
    if !limiter.try_acquire() {
        HTTP_RATE_LIMITED_TOTAL.inc();
        debug!(path = %request.uri().path(), "Rate limit exceeded");
        return ApiError::TooManyRequests.into_response();
    }

    next.run(request).await
}

/// Converts a handler panic into a 500 response.
pub fn handle_panic(panic: Box<dyn Any + Send + 'static>) -> Response {
    HTTP_PANICS_TOTAL.inc();

    let detail = if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    };
    error!("Recovered from handler panic: {}", detail);

    ApiError::Internal(detail).into_response()
}
