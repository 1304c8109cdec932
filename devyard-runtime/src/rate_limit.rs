//! Sliding-window rate limiting for the HTTP surface.
//!
//! Keyed by caller identity (the `x-user-id` header or a bearer-token
//! fingerprint) with the client IP as fallback for unauthenticated
//! requests. Two tiers: reads at 120 req/min, writes at 30 req/min.

use axum::{
    extract::{ConnectInfo, Request},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window: Duration,
}

pub struct RateLimiter {
    config: RateLimitConfig,
    windows: DashMap<String, Vec<Instant>>,
    last_gc_ms: AtomicU64,
    epoch: Instant,
}

/// Sweep stale callers out of the map every 5 minutes.
const GC_INTERVAL: Duration = Duration::from_secs(300);

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: DashMap::new(),
            last_gc_ms: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }

    /// Record a request for `caller`; false means over the limit.
    pub fn check(&self, caller: &str) -> bool {
        self.maybe_gc();

        let now = Instant::now();
        let cutoff = now.checked_sub(self.config.window);
        let mut entry = self.windows.entry(caller.to_string()).or_default();
        if let Some(cutoff) = cutoff {
            entry.retain(|t| *t > cutoff);
        }

        if (entry.len() as u32) < self.config.max_requests {
            entry.push(now);
            true
        } else {
            false
        }
    }

    fn maybe_gc(&self) {
        let now_ms = self.epoch.elapsed().as_millis() as u64;
        let last = self.last_gc_ms.load(Ordering::Relaxed);
        if now_ms.saturating_sub(last) < GC_INTERVAL.as_millis() as u64 {
            return;
        }
        if self
            .last_gc_ms
            .compare_exchange(last, now_ms, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        let cutoff = Instant::now().checked_sub(self.config.window * 2);
        if let Some(cutoff) = cutoff {
            self.windows
                .retain(|_, stamps| stamps.last().is_some_and(|t| *t > cutoff));
        }
    }

    pub fn tracked_callers(&self) -> usize {
        self.windows.len()
    }
}

static READ_LIMITER: once_cell::sync::Lazy<RateLimiter> = once_cell::sync::Lazy::new(|| {
    RateLimiter::new(RateLimitConfig {
        max_requests: 120,
        window: Duration::from_secs(60),
    })
});

static WRITE_LIMITER: once_cell::sync::Lazy<RateLimiter> = once_cell::sync::Lazy::new(|| {
    RateLimiter::new(RateLimitConfig {
        max_requests: 30,
        window: Duration::from_secs(60),
    })
});

/// Caller key for limiting: identity if present, IP otherwise.
fn caller_key(req: &Request) -> String {
    if let Some(user) = req
        .headers()
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.trim().is_empty())
    {
        return format!("user:{user}");
    }
    if let Some(auth) = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
    {
        // Fingerprint, not the token itself; limiter keys are not secrets.
        return format!("tok:{}", &crate::auth::hash_token(auth)[..16]);
    }
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| format!("ip:{}", ci.0.ip()))
        .unwrap_or_else(|| "anon".to_string())
}

fn too_many() -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        [("retry-after", "60")],
        "Rate limit exceeded",
    )
        .into_response()
}

/// Middleware for GET endpoints (120 req/min per caller).
pub async fn read_rate_limit(request: Request, next: Next) -> Response {
    if !READ_LIMITER.check(&caller_key(&request)) {
        return too_many();
    }
    next.run(request).await
}

/// Middleware for POST/DELETE endpoints (30 req/min per caller).
pub async fn write_rate_limit(request: Request, next: Next) -> Response {
    if !WRITE_LIMITER.check(&caller_key(&request)) {
        return too_many();
    }
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_within_limit() {
        let limiter = RateLimiter::new(RateLimitConfig {
            max_requests: 3,
            window: Duration::from_secs(60),
        });
        assert!(limiter.check("user:a"));
        assert!(limiter.check("user:a"));
        assert!(limiter.check("user:a"));
        assert!(!limiter.check("user:a"));
    }

    #[test]
    fn callers_are_independent() {
        let limiter = RateLimiter::new(RateLimitConfig {
            max_requests: 1,
            window: Duration::from_secs(60),
        });
        assert!(limiter.check("user:a"));
        assert!(!limiter.check("user:a"));
        assert!(limiter.check("user:b"));
    }

    #[test]
    fn window_slides() {
        let limiter = RateLimiter::new(RateLimitConfig {
            max_requests: 1,
            window: Duration::from_millis(20),
        });
        assert!(limiter.check("user:a"));
        assert!(!limiter.check("user:a"));
        std::thread::sleep(Duration::from_millis(30));
        assert!(limiter.check("user:a"));
    }

    #[test]
    fn header_beats_ip_in_key() {
        let req = Request::builder()
            .header("x-user-id", "alice")
            .body(axum::body::Body::empty())
            .unwrap();
        assert_eq!(caller_key(&req), "user:alice");
    }
}
