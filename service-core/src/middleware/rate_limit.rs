use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use governor::{
    Quota, RateLimiter,
    clock::{Clock, DefaultClock},
    state::keyed::DashMapStateStore,
};
use crate::error::AppError;
use std::{net::SocketAddr, num::NonZeroU32, sync::Arc, time::Duration};

/// Rate limiter keyed by IP address
pub type IpRateLimiter = Arc<RateLimiter<SocketAddr, DashMapStateStore<SocketAddr>, DefaultClock>>;

/// Build a quota allowing `requests` per `window_seconds`, refilled continuously.
pub fn quota(requests: u32, window_seconds: u64) -> Quota {
    let requests = requests.max(1);
    let burst = NonZeroU32::new(requests).unwrap_or(NonZeroU32::MIN);
    let period = Duration::from_millis((window_seconds.max(1) * 1000) / requests as u64);

    Quota::with_period(period)
        .unwrap_or_else(|| Quota::per_second(burst))
        .allow_burst(burst)
}

/// Create a keyed rate limiter (by IP)
pub fn create_ip_rate_limiter(attempts: u32, window_seconds: u64) -> IpRateLimiter {
    Arc::new(RateLimiter::dashmap(quota(attempts, window_seconds)))
}

/// Resolve the client address: first `X-Forwarded-For` hop, else the peer.
pub fn client_addr(request: &Request) -> Option<SocketAddr> {
    let forwarded_ip = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .and_then(|s| s.trim().parse::<std::net::IpAddr>().ok());

    if let Some(ip) = forwarded_ip {
        return Some(SocketAddr::new(ip, 0));
    }

    request
        .extensions()
        .get::<axum::extract::ConnectInfo<SocketAddr>>()
        .map(|axum::extract::ConnectInfo(addr)| *addr)
}

/// Middleware for IP-based rate limiting
pub async fn ip_rate_limit_middleware(
    State(limiter): State<IpRateLimiter>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    match client_addr(&request) {
        Some(addr) => {
            // The port is irrelevant for limiting and differs per connection.
            let key = SocketAddr::new(addr.ip(), 0);
            match limiter.check_key(&key) {
                Ok(_) => Ok(next.run(request).await),
                Err(negative) => {
                    let wait_time = negative.wait_time_from(DefaultClock::default().now());
                    Err(AppError::TooManyRequests {
                        message: "Too many requests from this IP. Please try again later."
                            .to_string(),
                        retry_after: Some(wait_time.as_secs().max(1)),
                        remaining: Some(0),
                    })
                }
            }
        }
        None => {
            tracing::warn!("Could not determine IP for rate limiting");
            Ok(next.run(request).await)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_allows_configured_burst() {
        let limiter = RateLimiter::direct(quota(3, 60));
        assert!(limiter.check().is_ok());
        assert!(limiter.check().is_ok());
        assert!(limiter.check().is_ok());
        assert!(limiter.check().is_err());
    }

    #[test]
    fn zero_requests_is_clamped_to_one() {
        let limiter = RateLimiter::direct(quota(0, 60));
        assert!(limiter.check().is_ok());
        assert!(limiter.check().is_err());
    }
}
