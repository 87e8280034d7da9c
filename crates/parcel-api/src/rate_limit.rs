//! Fixed-window limits on the operator routes, keyed by client address.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::client_ip::ClientIp;
use crate::config::AppConfig;
use crate::error::AppError;

/// Leading IPv6 segments that identify one allocation (/64).
const IPV6_PREFIX_SEGMENTS: usize = 4;

/// Above this many tracked windows, expired ones are dropped on the next check.
const PRUNE_THRESHOLD: usize = 4096;

#[derive(Clone)]
pub struct EndpointRateLimiter {
    windows: Arc<Mutex<HashMap<WindowKey, RateWindow>>>,
    window: Duration,
    auth_limit: u32,
    upload_limit: u32,
    metrics: Arc<RateLimitMetrics>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtectedEndpoint {
    AuthHandshake,
    Upload,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct WindowKey {
    endpoint: ProtectedEndpoint,
    bucket: String,
}

#[derive(Default)]
struct RateLimitMetrics {
    auth_allowed: AtomicU64,
    auth_limited: AtomicU64,
    upload_allowed: AtomicU64,
    upload_limited: AtomicU64,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct RateLimitMetricsSnapshot {
    pub auth_allowed: u64,
    pub auth_limited: u64,
    pub upload_allowed: u64,
    pub upload_limited: u64,
}

#[derive(Debug, Clone, Copy)]
struct RateWindow {
    started_at: Instant,
    count: u32,
}

impl EndpointRateLimiter {
    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config.rate_limit_window,
            config.auth_rate_limit_per_window,
            config.upload_rate_limit_per_window,
        )
    }

    fn new(window: Duration, auth_limit: u32, upload_limit: u32) -> Self {
        Self {
            windows: Arc::new(Mutex::new(HashMap::new())),
            window,
            auth_limit,
            upload_limit,
            metrics: Arc::new(RateLimitMetrics::default()),
        }
    }

    pub async fn check(&self, endpoint: ProtectedEndpoint, client: ClientIp) -> Result<(), AppError> {
        let limit = match endpoint {
            ProtectedEndpoint::AuthHandshake => self.auth_limit,
            ProtectedEndpoint::Upload => self.upload_limit,
        };
        let bucket = client.0.map_or_else(|| "unknown".to_string(), normalize_ip);
        let now = Instant::now();

        let mut windows = self.windows.lock().await;
        if windows.len() > PRUNE_THRESHOLD {
            windows.retain(|_, window| now.duration_since(window.started_at) < self.window);
        }
        let entry = windows
            .entry(WindowKey {
                endpoint,
                bucket: bucket.clone(),
            })
            .or_insert(RateWindow {
                started_at: now,
                count: 0,
            });

        if now.duration_since(entry.started_at) >= self.window {
            entry.started_at = now;
            entry.count = 0;
        }

        if entry.count >= limit {
            let retry_after_secs = self
                .window
                .saturating_sub(now.duration_since(entry.started_at))
                .as_secs();
            self.counter(endpoint, true).fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                endpoint = endpoint.label(),
                caller = caller_fingerprint(&bucket),
                retry_after_secs,
                "Rate limit exceeded"
            );
            return Err(AppError::too_many_requests(
                format!("Rate limit exceeded for {}", endpoint.label()),
                retry_after_secs,
            ));
        }

        entry.count += 1;
        self.counter(endpoint, false).fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn metrics_snapshot(&self) -> RateLimitMetricsSnapshot {
        RateLimitMetricsSnapshot {
            auth_allowed: self.metrics.auth_allowed.load(Ordering::Relaxed),
            auth_limited: self.metrics.auth_limited.load(Ordering::Relaxed),
            upload_allowed: self.metrics.upload_allowed.load(Ordering::Relaxed),
            upload_limited: self.metrics.upload_limited.load(Ordering::Relaxed),
        }
    }

    fn counter(&self, endpoint: ProtectedEndpoint, limited: bool) -> &AtomicU64 {
        match (endpoint, limited) {
            (ProtectedEndpoint::AuthHandshake, false) => &self.metrics.auth_allowed,
            (ProtectedEndpoint::AuthHandshake, true) => &self.metrics.auth_limited,
            (ProtectedEndpoint::Upload, false) => &self.metrics.upload_allowed,
            (ProtectedEndpoint::Upload, true) => &self.metrics.upload_limited,
        }
    }
}

impl ProtectedEndpoint {
    pub const fn label(self) -> &'static str {
        match self {
            Self::AuthHandshake => "auth_handshake",
            Self::Upload => "upload",
        }
    }
}

/// Rate-limit bucket for an address.
///
/// IPv4 addresses are kept as-is. IPv6 addresses collapse to their /64 so a
/// caller cannot rotate through one allocation to reset the window.
fn normalize_ip(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(mapped) => mapped.to_string(),
            None => {
                let segments = v6.segments();
                let prefix: Vec<String> = segments[..IPV6_PREFIX_SEGMENTS]
                    .iter()
                    .map(|segment| format!("{segment:x}"))
                    .collect();
                format!("{}::/64", prefix.join(":"))
            }
        },
    }
}

/// Stable hash so logs never carry the caller's address.
fn caller_fingerprint(bucket: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    bucket.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, Ipv6Addr};

    use super::*;

    fn v4(last: u8) -> ClientIp {
        ClientIp(Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))))
    }

    fn v6(host: u16) -> ClientIp {
        ClientIp(Some(IpAddr::V6(Ipv6Addr::new(
            0x2001, 0xdb8, 0x85a3, 0x1234, 0, 0, 0, host,
        ))))
    }

    #[tokio::test]
    async fn rate_limiter_blocks_after_limit() {
        let limiter = EndpointRateLimiter::new(Duration::from_secs(60), 2, 5);

        limiter.check(ProtectedEndpoint::AuthHandshake, v4(1)).await.unwrap();
        limiter.check(ProtectedEndpoint::AuthHandshake, v4(1)).await.unwrap();

        let err = limiter
            .check(ProtectedEndpoint::AuthHandshake, v4(1))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::TooManyRequests(_, _)));

        let metrics = limiter.metrics_snapshot();
        assert_eq!(metrics.auth_allowed, 2);
        assert_eq!(metrics.auth_limited, 1);
    }

    #[tokio::test]
    async fn endpoints_and_callers_have_separate_windows() {
        let limiter = EndpointRateLimiter::new(Duration::from_secs(60), 1, 1);
        limiter.check(ProtectedEndpoint::AuthHandshake, v4(1)).await.unwrap();
        limiter.check(ProtectedEndpoint::Upload, v4(1)).await.unwrap();
        limiter.check(ProtectedEndpoint::AuthHandshake, v4(2)).await.unwrap();
        assert!(limiter.check(ProtectedEndpoint::Upload, v4(1)).await.is_err());
    }

    #[tokio::test]
    async fn rotating_ipv6_hosts_share_one_window() {
        let limiter = EndpointRateLimiter::new(Duration::from_secs(60), 2, 2);
        limiter.check(ProtectedEndpoint::Upload, v6(1)).await.unwrap();
        limiter.check(ProtectedEndpoint::Upload, v6(2)).await.unwrap();
        assert!(limiter.check(ProtectedEndpoint::Upload, v6(3)).await.is_err());

        let other_allocation =
            ClientIp(Some(IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0x85a3, 0x9999, 0, 0, 0, 1))));
        limiter.check(ProtectedEndpoint::Upload, other_allocation).await.unwrap();
    }

    #[tokio::test]
    async fn unknown_callers_share_a_bucket() {
        let limiter = EndpointRateLimiter::new(Duration::from_secs(60), 1, 1);
        limiter.check(ProtectedEndpoint::AuthHandshake, ClientIp(None)).await.unwrap();
        assert!(limiter
            .check(ProtectedEndpoint::AuthHandshake, ClientIp(None))
            .await
            .is_err());
    }

    #[test]
    fn normalize_ip_groups_ipv6_by_prefix() {
        assert_eq!(normalize_ip(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 100))), "192.168.1.100");
        assert_eq!(
            normalize_ip(IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0x85a3, 0x1234, 0, 0, 0, 1))),
            "2001:db8:85a3:1234::/64"
        );
        assert_eq!(
            normalize_ip("::ffff:203.0.113.7".parse().unwrap()),
            "203.0.113.7"
        );
    }
}
