//! Per-route minimum inter-arrival rate limiting.
//!
//! Each key remembers only the timestamp of its most recent request. A
//! request is rejected when it arrives less than the configured threshold
//! after the previous one with the same key, and every request (admitted or
//! not) moves the key's timestamp forward. A client that keeps hammering a
//! route therefore stays rejected until it pauses for a full threshold.
//!
//! Keys are `"<client ip> <lowercased method> <lowercased path without
//! slashes>"`, see [`rate_limit_key`].
//!
//! Entries older than the threshold are indistinguishable from absent ones,
//! so [`RateLimiter::retain_recent`] can drop them at any time without
//! changing any decision. It should be called from a background task to keep
//! the map bounded under high-cardinality traffic.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use hyper::Method;
use parking_lot::Mutex;

use crate::RuntimeConfig;

/// A thread-safe key → last-seen map behind a single mutex.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    threshold_ms: u64,
    last_seen: Mutex<HashMap<String, u64>>,
}

/// Builds the rate-limit key for a request.
///
/// All slashes are stripped from the path rather than segmented, so `/`,
/// `//` and `/a/b` map to `""`, `""` and `"ab"`.
pub fn rate_limit_key(ip: IpAddr, method: &Method, path: &str) -> String {
    format!(
        "{ip} {} {}",
        method.as_str().to_ascii_lowercase(),
        path.to_lowercase().replace('/', "")
    )
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}

impl RateLimiter {
    /// Creates a limiter with the given threshold in milliseconds.
    /// A threshold of `0` never rejects.
    pub fn new(threshold_ms: u64) -> Self {
        Self {
            inner: Arc::new(Inner {
                threshold_ms,
                last_seen: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Creates a limiter from the validated configuration.
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self::new(config.rate_limit_threshold_ms)
    }

    /// The configured threshold in milliseconds.
    pub fn threshold_ms(&self) -> u64 {
        self.inner.threshold_ms
    }

    /// Records a request for `key` and returns `true` if it arrived too soon
    /// after the previous one.
    pub fn is_rate_limited(&self, key: &str) -> bool {
        self.check(key).is_err()
    }

    /// Records a request for `key` at the current time.
    ///
    /// Returns `Ok(())` if the request is admitted, or `Err(retry_after_ms)`
    /// with the time left until the key would be admitted again.
    pub fn check(&self, key: &str) -> Result<(), u64> {
        self.check_at(key, now_ms())
    }

    /// Same as [`check`](Self::check) with an explicit timestamp.
    pub fn check_at(&self, key: &str, now_ms: u64) -> Result<(), u64> {
        let last = {
            let mut seen = self.inner.last_seen.lock();
            match seen.get_mut(key) {
                Some(ts) => std::mem::replace(ts, now_ms),
                None => {
                    seen.insert(key.to_owned(), now_ms);
                    0
                }
            }
        };

        // A clock stepping backwards counts as zero elapsed time.
        let elapsed = now_ms.saturating_sub(last);
        if elapsed < self.inner.threshold_ms {
            Err(self.inner.threshold_ms - elapsed)
        } else {
            Ok(())
        }
    }

    /// Removes entries whose last request is at least one threshold old.
    pub fn retain_recent(&self) {
        self.retain_recent_at(now_ms());
    }

    /// Same as [`retain_recent`](Self::retain_recent) with an explicit timestamp.
    pub fn retain_recent_at(&self, now_ms: u64) {
        let threshold = self.inner.threshold_ms;
        self.inner
            .last_seen
            .lock()
            .retain(|_, last| now_ms.saturating_sub(*last) < threshold);
    }

    /// Returns the number of keys currently tracked.
    pub fn tracked_key_count(&self) -> usize {
        self.inner.last_seen.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    const T0: u64 = 1_700_000_000_000;

    #[test]
    fn accepts_a_single_attempt() {
        let limiter = RateLimiter::new(1000);
        assert!(limiter.check_at("aaa", T0).is_ok());
    }

    #[test]
    fn rejects_second_immediate_attempt() {
        let limiter = RateLimiter::new(1000);
        assert!(limiter.check_at("bbb", T0).is_ok());
        assert_eq!(limiter.check_at("bbb", T0 + 10), Err(990));
    }

    #[test]
    fn admits_after_threshold_elapsed() {
        let limiter = RateLimiter::new(1000);
        assert!(limiter.check_at("ccc", T0).is_ok());
        assert!(limiter.check_at("ccc", T0 + 1000).is_ok());
    }

    #[test]
    fn rejected_attempts_still_reset_the_timestamp() {
        let limiter = RateLimiter::new(1000);
        assert!(limiter.check_at("ddd", T0).is_ok());
        assert!(limiter.check_at("ddd", T0 + 900).is_err());
        // 1100ms after the first request but only 200ms after the rejected one.
        assert!(limiter.check_at("ddd", T0 + 1100).is_err());
        assert!(limiter.check_at("ddd", T0 + 2100).is_ok());
    }

    #[test]
    fn zero_threshold_never_rejects() {
        let limiter = RateLimiter::new(0);
        for _ in 0..5 {
            assert!(!limiter.is_rate_limited("eee"));
        }
        assert!(limiter.check_at("eee", T0).is_ok());
        assert!(limiter.check_at("eee", T0).is_ok());
    }

    #[test]
    fn keys_are_independent() {
        let limiter = RateLimiter::new(1000);
        assert!(limiter.check_at("a", T0).is_ok());
        assert!(limiter.check_at("b", T0).is_ok());
        assert!(limiter.check_at("a", T0 + 1).is_err());
    }

    #[test]
    fn clock_going_backwards_counts_as_no_elapsed_time() {
        let limiter = RateLimiter::new(1000);
        assert!(limiter.check_at("fff", T0).is_ok());
        assert_eq!(limiter.check_at("fff", T0 - 500), Err(1000));
    }

    #[test]
    fn retain_recent_drops_only_stale_entries() {
        let limiter = RateLimiter::new(1000);
        limiter.check_at("old", T0).unwrap();
        limiter.check_at("new", T0 + 800).unwrap();
        limiter.retain_recent_at(T0 + 1000);
        assert_eq!(limiter.tracked_key_count(), 1);
        assert!(limiter.check_at("new", T0 + 1000).is_err());
        assert!(limiter.check_at("old", T0 + 1000).is_ok());
    }

    #[test]
    fn key_strips_slashes_and_lowercases() {
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(rate_limit_key(ip, &Method::GET, "/"), "10.0.0.1 get ");
        assert_eq!(rate_limit_key(ip, &Method::GET, "//"), "10.0.0.1 get ");
        assert_eq!(
            rate_limit_key(ip, &Method::POST, "/Bandwidth/"),
            "10.0.0.1 post bandwidth"
        );
        assert_eq!(rate_limit_key(ip, &Method::GET, "/a/b"), "10.0.0.1 get ab");
    }
}
