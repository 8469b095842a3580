//! Abstract credit store interface and the in-process implementation.
//!
//! The backend owns all mutable rate-limit state: each bucket is an atomic
//! counter with a TTL, and `hit` performs the decrement-and-report in one
//! step. Server instances themselves stay stateless, so any number of them
//! can share one backend.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::error::BoxError;

pub mod redis;

/// Outcome of a single hit against a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HitOutcome {
    /// Whether the hit fit within the bucket's budget.
    pub is_allowed: bool,
    /// Credit remaining after this hit (never negative).
    pub current_credit: i64,
    /// Seconds until the bucket refills.
    pub next_reset_seconds: i64,
}

/// Keyed atomic counter store.
///
/// Implementations must make `hit` atomic per key: concurrent hits on the
/// same bucket may not observe the same count.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Establish connectivity. Called once at startup; a failure is fatal.
    async fn initialize(&self) -> Result<(), BoxError>;

    /// Consume one credit from `key`'s bucket of size `limit`, creating the
    /// bucket with a `ttl_seconds` window if it does not exist.
    async fn hit(&self, key: &str, limit: u64, ttl_seconds: u64) -> Result<HitOutcome, BoxError>;
}

/// In-process fixed-window counter store.
///
/// Buckets live in a mutex-guarded map and expire lazily on next touch.
/// Suitable for single-instance deployments and tests; a shared deployment
/// wants [`redis::RedisBackend`].
#[derive(Debug, Default)]
pub struct MemoryBackend {
    windows: Mutex<HashMap<String, Window>>,
}

#[derive(Debug)]
struct Window {
    count: u64,
    expires_at: Instant,
}

impl MemoryBackend {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn hit_sync(&self, key: &str, limit: u64, ttl_seconds: u64) -> HitOutcome {
        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap();
        let window = windows
            .entry(key.to_string())
            .and_modify(|w| {
                if w.expires_at <= now {
                    w.count = 0;
                    w.expires_at = now + Duration::from_secs(ttl_seconds);
                }
            })
            .or_insert_with(|| Window {
                count: 0,
                expires_at: now + Duration::from_secs(ttl_seconds),
            });
        window.count += 1;
        HitOutcome {
            is_allowed: window.count <= limit,
            current_credit: limit.saturating_sub(window.count) as i64,
            next_reset_seconds: remaining_seconds(window.expires_at, now),
        }
    }
}

/// Seconds until `expires_at`, rounded up so a fresh window reports its full
/// length.
fn remaining_seconds(expires_at: Instant, now: Instant) -> i64 {
    let remaining = expires_at.saturating_duration_since(now);
    let mut seconds = remaining.as_secs();
    if remaining.subsec_nanos() > 0 {
        seconds += 1;
    }
    seconds as i64
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn initialize(&self) -> Result<(), BoxError> {
        Ok(())
    }

    async fn hit(&self, key: &str, limit: u64, ttl_seconds: u64) -> Result<HitOutcome, BoxError> {
        Ok(self.hit_sync(key, limit, ttl_seconds))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn counts_down_then_denies() {
        let backend = MemoryBackend::new();
        for expected_credit in [2, 1, 0] {
            let outcome = backend.hit("k", 3, 60).await.unwrap();
            assert!(outcome.is_allowed);
            assert_eq!(outcome.current_credit, expected_credit);
        }
        let outcome = backend.hit("k", 3, 60).await.unwrap();
        assert!(!outcome.is_allowed);
        assert_eq!(outcome.current_credit, 0);
    }

    #[tokio::test]
    async fn fresh_window_reports_full_ttl() {
        let backend = MemoryBackend::new();
        let outcome = backend.hit("k", 10, 60).await.unwrap();
        assert_eq!(outcome.next_reset_seconds, 60);
    }

    #[tokio::test]
    async fn buckets_are_independent() {
        let backend = MemoryBackend::new();
        backend.hit("a", 1, 60).await.unwrap();
        let other = backend.hit("b", 1, 60).await.unwrap();
        assert!(other.is_allowed);
        assert_eq!(other.current_credit, 0);
    }

    #[tokio::test]
    async fn zero_limit_denies_every_hit() {
        let backend = MemoryBackend::new();
        let outcome = backend.hit("k", 0, 60).await.unwrap();
        assert!(!outcome.is_allowed);
        assert_eq!(outcome.current_credit, 0);
    }

    #[tokio::test]
    async fn zero_ttl_window_never_accumulates() {
        let backend = MemoryBackend::new();
        for _ in 0..5 {
            let outcome = backend.hit("k", 1, 0).await.unwrap();
            assert!(outcome.is_allowed);
            assert_eq!(outcome.next_reset_seconds, 0);
        }
    }

    #[tokio::test]
    async fn expired_window_restarts() {
        let backend = MemoryBackend::new();
        {
            let expired = Instant::now()
                .checked_sub(Duration::from_secs(1))
                .unwrap_or_else(Instant::now);
            let mut windows = backend.windows.lock().unwrap();
            windows.insert("k".to_string(), Window { count: 99, expires_at: expired });
        }
        let outcome = backend.hit("k", 10, 60).await.unwrap();
        assert!(outcome.is_allowed);
        assert_eq!(outcome.current_credit, 9);
    }
}
