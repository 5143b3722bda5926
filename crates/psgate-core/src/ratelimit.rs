use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use crate::config::RateLimitConfig;

const TOKEN_BITS: u64 = 16;
const TOKEN_MASK: u64 = (1 << TOKEN_BITS) - 1;

/// Token bucket with the whole state packed into one atomic:
/// low 16 bits token count, high 48 bits last-refill milliseconds
/// relative to the limiter epoch. The fast path is a single CAS loop.
struct TokenBucket {
    state: AtomicU64,
    interval_ms: u64,
    max_requests: u64,
    burst: u64,
}

impl TokenBucket {
    fn new(config: &RateLimitConfig) -> Self {
        let burst = (config.burst.max(1) as u64).min(TOKEN_MASK);
        Self {
            state: AtomicU64::new(pack(0, burst)),
            interval_ms: config.interval_ms.max(1),
            max_requests: config.max_requests.max(1) as u64,
            burst,
        }
    }

    /// Take one token, refilling for elapsed time first.
    /// On reject, returns how long until the next token matures.
    fn try_acquire_at(&self, now_ms: u64) -> std::result::Result<(), u64> {
        loop {
            let cur = self.state.load(Ordering::Acquire);
            let (last, tokens) = unpack(cur);
            let elapsed = now_ms.saturating_sub(last);
            let add = elapsed * self.max_requests / self.interval_ms;

            let (new_last, new_tokens) = if tokens + add >= self.burst {
                (now_ms, self.burst)
            } else if add > 0 {
                // Advance only by the time the minted tokens consumed so
                // fractional refill is not lost.
                (last + add * self.interval_ms / self.max_requests, tokens + add)
            } else {
                (last, tokens)
            };

            if new_tokens == 0 {
                let per_token = self.interval_ms.div_ceil(self.max_requests);
                let since = now_ms.saturating_sub(new_last);
                return Err(per_token.saturating_sub(since).max(1));
            }

            let next = pack(new_last, new_tokens - 1);
            if self
                .state
                .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(());
            }
        }
    }
}

fn pack(last_ms: u64, tokens: u64) -> u64 {
    (last_ms << TOKEN_BITS) | (tokens & TOKEN_MASK)
}

fn unpack(state: u64) -> (u64, u64) {
    (state >> TOKEN_BITS, state & TOKEN_MASK)
}

/// Per-client token buckets. The single-process default uses one
/// logical client; the map exists so transports can key by session.
pub struct RateLimiter {
    config: RateLimitConfig,
    epoch: Instant,
    buckets: RwLock<HashMap<String, Arc<TokenBucket>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            epoch: Instant::now(),
            buckets: RwLock::new(HashMap::new()),
        }
    }

    /// Non-blocking admission check. On reject, the error carries
    /// `retry_after_ms`.
    pub fn check(&self, client: &str) -> std::result::Result<(), u64> {
        if !self.config.enabled {
            return Ok(());
        }
        let now_ms = self.epoch.elapsed().as_millis() as u64;
        self.bucket(client).try_acquire_at(now_ms)
    }

    fn bucket(&self, client: &str) -> Arc<TokenBucket> {
        if let Some(b) = self
            .buckets
            .read()
            .expect("rate limiter lock poisoned")
            .get(client)
        {
            return b.clone();
        }
        let mut map = self.buckets.write().expect("rate limiter lock poisoned");
        map.entry(client.to_string())
            .or_insert_with(|| Arc::new(TokenBucket::new(&self.config)))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(burst: u32, max_requests: u32, interval_ms: u64) -> RateLimitConfig {
        RateLimitConfig {
            enabled: true,
            interval_ms,
            max_requests,
            burst,
        }
    }

    #[test]
    fn burst_then_reject() {
        let bucket = TokenBucket::new(&config(3, 60, 60_000));
        assert!(bucket.try_acquire_at(0).is_ok());
        assert!(bucket.try_acquire_at(0).is_ok());
        assert!(bucket.try_acquire_at(0).is_ok());
        let retry = bucket.try_acquire_at(0).unwrap_err();
        assert!(retry > 0);
    }

    #[test]
    fn refill_after_interval() {
        // 60 requests per minute: one token per second.
        let bucket = TokenBucket::new(&config(1, 60, 60_000));
        assert!(bucket.try_acquire_at(0).is_ok());
        assert!(bucket.try_acquire_at(10).is_err());
        assert!(bucket.try_acquire_at(1_000).is_ok());
    }

    #[test]
    fn retry_after_counts_down() {
        let bucket = TokenBucket::new(&config(1, 60, 60_000));
        assert!(bucket.try_acquire_at(0).is_ok());
        let r1 = bucket.try_acquire_at(100).unwrap_err();
        let r2 = bucket.try_acquire_at(600).unwrap_err();
        assert!(r2 < r1);
    }

    #[test]
    fn tokens_cap_at_burst() {
        let bucket = TokenBucket::new(&config(2, 60, 60_000));
        // A long idle period must not accumulate more than burst tokens.
        assert!(bucket.try_acquire_at(600_000).is_ok());
        assert!(bucket.try_acquire_at(600_000).is_ok());
        assert!(bucket.try_acquire_at(600_000).is_err());
    }

    #[test]
    fn disabled_limiter_always_passes() {
        let limiter = RateLimiter::new(RateLimitConfig {
            enabled: false,
            ..RateLimitConfig::default()
        });
        for _ in 0..1_000 {
            assert!(limiter.check("client").is_ok());
        }
    }

    #[test]
    fn clients_are_independent() {
        let limiter = RateLimiter::new(config(1, 1, 3_600_000));
        assert!(limiter.check("a").is_ok());
        assert!(limiter.check("a").is_err());
        assert!(limiter.check("b").is_ok());
    }
}
