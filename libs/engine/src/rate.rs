//! Per-account token bucket pacing Graph API sends.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration as StdDuration, Instant},
};

use serde::Deserialize;
use tokio::sync::Mutex;

static RATE_LIMIT_ENV: &str = "ACCOUNT_RATE_LIMITS";

const TOKEN: f64 = 1.0;
const TICK_MS: i64 = 100;

#[derive(Debug, Clone, Copy)]
pub struct RateLimit {
    pub rps: f64,
    pub burst: f64,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            rps: 2.0,
            burst: 5.0,
        }
    }
}

#[derive(Clone)]
pub struct RateLimits {
    default: RateLimit,
    accounts: HashMap<String, RateLimit>,
}

impl RateLimits {
    /// Per-account overrides come from `ACCOUNT_RATE_LIMITS`, a JSON map of
    /// `{"<account>": {"rps": .., "burst": ..}}`.
    pub fn from_env() -> Self {
        let default = RateLimit::default();
        let accounts = std::env::var(RATE_LIMIT_ENV)
            .ok()
            .and_then(|raw| serde_json::from_str::<HashMap<String, AccountRateLimit>>(&raw).ok())
            .map(|map| {
                map.into_iter()
                    .map(|(account, cfg)| {
                        (
                            account,
                            RateLimit {
                                rps: cfg.rps.max(0.1),
                                burst: cfg.burst.max(1.0),
                            },
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();
        Self { default, accounts }
    }

    pub fn get(&self, account: &str) -> RateLimit {
        self.accounts.get(account).copied().unwrap_or(self.default)
    }
}

#[derive(Debug, Deserialize)]
struct AccountRateLimit {
    rps: f64,
    burst: f64,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Local token bucket per account. `acquire` waits until a token is
/// available, so callers just await it in front of every send.
#[derive(Clone)]
pub struct AccountRateLimiter {
    limits: Arc<RateLimits>,
    buckets: Arc<Mutex<HashMap<String, Bucket>>>,
}

impl AccountRateLimiter {
    pub fn new(limits: Arc<RateLimits>) -> Self {
        Self {
            limits,
            buckets: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn from_env() -> Self {
        Self::new(Arc::new(RateLimits::from_env()))
    }

    fn refill(tokens: f64, elapsed: StdDuration, limit: RateLimit) -> (f64, StdDuration) {
        if elapsed.is_zero() {
            return (tokens, StdDuration::from_millis(0));
        }
        let ticks = (elapsed.as_millis() as i64) / TICK_MS;
        if ticks <= 0 {
            return (tokens, StdDuration::from_millis(0));
        }
        let refill = (ticks as f64) * (limit.rps * (TICK_MS as f64 / 1000.0));
        let tokens = (tokens + refill).min(limit.burst);
        let consumed = StdDuration::from_millis((ticks * TICK_MS) as u64);
        (tokens, consumed)
    }

    pub async fn acquire(&self, account: &str) {
        let account_key = account.to_string();
        loop {
            let limit = self.limits.get(account);
            let mut guard = self.buckets.lock().await;
            let bucket = guard.entry(account_key.clone()).or_insert(Bucket {
                tokens: limit.burst,
                last_refill: Instant::now(),
            });
            let now = Instant::now();
            let elapsed = now.saturating_duration_since(bucket.last_refill);
            let (filled, consumed) = Self::refill(bucket.tokens, elapsed, limit);
            if consumed > StdDuration::from_millis(0) {
                bucket.last_refill += consumed;
                bucket.tokens = filled;
            }
            if bucket.tokens >= TOKEN {
                bucket.tokens -= TOKEN;
                metrics::gauge!(
                    "engine_rate_tokens",
                    "account" => account_key.clone()
                )
                .set(bucket.tokens);
                return;
            }
            let missing = (TOKEN - bucket.tokens).max(0.0);
            let wait_secs = missing / limit.rps.max(0.1);
            drop(guard);
            tokio::time::sleep(StdDuration::from_secs_f64(wait_secs.max(0.1))).await;
        }
    }
}
