//! Rate Limit Service: four limiting strategies over a pluggable store,
//! with a `DashMap`-backed in-process default. Grounded on
//! `original_source/app/services/rate_limit_service.py`'s split between a
//! count-based per-operation limit (checked via `incrby`) and a
//! cost-weighted tenant-level bucket (`burst_size`, refilled from
//! `requests_per_minute`, distinct from any single operation's limit) —
//! `FixedWindow`/`SlidingWindow` implement the former, `TokenBucket`/
//! `LeakyBucket` the latter.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use dashmap::DashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    SlidingWindow,
    FixedWindow,
    TokenBucket,
    LeakyBucket,
}

/// One rate-limited action. The cost and window are looked up by
/// `Operation::limits()`; callers needn't know the numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Search,
    BatchInsert,
    Import,
    Export,
    CreateDataset,
    IndexOperation,
    HybridSearch,
}

impl Operation {
    /// Stable key for `Tenant.rate_limit_overrides` lookups.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Search => "search",
            Operation::BatchInsert => "batch_insert",
            Operation::Import => "import",
            Operation::Export => "export",
            Operation::CreateDataset => "create_dataset",
            Operation::IndexOperation => "index_operation",
            Operation::HybridSearch => "hybrid_search",
        }
    }

    pub fn limits(&self) -> OperationLimits {
        match self {
            Operation::Search => OperationLimits { cost: 1, limit_per_minute: 100 },
            Operation::BatchInsert => OperationLimits { cost: 10, limit_per_minute: 1000 },
            Operation::Import => OperationLimits { cost: 50, limit_per_minute: 5 },
            Operation::Export => OperationLimits { cost: 20, limit_per_minute: 20 },
            Operation::CreateDataset => OperationLimits { cost: 5, limit_per_minute: 10 },
            Operation::IndexOperation => OperationLimits { cost: 20, limit_per_minute: 20 },
            Operation::HybridSearch => OperationLimits { cost: 3, limit_per_minute: 100 },
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OperationLimits {
    pub cost: u32,
    pub limit_per_minute: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct Decision {
    pub allowed: bool,
    pub remaining: u32,
    pub limit: u32,
    pub retry_after_secs: u64,
}

struct BucketState {
    window_start: Instant,
    window_count: u32,
    tokens: f64,
    last_refill: Instant,
    timestamps: VecDeque<Instant>,
    queue_level: f64,
    last_leak: Instant,
}

impl BucketState {
    fn new(capacity: f64) -> Self {
        let now = Instant::now();
        Self {
            window_start: now,
            window_count: 0,
            tokens: capacity,
            last_refill: now,
            timestamps: VecDeque::new(),
            queue_level: 0.0,
            last_leak: now,
        }
    }
}

const WINDOW: Duration = Duration::from_secs(60);

/// Per-operation count limiter (`FixedWindow`/`SlidingWindow`) keyed by
/// `(tenant, operation)`, plus a single cost-weighted bucket per tenant
/// (`TokenBucket`/`LeakyBucket`) shared across every operation that tenant
/// performs — mirroring the Python service's two independent ceilings.
pub struct RateLimiter {
    strategy: Strategy,
    operation_buckets: DashMap<(String, Operation), Mutex<BucketState>>,
    tenant_buckets: DashMap<String, Mutex<BucketState>>,
    burst_capacity: f64,
    refill_per_minute: f64,
}

impl RateLimiter {
    /// Defaults match `RateLimitConfig::from_env`'s fallback values.
    pub fn new(strategy: Strategy) -> Self {
        Self::with_limits(strategy, 1000, 100)
    }

    pub fn with_limits(strategy: Strategy, requests_per_minute: u32, burst: u32) -> Self {
        Self {
            strategy,
            operation_buckets: DashMap::new(),
            tenant_buckets: DashMap::new(),
            burst_capacity: burst.max(1) as f64,
            refill_per_minute: requests_per_minute.max(1) as f64,
        }
    }

    /// `override_limit`, when present, replaces the operation's default
    /// `limit_per_minute` — the count-based ceiling a tenant's
    /// `rate_limit_overrides` entry adjusts. It does not affect the
    /// tenant-level bucket, which is sized from `RateLimitConfig` alone.
    pub fn check(&self, key: &str, operation: Operation, override_limit: Option<u32>) -> Decision {
        let mut limits = operation.limits();
        if let Some(over) = override_limit {
            limits.limit_per_minute = over;
        }

        match self.strategy {
            Strategy::FixedWindow | Strategy::SlidingWindow => {
                let entry = self
                    .operation_buckets
                    .entry((key.to_string(), operation))
                    .or_insert_with(|| Mutex::new(BucketState::new(limits.limit_per_minute as f64)));
                let mut state = entry.lock().expect("rate limit mutex poisoned");
                match self.strategy {
                    Strategy::FixedWindow => fixed_window(&mut state, &limits),
                    Strategy::SlidingWindow => sliding_window(&mut state, &limits),
                    _ => unreachable!(),
                }
            }
            Strategy::TokenBucket | Strategy::LeakyBucket => {
                let entry = self
                    .tenant_buckets
                    .entry(key.to_string())
                    .or_insert_with(|| Mutex::new(BucketState::new(self.burst_capacity)));
                let mut state = entry.lock().expect("rate limit mutex poisoned");
                match self.strategy {
                    Strategy::TokenBucket => {
                        token_bucket(&mut state, &limits, self.burst_capacity, self.refill_per_minute)
                    }
                    Strategy::LeakyBucket => {
                        leaky_bucket(&mut state, &limits, self.burst_capacity, self.refill_per_minute)
                    }
                    _ => unreachable!(),
                }
            }
        }
    }
}

/// Counts calls against `limit_per_minute`, ignoring `cost` — the window
/// resets wholesale once `WINDOW` has elapsed since it opened.
fn fixed_window(state: &mut BucketState, limits: &OperationLimits) -> Decision {
    let now = Instant::now();
    if now.duration_since(state.window_start) >= WINDOW {
        state.window_start = now;
        state.window_count = 0;
    }
    let would_be = state.window_count + 1;
    if would_be > limits.limit_per_minute {
        let retry_after = WINDOW.saturating_sub(now.duration_since(state.window_start));
        return Decision {
            allowed: false,
            remaining: limits.limit_per_minute.saturating_sub(state.window_count),
            limit: limits.limit_per_minute,
            retry_after_secs: retry_after.as_secs().max(1),
        };
    }
    state.window_count = would_be;
    Decision {
        allowed: true,
        remaining: limits.limit_per_minute.saturating_sub(state.window_count),
        limit: limits.limit_per_minute,
        retry_after_secs: 0,
    }
}

/// Counts calls against `limit_per_minute` over a rolling window, ignoring
/// `cost` — each call is one slot regardless of how expensive it is.
fn sliding_window(state: &mut BucketState, limits: &OperationLimits) -> Decision {
    let now = Instant::now();
    while let Some(front) = state.timestamps.front() {
        if now.duration_since(*front) > WINDOW {
            state.timestamps.pop_front();
        } else {
            break;
        }
    }
    let count = state.timestamps.len() as u32;
    if count + 1 > limits.limit_per_minute {
        let retry_after = state
            .timestamps
            .front()
            .map(|t| WINDOW.saturating_sub(now.duration_since(*t)))
            .unwrap_or(WINDOW);
        return Decision {
            allowed: false,
            remaining: 0,
            limit: limits.limit_per_minute,
            retry_after_secs: retry_after.as_secs().max(1),
        };
    }
    state.timestamps.push_back(now);
    Decision {
        allowed: true,
        remaining: limits.limit_per_minute.saturating_sub(state.timestamps.len() as u32),
        limit: limits.limit_per_minute,
        retry_after_secs: 0,
    }
}

/// Cost-weighted bucket shared by every operation a tenant performs.
/// `capacity`/`refill_per_minute` come from `RateLimitConfig`, so capacity
/// is never tied to any single operation's `limit_per_minute` — the bug
/// that made `Import` (cost 50) permanently unsatisfiable when its own
/// 5/minute count limit doubled as bucket capacity.
fn token_bucket(state: &mut BucketState, limits: &OperationLimits, capacity: f64, refill_per_minute: f64) -> Decision {
    let now = Instant::now();
    let refill_rate = refill_per_minute / WINDOW.as_secs_f64();
    let elapsed = now.duration_since(state.last_refill).as_secs_f64();
    state.tokens = (state.tokens + elapsed * refill_rate).min(capacity);
    state.last_refill = now;

    let cost = limits.cost as f64;
    if state.tokens < cost {
        let deficit = cost - state.tokens;
        let retry_after = (deficit / refill_rate).ceil() as u64;
        return Decision {
            allowed: false,
            remaining: state.tokens.floor() as u32,
            limit: capacity as u32,
            retry_after_secs: retry_after.max(1),
        };
    }
    state.tokens -= cost;
    Decision { allowed: true, remaining: state.tokens.floor() as u32, limit: capacity as u32, retry_after_secs: 0 }
}

fn leaky_bucket(state: &mut BucketState, limits: &OperationLimits, capacity: f64, refill_per_minute: f64) -> Decision {
    let now = Instant::now();
    let leak_rate = refill_per_minute / WINDOW.as_secs_f64();
    let elapsed = now.duration_since(state.last_leak).as_secs_f64();
    state.queue_level = (state.queue_level - elapsed * leak_rate).max(0.0);
    state.last_leak = now;

    let cost = limits.cost as f64;
    if state.queue_level + cost > capacity {
        let overflow = state.queue_level + cost - capacity;
        let retry_after = (overflow / leak_rate).ceil() as u64;
        return Decision {
            allowed: false,
            remaining: (capacity - state.queue_level).floor().max(0.0) as u32,
            limit: capacity as u32,
            retry_after_secs: retry_after.max(1),
        };
    }
    state.queue_level += cost;
    Decision {
        allowed: true,
        remaining: (capacity - state.queue_level).floor().max(0.0) as u32,
        limit: capacity as u32,
        retry_after_secs: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_window_blocks_once_limit_exhausted() {
        let limiter = RateLimiter::new(Strategy::FixedWindow);
        for _ in 0..10 {
            assert!(limiter.check("t1", Operation::CreateDataset, None).allowed);
        }
        let decision = limiter.check("t1", Operation::CreateDataset, None);
        assert!(!decision.allowed);
        assert!(decision.retry_after_secs > 0);
    }

    #[test]
    fn token_bucket_allows_burst_then_throttles() {
        // Default tenant bucket: burst=100, cost(Import)=50 -> exactly 2 calls drain it.
        let limiter = RateLimiter::new(Strategy::TokenBucket);
        for _ in 0..2 {
            assert!(limiter.check("t1", Operation::Import, None).allowed);
        }
        assert!(!limiter.check("t1", Operation::Import, None).allowed);
    }

    #[test]
    fn leaky_bucket_rejects_when_queue_full() {
        // Default tenant bucket: burst=100, cost(Export)=20 -> exactly 5 calls fill it.
        let limiter = RateLimiter::new(Strategy::LeakyBucket);
        for _ in 0..5 {
            assert!(limiter.check("t1", Operation::Export, None).allowed);
        }
        assert!(!limiter.check("t1", Operation::Export, None).allowed);
    }

    #[test]
    fn sliding_window_tracks_independent_keys() {
        let limiter = RateLimiter::new(Strategy::SlidingWindow);
        for _ in 0..100 {
            let _ = limiter.check("tenant-a", Operation::Search, None);
        }
        assert!(limiter.check("tenant-b", Operation::Search, None).allowed);
    }

    #[test]
    fn operation_limits_match_documented_table() {
        assert_eq!(Operation::Search.limits().cost, 1);
        assert_eq!(Operation::BatchInsert.limits().cost, 10);
        assert_eq!(Operation::Import.limits().limit_per_minute, 5);
        assert_eq!(Operation::CreateDataset.limits().limit_per_minute, 10);
    }

    #[test]
    fn override_limit_tightens_operation_count_ceiling() {
        let limiter = RateLimiter::new(Strategy::FixedWindow);
        assert!(!limiter.check("t1", Operation::Search, Some(0)).allowed);
    }

    #[test]
    fn token_bucket_never_permanently_blocks_import() {
        // Regression: capacity must never be derived from a single
        // operation's own limit_per_minute, or a cost > that limit (Import:
        // cost 50, limit 5/min) can never be satisfied.
        let limiter = RateLimiter::new(Strategy::TokenBucket);
        assert!(limiter.check("t2", Operation::Import, None).allowed);
    }
}
