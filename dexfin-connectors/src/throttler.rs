//! Sliding-window rate limiter with linked (pooled) limits.
//!
//! Every REST endpoint has its own limit, and most endpoints are also charged
//! against shared pools (`REQUEST_WEIGHT`, and for order placement `ORDERS` /
//! `ORDERS_24HR`). Acquiring a permit for an endpoint consumes weight 1 from the
//! endpoint's own bucket plus the link weight from each pool, all or nothing.
//!
//! # Concurrency
//!
//! Bucket state sits behind a `std::sync::Mutex` that is only taken for the
//! check-and-consume step. Waiting happens outside the lock with
//! `tokio::time::sleep_until`, so dropping an `acquire` future consumes nothing.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::error::{ConnectorError, ConnectorResult};

const ONE_SECOND: Duration = Duration::from_secs(1);
const ONE_MINUTE: Duration = Duration::from_secs(60);
const ONE_DAY: Duration = Duration::from_secs(86_400);

/// Capacity of every per-endpoint bucket in the default table.
const ENDPOINT_CAPACITY: u32 = 5_000;

// =============================================================================
// Limit identifiers
// =============================================================================

/// Identifier of a rate-limit bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LimitId {
    /// Shared request-weight pool
    RequestWeight,
    /// Short-window order placement pool
    Orders,
    /// Daily order placement pool
    Orders24h,
    /// Instrument catalog
    Markets,
    /// Tickers
    Tickers,
    /// Order book depth
    Depth,
    /// Server time
    ServerTime,
    /// Health probe
    Alive,
    /// Account balances
    Balances,
    /// Own trades
    Trades,
    /// Order listing
    ListOrders,
    /// Order placement
    PlaceOrder,
    /// Order detail
    OrderDetail,
    /// Order cancel
    CancelOrder,
}

impl LimitId {
    /// Every known identifier.
    pub const ALL: [LimitId; 14] = [
        LimitId::RequestWeight,
        LimitId::Orders,
        LimitId::Orders24h,
        LimitId::Markets,
        LimitId::Tickers,
        LimitId::Depth,
        LimitId::ServerTime,
        LimitId::Alive,
        LimitId::Balances,
        LimitId::Trades,
        LimitId::ListOrders,
        LimitId::PlaceOrder,
        LimitId::OrderDetail,
        LimitId::CancelOrder,
    ];

    /// Configuration name (`REQUEST_WEIGHT`, `DEPTH`, ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitId::RequestWeight => "REQUEST_WEIGHT",
            LimitId::Orders => "ORDERS",
            LimitId::Orders24h => "ORDERS_24HR",
            LimitId::Markets => "MARKETS",
            LimitId::Tickers => "TICKERS",
            LimitId::Depth => "DEPTH",
            LimitId::ServerTime => "SERVER_TIME",
            LimitId::Alive => "ALIVE",
            LimitId::Balances => "BALANCES",
            LimitId::Trades => "TRADES",
            LimitId::ListOrders => "LIST_ORDERS",
            LimitId::PlaceOrder => "PLACE_ORDER",
            LimitId::OrderDetail => "ORDER_DETAIL",
            LimitId::CancelOrder => "CANCEL_ORDER",
        }
    }
}

impl fmt::Display for LimitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LimitId {
    type Err = ConnectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_uppercase();
        LimitId::ALL
            .iter()
            .copied()
            .find(|id| id.as_str() == name)
            .ok_or_else(|| ConnectorError::RateLimit(format!("unknown limit id: {}", s)))
    }
}

// =============================================================================
// Configuration table
// =============================================================================

/// A pool the limit is additionally charged against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkedLimit {
    /// Pool identifier
    pub id: LimitId,
    /// Weight consumed from the pool per acquisition
    pub weight: u32,
}

/// One row of the rate-limit table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimit {
    /// Bucket identifier
    pub id: LimitId,
    /// Maximum weight inside one window
    pub capacity: u32,
    /// Sliding window length
    pub window: Duration,
    /// Pools charged alongside this bucket
    pub linked: Vec<LinkedLimit>,
}

impl RateLimit {
    /// Create an unlinked limit.
    pub fn new(id: LimitId, capacity: u32, window: Duration) -> Self {
        Self {
            id,
            capacity,
            window,
            linked: Vec::new(),
        }
    }

    /// Charge `weight` from pool `id` on every acquisition.
    pub fn linked_to(mut self, id: LimitId, weight: u32) -> Self {
        self.linked.push(LinkedLimit { id, weight });
        self
    }
}

/// The exchange's published limits.
pub fn default_rate_limits() -> Vec<RateLimit> {
    let endpoint = |id: LimitId, weight: u32| {
        RateLimit::new(id, ENDPOINT_CAPACITY, ONE_MINUTE).linked_to(LimitId::RequestWeight, weight)
    };

    vec![
        RateLimit::new(LimitId::RequestWeight, 1_200, ONE_MINUTE),
        RateLimit::new(LimitId::Orders, 10, ONE_SECOND),
        RateLimit::new(LimitId::Orders24h, 100_000, ONE_DAY),
        endpoint(LimitId::Tickers, 40),
        endpoint(LimitId::Markets, 10),
        endpoint(LimitId::Depth, 50),
        endpoint(LimitId::ServerTime, 1),
        endpoint(LimitId::Alive, 1),
        endpoint(LimitId::Balances, 10),
        endpoint(LimitId::Trades, 10),
        endpoint(LimitId::ListOrders, 1),
        endpoint(LimitId::PlaceOrder, 1)
            .linked_to(LimitId::Orders, 1)
            .linked_to(LimitId::Orders24h, 1),
        endpoint(LimitId::OrderDetail, 1),
        endpoint(LimitId::CancelOrder, 1),
    ]
}

/// Replace the capacity of existing rows.
///
/// # Errors
/// `ConnectorError::RateLimit` if an override names a limit absent from the table.
pub fn apply_capacity_overrides(
    limits: &mut [RateLimit],
    overrides: &[(LimitId, u32)],
) -> ConnectorResult<()> {
    for (id, capacity) in overrides {
        let row = limits
            .iter_mut()
            .find(|l| l.id == *id)
            .ok_or_else(|| ConnectorError::RateLimit(format!("override for undefined limit {}", id)))?;
        row.capacity = *capacity;
    }
    Ok(())
}

// =============================================================================
// Buckets
// =============================================================================

#[derive(Debug)]
struct Bucket {
    capacity: u32,
    window: Duration,
    log: VecDeque<(Instant, u32)>,
    used: u32,
}

impl Bucket {
    fn new(capacity: u32, window: Duration) -> Self {
        Self {
            capacity,
            window,
            log: VecDeque::new(),
            used: 0,
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&(at, weight)) = self.log.front() {
            if now.duration_since(at) < self.window {
                break;
            }
            self.used -= weight;
            self.log.pop_front();
        }
    }

    fn has_room(&self, weight: u32) -> bool {
        self.used + weight <= self.capacity
    }

    /// Earliest instant at which `weight` fits, assuming no new consumption.
    fn ready_at(&self, weight: u32) -> Option<Instant> {
        let mut used = self.used;
        for &(at, w) in &self.log {
            used -= w;
            if used + weight <= self.capacity {
                return Some(at + self.window);
            }
        }
        None
    }

    fn consume(&mut self, now: Instant, weight: u32) {
        self.log.push_back((now, weight));
        self.used += weight;
    }

    fn available(&self) -> u32 {
        self.capacity.saturating_sub(self.used)
    }
}

/// Proof that capacity was consumed for one call.
///
/// Dropping a permit releases nothing; consumption expires with the window.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitPermit {
    /// Limit the permit was acquired for
    pub limit_id: LimitId,
    /// When the capacity was consumed
    pub acquired_at: Instant,
    /// Time spent waiting for capacity
    pub waited: Duration,
}

// =============================================================================
// Rate limiter
// =============================================================================

/// Gate for outbound requests.
#[derive(Debug)]
pub struct RateLimiter {
    buckets: Mutex<HashMap<LimitId, Bucket>>,
    /// Per limit: every (bucket, weight) consumed by one acquisition
    plans: HashMap<LimitId, Vec<(LimitId, u32)>>,
}

impl RateLimiter {
    /// Build a limiter from a table.
    ///
    /// # Errors
    /// `ConnectorError::RateLimit` on duplicate ids, zero capacity, links to
    /// undefined ids, zero link weights or link weights above the linked capacity.
    pub fn new(limits: Vec<RateLimit>) -> ConnectorResult<Self> {
        let mut seen = HashSet::new();
        for limit in &limits {
            if !seen.insert(limit.id) {
                return Err(ConnectorError::RateLimit(format!("duplicate limit id {}", limit.id)));
            }
            if limit.capacity == 0 {
                return Err(ConnectorError::RateLimit(format!("limit {} has zero capacity", limit.id)));
            }
            if limit.window.is_zero() {
                return Err(ConnectorError::RateLimit(format!("limit {} has an empty window", limit.id)));
            }
        }

        let capacities: HashMap<LimitId, u32> = limits.iter().map(|l| (l.id, l.capacity)).collect();
        let mut plans = HashMap::with_capacity(limits.len());

        for limit in &limits {
            let mut plan = vec![(limit.id, 1)];
            for link in &limit.linked {
                let capacity = capacities.get(&link.id).copied().ok_or_else(|| {
                    ConnectorError::RateLimit(format!("{} links to undefined limit {}", limit.id, link.id))
                })?;
                if link.id == limit.id {
                    return Err(ConnectorError::RateLimit(format!("{} links to itself", limit.id)));
                }
                if link.weight == 0 || link.weight > capacity {
                    return Err(ConnectorError::RateLimit(format!(
                        "{} links to {} with weight {} (capacity {})",
                        limit.id, link.id, link.weight, capacity
                    )));
                }
                plan.push((link.id, link.weight));
            }
            plans.insert(limit.id, plan);
        }

        let buckets = limits
            .into_iter()
            .map(|l| (l.id, Bucket::new(l.capacity, l.window)))
            .collect();

        Ok(Self {
            buckets: Mutex::new(buckets),
            plans,
        })
    }

    /// Limiter over [`default_rate_limits`].
    pub fn with_defaults() -> ConnectorResult<Self> {
        Self::new(default_rate_limits())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<LimitId, Bucket>> {
        self.buckets.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn plan(&self, id: LimitId) -> ConnectorResult<&[(LimitId, u32)]> {
        self.plans
            .get(&id)
            .map(Vec::as_slice)
            .ok_or_else(|| ConnectorError::RateLimit(format!("limit {} is not configured", id)))
    }

    /// Consume now if every bucket has room, otherwise report when to retry.
    fn try_consume(&self, plan: &[(LimitId, u32)], now: Instant) -> Result<(), Instant> {
        let mut buckets = self.lock();
        let mut retry_at: Option<Instant> = None;

        for (id, weight) in plan {
            if let Some(bucket) = buckets.get_mut(id) {
                bucket.prune(now);
                if !bucket.has_room(*weight) {
                    let ready = bucket.ready_at(*weight).unwrap_or(now + bucket.window);
                    retry_at = Some(retry_at.map_or(ready, |r| r.max(ready)));
                }
            }
        }

        if let Some(at) = retry_at {
            return Err(at);
        }

        for (id, weight) in plan {
            if let Some(bucket) = buckets.get_mut(id) {
                bucket.consume(now, *weight);
            }
        }
        Ok(())
    }

    /// Wait until `id` and all of its linked pools have room, then consume them.
    ///
    /// # Errors
    /// `ConnectorError::RateLimit` if `id` is not in the table.
    pub async fn acquire(&self, id: LimitId) -> ConnectorResult<RateLimitPermit> {
        let plan = self.plan(id)?;
        let started = Instant::now();

        loop {
            let now = Instant::now();
            match self.try_consume(plan, now) {
                Ok(()) => {
                    return Ok(RateLimitPermit {
                        limit_id: id,
                        acquired_at: now,
                        waited: now.duration_since(started),
                    })
                }
                Err(retry_at) => {
                    debug!(
                        limit = %id,
                        wait_ms = retry_at.saturating_duration_since(now).as_millis() as u64,
                        "Rate limit reached, waiting"
                    );
                    tokio::time::sleep_until(retry_at).await;
                }
            }
        }
    }

    /// Consume without waiting. Returns `None` when any bucket is full.
    ///
    /// # Errors
    /// `ConnectorError::RateLimit` if `id` is not in the table.
    pub fn try_acquire(&self, id: LimitId) -> ConnectorResult<Option<RateLimitPermit>> {
        let plan = self.plan(id)?;
        let now = Instant::now();

        Ok(self.try_consume(plan, now).ok().map(|()| RateLimitPermit {
            limit_id: id,
            acquired_at: now,
            waited: Duration::ZERO,
        }))
    }

    /// Remaining capacity of a single bucket inside its current window.
    pub fn available(&self, id: LimitId) -> Option<u32> {
        let now = Instant::now();
        let mut buckets = self.lock();
        buckets.get_mut(&id).map(|bucket| {
            bucket.prune(now);
            bucket.available()
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
