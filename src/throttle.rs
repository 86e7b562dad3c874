//! Sliding-window admission control.
//!
//! A [`Throttler`] remembers the timestamps of the last `rate_limit` calls per
//! key. A call is throttled when the oldest remembered call happened less than
//! `period` ago, which allows at most `rate_limit` admissions per rolling
//! period. Every call advances the window, throttled or not, so a client that
//! keeps hammering the server keeps pushing its own window forward.
//!
//! Keys are either the global window (`None`) or a client identity. Client
//! windows live in a bounded cache: when a new client arrives at capacity,
//! windows idle for longer than `client_idle` go first, then the least
//! recently seen one.
//!
//! ```
//! use facegate::throttle::Throttler;
//! use std::time::Duration;
//!
//! let throttler = Throttler::new(2, Duration::from_secs(30)).unwrap();
//! assert!(throttler.admit(Some("10.0.0.1")));
//! assert!(throttler.admit(Some("10.0.0.1")));
//! assert!(!throttler.admit(Some("10.0.0.1")));
//! // Other clients have their own window
//! assert!(throttler.admit(Some("10.0.0.2")));
//! ```

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Default number of client windows kept in memory.
pub const DEFAULT_CLIENT_CAPACITY: usize = 10_000;

/// Default idle time after which a client window may be evicted.
pub const DEFAULT_CLIENT_IDLE: Duration = Duration::from_secs(600);

/// Invalid limiter parameters, reported at construction time.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ThrottleError {
    #[error("`rate_limit` should be a positive integer")]
    InvalidRateLimit,

    #[error("`period` should be a positive duration")]
    InvalidPeriod,

    #[error("client window capacity should be positive")]
    InvalidCapacity,
}

/// Ring of the last N admission timestamps for one key.
///
/// `None` slots stand for calls at the beginning of time and never throttle.
#[derive(Debug, Clone)]
struct RateWindow {
    times: VecDeque<Option<Instant>>,
}

impl RateWindow {
    fn new(rate_limit: usize) -> Self {
        Self {
            times: std::iter::repeat(None).take(rate_limit).collect(),
        }
    }

    /// Classify the call at `now` and slide the window. Returns `true` when throttled.
    fn check_and_advance(&mut self, now: Instant, period: Duration) -> bool {
        let throttled = match self.times.front().copied().flatten() {
            Some(oldest) => now.saturating_duration_since(oldest) <= period,
            None => false,
        };

        self.times.pop_front();
        self.times.push_back(Some(now));

        throttled
    }

    fn latest(&self) -> Option<Instant> {
        self.times.back().copied().flatten()
    }
}

#[derive(Debug)]
struct ClientEntry {
    window: RateWindow,
    last_seen: Instant,
}

/// Bounded map from client identity to its rate window.
#[derive(Debug)]
struct ClientWindows {
    entries: HashMap<String, ClientEntry>,
    capacity: usize,
    idle: Duration,
}

impl ClientWindows {
    fn window_mut(&mut self, client: &str, rate_limit: usize, now: Instant) -> &mut ClientEntry {
        if !self.entries.contains_key(client) && self.entries.len() >= self.capacity {
            self.evict(now);
        }
        self.entries
            .entry(client.to_string())
            .or_insert_with(|| ClientEntry {
                window: RateWindow::new(rate_limit),
                last_seen: now,
            })
    }

    /// Make room for one entry: drop idle windows, else the least recently seen one.
    fn evict(&mut self, now: Instant) {
        let idle = self.idle;
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now.saturating_duration_since(entry.last_seen) < idle);

        if self.entries.len() >= self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_seen)
                .map(|(key, _)| key.clone());
            if let Some(key) = oldest {
                self.entries.remove(&key);
            }
        }

        tracing::debug!(
            evicted = before - self.entries.len(),
            remaining = self.entries.len(),
            "client_windows_evicted"
        );
    }
}

/// Sliding-window rate limiter keyed globally and per client.
#[derive(Debug)]
pub struct Throttler {
    rate_limit: usize,
    period: Duration,
    global: Mutex<RateWindow>,
    clients: Mutex<ClientWindows>,
}

impl Throttler {
    /// Create a limiter allowing `rate_limit` admissions per `period`.
    pub fn new(rate_limit: usize, period: Duration) -> Result<Self, ThrottleError> {
        Self::with_client_cache(rate_limit, period, DEFAULT_CLIENT_CAPACITY, DEFAULT_CLIENT_IDLE)
    }

    /// Create a limiter with an explicit client cache size and idle eviction time.
    pub fn with_client_cache(
        rate_limit: usize,
        period: Duration,
        capacity: usize,
        idle: Duration,
    ) -> Result<Self, ThrottleError> {
        if rate_limit == 0 {
            return Err(ThrottleError::InvalidRateLimit);
        }
        if period.is_zero() {
            return Err(ThrottleError::InvalidPeriod);
        }
        if capacity == 0 {
            return Err(ThrottleError::InvalidCapacity);
        }

        Ok(Self {
            rate_limit,
            period,
            global: Mutex::new(RateWindow::new(rate_limit)),
            clients: Mutex::new(ClientWindows {
                entries: HashMap::new(),
                capacity,
                idle,
            }),
        })
    }

    /// Build a limiter from its configuration section.
    pub fn from_config(
        limit: &crate::config::RateLimitConfig,
        throttle: &crate::config::ThrottleConfig,
    ) -> Result<Self, ThrottleError> {
        let period = limit.period().ok_or(ThrottleError::InvalidPeriod)?;
        Self::with_client_cache(
            limit.rate_limit,
            period,
            throttle.client_capacity,
            throttle.client_idle(),
        )
    }

    /// Returns `true` if the call is admitted, `false` if it is throttled.
    pub fn admit(&self, client: Option<&str>) -> bool {
        self.admit_at(client, Instant::now())
    }

    /// [`admit`](Self::admit) with an explicit clock reading.
    pub fn admit_at(&self, client: Option<&str>, now: Instant) -> bool {
        let throttled = match client {
            None => self.global.lock().check_and_advance(now, self.period),
            Some(client) => {
                let mut clients = self.clients.lock();
                let entry = clients.window_mut(client, self.rate_limit, now);
                entry.last_seen = now;
                entry.window.check_and_advance(now, self.period)
            }
        };
        !throttled
    }

    /// Number of client windows currently held.
    pub fn tracked_clients(&self) -> usize {
        self.clients.lock().entries.len()
    }

    pub fn rate_limit(&self) -> usize {
        self.rate_limit
    }

    pub fn period(&self) -> Duration {
        self.period
    }
}
