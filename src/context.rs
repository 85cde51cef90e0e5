//! Process-wide context
//!
//! Everything that used to be "global" for a popup window lives here:
//! who we are, what time it is, and which operations were run recently.
//! It's built once on startup and handed (as `SharedContext`) to every
//! component that needs it.
use parking_lot::Mutex;
use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use crate::config::Config;

pub type TimestampMs = i64;

/// Identity of a single popup window: `{extensionOrigin}:{windowHandle}`
///
/// Only ever compared for equality.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct WindowIdentity(String);

impl WindowIdentity {
    pub fn new(extension_origin: &str, window_handle: impl fmt::Display) -> Self {
        Self(format!("{}:{}", extension_origin, window_handle))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WindowIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub trait Clock: Send + Sync {
    fn now_ms(&self) -> TimestampMs;
}

pub type SharedClock = Arc<dyn Clock + Send + Sync + 'static>;

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> TimestampMs {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as TimestampMs)
            .unwrap_or_default()
    }
}

/// Clock that only moves when told to.
///
/// Useful for unit-tests.
#[derive(Debug, Default)]
pub struct ManualClock(AtomicI64);

impl ManualClock {
    pub fn new(start_ms: TimestampMs) -> Self {
        Self(AtomicI64::new(start_ms))
    }

    pub fn new_shared(start_ms: TimestampMs) -> Arc<Self> {
        Arc::new(Self::new(start_ms))
    }

    pub fn advance(&self, by: Duration) {
        self.0.fetch_add(by.as_millis() as TimestampMs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> TimestampMs {
        self.0.load(Ordering::SeqCst)
    }
}

/// Remembers when each named operation last ran
#[derive(Debug, Default)]
pub struct RateLimiter {
    last_run: Mutex<BTreeMap<String, TimestampMs>>,
}

impl RateLimiter {
    /// Returns `true` (and records `now_ms`) if `operation` did not run
    /// within the last `min_interval`.
    pub fn check(&self, operation: &str, now_ms: TimestampMs, min_interval: Duration) -> bool {
        let mut last_run = self.last_run.lock();
        let min_interval_ms = min_interval.as_millis() as TimestampMs;

        match last_run.get(operation) {
            Some(&last) if now_ms - last < min_interval_ms => false,
            _ => {
                last_run.insert(operation.to_owned(), now_ms);
                true
            }
        }
    }
}

pub struct Context {
    pub identity: WindowIdentity,
    pub config: Config,
    pub clock: SharedClock,
    pub rate_limiter: RateLimiter,
}

pub type SharedContext = Arc<Context>;

impl Context {
    pub fn new(identity: WindowIdentity, config: Config, clock: SharedClock) -> Self {
        Self {
            identity,
            config,
            clock,
            rate_limiter: RateLimiter::default(),
        }
    }

    pub fn new_shared(identity: WindowIdentity, config: Config, clock: SharedClock) -> SharedContext {
        Arc::new(Self::new(identity, config, clock))
    }

    pub fn now_ms(&self) -> TimestampMs {
        self.clock.now_ms()
    }
}
