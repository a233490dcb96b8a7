//! Per-caller throttling of PIN checks, transfers and general API traffic.
//!
//! Counters are fixed windows keyed by `(caller, bucket)`, held in process
//! memory only. A restart forgets them.

use crate::config::RateLimitConfig;
use crate::error::{Result, WalletError};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Class of protected operation, each with its own threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Bucket {
    PinVerify,
    Transfer,
    General,
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Bucket::PinVerify => "pin-verify",
            Bucket::Transfer => "transfer",
            Bucket::General => "general",
        };
        f.write_str(name)
    }
}

/// Time source for window bookkeeping.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Manually advanced clock for deterministic tests.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<Instant>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock()
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    started: Instant,
}

pub struct RateGuard {
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
    windows: Mutex<HashMap<(String, Bucket), Window>>,
}

impl RateGuard {
    pub fn new(config: RateLimitConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            windows: Mutex::new(HashMap::new()),
        }
    }

    fn window_len(&self) -> Duration {
        Duration::from_secs(self.config.window_secs)
    }

    fn limit(&self, bucket: Bucket) -> u32 {
        match bucket {
            Bucket::PinVerify => self.config.pin_verify,
            Bucket::Transfer => self.config.transfer,
            Bucket::General => self.config.general,
        }
    }

    /// Count one attempt; `false` when the caller is over the limit.
    pub fn allow(&self, caller_key: &str, bucket: Bucket) -> bool {
        self.check(caller_key, bucket).is_ok()
    }

    /// Count one attempt, returning how long to wait when over the limit.
    pub fn check(&self, caller_key: &str, bucket: Bucket) -> Result<()> {
        let now = self.clock.now();
        let window_len = self.window_len();
        let limit = self.limit(bucket);

        let mut windows = self.windows.lock();

        // Clean up old entries
        windows.retain(|_, w| now.duration_since(w.started) < window_len);

        let entry = windows
            .entry((caller_key.to_string(), bucket))
            .or_insert(Window {
                count: 0,
                started: now,
            });

        if entry.count >= limit {
            let retry_after = window_len.saturating_sub(now.duration_since(entry.started));
            tracing::warn!(caller = %caller_key, bucket = %bucket, "rate limit exceeded");
            return Err(WalletError::RateLimitExceeded {
                bucket,
                retry_after,
            });
        }

        entry.count += 1;
        Ok(())
    }

    /// Number of live windows, for the stats endpoint.
    pub fn tracked_windows(&self) -> usize {
        let now = self.clock.now();
        let window_len = self.window_len();
        self.windows
            .lock()
            .values()
            .filter(|w| now.duration_since(w.started) < window_len)
            .count()
    }
}

impl fmt::Debug for RateGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateGuard")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
