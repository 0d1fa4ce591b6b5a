//! Per-source fixed-window rate limiting for the write and delete paths.
//!
//! Counters are keyed by `sha256(salt || address)` with a salt drawn once per
//! process, so raw addresses are never kept in memory.

pub mod source;

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use sha2::{Digest, Sha256};

use crate::crypto::random_bytes;
use crate::error::Result;
use crate::janitor::Sweeper;

pub use source::client_ip;

pub const DEFAULT_WINDOW: Duration = Duration::from_secs(24 * 3600);

type CounterKey = [u8; 32];

/// What to do with callers whose address is missing or reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnidentifiedSource {
    /// Refuse them while the limiter is active.
    #[default]
    Deny,
    /// Let them through unlimited.
    Allow,
    /// Count all of them against one shared counter.
    Shared,
}

impl FromStr for UnidentifiedSource {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "deny" => Ok(Self::Deny),
            "allow" => Ok(Self::Allow),
            "shared" => Ok(Self::Shared),
            other => Err(format!(
                "unknown unidentified-source policy '{other}' (expected deny, allow or shared)"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Counter {
    count: i64,
    started: Instant,
}

struct Inner {
    limit: i64,
    window: Duration,
    counters: HashMap<CounterKey, Counter>,
}

pub struct IpLimiter {
    salt: [u8; 32],
    unidentified: UnidentifiedSource,
    inner: RwLock<Inner>,
}

impl IpLimiter {
    /// A limiter admitting `limit` requests per source per `window`.
    /// A limit of zero or below disables it; a zero window means 24 hours.
    pub fn new(limit: i64, window: Duration, unidentified: UnidentifiedSource) -> Result<Self> {
        let window = if window.is_zero() {
            DEFAULT_WINDOW
        } else {
            window
        };
        Ok(Self {
            salt: random_bytes()?,
            unidentified,
            inner: RwLock::new(Inner {
                limit,
                window,
                counters: HashMap::new(),
            }),
        })
    }

    pub fn is_active(&self) -> bool {
        self.inner.read().limit > 0
    }

    pub fn limit(&self) -> i64 {
        self.inner.read().limit
    }

    pub fn window(&self) -> Duration {
        self.inner.read().window
    }

    /// Change the limit. Existing counters are kept.
    pub fn set_limit(&self, limit: i64) {
        self.inner.write().limit = limit;
    }

    /// Number of tracked sources.
    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.read().counters.len()
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Count one request from `source` and decide whether it may proceed.
    pub fn allow(&self, source: Option<IpAddr>) -> bool {
        self.allow_at(source, Instant::now())
    }

    fn allow_at(&self, source: Option<IpAddr>, now: Instant) -> bool {
        if !self.is_active() {
            return true;
        }
        let key = match (source, self.unidentified) {
            (Some(ip), _) => self.key_for(Some(ip)),
            (None, UnidentifiedSource::Shared) => self.key_for(None),
            (None, UnidentifiedSource::Allow) => return true,
            (None, UnidentifiedSource::Deny) => return false,
        };

        let mut inner = self.inner.write();
        let (limit, window) = (inner.limit, inner.window);
        if limit <= 0 {
            return true;
        }
        match inner.counters.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(Counter {
                    count: 1,
                    started: now,
                });
                true
            }
            Entry::Occupied(mut slot) => {
                let counter = slot.get_mut();
                if now.saturating_duration_since(counter.started) >= window {
                    *counter = Counter {
                        count: 1,
                        started: now,
                    };
                    true
                } else if counter.count < limit {
                    counter.count += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Drop counters whose window has elapsed. Returns how many were dropped.
    pub fn clean(&self) -> usize {
        self.clean_at(Instant::now())
    }

    fn clean_at(&self, now: Instant) -> usize {
        let mut inner = self.inner.write();
        let window = inner.window;
        let before = inner.counters.len();
        inner
            .counters
            .retain(|_, c| now.saturating_duration_since(c.started) < window);
        before - inner.counters.len()
    }

    fn key_for(&self, ip: Option<IpAddr>) -> CounterKey {
        let mut hasher = Sha256::new();
        hasher.update(self.salt);
        match ip {
            Some(IpAddr::V4(v4)) => hasher.update(v4.octets()),
            Some(IpAddr::V6(v6)) => hasher.update(v6.octets()),
            None => hasher.update(b"unidentified"),
        }
        hasher.finalize().into()
    }
}

impl Sweeper for IpLimiter {
    fn sweep_expired(&self) -> Result<usize> {
        Ok(self.clean())
    }
}
