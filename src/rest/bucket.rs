//! Rate-limit bucket table.
//!
//! The table is pure bookkeeping: it never sleeps and never performs I/O.
//! Two maps back it, route signature to bucket key and bucket key to
//! [`Bucket`], plus one process-wide global bucket that is only populated
//! while the server has the whole client parked.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use reqwest::header::HeaderMap;
use tokio::time::Instant;

use crate::rest::route::RouteSignature;

pub const HEADER_BUCKET: &str = "x-ratelimit-bucket";
pub const HEADER_LIMIT: &str = "x-ratelimit-limit";
pub const HEADER_REMAINING: &str = "x-ratelimit-remaining";
pub const HEADER_RESET: &str = "x-ratelimit-reset";
pub const HEADER_RESET_AFTER: &str = "x-ratelimit-reset-after";
pub const HEADER_GLOBAL: &str = "x-ratelimit-global";
pub const HEADER_SCOPE: &str = "x-ratelimit-scope";
pub const HEADER_RETRY_AFTER: &str = "retry-after";

const GLOBAL_BUCKET_KEY: &str = "global";
/// Prefix of buckets created locally for a 429 that named no bucket.
const SYNTHETIC_BUCKET_PREFIX: &str = "route:";

/// Rate-limit metadata carried by one response.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RateLimitHeaders {
    pub bucket: Option<String>,
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    /// Time until the window refills, relative to when the response arrived.
    pub reset_after: Option<Duration>,
    pub global: bool,
    /// `user`, `global` or `shared`, when the server says.
    pub scope: Option<String>,
    pub retry_after: Option<Duration>,
}

impl RateLimitHeaders {
    /// Extracts rate-limit metadata, ignoring malformed values.
    ///
    /// `X-RateLimit-Reset-After` wins over the absolute `X-RateLimit-Reset`
    /// because it does not depend on clock agreement with the server.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let reset_after = header_str(headers, HEADER_RESET_AFTER)
            .and_then(parse_seconds)
            .or_else(|| {
                let reset_epoch = header_str(headers, HEADER_RESET)?.parse::<f64>().ok()?;
                let now_epoch = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs_f64();
                Duration::try_from_secs_f64((reset_epoch - now_epoch).max(0.0)).ok()
            });

        Self {
            bucket: header_str(headers, HEADER_BUCKET).map(str::to_string),
            limit: header_str(headers, HEADER_LIMIT).and_then(|value| value.parse().ok()),
            remaining: header_str(headers, HEADER_REMAINING).and_then(|value| value.parse().ok()),
            reset_after,
            global: header_str(headers, HEADER_GLOBAL)
                .is_some_and(|value| value.eq_ignore_ascii_case("true")),
            scope: header_str(headers, HEADER_SCOPE).map(str::to_string),
            retry_after: header_str(headers, HEADER_RETRY_AFTER).and_then(parse_seconds),
        }
    }

    /// True when the response carries a full window description.
    pub fn has_window(&self) -> bool {
        self.limit.is_some() && self.remaining.is_some() && self.reset_after.is_some()
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
}

pub(crate) fn parse_seconds(value: &str) -> Option<Duration> {
    let seconds = value.trim().parse::<f64>().ok()?;
    if seconds < 0.0 {
        return None;
    }
    Duration::try_from_secs_f64(seconds).ok()
}

/// One server-defined quota window.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bucket {
    pub key: String,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: Instant,
    /// Last observed window length, used to estimate the next reset locally.
    pub window: Duration,
    pub is_global: bool,
}

impl Bucket {
    fn new(key: String, limit: u32, remaining: u32, reset_after: Duration, now: Instant) -> Self {
        Self {
            key,
            limit,
            remaining: remaining.min(limit),
            reset_at: now + reset_after,
            window: reset_after,
            is_global: false,
        }
    }

    /// Takes one unit of budget, refilling first if the window has passed.
    ///
    /// Returns the instant the caller must wait for when the budget is spent.
    fn try_take(&mut self, now: Instant) -> Result<(), Instant> {
        if now >= self.reset_at {
            self.remaining = self.limit;
            self.reset_at = now + self.window;
        }
        if self.remaining == 0 {
            return Err(self.reset_at);
        }
        self.remaining -= 1;
        Ok(())
    }

    /// Folds a server report into the bucket.
    ///
    /// A report for a window that has already elapsed locally replaces the
    /// state. Within one window, remaining only moves down.
    fn absorb(&mut self, limit: u32, remaining: u32, reset_after: Duration, now: Instant) {
        let remaining = remaining.min(limit);
        if now >= self.reset_at {
            self.remaining = remaining;
        } else {
            self.remaining = self.remaining.min(remaining);
        }
        self.limit = limit;
        self.reset_at = now + reset_after;
        self.window = reset_after;
    }

    /// Spends the whole budget until `until`.
    fn park(&mut self, until: Instant) {
        self.remaining = 0;
        if until > self.reset_at {
            self.reset_at = until;
        }
    }
}

/// Outcome of [`BucketTable::try_admit`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Wait { until: Instant, global: bool },
}

/// Route-to-bucket bookkeeping shared by every caller of one client.
#[derive(Debug, Default)]
pub struct BucketTable {
    routes: RwLock<HashMap<RouteSignature, String>>,
    buckets: Mutex<HashMap<String, Bucket>>,
    global: Mutex<Option<Bucket>>,
}

impl BucketTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies the rate-limit metadata of one response for `signature`.
    pub fn record_response(
        &self,
        signature: &RouteSignature,
        headers: &RateLimitHeaders,
        now: Instant,
    ) {
        let key = match &headers.bucket {
            Some(key) => {
                self.routes.write().insert(signature.clone(), key.clone());
                Some(key.clone())
            }
            None => self.routes.read().get(signature).cloned(),
        };

        if let (Some(key), Some(limit), Some(remaining), Some(reset_after)) = (
            key.as_ref(),
            headers.limit,
            headers.remaining,
            headers.reset_after,
        ) {
            self.buckets
                .lock()
                .entry(key.clone())
                .and_modify(|bucket| bucket.absorb(limit, remaining, reset_after, now))
                .or_insert_with(|| Bucket::new(key.clone(), limit, remaining, reset_after, now));
        }

        let Some(retry_after) = headers.retry_after else {
            return;
        };
        let until = now + retry_after;

        if headers.global {
            let mut global = self.global.lock();
            match global.as_mut() {
                Some(bucket) => bucket.park(until),
                None => {
                    let mut bucket =
                        Bucket::new(GLOBAL_BUCKET_KEY.to_string(), 0, 0, retry_after, now);
                    bucket.is_global = true;
                    *global = Some(bucket);
                }
            }
            return;
        }

        let key = key.unwrap_or_else(|| {
            let synthetic = format!("{SYNTHETIC_BUCKET_PREFIX}{signature}");
            self.routes
                .write()
                .insert(signature.clone(), synthetic.clone());
            synthetic
        });
        self.buckets
            .lock()
            .entry(key.clone())
            .and_modify(|bucket| bucket.park(until))
            .or_insert_with(|| {
                Bucket::new(key, headers.limit.unwrap_or(1).max(1), 0, retry_after, now)
            });
    }

    /// Returns the bucket governing `signature`, or `None` when no response
    /// has described it yet.
    pub fn lookup(&self, signature: &RouteSignature) -> Option<Bucket> {
        let key = self.routes.read().get(signature).cloned()?;
        self.buckets.lock().get(&key).cloned()
    }

    /// Returns the global bucket while the client is globally parked.
    pub fn global(&self) -> Option<Bucket> {
        self.global.lock().clone()
    }

    /// Checks the global then the route budget and takes one unit if both
    /// allow it. Unknown routes are admitted without any bookkeeping.
    pub fn try_admit(&self, signature: &RouteSignature, now: Instant) -> Admission {
        let mut global = self.global.lock();
        if let Some(bucket) = global.as_ref() {
            if now < bucket.reset_at {
                return Admission::Wait {
                    until: bucket.reset_at,
                    global: true,
                };
            }
            *global = None;
        }

        let Some(key) = self.routes.read().get(signature).cloned() else {
            return Admission::Admitted;
        };
        if key.starts_with(SYNTHETIC_BUCKET_PREFIX) {
            return self.admit_synthetic(signature, &key, now);
        }

        let mut buckets = self.buckets.lock();
        match buckets.get_mut(&key) {
            Some(bucket) => match bucket.try_take(now) {
                Ok(()) => Admission::Admitted,
                Err(until) => Admission::Wait {
                    until,
                    global: false,
                },
            },
            None => Admission::Admitted,
        }
    }

    /// A synthetic bucket only models one retry-after window. Once that has
    /// passed the route goes back to being unknown instead of refilling.
    fn admit_synthetic(&self, signature: &RouteSignature, key: &str, now: Instant) -> Admission {
        {
            let mut buckets = self.buckets.lock();
            if let Some(bucket) = buckets.get(key) {
                if now < bucket.reset_at {
                    return Admission::Wait {
                        until: bucket.reset_at,
                        global: false,
                    };
                }
            }
            buckets.remove(key);
        }

        let mut routes = self.routes.write();
        if routes.get(signature).is_some_and(|mapped| mapped == key) {
            routes.remove(signature);
        }
        Admission::Admitted
    }
}
