//! Token bucket rate limiter.
//!
//! Tokens accumulate at `rate` per second up to a ceiling, and every admitted byte spends one
//! token. The bucket is used standalone for policing, or as a shaping gate in front of a
//! [`QueueDiscipline`](crate::QueueDiscipline). [`MultiRateTokenBucket`] keeps several named
//! buckets side by side, e.g. one per customer or per traffic class.

use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::TokenBucketError;

/// Configuration of a [`TokenBucket`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBucketConfig {
    /// Maximum number of tokens the bucket can hold.
    pub capacity: u64,
    /// Refill rate in tokens per second.
    pub rate: u64,
    /// Maximum burst when bursting is disabled.
    pub burst_size: u64,
    /// When `true` the full `capacity` is usable at once. When `false` the bucket never holds
    /// more than `burst_size` tokens, even if `capacity` is larger.
    pub allow_burst: bool,
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self { capacity: 1_000_000, rate: 100_000, burst_size: 500_000, allow_burst: true }
    }
}

impl TokenBucketConfig {
    /// Sets the capacity.
    pub const fn capacity(mut self, capacity: u64) -> Self {
        self.capacity = capacity;
        self
    }

    /// Sets the refill rate in tokens per second.
    pub const fn rate(mut self, rate: u64) -> Self {
        self.rate = rate;
        self
    }

    /// Sets the burst size.
    pub const fn burst_size(mut self, burst_size: u64) -> Self {
        self.burst_size = burst_size;
        self
    }

    /// Enables or disables bursting up to the full capacity.
    pub const fn allow_burst(mut self, allow_burst: bool) -> Self {
        self.allow_burst = allow_burst;
        self
    }

    /// Checks the configuration, rejecting values that would make the bucket useless.
    pub const fn validate(&self) -> Result<(), TokenBucketError> {
        if self.capacity == 0 {
            return Err(TokenBucketError::InvalidConfig("capacity must be positive"));
        }

        if self.rate == 0 {
            return Err(TokenBucketError::InvalidConfig("rate must be positive"));
        }

        if !self.allow_burst && self.burst_size == 0 {
            return Err(TokenBucketError::InvalidConfig(
                "burst_size must be positive when bursting is disabled",
            ));
        }

        Ok(())
    }

    /// The most tokens the bucket will ever hold.
    pub fn ceiling(&self) -> u64 {
        if self.allow_burst {
            self.capacity
        } else {
            self.burst_size.min(self.capacity)
        }
    }
}

/// Counters for a [`TokenBucket`].
#[derive(Debug, Default)]
pub struct TokenBucketStats {
    admitted: AtomicU64,
    rejected: AtomicU64,
    tokens_consumed: AtomicU64,
}

impl TokenBucketStats {
    #[inline]
    fn increment_admitted(&self, tokens: u64) {
        self.admitted.fetch_add(1, Ordering::Relaxed);
        self.tokens_consumed.fetch_add(tokens, Ordering::Relaxed);
    }

    #[inline]
    fn increment_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of successful consume calls.
    #[inline]
    pub fn admitted(&self) -> u64 {
        self.admitted.load(Ordering::Relaxed)
    }

    /// Number of consume calls that found too few tokens.
    #[inline]
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Total tokens spent.
    #[inline]
    pub fn tokens_consumed(&self) -> u64 {
        self.tokens_consumed.load(Ordering::Relaxed)
    }

    fn reset(&self) {
        self.admitted.store(0, Ordering::Relaxed);
        self.rejected.store(0, Ordering::Relaxed);
        self.tokens_consumed.store(0, Ordering::Relaxed);
    }
}

#[derive(Debug)]
struct BucketState {
    config: TokenBucketConfig,
    /// Fractional so that slow refill rates don't lose tokens to rounding.
    tokens: f64,
    last_refill: Instant,
}

impl BucketState {
    fn refill(&mut self, now: Instant) {
        // A clock that moved backwards refills nothing.
        let Some(elapsed) = now.checked_duration_since(self.last_refill) else {
            return;
        };

        let ceiling = self.config.ceiling() as f64;
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.config.rate as f64).min(ceiling);
        self.last_refill = now;
    }
}

/// A thread-safe token bucket.
///
/// Refill and consumption happen under one lock, so no token can be spent twice and a
/// configuration swap never races an in-flight `consume`. All operations have an `_at`
/// variant taking an explicit [`Instant`], which lets simulations drive the bucket from a
/// logical clock.
#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<BucketState>,
    stats: TokenBucketStats,
}

impl TokenBucket {
    /// Creates a full bucket.
    pub fn new(config: TokenBucketConfig) -> Result<Self, TokenBucketError> {
        Self::with_start(config, Instant::now())
    }

    /// Creates a full bucket whose refill clock starts at `start`.
    pub fn with_start(config: TokenBucketConfig, start: Instant) -> Result<Self, TokenBucketError> {
        config.validate()?;

        Ok(Self {
            state: Mutex::new(BucketState {
                tokens: config.ceiling() as f64,
                config,
                last_refill: start,
            }),
            stats: TokenBucketStats::default(),
        })
    }

    /// Takes `tokens` from the bucket if enough are available. On failure nothing is taken.
    pub fn consume(&self, tokens: u64) -> Result<(), TokenBucketError> {
        self.consume_at(tokens, Instant::now())
    }

    /// Like [`consume`](Self::consume), refilling up to `now`.
    pub fn consume_at(&self, tokens: u64, now: Instant) -> Result<(), TokenBucketError> {
        let mut state = self.state.lock();
        state.refill(now);

        if state.tokens >= tokens as f64 {
            state.tokens -= tokens as f64;
            self.stats.increment_admitted(tokens);
            trace!(tokens, remaining = state.tokens, "Consumed tokens");
            Ok(())
        } else {
            self.stats.increment_rejected();
            Err(TokenBucketError::Insufficient {
                requested: tokens,
                available: state.tokens as u64,
            })
        }
    }

    /// Returns `true` if `tokens` could be consumed right now, without consuming them.
    pub fn try_consume(&self, tokens: u64) -> bool {
        self.try_consume_at(tokens, Instant::now())
    }

    /// Like [`try_consume`](Self::try_consume), refilling up to `now`.
    pub fn try_consume_at(&self, tokens: u64, now: Instant) -> bool {
        let mut state = self.state.lock();
        state.refill(now);
        state.tokens >= tokens as f64
    }

    /// Whole tokens currently available.
    pub fn available_tokens(&self) -> u64 {
        self.available_tokens_at(Instant::now())
    }

    /// Whole tokens available at `now`.
    pub fn available_tokens_at(&self, now: Instant) -> u64 {
        let mut state = self.state.lock();
        state.refill(now);
        state.tokens as u64
    }

    /// How long until `tokens` are available. Returns `None` if the request exceeds what the
    /// bucket can ever hold.
    pub fn time_until_available(&self, tokens: u64) -> Option<Duration> {
        self.time_until_available_at(tokens, Instant::now())
    }

    /// How long until `tokens` are available, measured from `now`. Returns `None` if the
    /// request exceeds what the bucket can ever hold.
    pub fn time_until_available_at(&self, tokens: u64, now: Instant) -> Option<Duration> {
        let mut state = self.state.lock();
        if tokens > state.config.ceiling() {
            return None;
        }

        state.refill(now);
        let missing = tokens as f64 - state.tokens;
        if missing <= 0.0 {
            return Some(Duration::ZERO);
        }

        Some(Duration::from_secs_f64(missing / state.config.rate as f64))
    }

    /// Swaps the configuration. Tokens earned under the old rate are credited first, then the
    /// balance is clamped to the new ceiling.
    pub fn update_config(&self, config: TokenBucketConfig) -> Result<(), TokenBucketError> {
        self.update_config_at(config, Instant::now())
    }

    /// Like [`update_config`](Self::update_config), settling the old rate up to `now`.
    pub fn update_config_at(
        &self,
        config: TokenBucketConfig,
        now: Instant,
    ) -> Result<(), TokenBucketError> {
        config.validate()?;

        let mut state = self.state.lock();
        state.refill(now);
        state.config = config;
        state.tokens = state.tokens.min(config.ceiling() as f64);

        debug!(?config, tokens = state.tokens, "Token bucket reconfigured");
        Ok(())
    }

    /// The current configuration.
    pub fn config(&self) -> TokenBucketConfig {
        self.state.lock().config
    }

    /// Bucket counters.
    pub const fn stats(&self) -> &TokenBucketStats {
        &self.stats
    }

    /// Zeroes the counters. The token balance is untouched.
    pub fn reset_stats(&self) {
        self.stats.reset();
    }
}

/// A set of named [`TokenBucket`]s.
///
/// Lookups share a read lock, so consumers of different buckets only contend on the bucket
/// they hit.
#[derive(Debug, Default)]
pub struct MultiRateTokenBucket {
    buckets: RwLock<BTreeMap<String, TokenBucket>>,
}

impl MultiRateTokenBucket {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a full bucket under `name`, replacing any bucket already registered there.
    pub fn add_bucket(
        &self,
        name: impl Into<String>,
        config: TokenBucketConfig,
    ) -> Result<(), TokenBucketError> {
        let name = name.into();
        let bucket = TokenBucket::new(config)?;
        if self.buckets.write().insert(name.clone(), bucket).is_some() {
            debug!(name, ?config, "Replaced token bucket");
        } else {
            debug!(name, ?config, "Added token bucket");
        }
        Ok(())
    }

    /// Removes the bucket `name`. Returns `false` if there was none.
    pub fn remove_bucket(&self, name: &str) -> bool {
        self.buckets.write().remove(name).is_some()
    }

    /// Takes `tokens` from the bucket `name`.
    pub fn consume(&self, name: &str, tokens: u64) -> Result<(), TokenBucketError> {
        self.with_bucket(name, |bucket| bucket.consume(tokens))?
    }

    /// Like [`consume`](Self::consume), refilling up to `now`.
    pub fn consume_at(
        &self,
        name: &str,
        tokens: u64,
        now: Instant,
    ) -> Result<(), TokenBucketError> {
        self.with_bucket(name, |bucket| bucket.consume_at(tokens, now))?
    }

    /// Returns `true` if the bucket `name` exists and could give `tokens` right now.
    pub fn try_consume(&self, name: &str, tokens: u64) -> bool {
        self.with_bucket(name, |bucket| bucket.try_consume(tokens)).unwrap_or(false)
    }

    /// Whole tokens available in the bucket `name`.
    pub fn available_tokens(&self, name: &str) -> Option<u64> {
        self.with_bucket(name, TokenBucket::available_tokens).ok()
    }

    /// Whole tokens available in every bucket, by name.
    pub fn all_available_tokens(&self) -> BTreeMap<String, u64> {
        self.buckets
            .read()
            .iter()
            .map(|(name, bucket)| (name.clone(), bucket.available_tokens()))
            .collect()
    }

    /// Registered bucket names, in order.
    pub fn bucket_names(&self) -> Vec<String> {
        self.buckets.read().keys().cloned().collect()
    }

    /// Runs `f` against the bucket `name` under the read lock.
    pub fn with_bucket<T>(
        &self,
        name: &str,
        f: impl FnOnce(&TokenBucket) -> T,
    ) -> Result<T, TokenBucketError> {
        let buckets = self.buckets.read();
        let bucket =
            buckets.get(name).ok_or_else(|| TokenBucketError::UnknownBucket(name.to_string()))?;
        Ok(f(bucket))
    }
}
