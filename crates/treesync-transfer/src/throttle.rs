//! Token-bucket throttling of transfer writes
//!
//! A [`ThrottlingManager`] owns one bucket shared by every concurrent transfer
//! of a pass. A background task adds `floor(tick * tokens_per_second)` tokens
//! every tick, capped at the bucket capacity (3x the per-second rate by
//! default, which permits short bursts).
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//! use treesync_transfer::ThrottlingManager;
//!
//! # async fn example() -> treesync_transfer::Result<()> {
//! let throttle = ThrottlingManager::new(1024 * 1024);
//! let cancel = CancellationToken::new();
//! throttle.acquire(64 * 1024, &cancel).await?;
//! // ... write one chunk ...
//! throttle.block_for(Duration::from_secs(30)); // server asked us to back off
//! # Ok(())
//! # }
//! ```
//!
//! Tokens are roughly bytes. [`ThrottlingManager::get_tokens`] never blocks:
//! it grants whatever is available up to the request, and callers loop with a
//! short delay until they have accumulated enough.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{Result, TransferError};

/// Mutable bucket state, protected by a Mutex.
#[derive(Debug)]
struct BucketState {
    available: u64,
    /// Refill is suspended until this instant
    blocked_until: Option<Instant>,
}

/// Shared token bucket with a background refill task
#[derive(Debug)]
pub struct ThrottlingManager {
    tokens_per_second: u64,
    capacity: u64,
    tick: Duration,
    state: Arc<Mutex<BucketState>>,
    shutdown: CancellationToken,
}

impl ThrottlingManager {
    /// Default refill cadence
    pub const DEFAULT_TICK: Duration = Duration::from_millis(100);
    /// Default capacity as a multiple of the per-second rate
    pub const DEFAULT_BURST_MULTIPLIER: u64 = 3;
    /// Delay between attempts in [`Self::acquire`]
    pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

    /// Create a manager refilling every [`Self::DEFAULT_TICK`] with a capacity
    /// of three seconds' worth of tokens.
    ///
    /// Must be called from within a Tokio runtime; the refill task is spawned
    /// immediately.
    pub fn new(tokens_per_second: u64) -> Self {
        Self::with_settings(
            tokens_per_second,
            Self::DEFAULT_TICK,
            tokens_per_second.saturating_mul(Self::DEFAULT_BURST_MULTIPLIER),
        )
    }

    /// Create a manager with an explicit tick and capacity.
    ///
    /// The bucket starts empty.
    pub fn with_settings(tokens_per_second: u64, tick: Duration, capacity: u64) -> Self {
        let state = Arc::new(Mutex::new(BucketState {
            available: 0,
            blocked_until: None,
        }));
        let shutdown = CancellationToken::new();
        let per_tick = (tick.as_secs_f64() * tokens_per_second as f64).floor() as u64;

        debug!(
            tokens_per_second,
            capacity,
            tick_ms = tick.as_millis() as u64,
            per_tick,
            "Starting throttling manager"
        );

        tokio::spawn(refill_loop(
            Arc::clone(&state),
            per_tick,
            capacity,
            tick,
            shutdown.clone(),
        ));

        Self {
            tokens_per_second,
            capacity,
            tick,
            state,
            shutdown,
        }
    }

    /// Take up to `requested` tokens without waiting.
    ///
    /// Returns the number granted, between 0 and `min(requested, available)`.
    pub fn get_tokens(&self, requested: u64) -> u64 {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let granted = requested.min(state.available);
        state.available -= granted;
        granted
    }

    /// Zero the bucket and suspend refilling for `duration`.
    ///
    /// A later call extends the pause only if it ends later than the current one.
    pub fn block_for(&self, duration: Duration) {
        let until = Instant::now() + duration;
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.available = 0;
        state.blocked_until = Some(match state.blocked_until {
            Some(existing) if existing > until => existing,
            _ => until,
        });
        debug!(duration_ms = duration.as_millis() as u64, "Throttle blocked");
    }

    /// Accumulate `amount` tokens, polling every [`Self::POLL_INTERVAL`].
    ///
    /// Requests larger than the capacity are still charged in full: the
    /// bucket never holds that many at once, so partial grants are collected
    /// across several refills.
    ///
    /// # Errors
    /// Returns [`TransferError::Cancelled`] if `cancel` fires first.
    pub async fn acquire(&self, amount: u64, cancel: &CancellationToken) -> Result<()> {
        let mut have = 0u64;
        loop {
            if cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            have += self.get_tokens(amount - have);
            if have >= amount {
                return Ok(());
            }
            trace!(have, amount, "Waiting for throttle tokens");
            tokio::select! {
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                _ = tokio::time::sleep(Self::POLL_INTERVAL) => {}
            }
        }
    }

    /// Tokens currently in the bucket
    pub fn available(&self) -> u64 {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .available
    }

    pub fn tokens_per_second(&self) -> u64 {
        self.tokens_per_second
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn tick(&self) -> Duration {
        self.tick
    }

    /// Stop the refill task. Tokens already in the bucket stay available.
    pub fn dispose(&self) {
        self.shutdown.cancel();
    }

    pub fn is_disposed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl Drop for ThrottlingManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn refill_loop(
    state: Arc<Mutex<BucketState>>,
    per_tick: u64,
    capacity: u64,
    tick: Duration,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            now = interval.tick() => {
                let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
                match state.blocked_until {
                    Some(until) if now < until => continue,
                    Some(_) => state.blocked_until = None,
                    None => {}
                }
                state.available = state.available.saturating_add(per_tick).min(capacity);
            }
        }
    }
    debug!("Throttle refill task stopped");
}
