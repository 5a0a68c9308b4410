//! Process-wide rate budgets for vendor API calls.
//!
//! The vendor enforces a hard per-minute cap per API method *per
//! account*, so one [`RateLimiter`] instance is shared by every worker in
//! the process and every fetch path must pass through
//! [`RateLimiter::acquire`] before touching the network.
//!
//! Each task type gets a sliding-window token bucket: at most `N` grants
//! within any trailing 60 second window. Waiters are served strictly
//! FIFO; a waiter cancelled while blocked consumes no token.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    clippy::clone_on_ref_ptr,
    clippy::dbg_macro,
    clippy::explicit_iter_loop,
    clippy::todo,
    clippy::use_self,
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    unreachable_pub
)]

use std::{
    collections::{HashMap, VecDeque},
    num::NonZeroUsize,
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// The rolling window over which a bucket's capacity applies.
pub const WINDOW: Duration = Duration::from_secs(60);

/// The wait was cancelled before a token was granted; no token was
/// consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("rate limit wait cancelled")]
pub struct Cancelled;

/// Per-task-type budgets used to build a [`RateLimiter`].
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Budget applied to task types without an explicit entry.
    pub default_per_minute: NonZeroUsize,

    /// Per-task-type overrides.
    pub per_task: HashMap<String, NonZeroUsize>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default_per_minute: NonZeroUsize::new(500).expect("non-zero"),
            per_task: HashMap::new(),
        }
    }
}

#[derive(Debug)]
struct Bucket {
    capacity: usize,

    /// Timestamps of grants inside the trailing window, oldest first.
    ///
    /// Serialises its own state; held only for short critical sections.
    grants: Mutex<VecDeque<Instant>>,

    /// FIFO turn lock. Tokio mutexes queue waiters fairly, so holding the
    /// turn while sleeping for capacity yields strict FIFO admission.
    turn: tokio::sync::Mutex<()>,
}

impl Bucket {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            grants: Mutex::new(VecDeque::with_capacity(capacity)),
            turn: tokio::sync::Mutex::new(()),
        }
    }

    /// Try to take a token now; on failure return the instant the oldest
    /// grant leaves the window.
    fn try_take(&self) -> Result<(), Instant> {
        let now = Instant::now();
        let mut grants = self.grants.lock();
        while let Some(front) = grants.front() {
            if now.duration_since(*front) >= WINDOW {
                grants.pop_front();
            } else {
                break;
            }
        }
        if grants.len() < self.capacity {
            grants.push_back(now);
            Ok(())
        } else {
            Err(*grants.front().expect("bucket full implies non-empty") + WINDOW)
        }
    }
}

/// Shared token buckets, one per task type.
///
/// Budgets are fixed at construction. A task type without an explicit
/// budget gets its *own* bucket at the default capacity on first use,
/// since the vendor caps each API method independently.
#[derive(Debug)]
pub struct RateLimiter {
    default_per_minute: NonZeroUsize,
    buckets: Mutex<HashMap<String, Arc<Bucket>>>,
}

impl RateLimiter {
    /// Build a limiter from per-task budgets.
    pub fn new(config: RateLimitConfig) -> Self {
        let buckets = config
            .per_task
            .into_iter()
            .map(|(name, cap)| (name, Arc::new(Bucket::new(cap.get()))))
            .collect();
        Self {
            default_per_minute: config.default_per_minute,
            buckets: Mutex::new(buckets),
        }
    }

    fn bucket(&self, task_type: &str) -> Arc<Bucket> {
        let mut buckets = self.buckets.lock();
        let default = self.default_per_minute;
        let bucket = buckets
            .entry(task_type.to_string())
            .or_insert_with(|| Arc::new(Bucket::new(default.get())));
        Arc::clone(bucket)
    }

    /// Block until a token is granted for `task_type`.
    ///
    /// FIFO among waiters of the same bucket. Returns [`Cancelled`]
    /// without consuming a token if `cancel` fires while waiting.
    pub async fn acquire(
        &self,
        task_type: &str,
        cancel: &CancellationToken,
    ) -> Result<(), Cancelled> {
        if cancel.is_cancelled() {
            return Err(Cancelled);
        }
        let bucket = self.bucket(task_type);

        // Take the FIFO turn. Everyone behind us waits here until we have
        // been granted a token (or gave up).
        let _turn = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Cancelled),
            guard = bucket.turn.lock() => guard,
        };

        loop {
            let wait_until = match bucket.try_take() {
                Ok(()) => {
                    trace!(task_type, "rate limit token granted");
                    return Ok(());
                }
                Err(at) => at,
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Cancelled),
                _ = tokio::time::sleep_until(wait_until) => {}
            }
        }
    }

    /// Number of grants currently inside the window for `task_type`.
    ///
    /// Test and introspection aid; racy by nature.
    pub fn in_window(&self, task_type: &str) -> usize {
        let bucket = self.bucket(task_type);
        let now = Instant::now();
        let grants = bucket.grants.lock();
        grants
            .iter()
            .filter(|g| now.duration_since(**g) < WINDOW)
            .count()
    }
}
