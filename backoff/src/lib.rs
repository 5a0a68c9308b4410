//! Exponential backoff with jitter, and retry helpers built on it.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    clippy::clone_on_ref_ptr,
    clippy::dbg_macro,
    clippy::todo,
    clippy::use_self,
    missing_debug_implementations,
    missing_docs,
    unreachable_pub
)]

use std::time::Duration;

use rand::Rng;
use tracing::warn;

/// Configuration for the exponential backoff sequence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    /// First delay.
    pub init_backoff: Duration,

    /// Ceiling on any single delay.
    pub max_backoff: Duration,

    /// Multiplier applied between consecutive delays.
    pub base: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            init_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            base: 3.0,
        }
    }
}

/// A stateful backoff sequence.
///
/// Each call to [`Backoff::next`] yields the next delay: jittered
/// uniformly between the previous nominal delay and the next one, capped
/// at `max_backoff`.
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    next_nominal: f64,
}

impl Backoff {
    /// Start a fresh sequence.
    pub fn new(config: &BackoffConfig) -> Self {
        Self {
            config: *config,
            next_nominal: config.init_backoff.as_secs_f64(),
        }
    }

    /// The next delay in the sequence.
    pub fn next(&mut self) -> Duration {
        let max = self.config.max_backoff.as_secs_f64();
        let low = self.next_nominal.min(max);
        let high = (self.next_nominal * self.config.base).min(max);
        self.next_nominal = high;

        let jittered = if high > low {
            rand::thread_rng().gen_range(low..high)
        } else {
            high
        };
        Duration::from_secs_f64(jittered)
    }

    /// The delay for a given 0-based attempt number, without jitter.
    ///
    /// Used where retries are scheduled from persisted state rather than
    /// from a live sequence.
    pub fn nominal_for_attempt(config: &BackoffConfig, attempt: u32) -> Duration {
        let nominal = config.init_backoff.as_secs_f64() * config.base.powi(attempt as i32);
        Duration::from_secs_f64(nominal.min(config.max_backoff.as_secs_f64()))
    }

    /// Retry `f` until it succeeds, sleeping between attempts.
    ///
    /// Every error is retried; use this only where the operation is known
    /// to eventually succeed (e.g. local disk metadata reads).
    pub async fn retry_all_errors<F, F2, T, E>(&mut self, task_name: &str, mut f: F) -> T
    where
        F: FnMut() -> F2,
        F2: std::future::Future<Output = Result<T, E>>,
        E: std::error::Error,
    {
        loop {
            match f().await {
                Ok(v) => return v,
                Err(e) => {
                    let delay = self.next();
                    warn!(
                        error = %e,
                        task = task_name,
                        delay_ms = delay.as_millis() as u64,
                        "retrying after error",
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
