//! Time source abstraction for the ingestion pipeline.
//!
//! The planner's notion of "today" has to be the exchange's calendar day,
//! not the host's: a host in UTC asking the vendor for data at 23:00 UTC
//! is already on the next trading day in Shanghai. All date arithmetic
//! therefore goes through a [`TimeProvider`] and is converted to the
//! exchange's fixed UTC+8 offset.
//!
//! The [`MockProvider`] lets tests pin and advance the clock.

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

use std::{fmt::Debug, sync::Arc};

use chrono::{DateTime, Datelike, FixedOffset, TimeZone, Utc};
use data_types::TradeDate;
use parking_lot::RwLock;

/// Seconds east of UTC for the exchange's local time (Asia/Shanghai, no
/// daylight saving).
const EXCHANGE_UTC_OFFSET_SECS: i32 = 8 * 3600;

/// A source of wall-clock time.
pub trait TimeProvider: Debug + Send + Sync + 'static {
    /// The current instant.
    fn now(&self) -> DateTime<Utc>;

    /// The current calendar day at the exchange.
    fn today(&self) -> TradeDate {
        let local = self.now().with_timezone(&exchange_offset());
        TradeDate::from_ymd(local.year(), local.month(), local.day())
            .expect("valid calendar day from clock")
    }
}

fn exchange_offset() -> FixedOffset {
    FixedOffset::east_opt(EXCHANGE_UTC_OFFSET_SECS).expect("valid fixed offset")
}

/// A [`TimeProvider`] backed by the system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProvider {}

impl SystemProvider {
    /// Create a new system clock provider.
    pub fn new() -> Self {
        Self::default()
    }
}

impl TimeProvider for SystemProvider {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A [`TimeProvider`] pinned to a settable instant, for tests.
#[derive(Debug)]
pub struct MockProvider {
    now: RwLock<DateTime<Utc>>,
}

impl MockProvider {
    /// Create a provider that reports `now` until told otherwise.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(now),
        }
    }

    /// Pin the clock to the given instant.
    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.write() = now;
    }

    /// Advance the clock by `d`.
    pub fn inc(&self, d: chrono::Duration) {
        let mut now = self.now.write();
        *now = *now + d;
    }
}

impl TimeProvider for MockProvider {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read()
    }
}

impl<T: TimeProvider> TimeProvider for Arc<T> {
    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }
}

/// Convenience constructor for a mock pinned to a UTC timestamp.
pub fn mock_at(year: i32, month: u32, day: u32, hour: u32) -> MockProvider {
    MockProvider::new(
        Utc.with_ymd_and_hms(year, month, day, hour, 0, 0)
            .single()
            .expect("valid mock timestamp"),
    )
}
