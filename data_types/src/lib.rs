//! Shared data types for the QuoteLake ingestion pipeline.
//!
//! This crate contains the domain vocabulary used across every component:
//! dataset identity, symbol identity, trade dates and date ranges, the
//! dataset descriptor loaded from the table catalogue, and the correlation
//! id that ties a download task to its paired persist task.
//!
//! Nothing in here performs I/O.

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

use std::{borrow::Borrow, collections::BTreeMap, fmt, ops::RangeInclusive, str::FromStr, sync::Arc};

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

/// Errors converting external strings into the types in this crate.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// A date string that is not `YYYYMMDD`.
    #[error("invalid trade date {value:?}: expected YYYYMMDD")]
    InvalidTradeDate {
        /// The rejected input.
        value: String,
    },

    /// A dataset name that cannot double as an on-disk directory name.
    #[error("invalid dataset name {value:?}: must be [a-z0-9_]+")]
    InvalidDatasetName {
        /// The rejected input.
        value: String,
    },
}

/// Unique name of a dataset (one row of the table catalogue).
///
/// Doubles as the dataset's directory name under the lake root, so the
/// accepted alphabet is restricted to `[a-z0-9_]`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct DatasetName(Arc<str>);

impl DatasetName {
    /// Create a validated dataset name.
    pub fn try_new(name: impl Into<String>) -> Result<Self, Error> {
        let name = name.into();
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        {
            return Err(Error::InvalidDatasetName { value: name });
        }
        Ok(Self(name.into()))
    }

    /// The name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DatasetName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for DatasetName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for DatasetName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::try_new(s).map_err(serde::de::Error::custom)
    }
}

/// A security identifier in vendor notation, e.g. `600519.SH`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Symbol(Arc<str>);

impl Symbol {
    /// Wrap a vendor symbol string.
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into().into())
    }

    /// The symbol as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// A calendar date in the vendor wire format `YYYYMMDD`.
///
/// All date columns in the lake carry this format, which makes
/// lexicographic comparison equivalent to chronological comparison. The
/// year component is the partition key on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TradeDate(NaiveDate);

impl TradeDate {
    /// The first trading day of the Shanghai exchange; the default start
    /// of a full-history fetch.
    pub fn earliest() -> Self {
        Self(NaiveDate::from_ymd_opt(1990, 12, 19).expect("valid constant date"))
    }

    /// Construct from year/month/day, `None` for out-of-range components.
    pub fn from_ymd(year: i32, month: u32, day: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, day).map(Self)
    }

    /// The calendar year, used as the partition key.
    pub fn year(&self) -> i32 {
        self.0.year()
    }

    /// The next calendar day.
    pub fn next(&self) -> Self {
        Self(self.0.succ_opt().expect("trade date overflow"))
    }

    /// The underlying calendar date.
    pub fn date(&self) -> NaiveDate {
        self.0
    }
}

impl fmt::Display for TradeDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y%m%d"))
    }
}

impl FromStr for TradeDate {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 8 || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::InvalidTradeDate { value: s.into() });
        }
        NaiveDate::parse_from_str(s, "%Y%m%d")
            .map(Self)
            .map_err(|_| Error::InvalidTradeDate { value: s.into() })
    }
}

impl Serialize for TradeDate {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TradeDate {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// An inclusive range of trade dates still missing from the lake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    start: TradeDate,
    end: TradeDate,
}

impl DateRange {
    /// A range spanning `start..=end`; `None` if `start > end`.
    pub fn new(start: TradeDate, end: TradeDate) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    /// The incremental range `(latest_on_disk, today]`.
    ///
    /// `None` means the dataset is already up to date and no download is
    /// needed. A dataset with no rows on disk gets the full history from
    /// [`TradeDate::earliest()`].
    pub fn incremental(latest_on_disk: Option<TradeDate>, today: TradeDate) -> Option<Self> {
        let start = latest_on_disk
            .map(|d| d.next())
            .unwrap_or_else(TradeDate::earliest);
        Self::new(start, today)
    }

    /// Start of the range (inclusive).
    pub fn start(&self) -> TradeDate {
        self.start
    }

    /// End of the range (inclusive).
    pub fn end(&self) -> TradeDate {
        self.end
    }

    /// The years this range touches, for partition pruning.
    pub fn years(&self) -> RangeInclusive<i32> {
        self.start.year()..=self.end.year()
    }
}

/// How completed downloads of a dataset are written to the lake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStrategy {
    /// New rows are appended as additional partition files; published
    /// files are never rewritten. Duplicate primary keys may occur across
    /// files and are resolved by readers (or by compaction).
    Incremental,

    /// The whole dataset is rewritten to a staging tree and published by
    /// an atomic directory rename.
    FullReplace,
}

/// Description of the vendor API call that produces a dataset.
///
/// The planner may bind the symbol/start/end parameters named here;
/// everything else is carried in `defaults` verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApiDescriptor {
    /// Vendor method name.
    pub method: String,

    /// Endpoint override for this method; `None` uses the configured
    /// vendor endpoint.
    #[serde(default)]
    pub base: Option<String>,

    /// Columns the response is expected to contain. A response missing
    /// any of these is a schema mismatch; extra columns are kept.
    pub fields: Vec<String>,

    /// Name of the call parameter carrying the symbol.
    #[serde(default)]
    pub symbol_param: Option<String>,

    /// Name of the call parameter carrying the range start.
    #[serde(default)]
    pub start_param: Option<String>,

    /// Name of the call parameter carrying the range end.
    #[serde(default)]
    pub end_param: Option<String>,

    /// Fixed parameters sent with every call.
    #[serde(default)]
    pub defaults: BTreeMap<String, String>,
}

impl ApiDescriptor {
    /// The set of parameter names the planner is allowed to bind.
    pub fn bindable_params(&self) -> impl Iterator<Item = &str> {
        [
            self.symbol_param.as_deref(),
            self.start_param.as_deref(),
            self.end_param.as_deref(),
        ]
        .into_iter()
        .flatten()
    }
}

/// One row of the table catalogue: everything the pipeline needs to plan,
/// fetch and persist a dataset. Immutable for the life of the process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatasetDescriptor {
    /// Stable identifier; also the directory name under the lake root.
    pub name: DatasetName,

    /// Ordered column set uniquely identifying a logical row.
    pub primary_key: Vec<String>,

    /// The column whose maximum determines "latest present". Absent for
    /// reference tables, which are never planned incrementally.
    #[serde(default)]
    pub date_column: Option<String>,

    /// The vendor call producing this dataset.
    pub api: ApiDescriptor,

    /// Persistence strategy.
    pub strategy: UpdateStrategy,

    /// Whether the dataset is planned per symbol (true) or fetched as a
    /// single whole-market call (false).
    pub per_symbol: bool,
}

impl DatasetDescriptor {
    /// The data column carrying the symbol for per-symbol datasets: by
    /// convention the leading primary-key column.
    pub fn symbol_column(&self) -> Option<&str> {
        if self.per_symbol {
            self.primary_key.first().map(String::as_str)
        } else {
            None
        }
    }
}

/// Identifier carried from a download task to its paired persist task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(uuid::Uuid);

impl CorrelationId {
    /// Generate a fresh correlation id.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dataset_name_alphabet() {
        assert!(DatasetName::try_new("daily").is_ok());
        assert!(DatasetName::try_new("adj_factor").is_ok());
        assert!(DatasetName::try_new("daily2").is_ok());

        assert!(DatasetName::try_new("").is_err());
        assert!(DatasetName::try_new("Daily").is_err());
        assert!(DatasetName::try_new("daily bars").is_err());
        assert!(DatasetName::try_new("../evil").is_err());
    }

    #[test]
    fn trade_date_round_trip() {
        let d: TradeDate = "20240315".parse().unwrap();
        assert_eq!(d.to_string(), "20240315");
        assert_eq!(d.year(), 2024);
        assert_eq!(d.next().to_string(), "20240316");

        // Month and year rollover.
        let d: TradeDate = "20231231".parse().unwrap();
        assert_eq!(d.next().to_string(), "20240101");
    }

    #[test]
    fn trade_date_rejects_garbage() {
        assert!("2024-03-15".parse::<TradeDate>().is_err());
        assert!("20241301".parse::<TradeDate>().is_err());
        assert!("bananas".parse::<TradeDate>().is_err());
        assert!("2024031".parse::<TradeDate>().is_err());
    }

    #[test]
    fn lexicographic_order_is_chronological() {
        let a: TradeDate = "20231231".parse().unwrap();
        let b: TradeDate = "20240101".parse().unwrap();
        assert!(a < b);
        assert!(a.to_string() < b.to_string());
    }

    #[test]
    fn incremental_range_empty_when_up_to_date() {
        let today: TradeDate = "20240315".parse().unwrap();

        // Up to date: nothing to fetch.
        assert_eq!(DateRange::incremental(Some(today), today), None);

        // Ahead of today (clock skew / vendor pre-publishing): nothing to
        // fetch either.
        let tomorrow = today.next();
        assert_eq!(DateRange::incremental(Some(tomorrow), today), None);
    }

    #[test]
    fn incremental_range_resumes_after_latest() {
        let latest: TradeDate = "20240310".parse().unwrap();
        let today: TradeDate = "20240315".parse().unwrap();

        let range = DateRange::incremental(Some(latest), today).unwrap();
        assert_eq!(range.start().to_string(), "20240311");
        assert_eq!(range.end().to_string(), "20240315");
    }

    #[test]
    fn incremental_range_full_history_when_empty() {
        let today: TradeDate = "20240315".parse().unwrap();
        let range = DateRange::incremental(None, today).unwrap();
        assert_eq!(range.start(), TradeDate::earliest());
        assert_eq!(range.end(), today);
        assert_eq!(range.years(), 1990..=2024);
    }

    #[test]
    fn descriptor_serde_round_trip() {
        let descriptor = DatasetDescriptor {
            name: DatasetName::try_new("daily").unwrap(),
            primary_key: vec!["ts_code".into(), "trade_date".into()],
            date_column: Some("trade_date".into()),
            api: ApiDescriptor {
                method: "daily".into(),
                base: None,
                fields: vec!["ts_code".into(), "trade_date".into(), "close".into()],
                symbol_param: Some("ts_code".into()),
                start_param: Some("start_date".into()),
                end_param: Some("end_date".into()),
                defaults: BTreeMap::new(),
            },
            strategy: UpdateStrategy::Incremental,
            per_symbol: true,
        };

        let json = serde_json::to_string(&descriptor).unwrap();
        let back: DatasetDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(descriptor, back);
    }

    #[test]
    fn bindable_params() {
        let api = ApiDescriptor {
            method: "daily".into(),
            base: None,
            fields: vec![],
            symbol_param: Some("ts_code".into()),
            start_param: Some("start_date".into()),
            end_param: None,
            defaults: BTreeMap::new(),
        };
        let params: Vec<_> = api.bindable_params().collect();
        assert_eq!(params, ["ts_code", "start_date"]);
    }
}
