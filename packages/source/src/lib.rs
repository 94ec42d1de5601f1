#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Provider source interface.
//!
//! Every data provider is reached through a [`ProviderSource`]. A source
//! declares how it wants to be driven ([`FetchStrategy`]) and answers one
//! [`BatchRequest`] at a time; the harvest coordinator owns the loop.
//!
//! Two HTTP adapters are provided: [`change_feed::ChangeFeedSource`] for
//! APIs that page through changes since a cursor inside a time window, and
//! [`id_range::IdRangeSource`] for APIs that serve records by id range.

pub mod change_feed;
pub mod clock;
pub mod definition;
pub mod id_range;
pub mod rate_limit;
pub mod retry;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

pub use clock::{Clock, ManualClock, SystemClock};
pub use definition::{FetcherConfig, ProviderDefinition, parse_providers_toml};
pub use rate_limit::RateLimiter;

/// Errors that can occur while talking to a provider.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// HTTP request failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON parsing failed.
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// The provider answered with something the adapter cannot use.
    #[error("Unexpected provider response: {message}")]
    Response {
        /// Description of what went wrong.
        message: String,
    },

    /// The provider definition is invalid.
    #[error("Invalid provider configuration: {message}")]
    Config {
        /// Description of what went wrong.
        message: String,
    },

    /// The source does not support the requested operation.
    #[error("Operation not supported by {source_id}: {operation}")]
    Unsupported {
        /// Source identifier.
        source_id: String,
        /// Operation name.
        operation: &'static str,
    },
}

/// Half-open time interval `[from, to)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    /// Inclusive start.
    pub from: DateTime<Utc>,
    /// Exclusive end.
    pub to: DateTime<Utc>,
}

impl TimeWindow {
    /// The window following this one: starts at `to` and is at most
    /// `length` long, never ending after `now`.
    #[must_use]
    pub fn advance(&self, length: chrono::Duration, now: DateTime<Utc>) -> Self {
        let from = self.to;
        Self {
            from,
            to: (from + length).min(now),
        }
    }

    /// Whether the window has no extent.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.from >= self.to
    }
}

/// One request for a batch of verbatim records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchRequest {
    /// Changes since `cursor` (or the window start when `None`) within
    /// `window`.
    Cursor {
        /// Opaque continuation token from the previous batch.
        cursor: Option<String>,
        /// Time window being harvested.
        window: TimeWindow,
    },
    /// Records with ids in `[from, to)`.
    Range {
        /// Inclusive lower id.
        from: i64,
        /// Exclusive upper id.
        to: i64,
    },
}

/// Whether more data is available after a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextCursor {
    /// Request again with this cursor.
    Continue(String),
    /// Nothing more in the current window (or range).
    CaughtUp,
}

/// A batch of verbatim records.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// Records exactly as delivered by the provider.
    pub records: Vec<Value>,
    /// Continuation.
    pub next: NextCursor,
}

impl Batch {
    /// A final batch.
    #[must_use]
    pub const fn caught_up(records: Vec<Value>) -> Self {
        Self {
            records,
            next: NextCursor::CaughtUp,
        }
    }
}

/// Inclusive id bounds reported by a range source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdBounds {
    /// Smallest id.
    pub min: i64,
    /// Largest id.
    pub max: i64,
}

/// How a source wants to be driven.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchStrategy {
    /// Sequential cursor paging through consecutive time windows.
    Cursor {
        /// Start of the first window.
        start: DateTime<Utc>,
        /// Length of each window.
        window: chrono::Duration,
        /// Minimum time between request starts.
        min_interval: Duration,
    },
    /// Fixed-size id chunks fetched concurrently.
    Range {
        /// Ids per chunk. Never zero.
        chunk_size: u64,
        /// Maximum chunks in flight. Never zero.
        max_concurrency: usize,
    },
}

/// A data provider.
#[async_trait]
pub trait ProviderSource: Send + Sync {
    /// Provider identifier, used in logs and collection names.
    fn id(&self) -> &str;

    /// How the harvest coordinator should drive this source.
    fn strategy(&self) -> FetchStrategy;

    /// Fetches one batch.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] if the request fails after retries or the
    /// response cannot be interpreted.
    async fn fetch_batch(&self, request: &BatchRequest) -> Result<Batch, SourceError>;

    /// Id bounds for range-driven sources. `None` means the provider has no
    /// records.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Unsupported`] for sources without id ranges.
    async fn id_bounds(&self) -> Result<Option<IdBounds>, SourceError> {
        Err(SourceError::Unsupported {
            source_id: self.id().to_string(),
            operation: "id_bounds",
        })
    }

    /// When the provider's data last changed, if it reports it.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] if the provider cannot be asked.
    async fn data_last_modified(&self) -> Result<Option<DateTime<Utc>>, SourceError> {
        Ok(None)
    }
}
