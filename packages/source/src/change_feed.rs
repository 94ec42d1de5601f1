//! Change-feed adapter.
//!
//! Queries `GET {api_url}?from=..&to=..&limit=..[&cursor=..]` and expects
//!
//! ```json
//! { "records": [ ... ], "nextCursor": "abc" | null, "lastModified": "2024-05-01T00:00:00Z" }
//! ```
//!
//! A missing or null `nextCursor`, or an empty page, means the window is
//! exhausted.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;

use crate::retry::{self, RetryPolicy};
use crate::{Batch, BatchRequest, FetchStrategy, NextCursor, ProviderSource, SourceError};

/// Settings for a [`ChangeFeedSource`].
#[derive(Debug, Clone)]
pub struct ChangeFeedConfig {
    /// Provider identifier.
    pub identifier: String,
    /// Endpoint URL.
    pub api_url: String,
    /// Start of the first window.
    pub start: DateTime<Utc>,
    /// Window length.
    pub window: chrono::Duration,
    /// Records per page.
    pub page_size: u32,
    /// Minimum time between request starts.
    pub min_interval: Duration,
}

/// Cursor-driven HTTP source.
pub struct ChangeFeedSource {
    config: ChangeFeedConfig,
    client: reqwest::Client,
    retry: RetryPolicy,
    last_modified: Mutex<Option<DateTime<Utc>>>,
}

impl ChangeFeedSource {
    /// Creates a source sharing `client`.
    #[must_use]
    pub fn new(config: ChangeFeedConfig, client: reqwest::Client) -> Self {
        Self {
            config,
            client,
            retry: RetryPolicy::default(),
            last_modified: Mutex::new(None),
        }
    }

    /// Replaces the retry policy.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn remember_last_modified(&self, modified: Option<DateTime<Utc>>) {
        let Some(modified) = modified else {
            return;
        };
        let mut last = self
            .last_modified
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if last.is_none_or(|l| modified > l) {
            *last = Some(modified);
        }
    }
}

fn timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Interprets one change-feed response body.
///
/// Returns the batch and the provider's `lastModified`, if present.
///
/// # Errors
///
/// Returns [`SourceError::Response`] if `records` is missing or not an
/// array.
pub fn parse_change_page(body: Value) -> Result<(Batch, Option<DateTime<Utc>>), SourceError> {
    let Value::Object(mut body) = body else {
        return Err(SourceError::Response {
            message: "change feed response is not an object".to_string(),
        });
    };

    let Some(Value::Array(records)) = body.remove("records") else {
        return Err(SourceError::Response {
            message: "change feed response has no records array".to_string(),
        });
    };

    let last_modified = body
        .get("lastModified")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc));

    let next = match body.remove("nextCursor") {
        Some(Value::String(cursor)) if !records.is_empty() => NextCursor::Continue(cursor),
        _ => NextCursor::CaughtUp,
    };

    Ok((Batch { records, next }, last_modified))
}

#[async_trait]
impl ProviderSource for ChangeFeedSource {
    fn id(&self) -> &str {
        &self.config.identifier
    }

    fn strategy(&self) -> FetchStrategy {
        FetchStrategy::Cursor {
            start: self.config.start,
            window: self.config.window,
            min_interval: self.config.min_interval,
        }
    }

    async fn fetch_batch(&self, request: &BatchRequest) -> Result<Batch, SourceError> {
        let BatchRequest::Cursor { cursor, window } = request else {
            return Err(SourceError::Unsupported {
                source_id: self.config.identifier.clone(),
                operation: "range request",
            });
        };

        let mut query = vec![
            ("from", timestamp(window.from)),
            ("to", timestamp(window.to)),
            ("limit", self.config.page_size.to_string()),
        ];
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor.clone()));
        }

        log::debug!(
            "[{}] Fetching changes {} .. {} (cursor={cursor:?})",
            self.config.identifier,
            query[0].1,
            query[1].1
        );

        let body = retry::send_json(&self.retry, || {
            self.client.get(&self.config.api_url).query(&query)
        })
        .await?;

        let (batch, last_modified) = parse_change_page(body)?;
        self.remember_last_modified(last_modified);
        Ok(batch)
    }

    async fn data_last_modified(&self) -> Result<Option<DateTime<Utc>>, SourceError> {
        Ok(*self
            .last_modified
            .lock()
            .unwrap_or_else(PoisonError::into_inner))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn page_with_cursor_continues() {
        let (batch, modified) = parse_change_page(json!({
            "records": [{"occurrenceId": "a"}, {"occurrenceId": "b"}],
            "nextCursor": "c-2",
            "lastModified": "2024-05-01T10:00:00Z"
        }))
        .unwrap();

        assert_eq!(batch.records.len(), 2);
        assert_eq!(batch.next, NextCursor::Continue("c-2".to_string()));
        assert_eq!(modified.unwrap().to_rfc3339(), "2024-05-01T10:00:00+00:00");
    }

    #[test]
    fn null_cursor_or_empty_page_is_caught_up() {
        let (batch, _) = parse_change_page(json!({
            "records": [{"occurrenceId": "a"}],
            "nextCursor": null
        }))
        .unwrap();
        assert_eq!(batch.next, NextCursor::CaughtUp);

        let (batch, _) = parse_change_page(json!({
            "records": [],
            "nextCursor": "still-here"
        }))
        .unwrap();
        assert_eq!(batch.next, NextCursor::CaughtUp);
    }

    #[test]
    fn missing_records_is_an_error() {
        assert!(matches!(
            parse_change_page(json!({"nextCursor": "x"})),
            Err(SourceError::Response { .. })
        ));
        assert!(parse_change_page(json!([])).is_err());
    }
}
