//! Id-range adapter.
//!
//! Bounds come from `GET {bounds_url}` as `{"min": 1, "max": 12345}` (both
//! `null` when the provider is empty). Records come from
//! `GET {api_url}?fromId=..&toId=..` as either a bare array or an object
//! with a `records` array.

use async_trait::async_trait;
use serde_json::Value;

use crate::retry::{self, RetryPolicy};
use crate::{Batch, BatchRequest, FetchStrategy, IdBounds, ProviderSource, SourceError};

/// Settings for an [`IdRangeSource`].
#[derive(Debug, Clone)]
pub struct IdRangeConfig {
    /// Provider identifier.
    pub identifier: String,
    /// Records endpoint.
    pub api_url: String,
    /// Bounds endpoint.
    pub bounds_url: String,
    /// Ids per chunk.
    pub chunk_size: u64,
    /// Chunks in flight.
    pub max_concurrency: usize,
}

/// Range-partitioned HTTP source.
pub struct IdRangeSource {
    config: IdRangeConfig,
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl IdRangeSource {
    /// Creates a source sharing `client`.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Config`] if the chunk size or concurrency is
    /// zero.
    pub fn new(config: IdRangeConfig, client: reqwest::Client) -> Result<Self, SourceError> {
        if config.chunk_size == 0 || config.max_concurrency == 0 {
            return Err(SourceError::Config {
                message: format!(
                    "{}: chunk_size and max_concurrency must be positive",
                    config.identifier
                ),
            });
        }
        Ok(Self {
            config,
            client,
            retry: RetryPolicy::default(),
        })
    }

    /// Replaces the retry policy.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Interprets a bounds response.
///
/// # Errors
///
/// Returns [`SourceError::Response`] if the body is malformed or `min`
/// exceeds `max`.
pub fn parse_bounds(body: &Value) -> Result<Option<IdBounds>, SourceError> {
    let malformed = || SourceError::Response {
        message: format!("malformed id bounds: {body}"),
    };

    let min = body.get("min").ok_or_else(malformed)?;
    let max = body.get("max").ok_or_else(malformed)?;
    if min.is_null() && max.is_null() {
        return Ok(None);
    }

    let min = min.as_i64().ok_or_else(malformed)?;
    let max = max.as_i64().ok_or_else(malformed)?;
    if min > max {
        return Err(malformed());
    }
    Ok(Some(IdBounds { min, max }))
}

/// Extracts the records from a range response.
///
/// # Errors
///
/// Returns [`SourceError::Response`] if no records array is found.
pub fn parse_records(body: Value) -> Result<Vec<Value>, SourceError> {
    match body {
        Value::Array(records) => Ok(records),
        Value::Object(mut object) => match object.remove("records") {
            Some(Value::Array(records)) => Ok(records),
            _ => Err(SourceError::Response {
                message: "range response has no records array".to_string(),
            }),
        },
        other => Err(SourceError::Response {
            message: format!("unexpected range response: {other}"),
        }),
    }
}

#[async_trait]
impl ProviderSource for IdRangeSource {
    fn id(&self) -> &str {
        &self.config.identifier
    }

    fn strategy(&self) -> FetchStrategy {
        FetchStrategy::Range {
            chunk_size: self.config.chunk_size,
            max_concurrency: self.config.max_concurrency,
        }
    }

    async fn fetch_batch(&self, request: &BatchRequest) -> Result<Batch, SourceError> {
        let BatchRequest::Range { from, to } = *request else {
            return Err(SourceError::Unsupported {
                source_id: self.config.identifier.clone(),
                operation: "cursor request",
            });
        };

        let query = [("fromId", from.to_string()), ("toId", to.to_string())];
        let body = retry::send_json(&self.retry, || {
            self.client.get(&self.config.api_url).query(&query)
        })
        .await?;

        Ok(Batch::caught_up(parse_records(body)?))
    }

    async fn id_bounds(&self) -> Result<Option<IdBounds>, SourceError> {
        let body = retry::send_json(&self.retry, || self.client.get(&self.config.bounds_url)).await?;
        parse_bounds(&body)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn bounds() {
        assert_eq!(
            parse_bounds(&json!({"min": 5, "max": 90})).unwrap(),
            Some(IdBounds { min: 5, max: 90 })
        );
        assert_eq!(parse_bounds(&json!({"min": null, "max": null})).unwrap(), None);
        assert!(parse_bounds(&json!({"min": 9, "max": 1})).is_err());
        assert!(parse_bounds(&json!({"max": 1})).is_err());
    }

    #[test]
    fn records_bare_or_wrapped() {
        assert_eq!(parse_records(json!([1, 2])).unwrap().len(), 2);
        assert_eq!(parse_records(json!({"records": [1]})).unwrap().len(), 1);
        assert!(parse_records(json!({"items": []})).is_err());
        assert!(parse_records(json!("nope")).is_err());
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        let config = IdRangeConfig {
            identifier: "p".to_string(),
            api_url: "http://localhost/records".to_string(),
            bounds_url: "http://localhost/bounds".to_string(),
            chunk_size: 0,
            max_concurrency: 2,
        };
        assert!(matches!(
            IdRangeSource::new(config, reqwest::Client::new()),
            Err(SourceError::Config { .. })
        ));
    }
}
