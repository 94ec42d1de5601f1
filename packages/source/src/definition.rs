//! Config-driven provider definitions.
//!
//! A [`ProviderDefinition`] captures what is unique about one provider;
//! [`ProviderDefinition::build_source`] turns its [`FetcherConfig`] into a
//! boxed [`ProviderSource`]. Definitions are read from the `[[providers]]`
//! tables of the application config.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::change_feed::{ChangeFeedConfig, ChangeFeedSource};
use crate::id_range::{IdRangeConfig, IdRangeSource};
use crate::{ProviderSource, SourceError};

/// A data provider.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderDefinition {
    /// Numeric provider id, stored on every observation.
    pub id: u32,
    /// Short unique identifier (e.g. `"artportalen"`), used in collection
    /// names.
    pub identifier: String,
    /// Human-readable name.
    pub name: String,
    /// Disabled providers are skipped by full cycles.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// How to fetch.
    pub fetcher: FetcherConfig,
}

const fn default_enabled() -> bool {
    true
}

const fn default_window_days() -> u32 {
    30
}

const fn default_page_size() -> u32 {
    10_000
}

const fn default_max_concurrency() -> usize {
    4
}

/// How to fetch from a provider.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FetcherConfig {
    /// Cursor paging through time windows.
    ChangeFeed {
        /// Endpoint URL.
        api_url: String,
        /// Start of the first window.
        start_date: DateTime<Utc>,
        /// Window length in days.
        #[serde(default = "default_window_days")]
        window_days: u32,
        /// Records per page.
        #[serde(default = "default_page_size")]
        page_size: u32,
        /// Overrides the global minimum request interval.
        min_interval_ms: Option<u64>,
    },
    /// Concurrent id-range chunks.
    IdRange {
        /// Records endpoint.
        api_url: String,
        /// Bounds endpoint. Defaults to `{api_url}/bounds`.
        bounds_url: Option<String>,
        /// Ids per chunk.
        chunk_size: u64,
        /// Chunks in flight. Defaults to the global harvest concurrency.
        max_concurrency: Option<usize>,
    },
}

/// Defaults from the `[harvest]` section applied where a provider does not
/// override them.
#[derive(Debug, Clone, Copy)]
pub struct SourceDefaults {
    /// Minimum interval between cursor requests.
    pub min_interval: Duration,
    /// Range chunks in flight.
    pub max_concurrency: usize,
}

impl Default for SourceDefaults {
    fn default() -> Self {
        Self {
            min_interval: crate::rate_limit::DEFAULT_MIN_INTERVAL,
            max_concurrency: default_max_concurrency(),
        }
    }
}

impl ProviderDefinition {
    /// Checks the definition for values no source can work with.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Config`] describing the first problem.
    pub fn validate(&self) -> Result<(), SourceError> {
        let fail = |message: &str| {
            Err(SourceError::Config {
                message: format!("{}: {message}", self.identifier),
            })
        };

        if self.identifier.is_empty()
            || !self
                .identifier
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return fail("identifier must be non-empty ASCII alphanumerics or '_'");
        }

        match &self.fetcher {
            FetcherConfig::ChangeFeed {
                window_days,
                page_size,
                ..
            } => {
                if *window_days == 0 {
                    return fail("window_days must be positive");
                }
                if *page_size == 0 {
                    return fail("page_size must be positive");
                }
            }
            FetcherConfig::IdRange {
                chunk_size,
                max_concurrency,
                ..
            } => {
                if *chunk_size == 0 {
                    return fail("chunk_size must be positive");
                }
                if *max_concurrency == Some(0) {
                    return fail("max_concurrency must be positive");
                }
            }
        }
        Ok(())
    }

    /// Builds the source for this provider.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Config`] if the definition is invalid.
    pub fn build_source(
        &self,
        client: reqwest::Client,
        defaults: SourceDefaults,
    ) -> Result<Box<dyn ProviderSource>, SourceError> {
        self.validate()?;

        Ok(match &self.fetcher {
            FetcherConfig::ChangeFeed {
                api_url,
                start_date,
                window_days,
                page_size,
                min_interval_ms,
            } => Box::new(ChangeFeedSource::new(
                ChangeFeedConfig {
                    identifier: self.identifier.clone(),
                    api_url: api_url.clone(),
                    start: *start_date,
                    window: chrono::Duration::days(i64::from(*window_days)),
                    page_size: *page_size,
                    min_interval: min_interval_ms
                        .map_or(defaults.min_interval, Duration::from_millis),
                },
                client,
            )),
            FetcherConfig::IdRange {
                api_url,
                bounds_url,
                chunk_size,
                max_concurrency,
            } => Box::new(IdRangeSource::new(
                IdRangeConfig {
                    identifier: self.identifier.clone(),
                    api_url: api_url.clone(),
                    bounds_url: bounds_url
                        .clone()
                        .unwrap_or_else(|| format!("{}/bounds", api_url.trim_end_matches('/'))),
                    chunk_size: *chunk_size,
                    max_concurrency: max_concurrency.unwrap_or(defaults.max_concurrency),
                },
                client,
            )?),
        })
    }
}

#[derive(Deserialize)]
struct ProvidersFile {
    #[serde(default)]
    providers: Vec<ProviderDefinition>,
}

/// Parses the `[[providers]]` tables of a TOML document and validates
/// each definition. Other keys are ignored.
///
/// # Errors
///
/// Returns [`SourceError::Config`] if the TOML is malformed, a definition
/// is invalid, or two providers share an id or identifier.
pub fn parse_providers_toml(toml_str: &str) -> Result<Vec<ProviderDefinition>, SourceError> {
    let file: ProvidersFile = toml::de::from_str(toml_str).map_err(|e| SourceError::Config {
        message: e.to_string(),
    })?;
    check_providers(&file.providers)?;
    Ok(file.providers)
}

/// Validates every definition and rejects duplicate ids or identifiers.
///
/// # Errors
///
/// Returns [`SourceError::Config`] for the first problem found.
pub fn check_providers(providers: &[ProviderDefinition]) -> Result<(), SourceError> {
    let mut ids = std::collections::BTreeSet::new();
    let mut identifiers = std::collections::BTreeSet::new();

    for provider in providers {
        provider.validate()?;
        if !ids.insert(provider.id) || !identifiers.insert(provider.identifier.as_str()) {
            return Err(SourceError::Config {
                message: format!(
                    "duplicate provider {} ({})",
                    provider.id, provider.identifier
                ),
            });
        }
    }
    Ok(())
}

/// Keeps the providers named in `identifiers` (all enabled providers when
/// it is empty).
///
/// # Errors
///
/// Returns [`SourceError::Config`] if an identifier matches no provider.
pub fn select_providers<'a>(
    providers: &'a [ProviderDefinition],
    identifiers: &[String],
) -> Result<Vec<&'a ProviderDefinition>, SourceError> {
    if identifiers.is_empty() {
        return Ok(providers.iter().filter(|p| p.enabled).collect());
    }

    identifiers
        .iter()
        .map(|wanted| {
            providers
                .iter()
                .find(|p| &p.identifier == wanted)
                .ok_or_else(|| SourceError::Config {
                    message: format!("unknown provider: {wanted}"),
                })
        })
        .collect()
}
