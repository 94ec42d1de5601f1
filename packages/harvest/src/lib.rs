#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Provider harvesting.
//!
//! A harvest run pulls every batch a provider offers into a scratch
//! collection, compares the result with the previously committed
//! collection, and then either renames scratch over committed or deletes
//! it. Committed data is never touched by a run that does not succeed.
//!
//! ```text
//! NotStarted -> Running -> Validating -> Committing  -> Done(Success)
//!                  |            '------> RollingBack -> Done(Failed)
//!                  '-- error / cancel -> RollingBack -> Done(Failed | Canceled)
//! ```

pub mod coordinator;
pub mod driver;
pub mod gate;
pub mod progress;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sos_source::SourceError;
use sos_store::StoreError;

pub use coordinator::{HarvestCoordinator, HarvestJob, HarvestReport, read_harvest_info};
pub use tokio_util::sync::CancellationToken;

/// Prefix of committed verbatim collections.
pub const VERBATIM_PREFIX: &str = "verbatim-";

/// Collection receiving one record per harvest run.
pub const HARVEST_INFO_COLLECTION: &str = "harvest-info";

/// Committed verbatim collection for a provider identifier.
#[must_use]
pub fn verbatim_collection(identifier: &str) -> String {
    format!("{VERBATIM_PREFIX}{identifier}")
}

/// Errors that abort a harvest run. They are caught at the run boundary and
/// turned into a `Failed` or `Canceled` [`sos_harvest_models::HarvestInfo`].
#[derive(Debug, thiserror::Error)]
pub enum HarvestError {
    /// The provider could not be read.
    #[error(transparent)]
    Source(#[from] SourceError),

    /// The store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The run's cancellation token fired.
    #[error("Harvest canceled")]
    Canceled,

    /// A caller or source broke an invariant (zero chunk size, empty
    /// window, ...).
    #[error("Invalid harvest setup: {message}")]
    Contract {
        /// Description of what went wrong.
        message: String,
    },
}

fn default_validation_threshold() -> f64 {
    0.8
}

const fn default_min_request_interval_ms() -> u64 {
    2000
}

const fn default_max_concurrency() -> usize {
    4
}

/// `[harvest]` configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarvestConfig {
    /// A new harvest must hold at least this fraction of the previously
    /// committed count to be committed.
    #[serde(default = "default_validation_threshold")]
    pub validation_threshold: f64,
    /// Minimum milliseconds between cursor request starts.
    #[serde(default = "default_min_request_interval_ms")]
    pub min_request_interval_ms: u64,
    /// Default range chunks in flight.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            validation_threshold: default_validation_threshold(),
            min_request_interval_ms: default_min_request_interval_ms(),
            max_concurrency: default_max_concurrency(),
        }
    }
}

impl HarvestConfig {
    /// [`Self::min_request_interval_ms`] as a duration.
    #[must_use]
    pub const fn min_request_interval(&self) -> Duration {
        Duration::from_millis(self.min_request_interval_ms)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`HarvestError::Contract`] for a threshold outside `0..=1`
    /// or a zero concurrency.
    pub fn validate(&self) -> Result<(), HarvestError> {
        if !(0.0..=1.0).contains(&self.validation_threshold) {
            return Err(HarvestError::Contract {
                message: format!(
                    "validation_threshold {} is outside 0..=1",
                    self.validation_threshold
                ),
            });
        }
        if self.max_concurrency == 0 {
            return Err(HarvestError::Contract {
                message: "max_concurrency must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// Whether `count` new records may replace `previous` committed ones.
    #[must_use]
    pub fn accepts(&self, count: u64, previous: Option<u64>) -> bool {
        previous.is_none_or(|previous| {
            #[allow(clippy::cast_precision_loss)]
            let accepted = count as f64 >= self.validation_threshold * previous as f64;
            accepted
        })
    }
}
