#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Harvest run records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Final outcome of a harvest run.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
pub enum RunStatus {
    /// Data was committed.
    Success,
    /// Validation or a fetch failed; committed data is unchanged.
    Failed,
    /// The run was canceled; committed data is unchanged.
    Canceled,
}

/// Where a harvest run is in its lifecycle.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
pub enum HarvestPhase {
    /// Created, nothing fetched yet.
    NotStarted,
    /// Fetching batches into the scratch collection.
    Running,
    /// Comparing the new count with the committed one.
    Validating,
    /// Renaming scratch over committed.
    Committing,
    /// Deleting the scratch collection.
    RollingBack,
    /// Finished; see [`HarvestInfo::status`].
    Done,
}

/// Audit record of one harvest run.
///
/// Created when the run starts and finalized exactly once when it ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarvestInfo {
    /// Provider harvested.
    pub provider_id: u32,
    /// Provider identifier.
    pub provider_identifier: String,
    /// Run start.
    pub start: DateTime<Utc>,
    /// Run end. `None` while running.
    pub end: Option<DateTime<Utc>>,
    /// Outcome. `None` while running.
    pub status: Option<RunStatus>,
    /// Records written to the scratch collection.
    pub count: u64,
    /// When the provider's data last changed, if it reports it.
    pub data_last_modified: Option<DateTime<Utc>>,
    /// Count of the previously committed collection, if there was one.
    pub previous_count: Option<u64>,
    /// Failure description for `Failed` runs.
    pub message: Option<String>,
}

impl HarvestInfo {
    /// Starts a record for a run beginning at `start`.
    #[must_use]
    pub fn start(provider_id: u32, provider_identifier: impl Into<String>, start: DateTime<Utc>) -> Self {
        Self {
            provider_id,
            provider_identifier: provider_identifier.into(),
            start,
            end: None,
            status: None,
            count: 0,
            data_last_modified: None,
            previous_count: None,
            message: None,
        }
    }

    /// Finalizes the record. Later calls are ignored.
    pub fn finish(&mut self, status: RunStatus, end: DateTime<Utc>) {
        if self.status.is_none() {
            self.status = Some(status);
            self.end = Some(end);
        }
    }

    /// Whether the run committed.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == Some(RunStatus::Success)
    }
}
