#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Instance control and publish cycles.
//!
//! [`InstanceManager`] owns the active/inactive flag. [`PublishManager`]
//! runs a cycle (harvest, process into the inactive instance, swap) and
//! only flips the flag when every provider of the cycle made it through.

pub mod cycle;
pub mod instance;

use sos_store::StoreError;

pub use cycle::{CycleMode, CycleReport, PublishManager};
pub use instance::{InstanceManager, ReaderSession};

/// Errors that can occur while controlling instances.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// The store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// An instance id other than 0 or 1.
    #[error("Invalid instance {id}: expected 0 or 1")]
    InvalidInstance {
        /// The rejected id.
        id: u8,
    },

    /// A copy from an instance onto itself.
    #[error("Cannot copy instance {id} onto itself")]
    SameInstance {
        /// The instance.
        id: u8,
    },
}
