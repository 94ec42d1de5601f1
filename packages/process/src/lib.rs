#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Processing of committed verbatim collections.
//!
//! Reads a provider's `verbatim-<identifier>` collection page by page, maps
//! each record to an [`Observation`], diffuses sensitive coordinates,
//! attaches area metadata, and writes the result into one instance:
//!
//! - `processed-<instance>-<provider>`: the published observations
//! - `protected-<instance>-<provider>`: true locations of diffused
//!   observations
//!
//! Both are built in scratch collections and renamed into place only when
//! the whole provider processed cleanly.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sos_area::AreaEnricher;
use sos_diffusion::DiffusionEngine;
use sos_harvest::CancellationToken;
use sos_harvest::progress::ProgressCallback;
use sos_harvest::verbatim_collection;
use sos_observation_models::{Observation, ObservationLocation, ProtectionLevel};
use sos_store::{CollectionStore, StoreError, scratch_name};

/// Verbatim records read per page.
pub const DEFAULT_BATCH_SIZE: usize = 5000;

/// Prefix of processed observation collections.
pub const PROCESSED_PREFIX: &str = "processed-";

/// Prefix of protected location collections.
pub const PROTECTED_PREFIX: &str = "protected-";

/// Processed observations of `provider_id` in `instance`.
#[must_use]
pub fn processed_collection(instance: u8, provider_id: u32) -> String {
    format!("{PROCESSED_PREFIX}{instance}-{provider_id}")
}

/// True locations of `provider_id`'s diffused observations in `instance`.
#[must_use]
pub fn protected_collection(instance: u8, provider_id: u32) -> String {
    format!("{PROTECTED_PREFIX}{instance}-{provider_id}")
}

/// Errors that can occur while processing a provider.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// The store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A verbatim record could not be mapped.
    #[error("Record {index} of {collection} is invalid: {message}")]
    Record {
        /// Verbatim collection.
        collection: String,
        /// Position of the record in the collection.
        index: usize,
        /// Description of what went wrong.
        message: String,
    },

    /// The cancellation token fired.
    #[error("Processing canceled")]
    Canceled,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OccurrenceId {
    Text(String),
    Number(i64),
}

/// The verbatim fields processing reads. Everything else is ignored.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerbatimRecord {
    occurrence_id: OccurrenceId,
    #[serde(default)]
    taxon_id: Option<i64>,
    #[serde(default)]
    decimal_latitude: Option<f64>,
    #[serde(default)]
    decimal_longitude: Option<f64>,
    #[serde(default)]
    protection_level: Option<u8>,
    #[serde(default)]
    event_date: Option<DateTime<Utc>>,
}

/// Maps one verbatim record to an observation with true coordinates and no
/// area metadata. A missing protection level means public.
///
/// # Errors
///
/// Returns a description of the problem when required fields are missing,
/// malformed, or the protection level is outside 1-5.
pub fn map_verbatim(provider_id: u32, record: Value) -> Result<Observation, String> {
    let record: VerbatimRecord = serde_json::from_value(record).map_err(|e| e.to_string())?;

    let occurrence_id = match record.occurrence_id {
        OccurrenceId::Text(id) => id,
        OccurrenceId::Number(id) => id.to_string(),
    };
    if occurrence_id.is_empty() {
        return Err("empty occurrenceId".to_string());
    }

    let protection_level = record
        .protection_level
        .map_or(Ok(ProtectionLevel::Public), ProtectionLevel::from_value)
        .map_err(|e| e.to_string())?;

    Ok(Observation {
        occurrence_id,
        provider_id,
        taxon_id: record.taxon_id,
        event_date: record.event_date,
        protection_level,
        location: ObservationLocation {
            decimal_latitude: record.decimal_latitude,
            decimal_longitude: record.decimal_longitude,
            ..ObservationLocation::default()
        },
        is_diffused: false,
        diffusion_radius_meters: None,
    })
}

/// True location of a diffused observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtectedLocation {
    /// Occurrence id of the published observation.
    pub occurrence_id: String,
    /// Protection level that caused the diffusion.
    pub protection_level: ProtectionLevel,
    /// True coordinates with their own area metadata.
    pub location: ObservationLocation,
}

/// Counts from one provider run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessReport {
    /// Provider processed.
    pub provider_id: u32,
    /// Instance written to.
    pub instance: u8,
    /// Observations written.
    pub processed: u64,
    /// Observations that received area metadata.
    pub enriched: u64,
    /// Observations whose coordinates were diffused.
    pub diffused: u64,
}

/// Processes committed verbatim collections into an instance.
pub struct Processor {
    store: Arc<dyn CollectionStore>,
    enricher: Arc<AreaEnricher>,
    diffusion: Arc<DiffusionEngine>,
    batch_size: usize,
}

impl Processor {
    /// Creates a processor reading [`DEFAULT_BATCH_SIZE`] records per page.
    #[must_use]
    pub fn new(
        store: Arc<dyn CollectionStore>,
        enricher: Arc<AreaEnricher>,
        diffusion: Arc<DiffusionEngine>,
    ) -> Self {
        Self {
            store,
            enricher,
            diffusion,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Sets the page size (at least one).
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Processes the committed verbatim collection of `identifier` into
    /// `instance`, replacing whatever the instance held for the provider.
    ///
    /// On error both scratch collections are deleted and the instance's
    /// previous data for the provider is left in place.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError`] if the verbatim collection is missing, a
    /// record cannot be mapped, the store fails, or `cancel` fires.
    pub async fn process_provider(
        &self,
        provider_id: u32,
        identifier: &str,
        instance: u8,
        cancel: &CancellationToken,
        progress: &dyn ProgressCallback,
    ) -> Result<ProcessReport, ProcessError> {
        let verbatim = verbatim_collection(identifier);
        let processed = processed_collection(instance, provider_id);
        let protected = protected_collection(instance, provider_id);
        let processed_scratch = scratch_name(&processed);
        let protected_scratch = scratch_name(&protected);

        let total = self.store.count(&verbatim).await?;
        log::info!("[{identifier}] Processing {total} records into instance {instance}");
        progress.set_total(total);
        progress.set_message(format!("Processing {identifier}"));

        self.store.create_collection(&processed_scratch).await?;
        self.store.create_collection(&protected_scratch).await?;

        let result = self
            .copy_processed(
                provider_id,
                instance,
                &verbatim,
                &processed_scratch,
                &protected_scratch,
                cancel,
                progress,
            )
            .await;

        let report = match result {
            Ok(report) => report,
            Err(e) => {
                log::error!("[{identifier}] Processing failed: {e}");
                for scratch in [&processed_scratch, &protected_scratch] {
                    if let Err(e) = self.store.delete_collection(scratch).await {
                        log::error!("[{identifier}] Failed to delete {scratch}: {e}");
                    }
                }
                progress.finish(format!("{identifier}: failed"));
                return Err(e);
            }
        };

        self.store
            .rename_collection(&processed_scratch, &processed)
            .await?;
        self.store
            .rename_collection(&protected_scratch, &protected)
            .await?;

        let stats = self.enricher.stats();
        log::info!(
            "[{identifier}] Processed {} observations ({} enriched, {} diffused; area cache {} hits / {} misses)",
            report.processed,
            report.enriched,
            report.diffused,
            stats.hits,
            stats.misses
        );
        progress.finish(format!("{identifier}: {} processed", report.processed));

        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    async fn copy_processed(
        &self,
        provider_id: u32,
        instance: u8,
        verbatim: &str,
        processed_scratch: &str,
        protected_scratch: &str,
        cancel: &CancellationToken,
        progress: &dyn ProgressCallback,
    ) -> Result<ProcessReport, ProcessError> {
        let mut report = ProcessReport {
            provider_id,
            instance,
            ..ProcessReport::default()
        };
        let mut skip = 0usize;

        loop {
            if cancel.is_cancelled() {
                return Err(ProcessError::Canceled);
            }

            let page = self.store.get_chunk(verbatim, skip, self.batch_size).await?;
            let len = page.len();
            if len == 0 {
                break;
            }

            let mut observations = Vec::with_capacity(len);
            let mut protected = Vec::new();

            for (offset, record) in page.into_iter().enumerate() {
                let mut observation =
                    map_verbatim(provider_id, record).map_err(|message| ProcessError::Record {
                        collection: verbatim.to_string(),
                        index: skip + offset,
                        message,
                    })?;

                if let Some(true_location) = self.protect(&mut observation) {
                    report.diffused += 1;
                    protected.push(serde_json::to_value(true_location).map_err(StoreError::from)?);
                }
                if self.enricher.enrich_location(&mut observation.location) {
                    report.enriched += 1;
                }
                observations.push(serde_json::to_value(observation).map_err(StoreError::from)?);
            }

            report.processed += len as u64;
            self.store
                .write_batch(processed_scratch, observations)
                .await?;
            if !protected.is_empty() {
                self.store.write_batch(protected_scratch, protected).await?;
            }
            progress.inc(len as u64);

            skip += len;
            if len < self.batch_size {
                break;
            }
        }

        Ok(report)
    }

    /// Diffuses a sensitive observation in place and returns its enriched
    /// true location. Public observations and observations without usable
    /// coordinates are left alone.
    fn protect(&self, observation: &mut Observation) -> Option<ProtectedLocation> {
        if !observation.protection_level.is_sensitive() {
            return None;
        }
        let (lon, lat) = observation.location.valid_point()?;

        let mut rng = self.diffusion.rng_for(&observation.occurrence_id);
        let result = self
            .diffusion
            .diffuse(lon, lat, observation.protection_level, &mut rng)?;

        let mut true_location = ObservationLocation::at(lon, lat);
        self.enricher.enrich_location(&mut true_location);

        observation.location.decimal_longitude = Some(result.diffused_point.x());
        observation.location.decimal_latitude = Some(result.diffused_point.y());
        observation.is_diffused = true;
        observation.diffusion_radius_meters = Some(result.radius);

        Some(ProtectedLocation {
            occurrence_id: observation.occurrence_id.clone(),
            protection_level: observation.protection_level,
            location: true_location,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use sos_area_models::{AreaInfo, AreaRef, AreaType};
    use sos_diffusion::DiffusionConfig;
    use sos_harvest::progress::NullProgress;
    use sos_spatial::AreaLookup;
    use sos_store::MemoryStore;

    use super::*;

    /// Puts every point in Uppsala county.
    struct Everywhere;

    impl AreaLookup for Everywhere {
        fn areas_at(&self, _lon: f64, _lat: f64) -> Vec<AreaInfo> {
            vec![AreaInfo {
                area_type: AreaType::County,
                feature_id: "3".to_string(),
                name: "Uppsala".to_string(),
            }]
        }
    }

    fn processor(store: Arc<MemoryStore>) -> Processor {
        let engine = DiffusionEngine::sweref99(DiffusionConfig {
            seed: Some(7),
            ..DiffusionConfig::default()
        })
        .unwrap();
        Processor::new(
            store,
            Arc::new(AreaEnricher::new(Arc::new(Everywhere))),
            Arc::new(engine),
        )
        .with_batch_size(2)
    }

    async fn verbatim(records: Vec<Value>) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.create_collection("verbatim-nors").await.unwrap();
        store.write_batch("verbatim-nors", records).await.unwrap();
        store
    }

    #[test]
    fn maps_verbatim_fields() {
        let observation = map_verbatim(
            4,
            json!({
                "occurrenceId": 123,
                "taxonId": 100_024,
                "decimalLatitude": 59.85,
                "decimalLongitude": 17.63,
                "protectionLevel": 3,
                "eventDate": "2024-05-01T06:30:00Z",
                "recordedBy": "ignored",
            }),
        )
        .unwrap();

        assert_eq!(observation.occurrence_id, "123");
        assert_eq!(observation.provider_id, 4);
        assert_eq!(observation.taxon_id, Some(100_024));
        assert_eq!(observation.protection_level, ProtectionLevel::Medium);
        assert_eq!(observation.location.valid_point(), Some((17.63, 59.85)));
        assert!(observation.event_date.is_some());
    }

    #[test]
    fn rejects_unknown_protection_level() {
        let err = map_verbatim(1, json!({ "occurrenceId": "a", "protectionLevel": 9 }))
            .unwrap_err();
        assert!(err.contains("protection level"), "{err}");
        assert!(map_verbatim(1, json!({ "taxonId": 1 })).is_err());
    }

    #[tokio::test]
    async fn writes_processed_and_protected_collections() {
        let store = verbatim(vec![
            json!({ "occurrenceId": "a", "decimalLatitude": 59.85, "decimalLongitude": 17.63 }),
            json!({ "occurrenceId": "b", "decimalLatitude": 59.85, "decimalLongitude": 17.63, "protectionLevel": 5 }),
            json!({ "occurrenceId": "c" }),
        ])
        .await;
        let report = processor(store.clone())
            .process_provider(4, "nors", 1, &CancellationToken::new(), &NullProgress)
            .await
            .unwrap();

        assert_eq!(report.processed, 3);
        assert_eq!(report.diffused, 1);
        assert_eq!(report.enriched, 2);

        let processed: Vec<Observation> = store
            .get_chunk("processed-1-4", 0, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|v| serde_json::from_value(v).unwrap())
            .collect();
        assert_eq!(processed.len(), 3);
        assert!(!processed[0].is_diffused);
        assert_eq!(processed[0].location.valid_point(), Some((17.63, 59.85)));
        assert_eq!(processed[0].location.county, Some(AreaRef::new("3", "Uppsala")));

        let diffused = &processed[1];
        assert!(diffused.is_diffused);
        assert_eq!(diffused.diffusion_radius_meters, Some(50_000.0));
        assert_ne!(diffused.location.valid_point(), Some((17.63, 59.85)));

        let protected: Vec<ProtectedLocation> = store
            .get_chunk("protected-1-4", 0, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|v| serde_json::from_value(v).unwrap())
            .collect();
        assert_eq!(protected.len(), 1);
        assert_eq!(protected[0].occurrence_id, "b");
        assert_eq!(protected[0].location.valid_point(), Some((17.63, 59.85)));

        assert!(!store.exists("processed-1-4-temp").await.unwrap());
        assert!(!store.exists("protected-1-4-temp").await.unwrap());
    }

    #[tokio::test]
    async fn reprocessing_diffuses_to_the_same_point() {
        let store = verbatim(vec![json!({
            "occurrenceId": "wolf-1",
            "decimalLatitude": 62.0,
            "decimalLongitude": 15.0,
            "protectionLevel": 4,
        })])
        .await;
        let processor = processor(store.clone());
        let token = CancellationToken::new();

        processor
            .process_provider(4, "nors", 0, &token, &NullProgress)
            .await
            .unwrap();
        processor
            .process_provider(4, "nors", 1, &token, &NullProgress)
            .await
            .unwrap();

        let first = store.get_chunk("processed-0-4", 0, 1).await.unwrap();
        let second = store.get_chunk("processed-1-4", 0, 1).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn bad_record_keeps_previous_instance_data() {
        let store = verbatim(vec![
            json!({ "occurrenceId": "a" }),
            json!({ "occurrenceId": "b" }),
            json!({ "occurrenceId": "c", "protectionLevel": 0 }),
        ])
        .await;
        store.create_collection("processed-0-4").await.unwrap();
        store
            .write_batch("processed-0-4", vec![json!({ "old": true })])
            .await
            .unwrap();

        let err = processor(store.clone())
            .process_provider(4, "nors", 0, &CancellationToken::new(), &NullProgress)
            .await
            .unwrap_err();

        assert!(matches!(err, ProcessError::Record { index: 2, .. }), "{err}");
        assert_eq!(
            store.get_chunk("processed-0-4", 0, 10).await.unwrap(),
            vec![json!({ "old": true })]
        );
        assert!(!store.exists("processed-0-4-temp").await.unwrap());
        assert!(!store.exists("protected-0-4-temp").await.unwrap());
    }

    #[tokio::test]
    async fn missing_verbatim_collection_is_an_error() {
        let store = Arc::new(MemoryStore::new());
        let err = processor(store)
            .process_provider(4, "nors", 0, &CancellationToken::new(), &NullProgress)
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Store(StoreError::NotFound { .. })));
    }

    #[tokio::test]
    async fn canceled_run_writes_nothing() {
        let store = verbatim(vec![json!({ "occurrenceId": "a" })]).await;
        let token = CancellationToken::new();
        token.cancel();

        let err = processor(store.clone())
            .process_provider(4, "nors", 0, &token, &NullProgress)
            .await
            .unwrap_err();

        assert!(matches!(err, ProcessError::Canceled));
        assert!(!store.exists("processed-0-4").await.unwrap());
    }
}
