//! Harvest state machine.

use std::sync::Arc;

use futures::future::join_all;
use sos_harvest_models::{HarvestInfo, HarvestPhase, RunStatus};
use sos_source::{Clock, FetchStrategy, ProviderSource, RateLimiter};
use sos_store::{CollectionStore, StoreError, scratch_name};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::driver::{DriverContext, run_cursor, run_ranges};
use crate::gate::AdmissionGate;
use crate::progress::{ProgressCallback, null_progress};
use crate::{HARVEST_INFO_COLLECTION, HarvestConfig, HarvestError, verbatim_collection};

/// One provider to harvest.
pub struct HarvestJob {
    /// Numeric provider id recorded in the audit trail.
    pub provider_id: u32,
    /// Where the records come from.
    pub source: Arc<dyn ProviderSource>,
    /// Receives record counts as batches land.
    pub progress: Arc<dyn ProgressCallback>,
}

impl HarvestJob {
    /// A job without progress reporting.
    #[must_use]
    pub fn new(provider_id: u32, source: Arc<dyn ProviderSource>) -> Self {
        Self {
            provider_id,
            source,
            progress: null_progress(),
        }
    }

    /// Replaces the progress sink.
    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn ProgressCallback>) -> Self {
        self.progress = progress;
        self
    }
}

/// Result of one run.
#[derive(Debug, Clone)]
pub struct HarvestReport {
    /// The finalized audit record.
    pub info: HarvestInfo,
    /// Every phase the run passed through, in order.
    pub phases: Vec<HarvestPhase>,
    /// Most range chunks in flight at once (range sources only).
    pub peak_in_flight: Option<usize>,
}

struct PhaseLog<'a> {
    provider: &'a str,
    phases: Vec<HarvestPhase>,
}

impl PhaseLog<'_> {
    fn enter(&mut self, phase: HarvestPhase) {
        if let Some(previous) = self.phases.last() {
            log::debug!("[{}] {previous} -> {phase}", self.provider);
        }
        self.phases.push(phase);
    }
}

/// Runs harvests against one store.
pub struct HarvestCoordinator {
    store: Arc<dyn CollectionStore>,
    clock: Arc<dyn Clock>,
    config: HarvestConfig,
    audit_lock: Mutex<()>,
}

impl HarvestCoordinator {
    /// Creates a coordinator.
    ///
    /// # Errors
    ///
    /// Returns [`HarvestError::Contract`] if `config` is out of range.
    pub fn new(
        store: Arc<dyn CollectionStore>,
        clock: Arc<dyn Clock>,
        config: HarvestConfig,
    ) -> Result<Self, HarvestError> {
        config.validate()?;
        Ok(Self {
            store,
            clock,
            config,
            audit_lock: Mutex::new(()),
        })
    }

    /// The store harvests are written to.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn CollectionStore> {
        &self.store
    }

    /// Harvests every job concurrently. One job failing never affects
    /// another. Reports come back in job order.
    pub async fn harvest_all(
        &self,
        jobs: &[HarvestJob],
        cancel: &CancellationToken,
    ) -> Vec<HarvestReport> {
        join_all(jobs.iter().map(|job| self.harvest(job, cancel))).await
    }

    /// Runs one harvest to completion. Never fails: errors become a
    /// `Failed` (or `Canceled`) record, which is also written to the audit
    /// collection.
    pub async fn harvest(&self, job: &HarvestJob, cancel: &CancellationToken) -> HarvestReport {
        let identifier = job.source.id();
        let committed = verbatim_collection(identifier);
        let scratch = scratch_name(&committed);

        let mut info = HarvestInfo::start(job.provider_id, identifier, self.clock.utc_now());
        let mut phases = PhaseLog {
            provider: identifier,
            phases: vec![HarvestPhase::NotStarted],
        };
        let mut peak_in_flight = None;

        log::info!("[{identifier}] Harvest started");
        job.progress.set_message(format!("Harvesting {identifier}"));

        let status = match self
            .run(job, cancel, &committed, &scratch, &mut info, &mut phases, &mut peak_in_flight)
            .await
        {
            Ok(status) => status,
            Err(HarvestError::Canceled) => {
                log::warn!("[{identifier}] Harvest canceled after {} records", info.count);
                self.roll_back(&scratch, &mut phases).await;
                RunStatus::Canceled
            }
            Err(e) => {
                log::error!("[{identifier}] Harvest failed: {e}");
                info.message = Some(e.to_string());
                self.roll_back(&scratch, &mut phases).await;
                RunStatus::Failed
            }
        };

        phases.enter(HarvestPhase::Done);
        info.finish(status, self.clock.utc_now());
        job.progress
            .finish(format!("{identifier}: {status} ({} records)", info.count));
        log::info!("[{identifier}] Harvest {status}: {} records", info.count);

        if let Err(e) = self.record(&info).await {
            log::error!("[{identifier}] Failed to write harvest info: {e}");
        }

        HarvestReport {
            info,
            phases: phases.phases,
            peak_in_flight,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run(
        &self,
        job: &HarvestJob,
        cancel: &CancellationToken,
        committed: &str,
        scratch: &str,
        info: &mut HarvestInfo,
        phases: &mut PhaseLog<'_>,
        peak_in_flight: &mut Option<usize>,
    ) -> Result<RunStatus, HarvestError> {
        let source = job.source.as_ref();

        phases.enter(HarvestPhase::Running);
        self.store.create_collection(scratch).await?;

        let ctx = DriverContext {
            store: self.store.as_ref(),
            scratch,
            cancel,
            progress: job.progress.as_ref(),
        };

        let count = match source.strategy() {
            FetchStrategy::Cursor {
                start,
                window,
                min_interval,
            } => {
                let limiter = RateLimiter::new(min_interval, Arc::clone(&self.clock));
                run_cursor(source, &ctx, start, window, info.start, &limiter).await?
            }
            FetchStrategy::Range {
                chunk_size,
                max_concurrency,
            } => {
                let gate = AdmissionGate::new(max_concurrency)?;
                let result = run_ranges(source, &ctx, chunk_size, &gate).await;
                *peak_in_flight = Some(gate.peak());
                result?
            }
        };
        info.count = count;
        ctx.check_cancel()?;

        info.data_last_modified = match source.data_last_modified().await {
            Ok(modified) => modified,
            Err(e) => {
                log::warn!("[{}] Could not read data last modified: {e}", source.id());
                None
            }
        };

        phases.enter(HarvestPhase::Validating);
        let previous = if self.store.exists(committed).await? {
            Some(self.store.count(committed).await?)
        } else {
            None
        };
        info.previous_count = previous;

        if !self.config.accepts(count, previous) {
            let message = format!(
                "harvested {count} records, below {:.0}% of the {} already committed",
                self.config.validation_threshold * 100.0,
                previous.unwrap_or_default()
            );
            log::warn!("[{}] Validation failed: {message}", source.id());
            info.message = Some(message);
            self.roll_back(scratch, phases).await;
            return Ok(RunStatus::Failed);
        }

        ctx.check_cancel()?;
        phases.enter(HarvestPhase::Committing);
        self.store.rename_collection(scratch, committed).await?;
        Ok(RunStatus::Success)
    }

    async fn roll_back(&self, scratch: &str, phases: &mut PhaseLog<'_>) {
        phases.enter(HarvestPhase::RollingBack);
        if let Err(e) = self.store.delete_collection(scratch).await {
            log::error!("[{}] Failed to delete {scratch}: {e}", phases.provider);
        }
    }

    async fn record(&self, info: &HarvestInfo) -> Result<(), StoreError> {
        let document = serde_json::to_value(info)?;

        let _guard = self.audit_lock.lock().await;
        if !self.store.exists(HARVEST_INFO_COLLECTION).await? {
            self.store.create_collection(HARVEST_INFO_COLLECTION).await?;
        }
        self.store
            .write_batch(HARVEST_INFO_COLLECTION, vec![document])
            .await
    }
}

/// Reads every harvest record from the audit collection, oldest first.
///
/// # Errors
///
/// Returns [`StoreError`] if the collection cannot be read or a record does
/// not decode.
pub async fn read_harvest_info(
    store: &dyn CollectionStore,
) -> Result<Vec<HarvestInfo>, StoreError> {
    const PAGE: usize = 1000;

    if !store.exists(HARVEST_INFO_COLLECTION).await? {
        return Ok(Vec::new());
    }

    let mut records = Vec::new();
    loop {
        let page = store
            .get_chunk(HARVEST_INFO_COLLECTION, records.len(), PAGE)
            .await?;
        let len = page.len();
        for document in page {
            records.push(serde_json::from_value(document)?);
        }
        if len < PAGE {
            break;
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone as _, Utc};
    use serde_json::json;
    use sos_source::{
        Batch, BatchRequest, IdBounds, ManualClock, NextCursor, SourceError, TimeWindow,
    };
    use sos_store::MemoryStore;

    use super::*;

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0).unwrap()
    }

    /// Serves ids `1..=records` in chunks, optionally failing on the chunk
    /// containing `fail_at`.
    struct RangeFake {
        records: i64,
        chunk_size: u64,
        max_concurrency: usize,
        fail_at: Option<i64>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl RangeFake {
        fn new(records: i64) -> Self {
            Self {
                records,
                chunk_size: 10,
                max_concurrency: 3,
                fail_at: None,
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ProviderSource for RangeFake {
        fn id(&self) -> &str {
            "range"
        }

        fn strategy(&self) -> FetchStrategy {
            FetchStrategy::Range {
                chunk_size: self.chunk_size,
                max_concurrency: self.max_concurrency,
            }
        }

        async fn fetch_batch(&self, request: &BatchRequest) -> Result<Batch, SourceError> {
            let BatchRequest::Range { from, to } = *request else {
                panic!("unexpected request {request:?}");
            };

            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            for _ in 0..3 {
                tokio::task::yield_now().await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.fail_at.is_some_and(|id| (from..to).contains(&id)) {
                return Err(SourceError::Response {
                    message: "HTTP 404".to_string(),
                });
            }

            Ok(Batch::caught_up(
                (from..to.min(self.records + 1))
                    .map(|id| json!({ "occurrenceId": id.to_string() }))
                    .collect(),
            ))
        }

        async fn id_bounds(&self) -> Result<Option<IdBounds>, SourceError> {
            Ok((self.records > 0).then_some(IdBounds {
                min: 1,
                max: self.records,
            }))
        }
    }

    /// Replays scripted batches and records every request.
    struct CursorFake {
        script: std::sync::Mutex<VecDeque<Batch>>,
        requests: std::sync::Mutex<Vec<BatchRequest>>,
        cancel_on_request: Option<(usize, CancellationToken)>,
    }

    impl CursorFake {
        fn new(script: Vec<Batch>) -> Self {
            Self {
                script: std::sync::Mutex::new(script.into()),
                requests: std::sync::Mutex::new(Vec::new()),
                cancel_on_request: None,
            }
        }

        fn requests(&self) -> Vec<BatchRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ProviderSource for CursorFake {
        fn id(&self) -> &str {
            "cursor"
        }

        fn strategy(&self) -> FetchStrategy {
            FetchStrategy::Cursor {
                start: day(1),
                window: chrono::Duration::days(10),
                min_interval: Duration::from_secs(2),
            }
        }

        async fn fetch_batch(&self, request: &BatchRequest) -> Result<Batch, SourceError> {
            let n = {
                let mut requests = self.requests.lock().unwrap();
                requests.push(request.clone());
                requests.len()
            };
            if let Some((at, token)) = &self.cancel_on_request
                && *at == n
            {
                token.cancel();
            }
            Ok(self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Batch::caught_up(Vec::new())))
        }
    }

    fn records(n: usize) -> Vec<serde_json::Value> {
        (0..n).map(|i| json!({ "occurrenceId": format!("s{i}") })).collect()
    }

    async fn seeded_store(collection: &str, count: usize) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        if count > 0 {
            store.create_collection(collection).await.unwrap();
            store.write_batch(collection, records(count)).await.unwrap();
        }
        store
    }

    fn coordinator(store: Arc<MemoryStore>, clock: Arc<ManualClock>) -> HarvestCoordinator {
        HarvestCoordinator::new(store, clock, HarvestConfig::default()).unwrap()
    }

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(day(31)))
    }

    #[tokio::test]
    async fn commits_when_count_meets_threshold() {
        let store = seeded_store("verbatim-range", 100).await;
        let harvester = coordinator(store.clone(), clock());

        let job = HarvestJob::new(7, Arc::new(RangeFake::new(90)));
        let report = harvester.harvest(&job, &CancellationToken::new()).await;

        assert_eq!(report.info.status, Some(RunStatus::Success));
        assert_eq!(report.info.count, 90);
        assert_eq!(report.info.previous_count, Some(100));
        assert_eq!(
            report.phases,
            vec![
                HarvestPhase::NotStarted,
                HarvestPhase::Running,
                HarvestPhase::Validating,
                HarvestPhase::Committing,
                HarvestPhase::Done,
            ]
        );
        assert_eq!(store.count("verbatim-range").await.unwrap(), 90);
        assert!(!store.exists("verbatim-range-temp").await.unwrap());
    }

    #[tokio::test]
    async fn rolls_back_when_count_drops_below_threshold() {
        let store = seeded_store("verbatim-range", 100).await;
        let harvester = coordinator(store.clone(), clock());

        let job = HarvestJob::new(7, Arc::new(RangeFake::new(70)));
        let report = harvester.harvest(&job, &CancellationToken::new()).await;

        assert_eq!(report.info.status, Some(RunStatus::Failed));
        assert_eq!(report.info.count, 70);
        assert!(report.info.message.is_some());
        assert!(report.phases.contains(&HarvestPhase::RollingBack));
        assert!(!report.phases.contains(&HarvestPhase::Committing));

        let kept = store.get_chunk("verbatim-range", 0, 1000).await.unwrap();
        assert_eq!(kept, records(100));
        assert!(!store.exists("verbatim-range-temp").await.unwrap());
    }

    #[tokio::test]
    async fn first_harvest_commits_any_count() {
        let store = seeded_store("unused", 0).await;
        let harvester = coordinator(store.clone(), clock());

        let job = HarvestJob::new(7, Arc::new(RangeFake::new(0)));
        let report = harvester.harvest(&job, &CancellationToken::new()).await;

        assert!(report.info.is_success());
        assert_eq!(report.info.previous_count, None);
        assert_eq!(store.count("verbatim-range").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn source_failure_mid_run_rolls_back() {
        let store = seeded_store("verbatim-range", 40).await;
        let harvester = coordinator(store.clone(), clock());

        let mut fake = RangeFake::new(50);
        fake.fail_at = Some(25);
        let job = HarvestJob::new(7, Arc::new(fake));
        let report = harvester.harvest(&job, &CancellationToken::new()).await;

        assert_eq!(report.info.status, Some(RunStatus::Failed));
        assert!(report.info.message.as_deref().unwrap().contains("404"));
        assert_eq!(store.get_chunk("verbatim-range", 0, 100).await.unwrap(), records(40));
        assert!(!store.exists("verbatim-range-temp").await.unwrap());
    }

    #[tokio::test]
    async fn range_chunks_respect_admission_gate() {
        let store = seeded_store("unused", 0).await;
        let harvester = coordinator(store.clone(), clock());

        let mut fake = RangeFake::new(100);
        fake.chunk_size = 5;
        fake.max_concurrency = 3;
        let fake = Arc::new(fake);
        let job = HarvestJob::new(7, fake.clone());
        let report = harvester.harvest(&job, &CancellationToken::new()).await;

        assert!(report.info.is_success());
        assert_eq!(report.info.count, 100);
        let peak = fake.peak.load(Ordering::SeqCst);
        assert!(peak <= 3, "peak was {peak}");
        assert!(peak >= 2, "chunks never overlapped");
        assert!(report.peak_in_flight.unwrap() <= 3);
    }

    #[tokio::test]
    async fn cursor_advances_windows_and_spaces_requests() {
        let store = seeded_store("unused", 0).await;
        let clock = clock();
        let harvester = coordinator(store.clone(), clock.clone());

        let fake = Arc::new(CursorFake::new(vec![
            Batch {
                records: records(2),
                next: NextCursor::Continue("p2".to_string()),
            },
            Batch::caught_up(records(1)),
        ]));
        let job = HarvestJob::new(1, fake.clone());
        let report = harvester.harvest(&job, &CancellationToken::new()).await;

        let window = |from, to| TimeWindow {
            from: day(from),
            to: day(to),
        };
        assert_eq!(
            fake.requests(),
            vec![
                BatchRequest::Cursor {
                    cursor: None,
                    window: window(1, 11)
                },
                BatchRequest::Cursor {
                    cursor: Some("p2".to_string()),
                    window: window(1, 11)
                },
                BatchRequest::Cursor {
                    cursor: None,
                    window: window(11, 21)
                },
                BatchRequest::Cursor {
                    cursor: None,
                    window: window(21, 31)
                },
            ]
        );
        assert_eq!(report.info.count, 3);
        assert!(report.info.is_success());
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(2); 3]);
    }

    #[tokio::test]
    async fn cancellation_mid_run_keeps_committed_data() {
        let store = seeded_store("verbatim-cursor", 5).await;
        let harvester = coordinator(store.clone(), clock());
        let token = CancellationToken::new();

        let mut fake = CursorFake::new(vec![Batch {
            records: records(2),
            next: NextCursor::Continue("p2".to_string()),
        }]);
        fake.cancel_on_request = Some((2, token.clone()));
        let fake = Arc::new(fake);
        let job = HarvestJob::new(1, fake.clone());
        let report = harvester.harvest(&job, &token).await;

        assert_eq!(report.info.status, Some(RunStatus::Canceled));
        assert_eq!(fake.requests().len(), 2);
        assert_eq!(store.get_chunk("verbatim-cursor", 0, 10).await.unwrap(), records(5));
        assert!(!store.exists("verbatim-cursor-temp").await.unwrap());
    }

    #[tokio::test]
    async fn cancellation_during_last_batch_does_not_commit() {
        let store = Arc::new(MemoryStore::new());
        store.create_collection("verbatim-cursor").await.unwrap();
        store
            .write_batch("verbatim-cursor", vec![json!({ "occurrenceId": "old" })])
            .await
            .unwrap();
        let harvester = coordinator(store.clone(), clock());
        let token = CancellationToken::new();

        let mut fake = CursorFake::new(vec![Batch::caught_up(vec![
            json!({ "occurrenceId": "new" }),
        ])]);
        // Third request covers the final window, after which the loop ends.
        fake.cancel_on_request = Some((3, token.clone()));
        let fake = Arc::new(fake);
        let report = harvester.harvest(&HarvestJob::new(1, fake.clone()), &token).await;

        assert_eq!(fake.requests().len(), 3);
        assert_eq!(report.info.status, Some(RunStatus::Canceled));
        assert!(!report.phases.contains(&HarvestPhase::Committing));
        assert_eq!(
            store.get_chunk("verbatim-cursor", 0, 10).await.unwrap(),
            vec![json!({ "occurrenceId": "old" })]
        );
        assert!(!store.exists("verbatim-cursor-temp").await.unwrap());
    }

    #[tokio::test]
    async fn canceled_before_start_fetches_nothing() {
        let store = seeded_store("unused", 0).await;
        let harvester = coordinator(store.clone(), clock());
        let token = CancellationToken::new();
        token.cancel();

        let fake = Arc::new(CursorFake::new(Vec::new()));
        let report = harvester
            .harvest(&HarvestJob::new(1, fake.clone()), &token)
            .await;

        assert_eq!(report.info.status, Some(RunStatus::Canceled));
        assert!(fake.requests().is_empty());
        assert!(!store.exists("verbatim-cursor").await.unwrap());
    }

    #[tokio::test]
    async fn providers_fail_independently_and_every_run_is_audited() {
        let store = seeded_store("unused", 0).await;
        let harvester = coordinator(store.clone(), clock());

        let mut failing = RangeFake::new(30);
        failing.fail_at = Some(1);
        let jobs = vec![
            HarvestJob::new(1, Arc::new(CursorFake::new(vec![Batch::caught_up(records(4))]))),
            HarvestJob::new(2, Arc::new(failing)),
        ];
        let reports = harvester.harvest_all(&jobs, &CancellationToken::new()).await;

        assert_eq!(reports[0].info.status, Some(RunStatus::Success));
        assert_eq!(reports[1].info.status, Some(RunStatus::Failed));
        assert_eq!(store.count("verbatim-cursor").await.unwrap(), 4);

        let audit = read_harvest_info(store.as_ref()).await.unwrap();
        assert_eq!(audit.len(), 2);
        assert!(audit.iter().all(|info| info.end.is_some()));
        let mut ids: Vec<u32> = audit.iter().map(|i| i.provider_id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2]);
    }
}
