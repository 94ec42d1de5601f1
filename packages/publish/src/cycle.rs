//! Publish cycles.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures::future::join_all;
use sos_harvest::progress::NullProgress;
use sos_harvest::{CancellationToken, HarvestCoordinator, HarvestJob, HarvestReport};
use sos_process::{PROCESSED_PREFIX, PROTECTED_PREFIX, ProcessReport, Processor};
use strum_macros::{AsRefStr, Display, EnumString};

use crate::PublishError;
use crate::instance::InstanceManager;

/// What a cycle harvests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum CycleMode {
    /// Every provider is harvested and processed from scratch.
    Full,
    /// Some providers are harvested; the rest are copied over from the
    /// active instance.
    Incremental,
}

/// Outcome of one cycle.
#[derive(Debug, Clone)]
pub struct CycleReport {
    /// Cycle mode.
    pub mode: CycleMode,
    /// Instance the cycle wrote to.
    pub target_instance: u8,
    /// One report per harvest job, in job order.
    pub harvests: Vec<HarvestReport>,
    /// Providers processed into the target instance.
    pub processed: Vec<ProcessReport>,
    /// Providers copied from the active instance.
    pub copied: Vec<u32>,
    /// Everything that blocked the swap.
    pub failures: Vec<String>,
    /// Whether the target instance became active.
    pub swapped: bool,
}

/// Runs cycles and decides whether to swap.
pub struct PublishManager {
    instances: Arc<InstanceManager>,
    coordinator: Arc<HarvestCoordinator>,
    processor: Arc<Processor>,
}

impl PublishManager {
    /// Creates a manager.
    #[must_use]
    pub const fn new(
        instances: Arc<InstanceManager>,
        coordinator: Arc<HarvestCoordinator>,
        processor: Arc<Processor>,
    ) -> Self {
        Self {
            instances,
            coordinator,
            processor,
        }
    }

    /// The instance control surface.
    #[must_use]
    pub const fn instances(&self) -> &Arc<InstanceManager> {
        &self.instances
    }

    /// Runs one cycle into the inactive instance.
    ///
    /// `jobs` are harvested and processed. In an incremental cycle the
    /// providers in `carried_over` are copied from the active instance
    /// instead; a full cycle ignores them. Any other provider data in the
    /// target instance is dropped, so after a swap the active instance
    /// holds exactly this cycle's providers.
    ///
    /// The swap happens only when every harvest, processing run, and copy
    /// succeeded and `cancel` did not fire. Otherwise the active instance
    /// stays as it was and the failures are listed in the report.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError`] only if the swap itself (or dropping stale
    /// collections) fails. Provider failures are reported, not returned.
    pub async fn run_cycle(
        &self,
        mode: CycleMode,
        jobs: &[HarvestJob],
        carried_over: &[u32],
        cancel: &CancellationToken,
    ) -> Result<CycleReport, PublishError> {
        let active = self.instances.active_instance();
        let target = self.instances.inactive_instance();
        let carried_over = match mode {
            CycleMode::Full => {
                if !carried_over.is_empty() {
                    log::warn!("Full cycle ignores {} carried-over providers", carried_over.len());
                }
                &[][..]
            }
            CycleMode::Incremental => carried_over,
        };

        log::info!(
            "Starting {mode} cycle into instance {target}: {} to harvest, {} to carry over",
            jobs.len(),
            carried_over.len()
        );

        let mut report = CycleReport {
            mode,
            target_instance: target,
            harvests: Vec::new(),
            processed: Vec::new(),
            copied: Vec::new(),
            failures: Vec::new(),
            swapped: false,
        };

        let keep: BTreeSet<u32> = jobs
            .iter()
            .map(|job| job.provider_id)
            .chain(carried_over.iter().copied())
            .collect();
        self.drop_other_providers(target, &keep).await?;

        report.harvests = self.coordinator.harvest_all(jobs, cancel).await;

        let harvested: Vec<&HarvestJob> = jobs
            .iter()
            .zip(&report.harvests)
            .filter_map(|(job, harvest)| {
                if harvest.info.is_success() {
                    Some(job)
                } else {
                    report.failures.push(format!(
                        "{}: harvest {}",
                        job.source.id(),
                        harvest
                            .info
                            .status
                            .map_or_else(|| "unfinished".to_string(), |s| s.to_string())
                    ));
                    None
                }
            })
            .collect();

        let results = join_all(harvested.iter().map(|job| {
            self.processor.process_provider(
                job.provider_id,
                job.source.id(),
                target,
                cancel,
                &NullProgress,
            )
        }))
        .await;
        for (job, result) in harvested.iter().zip(results) {
            match result {
                Ok(processed) => report.processed.push(processed),
                Err(e) => report
                    .failures
                    .push(format!("{}: processing failed: {e}", job.source.id())),
            }
        }

        for provider_id in carried_over {
            match self
                .instances
                .copy_provider_data(active, target, *provider_id)
                .await
            {
                Ok(_) => report.copied.push(*provider_id),
                Err(e) => report
                    .failures
                    .push(format!("provider {provider_id}: copy failed: {e}")),
            }
        }

        if cancel.is_cancelled() {
            report.failures.push("cycle canceled".to_string());
        }

        if report.failures.is_empty() {
            self.instances.set_active_instance(target).await?;
            report.swapped = true;
            log::info!("{mode} cycle complete, instance {target} is now active");
        } else {
            for failure in &report.failures {
                log::warn!("{failure}");
            }
            log::warn!(
                "{mode} cycle had {} failures, instance {active} stays active",
                report.failures.len()
            );
        }

        Ok(report)
    }

    async fn drop_other_providers(
        &self,
        instance: u8,
        keep: &BTreeSet<u32>,
    ) -> Result<(), PublishError> {
        let store = self.coordinator.store();
        let prefixes = [
            format!("{PROCESSED_PREFIX}{instance}-"),
            format!("{PROTECTED_PREFIX}{instance}-"),
        ];

        for name in store.list_collections().await? {
            let provider_id = prefixes
                .iter()
                .find_map(|prefix| name.strip_prefix(prefix.as_str()))
                .and_then(|rest| rest.parse::<u32>().ok());

            if let Some(provider_id) = provider_id
                && !keep.contains(&provider_id)
            {
                log::info!("Dropping {name} from instance {instance}");
                store.delete_collection(&name).await?;
            }
        }
        Ok(())
    }
}
