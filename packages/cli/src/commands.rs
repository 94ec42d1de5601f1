//! Subcommand implementations.

use std::error::Error;
use std::sync::Arc;

use sos_area::AreaEnricher;
use sos_cli_utils::{IndicatifProgress, MultiProgress};
use sos_diffusion::DiffusionEngine;
use sos_harvest::{
    CancellationToken, HarvestCoordinator, HarvestJob, HarvestReport, read_harvest_info,
};
use sos_observation_models::ProtectionLevel;
use sos_process::Processor;
use sos_publish::{CycleMode, InstanceManager, PublishManager};
use sos_source::{FetcherConfig, ProviderDefinition, SystemClock};
use sos_spatial::{GeoJsonAreaReader, SpatialAreaIndex};
use sos_store::{CollectionStore, FileStore};

use crate::config::AppConfig;

const USER_AGENT: &str = "sos-harvester/0.1";

/// Point in central Sweden used by the diffusion self-test.
const SELF_TEST_POINT: (f64, f64) = (15.0, 62.0);

/// Shared state of one CLI invocation.
pub struct Context {
    config: AppConfig,
    store: Arc<dyn CollectionStore>,
    multi: MultiProgress,
    cancel: CancellationToken,
}

impl Context {
    /// Opens the configured store.
    ///
    /// # Errors
    ///
    /// Returns an error if the store directory cannot be opened.
    pub async fn open(
        config: AppConfig,
        multi: MultiProgress,
        cancel: CancellationToken,
    ) -> Result<Self, Box<dyn Error>> {
        let store = FileStore::open(&config.store_dir).await?;
        log::debug!("Store at {}", store.dir().display());
        Ok(Self {
            config,
            store: Arc::new(store),
            multi,
            cancel,
        })
    }

    fn coordinator(&self) -> Result<HarvestCoordinator, Box<dyn Error>> {
        Ok(HarvestCoordinator::new(
            Arc::clone(&self.store),
            Arc::new(SystemClock),
            self.config.harvest.clone(),
        )?)
    }

    fn jobs(&self, providers: &[&ProviderDefinition]) -> Result<Vec<HarvestJob>, Box<dyn Error>> {
        let client = reqwest::Client::builder().user_agent(USER_AGENT).build()?;
        let defaults = self.config.source_defaults();

        providers
            .iter()
            .map(|provider| -> Result<HarvestJob, Box<dyn Error>> {
                let source = provider.build_source(client.clone(), defaults)?;
                Ok(HarvestJob::new(provider.id, Arc::from(source)).with_progress(
                    IndicatifProgress::provider_bar(&self.multi, &provider.identifier),
                ))
            })
            .collect()
    }

    async fn processor(&self) -> Result<Processor, Box<dyn Error>> {
        let index = Arc::new(SpatialAreaIndex::new());
        if let Some(path) = &self.config.areas_path {
            let count = index.build(&GeoJsonAreaReader::new(path)).await?;
            log::info!("Indexed {count} areas from {}", path.display());
        } else {
            log::warn!("No areas_path configured, observations will carry no area metadata");
        }

        let engine = DiffusionEngine::sweref99(self.config.diffusion.clone())?;
        Ok(Processor::new(
            Arc::clone(&self.store),
            Arc::new(AreaEnricher::new(index)),
            Arc::new(engine),
        ))
    }

    async fn instances(&self) -> Result<Arc<InstanceManager>, Box<dyn Error>> {
        Ok(Arc::new(InstanceManager::load(Arc::clone(&self.store)).await?))
    }
}

fn print_harvests(reports: &[HarvestReport]) {
    println!();
    println!("{:<20} {:<9} {:>10} {:>10}  Message", "Provider", "Status", "Count", "Previous");
    for report in reports {
        let info = &report.info;
        println!(
            "{:<20} {:<9} {:>10} {:>10}  {}",
            info.provider_identifier,
            info.status.map_or_else(|| "-".to_string(), |s| s.to_string()),
            info.count,
            info.previous_count
                .map_or_else(|| "-".to_string(), |c| c.to_string()),
            info.message.as_deref().unwrap_or("")
        );
    }
}

/// Lists the configured providers.
pub fn providers(config: &AppConfig) {
    println!("{:>4}  {:<20} {:<12} {:<8} Name", "Id", "Identifier", "Fetcher", "Enabled");
    for provider in &config.providers {
        let fetcher = match provider.fetcher {
            FetcherConfig::ChangeFeed { .. } => "change_feed",
            FetcherConfig::IdRange { .. } => "id_range",
        };
        println!(
            "{:>4}  {:<20} {:<12} {:<8} {}",
            provider.id, provider.identifier, fetcher, provider.enabled, provider.name
        );
    }
}

/// Harvests the selected providers into their verbatim collections.
///
/// # Errors
///
/// Returns an error if the providers or the coordinator cannot be set up.
/// Individual harvest failures are reported, not returned.
pub async fn harvest(ctx: &Context, filter: Option<String>) -> Result<(), Box<dyn Error>> {
    let providers = ctx.config.selected_providers(filter)?;
    let jobs = ctx.jobs(&providers)?;
    let coordinator = ctx.coordinator()?;

    let reports = coordinator.harvest_all(&jobs, &ctx.cancel).await;
    print_harvests(&reports);

    let failed = reports.iter().filter(|r| !r.info.is_success()).count();
    if failed > 0 {
        log::warn!("{failed} of {} harvests did not succeed", reports.len());
    }
    Ok(())
}

/// Processes the selected providers' committed verbatim data into
/// `instance` (the inactive instance by default).
///
/// # Errors
///
/// Returns an error if setup fails or any provider fails to process.
pub async fn process(
    ctx: &Context,
    filter: Option<String>,
    instance: Option<u8>,
) -> Result<(), Box<dyn Error>> {
    let providers = ctx.config.selected_providers(filter)?;
    let instance = match instance {
        Some(instance) => instance,
        None => ctx.instances().await?.inactive_instance(),
    };
    let processor = ctx.processor().await?;

    let mut failed = 0usize;
    for provider in &providers {
        let progress = IndicatifProgress::provider_bar(&ctx.multi, &provider.identifier);
        match processor
            .process_provider(
                provider.id,
                &provider.identifier,
                instance,
                &ctx.cancel,
                progress.as_ref(),
            )
            .await
        {
            Ok(report) => println!(
                "{}: {} processed, {} diffused into instance {instance}",
                provider.identifier, report.processed, report.diffused
            ),
            Err(e) => {
                log::error!("{}: {e}", provider.identifier);
                failed += 1;
            }
        }
    }

    if failed > 0 {
        return Err(format!("{failed} providers failed to process").into());
    }
    Ok(())
}

/// Runs a full or incremental publish cycle.
///
/// # Errors
///
/// Returns an error if setup fails, a full cycle would silently drop
/// enabled providers (unless `allow_partial`), or the swap could not be
/// persisted. Provider failures skip the swap and are reported.
pub async fn run(
    ctx: &Context,
    mode: CycleMode,
    filter: Option<String>,
    allow_partial: bool,
) -> Result<(), Box<dyn Error>> {
    let selected = ctx.config.selected_providers(filter)?;
    let carried_over: Vec<u32> = match mode {
        CycleMode::Full => {
            ctx.config.check_full_cycle(&selected, allow_partial)?;
            Vec::new()
        }
        CycleMode::Incremental => ctx
            .config
            .other_providers(&selected)
            .iter()
            .map(|p| p.id)
            .collect(),
    };

    let jobs = ctx.jobs(&selected)?;
    let manager = PublishManager::new(
        ctx.instances().await?,
        Arc::new(ctx.coordinator()?),
        Arc::new(ctx.processor().await?),
    );

    let report = manager
        .run_cycle(mode, &jobs, &carried_over, &ctx.cancel)
        .await?;
    print_harvests(&report.harvests);

    println!();
    if report.swapped {
        println!(
            "{mode} cycle complete: instance {} is active ({} processed, {} copied)",
            report.target_instance,
            report.processed.len(),
            report.copied.len()
        );
    } else {
        println!(
            "{mode} cycle failed, instance {} stays active:",
            manager.instances().active_instance()
        );
        for failure in &report.failures {
            println!("  {failure}");
        }
    }
    Ok(())
}

/// Prints the most recent harvest runs.
///
/// # Errors
///
/// Returns an error if the audit collection cannot be read.
pub async fn history(
    ctx: &Context,
    provider: Option<String>,
    limit: usize,
) -> Result<(), Box<dyn Error>> {
    let records = read_harvest_info(ctx.store.as_ref()).await?;

    println!(
        "{:<20} {:<25} {:<9} {:>10}  Message",
        "Provider", "Started", "Status", "Count"
    );
    for info in records
        .iter()
        .rev()
        .filter(|i| provider.as_ref().is_none_or(|p| &i.provider_identifier == p))
        .take(limit)
    {
        println!(
            "{:<20} {:<25} {:<9} {:>10}  {}",
            info.provider_identifier,
            info.start.to_rfc3339(),
            info.status.map_or_else(|| "-".to_string(), |s| s.to_string()),
            info.count,
            info.message.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

/// Prints the active instance.
///
/// # Errors
///
/// Returns an error if the instance configuration cannot be read.
pub async fn active(ctx: &Context) -> Result<(), Box<dyn Error>> {
    let instances = ctx.instances().await?;
    println!(
        "Active instance: {} (inactive: {})",
        instances.active_instance(),
        instances.inactive_instance()
    );
    Ok(())
}

/// Makes `instance` active.
///
/// # Errors
///
/// Returns an error for invalid ids or if the flag cannot be persisted.
pub async fn set_active(ctx: &Context, instance: u8) -> Result<(), Box<dyn Error>> {
    ctx.instances().await?.set_active_instance(instance).await?;
    println!("Active instance: {instance}");
    Ok(())
}

/// Copies one provider's processed data between instances.
///
/// # Errors
///
/// Returns an error if the copy fails.
pub async fn copy_provider(
    ctx: &Context,
    from: u8,
    to: u8,
    provider_id: u32,
) -> Result<(), Box<dyn Error>> {
    let copied = ctx
        .instances()
        .await?
        .copy_provider_data(from, to, provider_id)
        .await?;
    println!("Copied {copied} observations of provider {provider_id} from instance {from} to {to}");
    Ok(())
}

/// Checks the configured radii statistically.
///
/// # Errors
///
/// Returns an error if the engine cannot be built or a level's mean
/// displacement is off.
pub fn self_test(config: &AppConfig, samples: usize) -> Result<(), Box<dyn Error>> {
    let engine = DiffusionEngine::sweref99(config.diffusion.clone())?;
    let (lon, lat) = SELF_TEST_POINT;

    for level in ProtectionLevel::all().iter().filter(|l| l.is_sensitive()) {
        let mean = engine.self_test(lon, lat, *level, samples)?;
        println!(
            "Level {}: radius {:.0} m, mean displacement {mean:.0} m",
            level.value(),
            engine.radius_for(*level)
        );
    }
    Ok(())
}
