#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Operator CLI for the SOS pipeline.
//!
//! Wires the store, provider sources, spatial index, and diffusion engine
//! from `sos.toml` and runs harvests, processing, and publish cycles.
//!
//! Uses `indicatif-log-bridge` (via [`sos_cli_utils::init_logger`]) so log
//! lines and progress bars never fight for the terminal. Ctrl-C cancels
//! running harvests at the next batch boundary.

mod commands;
mod config;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use sos_harvest::CancellationToken;
use sos_publish::CycleMode;

use crate::commands::Context;
use crate::config::AppConfig;

#[derive(Parser)]
#[command(name = "sos", about = "Species observation harvest and publish pipeline")]
struct Cli {
    /// Path to the configuration file
    #[arg(long, default_value = "sos.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured providers
    Providers,
    /// Harvest providers into their verbatim collections
    Harvest {
        /// Comma-separated provider identifiers (overrides `SOS_PROVIDERS`)
        #[arg(long)]
        providers: Option<String>,
    },
    /// Process committed verbatim data into an instance
    Process {
        /// Comma-separated provider identifiers (overrides `SOS_PROVIDERS`)
        #[arg(long)]
        providers: Option<String>,
        /// Target instance (default: the inactive one)
        #[arg(long)]
        instance: Option<u8>,
    },
    /// Harvest, process, and swap instances
    Run {
        /// `full` harvests every selected provider; `incremental` copies
        /// the unselected ones from the active instance
        #[arg(long, default_value_t = CycleMode::Full)]
        mode: CycleMode,
        /// Comma-separated provider identifiers (overrides `SOS_PROVIDERS`)
        #[arg(long)]
        providers: Option<String>,
        /// Let a filtered `full` cycle unpublish the providers it leaves out
        #[arg(long)]
        allow_partial: bool,
    },
    /// Show recent harvest runs
    History {
        /// Only runs of this provider identifier
        #[arg(long)]
        provider: Option<String>,
        /// Maximum number of runs to show
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Show the active instance
    Active,
    /// Make an instance active
    SetActive {
        /// Instance id (0 or 1)
        instance: u8,
    },
    /// Copy one provider's processed data between instances
    CopyProvider {
        /// Source instance
        from: u8,
        /// Target instance
        to: u8,
        /// Provider id
        provider: u32,
    },
    /// Check the diffusion radii statistically
    SelfTest {
        /// Samples per protection level
        #[arg(long, default_value = "10000")]
        samples: usize,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let multi = sos_cli_utils::init_logger();
    let cli = Cli::parse();
    let config = AppConfig::load(&cli.config)?;

    match cli.command {
        Commands::Providers => {
            commands::providers(&config);
            return Ok(());
        }
        Commands::SelfTest { samples } => return commands::self_test(&config, samples),
        _ => {}
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::warn!("Interrupted, stopping at the next batch boundary");
                cancel.cancel();
            }
        });
    }

    let ctx = Context::open(config, multi, cancel).await?;

    match cli.command {
        Commands::Harvest { providers } => commands::harvest(&ctx, providers).await?,
        Commands::Process {
            providers,
            instance,
        } => commands::process(&ctx, providers, instance).await?,
        Commands::Run {
            mode,
            providers,
            allow_partial,
        } => commands::run(&ctx, mode, providers, allow_partial).await?,
        Commands::History { provider, limit } => commands::history(&ctx, provider, limit).await?,
        Commands::Active => commands::active(&ctx).await?,
        Commands::SetActive { instance } => commands::set_active(&ctx, instance).await?,
        Commands::CopyProvider { from, to, provider } => {
            commands::copy_provider(&ctx, from, to, provider).await?;
        }
        Commands::Providers | Commands::SelfTest { .. } => {}
    }

    Ok(())
}
