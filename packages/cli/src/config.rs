//! `sos.toml` loading.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use sos_diffusion::DiffusionConfig;
use sos_harvest::{HarvestConfig, HarvestError};
use sos_source::definition::{SourceDefaults, check_providers, select_providers};
use sos_source::{ProviderDefinition, SourceError};

/// Environment variable listing provider identifiers to run when
/// `--providers` is not given.
pub const PROVIDERS_ENV: &str = "SOS_PROVIDERS";

/// Errors that can occur while loading the configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("Failed to read {path}: {source}")]
    Io {
        /// Config file path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The file is not valid TOML for [`AppConfig`].
    #[error("Failed to parse {path}: {source}")]
    Toml {
        /// Config file path.
        path: PathBuf,
        /// Underlying error.
        source: toml::de::Error,
    },

    /// A provider definition is invalid.
    #[error(transparent)]
    Provider(#[from] SourceError),

    /// The `[harvest]` table is out of range.
    #[error(transparent)]
    Harvest(#[from] HarvestError),

    /// A full cycle would unpublish enabled providers left out of the
    /// selection.
    #[error(
        "a full cycle drops unselected providers from the published data: {}",
        omitted.join(", ")
    )]
    PartialFullCycle {
        /// Identifiers of the enabled providers that would be dropped.
        omitted: Vec<String>,
    },
}

fn default_store_dir() -> PathBuf {
    PathBuf::from("data")
}

/// Everything the CLI reads from `sos.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Directory of the file store.
    #[serde(default = "default_store_dir")]
    pub store_dir: PathBuf,
    /// `GeoJSON` file with the reference areas. Without it observations get
    /// no area metadata.
    #[serde(default)]
    pub areas_path: Option<PathBuf>,
    /// Harvest tunables.
    #[serde(default)]
    pub harvest: HarvestConfig,
    /// Diffusion radii and seed.
    #[serde(default)]
    pub diffusion: DiffusionConfig,
    /// Provider definitions.
    #[serde(default)]
    pub providers: Vec<ProviderDefinition>,
}

impl AppConfig {
    /// Parses and validates a configuration document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the document is malformed or a value is
    /// out of range.
    pub fn parse(path: &Path, text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::de::from_str(text).map_err(|source| ConfigError::Toml {
            path: path.to_path_buf(),
            source,
        })?;
        config.harvest.validate()?;
        check_providers(&config.providers)?;
        Ok(config)
    }

    /// Reads and validates `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or is invalid.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::parse(path, &text)?;
        log::debug!(
            "Loaded {} with {} providers",
            path.display(),
            config.providers.len()
        );
        Ok(config)
    }

    /// Defaults applied to provider definitions that leave them out.
    #[must_use]
    pub const fn source_defaults(&self) -> SourceDefaults {
        SourceDefaults {
            min_interval: self.harvest.min_request_interval(),
            max_concurrency: self.harvest.max_concurrency,
        }
    }

    /// Providers selected by `filter` (comma-separated identifiers), or by
    /// [`PROVIDERS_ENV`] when `filter` is `None`. With neither, every
    /// enabled provider.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Config`] for identifiers that match no
    /// provider.
    pub fn selected_providers(
        &self,
        filter: Option<String>,
    ) -> Result<Vec<&ProviderDefinition>, SourceError> {
        let filter = filter.or_else(|| std::env::var(PROVIDERS_ENV).ok());
        let identifiers: Vec<String> = filter
            .iter()
            .flat_map(|f| f.split(','))
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        select_providers(&self.providers, &identifiers)
    }

    /// Checks that a full cycle over `selected` keeps every enabled
    /// provider published. With `allow_partial` the omitted providers are
    /// only logged.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::PartialFullCycle`] naming the enabled
    /// providers missing from `selected`.
    pub fn check_full_cycle(
        &self,
        selected: &[&ProviderDefinition],
        allow_partial: bool,
    ) -> Result<(), ConfigError> {
        let omitted: Vec<String> = self
            .other_providers(selected)
            .iter()
            .map(|p| p.identifier.clone())
            .collect();
        if omitted.is_empty() {
            return Ok(());
        }

        if allow_partial {
            log::warn!(
                "Full cycle will drop {} from the published data",
                omitted.join(", ")
            );
            Ok(())
        } else {
            Err(ConfigError::PartialFullCycle { omitted })
        }
    }

    /// Enabled providers not in `selected`.
    #[must_use]
    pub fn other_providers(&self, selected: &[&ProviderDefinition]) -> Vec<&ProviderDefinition> {
        self.providers
            .iter()
            .filter(|p| p.enabled && !selected.iter().any(|s| s.id == p.id))
            .collect()
    }
}
