use std::{fs, path::PathBuf, sync::Arc, time::Duration};

use datum_client::store::{
    InMemoryMetadataStore, InMemorySettingStore, JsonFileMetadataStore, JsonFileSettingStore,
};
use datum_client::{MetadataStore, SettingStore, StoreError};
use serde::Deserialize;

use crate::filters::{
    DownsampleConfig, DownsampleFilter, FilterChain, FilterConfigError, FilterContext,
    OperationalModeConfig, OperationalModeFilter, PropertyPatternConfig, PropertyPatternFilter,
    SampleFilter, SourceThrottleConfig, SourceThrottlingFilter, VirtualMeterFilter,
    VirtualMeterFilterConfig,
};
use crate::settings_cache::DEFAULT_CACHE_SECS;

pub const CONFIG_ENV: &str = "SAMPLE_FILTER_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "filter-config.toml";

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("filter #{index} ({uid}): {source}")]
    Filter {
        index: usize,
        uid: String,
        #[source]
        source: FilterConfigError,
    },
    #[error("failed to open store: {0}")]
    Store(#[from] StoreError),
}

fn default_cache_secs() -> u64 {
    DEFAULT_CACHE_SECS
}

#[derive(Debug, Clone, Deserialize)]
pub struct SettingsConfig {
    #[serde(default = "default_cache_secs")]
    pub cache_secs: u64,
    /// JSON file for filter timestamps; in memory when unset.
    #[serde(default)]
    pub setting_store_path: Option<PathBuf>,
    /// JSON file for source metadata; in memory when unset.
    #[serde(default)]
    pub metadata_store_path: Option<PathBuf>,
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            cache_secs: default_cache_secs(),
            setting_store_path: None,
            metadata_store_path: None,
        }
    }
}

impl SettingsConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_secs)
    }

    pub fn open_setting_store(&self) -> Result<Arc<dyn SettingStore>, StoreError> {
        Ok(match &self.setting_store_path {
            Some(path) => Arc::new(JsonFileSettingStore::open(path)?),
            None => Arc::new(InMemorySettingStore::new()),
        })
    }

    pub fn open_metadata_store(&self) -> Result<Arc<dyn MetadataStore>, StoreError> {
        Ok(match &self.metadata_store_path {
            Some(path) => Arc::new(JsonFileMetadataStore::open(path)?),
            None => Arc::new(InMemoryMetadataStore::new()),
        })
    }
}

fn default_workers() -> usize {
    4
}

fn default_channel_capacity() -> usize {
    1024
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// NDJSON input file; stdin when unset.
    #[serde(default)]
    pub input: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            channel_capacity: default_channel_capacity(),
            input: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub bind_addr: String,
}

/// One `[[filters]]` entry, selected by its `type` key.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FilterConfig {
    SourceThrottle(SourceThrottleConfig),
    PropertyPattern(PropertyPatternConfig),
    Downsample(DownsampleConfig),
    OperationalMode(OperationalModeConfig),
    VirtualMeter(VirtualMeterFilterConfig),
}

impl FilterConfig {
    pub fn uid(&self) -> &str {
        match self {
            FilterConfig::SourceThrottle(c) => &c.uid,
            FilterConfig::PropertyPattern(c) => &c.uid,
            FilterConfig::Downsample(c) => &c.uid,
            FilterConfig::OperationalMode(c) => &c.uid,
            FilterConfig::VirtualMeter(c) => &c.uid,
        }
    }

    pub fn build(&self, ctx: &FilterContext) -> Result<Arc<dyn SampleFilter>, FilterConfigError> {
        Ok(match self {
            FilterConfig::SourceThrottle(c) => Arc::new(SourceThrottlingFilter::new(c, ctx)?),
            FilterConfig::PropertyPattern(c) => Arc::new(PropertyPatternFilter::new(c, ctx)?),
            FilterConfig::Downsample(c) => Arc::new(DownsampleFilter::new(c, ctx)?),
            FilterConfig::OperationalMode(c) => Arc::new(OperationalModeFilter::new(c, ctx)?),
            FilterConfig::VirtualMeter(c) => Arc::new(VirtualMeterFilter::new(c, ctx)?),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub settings: SettingsConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub metrics: Option<MetricsConfig>,
    #[serde(default)]
    pub filters: Vec<FilterConfig>,
}

impl AppConfig {
    /// Load from the file named by `SAMPLE_FILTER_CONFIG`, or
    /// `filter-config.toml` in the working directory.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let contents = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Build every configured filter, in order. The first invalid one fails
    /// the whole chain.
    pub fn build_chain(&self, ctx: &FilterContext) -> Result<FilterChain, ConfigError> {
        let filters = self
            .filters
            .iter()
            .enumerate()
            .map(|(index, f)| {
                f.build(ctx).map_err(|source| ConfigError::Filter {
                    index,
                    uid: f.uid().to_string(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(FilterChain::new(filters))
    }
}
