//! Application config
use std::collections::HashMap;
use std::time::Duration;

use config::{Config, ConfigError, File};
use serde::Deserialize;

const DEFAULT_FETCH_TIMEOUT_SECONDS: u64 = 30;
const DEFAULT_FETCH_MAX_RETRIES: u32 = 3;
const DEFAULT_CACHE_TTL_SECONDS: u64 = 300;
const DEFAULT_DATA_GOUV_BASE_URL: &str = "https://www.data.gouv.fr/api/1";

/// Per-dataset overrides of the built-in registry
#[derive(Deserialize, Default, Clone)]
pub struct DatasetOverride {
    /// direct CSV url, bypassing dataset metadata resolution
    pub url: Option<String>,
}

#[derive(Deserialize)]
pub struct Settings {
    /// seconds between scheduled refreshes (absent: manual trigger only)
    pub refresh_interval_seconds: Option<u64>,
    /// per-attempt HTTP timeout (default: 30s)
    pub fetch_timeout_seconds: Option<u64>,
    /// extra attempts after a transient fetch failure (default: 3)
    pub fetch_max_retries: Option<u32>,
    /// TTL of read-side cache entries (default: 300s)
    pub cache_ttl_seconds: Option<u64>,
    /// base URL of the data.gouv.fr API (default: production)
    pub data_gouv_base_url: Option<String>,
    /// map of dataset ids and overrides
    pub datasets: Option<HashMap<String, DatasetOverride>>,
}

impl Settings {
    pub fn new(cfgfile: &str) -> Result<Self, ConfigError> {
        let cfg = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(cfgfile).required(true))
            .build()?;
        let mut settings: Settings = cfg.try_deserialize()?;
        settings.fetch_timeout_seconds = match settings.fetch_timeout_seconds {
            None => Some(DEFAULT_FETCH_TIMEOUT_SECONDS),
            Some(x) => Some(x),
        };
        settings.fetch_max_retries = match settings.fetch_max_retries {
            None => Some(DEFAULT_FETCH_MAX_RETRIES),
            Some(x) => Some(x),
        };
        settings.cache_ttl_seconds = match settings.cache_ttl_seconds {
            None => Some(DEFAULT_CACHE_TTL_SECONDS),
            Some(x) => Some(x),
        };
        settings.data_gouv_base_url = match settings.data_gouv_base_url {
            None => Some(DEFAULT_DATA_GOUV_BASE_URL.to_owned()),
            Some(x) => Some(x),
        };
        Ok(settings)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(
            self.fetch_timeout_seconds
                .unwrap_or(DEFAULT_FETCH_TIMEOUT_SECONDS),
        )
    }

    pub fn fetch_max_retries(&self) -> u32 {
        self.fetch_max_retries.unwrap_or(DEFAULT_FETCH_MAX_RETRIES)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_seconds.unwrap_or(DEFAULT_CACHE_TTL_SECONDS))
    }

    pub fn data_gouv_base_url(&self) -> &str {
        self.data_gouv_base_url
            .as_deref()
            .unwrap_or(DEFAULT_DATA_GOUV_BASE_URL)
    }

    pub fn dataset_url_override(&self, id: &str) -> Option<String> {
        self.datasets
            .as_ref()
            .and_then(|m| m.get(id))
            .and_then(|o| o.url.clone())
    }
}
