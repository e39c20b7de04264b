use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::BcdataError;

pub const DEFAULT_WFS_URL: &str = "https://openmaps.gov.bc.ca/geo/pub/wfs";
pub const DEFAULT_CATALOG_URL: &str = "https://catalogue.data.gov.bc.ca/api/3";
pub const DEFAULT_CRS: &str = "EPSG:3005";
pub const DEFAULT_PAGESIZE: u64 = 10_000;
pub const DEFAULT_WORKERS: usize = 5;

const CONFIG_FILE: &str = "bcdata.json";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub wfs_url: Option<String>,
    #[serde(default)]
    pub catalog_url: Option<String>,
    #[serde(default)]
    pub crs: Option<String>,
    #[serde(default)]
    pub pagesize: Option<u64>,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub http_timeout_secs: Option<u64>,
    #[serde(default)]
    pub load_timeout_secs: Option<u64>,
    #[serde(default)]
    pub ogr2ogr: Option<String>,
    #[serde(default)]
    pub database_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub wfs_url: String,
    pub catalog_url: String,
    pub crs: String,
    pub pagesize: u64,
    pub workers: usize,
    pub http_timeout: Duration,
    pub load_timeout: Option<Duration>,
    pub ogr2ogr: Option<PathBuf>,
    pub database_url: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            wfs_url: DEFAULT_WFS_URL.to_string(),
            catalog_url: DEFAULT_CATALOG_URL.to_string(),
            crs: DEFAULT_CRS.to_string(),
            pagesize: DEFAULT_PAGESIZE,
            workers: DEFAULT_WORKERS,
            http_timeout: Duration::from_secs(60),
            load_timeout: None,
            ogr2ogr: None,
            database_url: None,
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<Settings, BcdataError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(CONFIG_FILE),
        };

        let config = if path.is_none() && !config_path.exists() {
            Config::default()
        } else {
            let content = fs::read_to_string(&config_path)
                .map_err(|_| BcdataError::ConfigRead(config_path.clone()))?;
            serde_json::from_str(&content)
                .map_err(|err| BcdataError::ConfigParse(err.to_string()))?
        };

        let settings = Self::resolve_config(config)?;
        Ok(Self::apply_env(settings, |key| std::env::var(key).ok()))
    }

    pub fn resolve_config(config: Config) -> Result<Settings, BcdataError> {
        let defaults = Settings::default();
        let pagesize = config.pagesize.unwrap_or(defaults.pagesize);
        if pagesize == 0 {
            return Err(BcdataError::validation("pagesize", "must be greater than zero"));
        }
        let workers = config.workers.unwrap_or(defaults.workers);
        if workers == 0 {
            return Err(BcdataError::validation("workers", "must be greater than zero"));
        }

        Ok(Settings {
            wfs_url: config.wfs_url.unwrap_or(defaults.wfs_url),
            catalog_url: config.catalog_url.unwrap_or(defaults.catalog_url),
            crs: config.crs.unwrap_or(defaults.crs),
            pagesize,
            workers,
            http_timeout: config
                .http_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.http_timeout),
            load_timeout: config.load_timeout_secs.map(Duration::from_secs),
            ogr2ogr: config.ogr2ogr.map(PathBuf::from),
            database_url: config.database_url,
        })
    }

    pub fn apply_env<F>(mut settings: Settings, lookup: F) -> Settings
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        if let Some(url) = lookup("BCDATA_WFS_URL") {
            settings.wfs_url = url;
        }
        if let Some(url) = lookup("BCDATA_CATALOG_URL") {
            settings.catalog_url = url;
        }
        if let Some(path) = lookup("BCDATA_OGR2OGR") {
            settings.ogr2ogr = Some(PathBuf::from(path));
        }
        if let Some(url) = lookup("DATABASE_URL") {
            settings.database_url = Some(url);
        }
        settings
    }
}
