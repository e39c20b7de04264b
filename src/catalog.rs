use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use directories::BaseDirs;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::domain::{DatasetName, ObjectName};
use crate::error::BcdataError;
use crate::http;

const SERVICE: &str = "catalogue";
const SEARCH_ROWS: u64 = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub alias: String,
    pub object_name: ObjectName,
}

pub trait CatalogClient: Send + Sync {
    fn search(&self) -> Result<Vec<CatalogEntry>, BcdataError>;
}

#[derive(Clone)]
pub struct CatalogHttpClient {
    client: Client,
    base_url: String,
}

impl CatalogHttpClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, BcdataError> {
        Ok(Self {
            client: http::build_client(SERVICE, timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn search_page(&self, start: u64) -> Result<SearchResult, BcdataError> {
        let url = format!("{}/action/package_search", self.base_url);
        let start = start.to_string();
        let rows = SEARCH_ROWS.to_string();
        let response = http::send_with_retries(SERVICE, || {
            self.client.get(&url).query(&[
                ("fq", "res_format:wms"),
                ("rows", rows.as_str()),
                ("start", start.as_str()),
            ])
        })?;
        let response = http::check_status(SERVICE, response)?;
        let body: SearchResponse = response
            .json()
            .map_err(|err| BcdataError::decode("catalogue search response", err))?;
        if !body.success {
            return Err(BcdataError::decode(
                "catalogue search response",
                "catalogue reported success=false",
            ));
        }
        Ok(body.result)
    }
}

impl CatalogClient for CatalogHttpClient {
    fn search(&self) -> Result<Vec<CatalogEntry>, BcdataError> {
        let mut packages = Vec::new();
        let mut start = 0u64;
        loop {
            let page = self.search_page(start)?;
            let received = page.results.len() as u64;
            packages.extend(page.results);
            start += received;
            debug!(start, total = page.count, "read catalogue page");
            if received == 0 || start >= page.count {
                break;
            }
        }
        Ok(entries_from_packages(&packages))
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    success: bool,
    result: SearchResult,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    count: u64,
    results: Vec<Package>,
}

#[derive(Debug, Deserialize)]
pub struct Package {
    pub name: String,
    #[serde(default)]
    pub object_name: Option<String>,
    #[serde(default)]
    pub resources: Vec<Resource>,
}

#[derive(Debug, Deserialize)]
pub struct Resource {
    #[serde(default)]
    pub object_name: Option<String>,
}

pub fn entries_from_packages(packages: &[Package]) -> Vec<CatalogEntry> {
    let mut entries = Vec::new();
    for package in packages {
        let candidates = package
            .object_name
            .iter()
            .chain(package.resources.iter().filter_map(|r| r.object_name.as_ref()));
        let mut seen = BTreeSet::new();
        for candidate in candidates {
            let Ok(object_name) = candidate.parse::<ObjectName>() else {
                continue;
            };
            if seen.insert(object_name.clone()) {
                entries.push(CatalogEntry {
                    alias: package.name.to_lowercase(),
                    object_name,
                });
            }
        }
    }
    entries
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Catalog {
    pub fetched_at: String,
    aliases: BTreeMap<String, ObjectName>,
    objects: BTreeSet<ObjectName>,
}

impl Catalog {
    pub fn from_entries(entries: Vec<CatalogEntry>) -> Self {
        let mut aliases = BTreeMap::new();
        let mut objects = BTreeSet::new();
        for entry in entries {
            objects.insert(entry.object_name.clone());
            aliases.entry(entry.alias).or_insert(entry.object_name);
        }
        Self {
            fetched_at: Utc::now().to_rfc3339(),
            aliases,
            objects,
        }
    }

    pub fn lookup(&self, name: &DatasetName) -> Option<&ObjectName> {
        if let Some(object) = self.aliases.get(&name.alias_key()) {
            return Some(object);
        }
        let object = name.as_str().parse::<ObjectName>().ok()?;
        self.objects.get(&object)
    }

    pub fn objects(&self) -> impl Iterator<Item = &ObjectName> {
        self.objects.iter()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[derive(Debug)]
pub struct CatalogCache {
    current: Mutex<Option<Arc<Catalog>>>,
    path: Option<Utf8PathBuf>,
}

impl CatalogCache {
    pub fn in_memory() -> Self {
        Self {
            current: Mutex::new(None),
            path: None,
        }
    }

    pub fn persistent(path: Utf8PathBuf) -> Self {
        Self {
            current: Mutex::new(None),
            path: Some(path),
        }
    }

    pub fn default_path() -> Result<Utf8PathBuf, BcdataError> {
        BaseDirs::new()
            .and_then(|dirs| {
                Utf8PathBuf::from_path_buf(dirs.home_dir().join(".cache").join("bcdata")).ok()
            })
            .map(|dir| dir.join("catalog.json"))
            .ok_or_else(|| BcdataError::Filesystem("unable to resolve cache directory".to_string()))
    }

    pub fn path(&self) -> Option<&Utf8Path> {
        self.path.as_deref()
    }

    pub fn is_warm(&self) -> bool {
        self.lock().is_some()
    }

    pub fn init<F>(&self, fetch: F) -> Result<Arc<Catalog>, BcdataError>
    where
        F: FnOnce() -> Result<Vec<CatalogEntry>, BcdataError>,
    {
        let mut current = self.lock();
        if let Some(catalog) = current.as_ref() {
            return Ok(Arc::clone(catalog));
        }
        let catalog = match self.read_disk() {
            Some(catalog) => Arc::new(catalog),
            None => self.fetch_and_store(fetch)?,
        };
        *current = Some(Arc::clone(&catalog));
        Ok(catalog)
    }

    pub fn refresh<F>(&self, fetch: F) -> Result<Arc<Catalog>, BcdataError>
    where
        F: FnOnce() -> Result<Vec<CatalogEntry>, BcdataError>,
    {
        let mut current = self.lock();
        let catalog = self.fetch_and_store(fetch)?;
        *current = Some(Arc::clone(&catalog));
        Ok(catalog)
    }

    pub fn clear(&self) -> Result<(), BcdataError> {
        let mut current = self.lock();
        *current = None;
        if let Some(path) = &self.path {
            if path.as_std_path().exists() {
                fs::remove_file(path.as_std_path())
                    .map_err(|err| BcdataError::Filesystem(err.to_string()))?;
            }
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Arc<Catalog>>> {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn fetch_and_store<F>(&self, fetch: F) -> Result<Arc<Catalog>, BcdataError>
    where
        F: FnOnce() -> Result<Vec<CatalogEntry>, BcdataError>,
    {
        let catalog = Catalog::from_entries(fetch()?);
        info!(layers = catalog.len(), "fetched catalogue listing");
        if let Some(path) = &self.path {
            if let Err(err) = write_catalog(path, &catalog) {
                warn!(path = %path, error = %err, "could not persist catalogue cache");
            }
        }
        Ok(Arc::new(catalog))
    }

    fn read_disk(&self) -> Option<Catalog> {
        let path = self.path.as_ref()?;
        let content = fs::read_to_string(path.as_std_path()).ok()?;
        match serde_json::from_str::<Catalog>(&content) {
            Ok(catalog) => {
                debug!(path = %path, fetched_at = %catalog.fetched_at, "using cached catalogue");
                Some(catalog)
            }
            Err(err) => {
                warn!(path = %path, error = %err, "ignoring unreadable catalogue cache");
                None
            }
        }
    }
}

fn write_catalog(path: &Utf8Path, catalog: &Catalog) -> Result<(), BcdataError> {
    let parent = path
        .parent()
        .ok_or_else(|| BcdataError::Filesystem("invalid cache path".to_string()))?;
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| BcdataError::Filesystem(err.to_string()))?;
    let content =
        serde_json::to_vec(catalog).map_err(|err| BcdataError::Filesystem(err.to_string()))?;
    let temp = tempfile::Builder::new()
        .prefix("bcdata-catalog")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| BcdataError::Filesystem(err.to_string()))?;
    fs::write(temp.path(), &content).map_err(|err| BcdataError::Filesystem(err.to_string()))?;
    temp.persist(path.as_std_path())
        .map_err(|err| BcdataError::Filesystem(err.to_string()))?;
    Ok(())
}

pub struct CatalogResolver<C: CatalogClient> {
    client: C,
    cache: Arc<CatalogCache>,
}

impl<C: CatalogClient> CatalogResolver<C> {
    pub fn new(client: C, cache: Arc<CatalogCache>) -> Self {
        Self { client, cache }
    }

    pub fn cache(&self) -> &CatalogCache {
        &self.cache
    }

    pub fn resolve(&self, name: &DatasetName) -> Result<ObjectName, BcdataError> {
        let catalog = self.cache.init(|| self.client.search())?;
        Self::lookup(&catalog, name)
    }

    pub fn resolve_refreshed(&self, name: &DatasetName) -> Result<ObjectName, BcdataError> {
        let catalog = self.cache.refresh(|| self.client.search())?;
        Self::lookup(&catalog, name)
    }

    pub fn list(&self, refresh: bool) -> Result<Vec<ObjectName>, BcdataError> {
        let catalog = if refresh {
            self.cache.refresh(|| self.client.search())?
        } else {
            self.cache.init(|| self.client.search())?
        };
        Ok(catalog.objects().cloned().collect())
    }

    fn lookup(catalog: &Catalog, name: &DatasetName) -> Result<ObjectName, BcdataError> {
        catalog
            .lookup(name)
            .cloned()
            .ok_or_else(|| BcdataError::NotFound(name.to_string()))
    }
}
