use std::io::Write;

use serde::Serialize;
use tracing::info;

use crate::bulk::{BulkLoadOptions, BulkLoader, LoadReport};
use crate::catalog::{CatalogClient, CatalogResolver};
use crate::config::{DEFAULT_CRS, Settings};
use crate::db::Database;
use crate::domain::{Bounds, DatasetName, ObjectName, TableRef};
use crate::error::BcdataError;
use crate::fetch::FetchExecutor;
use crate::loader::{LoadOptions, Loader};
use crate::planner::{FeatureQuery, Filter, RequestPlan, RequestPlanner};
use crate::wfs::{FeatureType, WfsClient};

#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub query: Option<String>,
    pub bounds: Option<String>,
    pub bounds_crs: Option<String>,
    pub crs: Option<String>,
    pub pagesize: Option<u64>,
    pub sortby: Option<String>,
}

impl QueryOptions {
    pub fn validate(&self) -> Result<Option<Bounds>, BcdataError> {
        if self.pagesize == Some(0) {
            return Err(BcdataError::validation("pagesize", "must be greater than zero"));
        }
        self.bounds.as_deref().map(str::parse::<Bounds>).transpose()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Bc2pgOptions {
    pub schema: Option<String>,
    pub table: Option<String>,
    pub workers: Option<usize>,
    pub fid: Option<String>,
    pub dim: Option<u8>,
}

impl Bc2pgOptions {
    pub fn validate(&self) -> Result<(), BcdataError> {
        if let Some(dim) = self.dim {
            if !matches!(dim, 2 | 3) {
                return Err(BcdataError::validation("dim", format!("{dim} is not 2 or 3")));
            }
        }
        if self.workers == Some(0) {
            return Err(BcdataError::validation("workers", "must be greater than zero"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ListResult {
    pub datasets: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InfoResult {
    pub name: String,
    pub count: u64,
    pub geometry_column: Option<String>,
    pub schema: FeatureType,
}

#[derive(Debug, Clone, Serialize)]
pub struct DumpResult {
    pub name: String,
    pub pages: usize,
    pub features: u64,
}

pub struct App<C: CatalogClient, W: WfsClient> {
    settings: Settings,
    resolver: CatalogResolver<C>,
    wfs: W,
}

impl<C: CatalogClient, W: WfsClient> App<C, W> {
    pub fn new(settings: Settings, resolver: CatalogResolver<C>, wfs: W) -> Self {
        Self {
            settings,
            resolver,
            wfs,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn list(&self, refresh: bool) -> Result<ListResult, BcdataError> {
        let datasets = self
            .resolver
            .list(refresh)?
            .into_iter()
            .map(|name| name.to_string())
            .collect();
        Ok(ListResult { datasets })
    }

    pub fn resolve(&self, dataset: &str) -> Result<ObjectName, BcdataError> {
        let name: DatasetName = dataset.parse()?;
        self.resolver.resolve(&name)
    }

    pub fn count(&self, dataset: &str) -> Result<u64, BcdataError> {
        let object_name = self.resolve(dataset)?;
        self.hits(object_name)
    }

    pub fn info(&self, dataset: &str) -> Result<InfoResult, BcdataError> {
        let object_name = self.resolve(dataset)?;
        let count = self.hits(object_name.clone())?;
        let schema = self.wfs.describe(&object_name)?;
        Ok(InfoResult {
            name: object_name.to_string(),
            count,
            geometry_column: schema.geometry_column().map(str::to_string),
            schema,
        })
    }

    fn hits(&self, object_name: ObjectName) -> Result<u64, BcdataError> {
        let query = self.feature_query(object_name.clone(), &QueryOptions::default(), None);
        self.wfs.hits(&object_name, &Filter::new(&query, None)?)
    }

    pub fn plan(&self, dataset: &str, options: &QueryOptions) -> Result<RequestPlan, BcdataError> {
        let name: DatasetName = dataset.parse()?;
        let bounds = options.validate()?;
        let pagesize = options.pagesize.unwrap_or(self.settings.pagesize);
        let object_name = self.resolver.resolve(&name)?;
        let query = self.feature_query(object_name, options, bounds);
        RequestPlanner::new(&self.wfs).plan(&query, pagesize)
    }

    pub fn dump(
        &self,
        dataset: &str,
        options: &QueryOptions,
        stream: bool,
        mut out: impl Write,
    ) -> Result<DumpResult, BcdataError> {
        let plan = self.plan(dataset, options)?;
        let name = plan.pages()[0].object_name.to_string();
        let executor = FetchExecutor::new(&self.wfs);
        let write_err = |err: std::io::Error| BcdataError::Filesystem(err.to_string());

        let features = if stream {
            let mut written = 0u64;
            for page in plan.pages() {
                for feature in executor.stream(page)? {
                    serde_json::to_writer(&mut out, &feature?)
                        .map_err(|err| BcdataError::Filesystem(err.to_string()))?;
                    out.write_all(b"\n").map_err(write_err)?;
                    written += 1;
                }
            }
            written
        } else {
            let collection = executor.fetch_all(&plan)?;
            serde_json::to_writer(&mut out, &collection)
                .map_err(|err| BcdataError::Filesystem(err.to_string()))?;
            out.write_all(b"\n").map_err(write_err)?;
            collection.len() as u64
        };
        out.flush().map_err(write_err)?;

        info!(name = %name, features, "dump complete");
        Ok(DumpResult {
            name,
            pages: plan.pages().len(),
            features,
        })
    }

    pub fn bc2pg<L: Loader, D: Database>(
        &self,
        dataset: &str,
        options: &QueryOptions,
        load: &Bc2pgOptions,
        loader: &L,
        db: &D,
    ) -> Result<LoadReport, BcdataError> {
        load.validate()?;
        let workers = load.workers.unwrap_or(self.settings.workers);

        let plan = self.plan(dataset, options)?;
        let destination = destination_table(&plan.pages()[0].object_name, load);
        let options = BulkLoadOptions {
            workers,
            load: LoadOptions {
                crs: self.output_crs(options),
                dim: load.dim,
                fid: load.fid.clone(),
                ..LoadOptions::default()
            },
            ..BulkLoadOptions::default()
        };
        BulkLoader::new(loader, db, &self.settings.wfs_url).load(&plan, &destination, &options)
    }

    fn output_crs(&self, options: &QueryOptions) -> String {
        options
            .crs
            .clone()
            .unwrap_or_else(|| self.settings.crs.clone())
    }

    fn feature_query(
        &self,
        object_name: ObjectName,
        options: &QueryOptions,
        bounds: Option<Bounds>,
    ) -> FeatureQuery {
        FeatureQuery {
            object_name,
            cql_filter: options.query.clone().filter(|query| !query.trim().is_empty()),
            bounds,
            bounds_crs: options
                .bounds_crs
                .clone()
                .unwrap_or_else(|| DEFAULT_CRS.to_string()),
            crs: self.output_crs(options),
            sortby: options.sortby.clone(),
        }
    }
}

pub fn destination_table(object_name: &ObjectName, load: &Bc2pgOptions) -> TableRef {
    let default = object_name.to_table_ref();
    TableRef::new(
        load.schema
            .as_deref()
            .map(str::to_lowercase)
            .unwrap_or(default.schema),
        load.table
            .as_deref()
            .map(str::to_lowercase)
            .unwrap_or(default.table),
    )
}
