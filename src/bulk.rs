use serde::Serialize;
use tracing::{info, warn};

use crate::db::{Database, truncate_ident};
use crate::domain::TableRef;
use crate::error::BcdataError;
use crate::loader::{LoadJob, LoadMode, LoadOptions, Loader};
use crate::planner::{PageRequest, RequestPlan};
use crate::pool::run_jobs;

pub const DEFAULT_ID_COLUMN: &str = "ogc_fid";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageFailure {
    pub page: usize,
    pub start_index: Option<u64>,
    pub table: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct BulkLoadOptions {
    pub workers: usize,
    pub id_column: String,
    pub load: LoadOptions,
}

impl Default for BulkLoadOptions {
    fn default() -> Self {
        Self {
            workers: crate::config::DEFAULT_WORKERS,
            id_column: DEFAULT_ID_COLUMN.to_string(),
            load: LoadOptions::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub table: String,
    pub pages: usize,
    pub rows: u64,
    pub expected_rows: u64,
}

/// `<table>_<page:04>`, shortened to fit an identifier.
pub fn staging_table(destination: &TableRef, page: usize) -> TableRef {
    destination.with_table(truncate_ident(&destination.table, &format!("_{page:04}")))
}

pub struct BulkLoader<'a, L: Loader, D: Database> {
    loader: &'a L,
    db: &'a D,
    wfs_url: &'a str,
}

impl<'a, L: Loader, D: Database> BulkLoader<'a, L, D> {
    pub fn new(loader: &'a L, db: &'a D, wfs_url: &'a str) -> Self {
        Self {
            loader,
            db,
            wfs_url,
        }
    }

    pub fn load(
        &self,
        plan: &RequestPlan,
        destination: &TableRef,
        options: &BulkLoadOptions,
    ) -> Result<LoadReport, BcdataError> {
        let Some((first, rest)) = plan.pages().split_first() else {
            return Err(BcdataError::validation("plan", "no pages to load"));
        };
        let urls = plan
            .pages()
            .iter()
            .map(|page| page.url(self.wfs_url))
            .collect::<Result<Vec<_>, _>>()?;

        if !self.db.schema_exists(&destination.schema)? {
            info!(schema = %destination.schema, "creating schema");
            self.db.create_schema(&destination.schema)?;
        }

        info!(table = %destination, pages = plan.pages().len(), "loading page 0");
        self.loader.load(&LoadJob {
            page: first.index,
            source_url: urls[0].clone(),
            destination: destination.clone(),
            mode: LoadMode::Create,
            options: options.load.clone(),
        })?;

        let mut failures = Vec::new();
        let mut jobs = Vec::new();
        for (page, url) in rest.iter().zip(&urls[1..]) {
            let staging = staging_table(destination, page.index);
            let created = match self.db.table_exists(&staging) {
                Ok(true) => Err(BcdataError::Configuration(format!(
                    "staging table {staging} already exists; drop or rename it before loading"
                ))),
                Ok(false) => self.db.create_table_like(destination, &staging),
                Err(err) => Err(err),
            };
            match created {
                Ok(()) => jobs.push(LoadJob {
                    page: page.index,
                    source_url: url.clone(),
                    destination: staging,
                    mode: LoadMode::Append,
                    options: options.load.clone(),
                }),
                Err(err) => {
                    warn!(page = page.index, table = %staging, error = %err, "staging table not created");
                    failures.push(page_failure(page, &staging, &err));
                }
            }
        }

        let loader = self.loader;
        let outcomes = run_jobs(jobs, options.workers, |job| loader.load(job));

        let skip_column = options
            .load
            .fid
            .is_none()
            .then_some(options.id_column.as_str());
        let mut expected_rows = first.expected;
        let mut loaded_pages = 1;
        for outcome in outcomes {
            let job = outcome.job;
            let page = &plan.pages()[job.page];
            let merged = outcome
                .result
                .and_then(|()| self.db.append(&job.destination, destination, skip_column));
            match merged {
                Ok(rows) => {
                    info!(page = job.page, rows, table = %destination, "merged page");
                    expected_rows += page.expected;
                    loaded_pages += 1;
                }
                Err(err) => {
                    warn!(page = job.page, error = %err, "page failed");
                    failures.push(page_failure(page, &job.destination, &err));
                }
            }
            self.drop_staging(&job.destination);
        }

        let completed = self
            .finalize(destination, options)
            .and_then(|()| self.db.row_count(destination));

        if !failures.is_empty() {
            failures.sort_by_key(|failure| failure.page);
            let cleanup = match completed {
                Ok(rows) => {
                    check_row_count(destination, rows, expected_rows);
                    None
                }
                Err(err) => {
                    warn!(table = %destination, error = %err, "finalizing after failed pages");
                    Some(err.to_string())
                }
            };
            return Err(BcdataError::PartialFailure {
                table: destination.to_string(),
                total_pages: plan.pages().len(),
                failed: failures,
                cleanup,
            });
        }

        let rows = completed?;
        check_row_count(destination, rows, expected_rows);
        info!(table = %destination, rows, pages = loaded_pages, "load complete");
        Ok(LoadReport {
            table: destination.to_string(),
            pages: loaded_pages,
            rows,
            expected_rows,
        })
    }

    fn finalize(&self, destination: &TableRef, options: &BulkLoadOptions) -> Result<(), BcdataError> {
        self.db.set_logged(destination)?;
        self.db
            .create_spatial_index(destination, &options.load.geometry_column)?;
        if options.load.fid.is_none() {
            self.db
                .regenerate_primary_key(destination, &options.id_column)?;
        }
        Ok(())
    }

    fn drop_staging(&self, staging: &TableRef) {
        if let Err(err) = self.db.drop_table(staging) {
            warn!(table = %staging, error = %err, "failed to drop staging table");
        }
    }
}

fn check_row_count(destination: &TableRef, rows: u64, expected_rows: u64) {
    if rows != expected_rows {
        warn!(
            table = %destination,
            rows,
            expected_rows,
            "row count differs from the feature count reported by the service"
        );
    }
}

fn page_failure(page: &PageRequest, staging: &TableRef, err: &BcdataError) -> PageFailure {
    PageFailure {
        page: page.index,
        start_index: page.start_index,
        table: staging.to_string(),
        reason: err.to_string(),
    }
}
