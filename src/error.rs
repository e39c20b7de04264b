use std::path::PathBuf;
use std::time::Duration;

use miette::Diagnostic;
use thiserror::Error;

use crate::bulk::PageFailure;

#[derive(Debug, Error, Diagnostic)]
pub enum BcdataError {
    #[error("dataset not found in catalogue: {0}")]
    #[diagnostic(help("run `bcdata list` to see available datasets"))]
    NotFound(String),

    #[error("invalid {field}: {message}")]
    Validation { field: String, message: String },

    #[error("{0}")]
    Configuration(String),

    #[error("{service} returned status {status}: {body}")]
    Upstream {
        service: String,
        status: u16,
        body: String,
    },

    #[error("{service} request failed: {message}")]
    Http { service: String, message: String },

    #[error("failed to decode {context}: {message}")]
    Decode { context: String, message: String },

    #[error("load of page {page} into {table} failed: {message}")]
    LoadJobFailure {
        table: String,
        page: usize,
        message: String,
    },

    #[error(
        "{} of {total_pages} pages failed to load into {table}: {}{}",
        .failed.len(),
        describe_failures(.failed),
        describe_cleanup(.cleanup)
    )]
    #[diagnostic(help("re-run the failed pages, or the whole load, once the cause is fixed"))]
    PartialFailure {
        table: String,
        total_pages: usize,
        failed: Vec<PageFailure>,
        cleanup: Option<String>,
    },

    #[error("database error on {context}: {message}")]
    Database { context: String, message: String },

    #[error("required tool not found: {0}")]
    #[diagnostic(help("install GDAL so that ogr2ogr is on PATH, or set BCDATA_OGR2OGR"))]
    MissingTool(String),

    #[error("{0} timed out after {1:?}")]
    Timeout(String, Duration),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),
}

impl BcdataError {
    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.to_string(),
            message: message.into(),
        }
    }

    pub fn http(service: &str, err: impl ToString) -> Self {
        Self::Http {
            service: service.to_string(),
            message: err.to_string(),
        }
    }

    pub fn decode(context: impl Into<String>, err: impl ToString) -> Self {
        Self::Decode {
            context: context.into(),
            message: err.to_string(),
        }
    }

    pub fn database(context: impl Into<String>, err: impl ToString) -> Self {
        Self::Database {
            context: context.into(),
            message: err.to_string(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::MissingTool(_) | Self::Cancelled(_))
    }
}

fn describe_failures(failed: &[PageFailure]) -> String {
    failed
        .iter()
        .map(|failure| format!("page {} ({})", failure.page, failure.table))
        .collect::<Vec<_>>()
        .join(", ")
}

fn describe_cleanup(cleanup: &Option<String>) -> String {
    cleanup
        .as_ref()
        .map(|message| format!("; finalizing the table also failed: {message}"))
        .unwrap_or_default()
}
