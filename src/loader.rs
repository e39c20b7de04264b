use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;
use url::Url;

use crate::domain::TableRef;
use crate::error::BcdataError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    Create,
    Append,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadOptions {
    pub crs: String,
    pub geometry_column: String,
    pub dim: Option<u8>,
    pub fid: Option<String>,
    pub promote_to_multi: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            crs: crate::config::DEFAULT_CRS.to_string(),
            geometry_column: "geom".to_string(),
            dim: None,
            fid: None,
            promote_to_multi: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadJob {
    pub page: usize,
    pub source_url: String,
    pub destination: TableRef,
    pub mode: LoadMode,
    pub options: LoadOptions,
}

pub trait Loader: Send + Sync {
    fn load(&self, job: &LoadJob) -> Result<(), BcdataError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgConnectionInfo {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub dbname: Option<String>,
}

impl PgConnectionInfo {
    pub fn from_url(database_url: &str) -> Result<Self, BcdataError> {
        let url = Url::parse(database_url)
            .map_err(|err| BcdataError::validation("database url", err.to_string()))?;
        if !matches!(url.scheme(), "postgres" | "postgresql") {
            return Err(BcdataError::validation(
                "database url",
                format!("unsupported scheme {}", url.scheme()),
            ));
        }
        let non_empty = |value: &str| (!value.is_empty()).then(|| value.to_string());
        Ok(Self {
            host: url.host_str().and_then(non_empty),
            port: url.port(),
            user: non_empty(url.username()),
            password: url.password().and_then(non_empty),
            dbname: non_empty(url.path().trim_start_matches('/')),
        })
    }

    pub fn to_ogr_datasource(&self) -> String {
        let mut parts = Vec::new();
        let port = self.port.map(|port| port.to_string());
        for (key, value) in [
            ("host", self.host.as_ref()),
            ("port", port.as_ref()),
            ("user", self.user.as_ref()),
            ("dbname", self.dbname.as_ref()),
            ("password", self.password.as_ref()),
        ] {
            if let Some(value) = value {
                parts.push(format!("{key}={}", conninfo_quote(value)));
            }
        }
        format!("PG:{}", parts.join(" "))
    }
}

fn conninfo_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|ch| !ch.is_whitespace() && ch != '\'' && ch != '\\')
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

#[derive(Clone)]
pub struct Ogr2OgrLoader {
    program: Option<PathBuf>,
    datasource: String,
    timeout: Option<Duration>,
}

impl Ogr2OgrLoader {
    pub fn new(
        program: Option<PathBuf>,
        connection: &PgConnectionInfo,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            program: program.or_else(|| find_in_path("ogr2ogr")),
            datasource: connection.to_ogr_datasource(),
            timeout,
        }
    }

    pub fn program(&self) -> Option<&Path> {
        self.program.as_deref()
    }

    fn require_program(&self) -> Result<&Path, BcdataError> {
        self.program()
            .ok_or_else(|| BcdataError::MissingTool("ogr2ogr".to_string()))
    }

    pub fn args(&self, job: &LoadJob) -> Vec<String> {
        build_args(&self.datasource, job)
    }

    fn run(&self, program: &Path, job: &LoadJob) -> Result<(), BcdataError> {
        let failure = |message: String| BcdataError::LoadJobFailure {
            table: job.destination.to_string(),
            page: job.page,
            message,
        };
        let mut stderr = tempfile::tempfile().map_err(|err| failure(err.to_string()))?;
        let stderr_handle = stderr.try_clone().map_err(|err| failure(err.to_string()))?;
        let mut child = Command::new(program)
            .args(self.args(job))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(stderr_handle))
            .spawn()
            .map_err(|err| failure(format!("could not start {}: {err}", program.display())))?;

        let started = Instant::now();
        let status: ExitStatus = loop {
            if let Some(status) = child.try_wait().map_err(|err| failure(err.to_string()))? {
                break status;
            }
            if let Some(timeout) = self.timeout {
                if started.elapsed() >= timeout {
                    // The child may have exited between the two calls.
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(BcdataError::Timeout(
                        format!("load of page {} into {}", job.page, job.destination),
                        timeout,
                    ));
                }
            }
            thread::sleep(Duration::from_millis(100));
        };
        debug!(
            page = job.page,
            table = %job.destination,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "ogr2ogr finished"
        );

        if status.success() {
            return Ok(());
        }
        let message = read_tail(&mut stderr)
            .filter(|text| !text.is_empty())
            .unwrap_or_else(|| format!("ogr2ogr exited with {status}"));
        Err(failure(message))
    }
}

impl Loader for Ogr2OgrLoader {
    fn load(&self, job: &LoadJob) -> Result<(), BcdataError> {
        let program = self.require_program()?;
        self.run(program, job)
    }
}

pub fn build_args(datasource: &str, job: &LoadJob) -> Vec<String> {
    let options = &job.options;
    let mut args: Vec<String> = Vec::new();
    let mut push = |values: &[&str]| args.extend(values.iter().map(|value| value.to_string()));

    if job.mode == LoadMode::Append {
        push(&["-update", "-append"]);
    }
    push(&["--config", "PG_USE_COPY", "YES"]);
    push(&["-f", "PostgreSQL", datasource]);
    push(&["-t_srs", options.crs.as_str()]);
    match job.mode {
        LoadMode::Create => {
            let schema = format!("SCHEMA={}", job.destination.schema);
            let geometry = format!("GEOMETRY_NAME={}", options.geometry_column);
            push(&["-lco", "OVERWRITE=YES"]);
            push(&["-lco", schema.as_str(), "-lco", geometry.as_str()]);
            push(&["-lco", "UNLOGGED=ON", "-lco", "SPATIAL_INDEX=NONE"]);
            if let Some(fid) = &options.fid {
                let fid = format!("FID={}", fid.to_lowercase());
                push(&["-lco", fid.as_str()]);
            }
            push(&["-nln", job.destination.table.as_str()]);
        }
        LoadMode::Append => {
            let name = job.destination.to_string();
            push(&["-nln", name.as_str()]);
        }
    }
    if let Some(dim) = options.dim {
        let dim = dim.to_string();
        push(&["-dim", dim.as_str()]);
    }
    if options.promote_to_multi {
        push(&["-nlt", "PROMOTE_TO_MULTI"]);
    }
    push(&[job.source_url.as_str()]);
    args
}

fn read_tail(file: &mut File) -> Option<String> {
    file.seek(SeekFrom::Start(0)).ok()?;
    let mut text = String::new();
    file.read_to_string(&mut text).ok()?;
    let lines = text.lines().collect::<Vec<_>>();
    let start = lines.len().saturating_sub(5);
    Some(lines[start..].join("\n").trim().to_string())
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let exe = path.join(format!("{name}.exe"));
        if exe.exists() {
            return Some(exe);
        }
        let plain = path.join(name);
        if plain.exists() {
            return Some(plain);
        }
    }
    None
}
