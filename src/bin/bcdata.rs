use std::fs::File;
use std::io::{self, BufWriter};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use bcdata::app::{App, Bc2pgOptions, QueryOptions};
use bcdata::catalog::{CatalogCache, CatalogHttpClient, CatalogResolver};
use bcdata::config::{ConfigLoader, Settings};
use bcdata::db::PgDatabase;
use bcdata::error::BcdataError;
use bcdata::loader::{Ogr2OgrLoader, PgConnectionInfo};
use bcdata::output::JsonOutput;
use bcdata::wfs::WfsHttpClient;

#[derive(Parser)]
#[command(name = "bcdata")]
#[command(about = "Fetch layers from the BC government WFS and load them into PostGIS")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true, help = "JSON config file (defaults to ./bcdata.json when present)")]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "List layers published on the WFS")]
    List(ListArgs),
    #[command(about = "Show a layer's feature count and schema")]
    Info(InfoArgs),
    #[command(about = "Write a layer as GeoJSON")]
    Dump(DumpArgs),
    #[command(about = "Load a layer into PostGIS")]
    Bc2pg(Bc2pgArgs),
}

#[derive(Args)]
struct ListArgs {
    #[arg(long, help = "Refetch the catalogue instead of using the cached copy")]
    refresh: bool,
}

#[derive(Args)]
struct InfoArgs {
    dataset: String,

    #[arg(long, conflicts_with = "name", help = "Print only the feature count")]
    count: bool,

    #[arg(long, help = "Print only the object name")]
    name: bool,

    #[arg(long)]
    indent: Option<usize>,
}

#[derive(Args, Clone)]
struct QueryArgs {
    #[arg(long, help = "CQL filter, e.g. \"AIRPORT_NAME LIKE '%Victoria%'\"")]
    query: Option<String>,

    #[arg(long, allow_hyphen_values = true, help = "\"xmin ymin xmax ymax\"")]
    bounds: Option<String>,

    #[arg(long)]
    bounds_crs: Option<String>,

    #[arg(long, help = "Output CRS (default EPSG:3005)")]
    crs: Option<String>,

    #[arg(long)]
    pagesize: Option<u64>,

    #[arg(long, help = "Property to order paged requests by")]
    sortby: Option<String>,
}

impl From<QueryArgs> for QueryOptions {
    fn from(args: QueryArgs) -> Self {
        Self {
            query: args.query,
            bounds: args.bounds,
            bounds_crs: args.bounds_crs,
            crs: args.crs,
            pagesize: args.pagesize,
            sortby: args.sortby,
        }
    }
}

#[derive(Args)]
struct DumpArgs {
    dataset: String,

    #[command(flatten)]
    query: QueryArgs,

    #[arg(long, short = 'o')]
    out_file: Option<String>,

    #[arg(long, help = "Write one feature per line as it arrives")]
    stream: bool,
}

#[derive(Args)]
struct Bc2pgArgs {
    dataset: String,

    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    db_url: Option<String>,

    #[command(flatten)]
    query: QueryArgs,

    #[arg(long, short = 'w', help = "Parallel load jobs")]
    workers: Option<usize>,

    #[arg(long, help = "Source field to keep as the primary key")]
    fid: Option<String>,

    #[arg(long, help = "Coordinate dimension, 2 or 3")]
    dim: Option<u8>,

    #[arg(long)]
    schema: Option<String>,

    #[arg(long)]
    table: Option<String>,

    #[arg(long, help = "Seconds before a single page load is killed")]
    timeout: Option<u64>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<BcdataError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &BcdataError) -> u8 {
    match error {
        BcdataError::NotFound(_)
        | BcdataError::Validation { .. }
        | BcdataError::Configuration(_)
        | BcdataError::ConfigRead(_)
        | BcdataError::ConfigParse(_) => 2,
        BcdataError::Upstream { .. }
        | BcdataError::Http { .. }
        | BcdataError::Decode { .. }
        | BcdataError::Database { .. }
        | BcdataError::LoadJobFailure { .. }
        | BcdataError::MissingTool(_)
        | BcdataError::Timeout(..) => 3,
        BcdataError::PartialFailure { .. } => 4,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = ConfigLoader::resolve(cli.config.as_deref())?;

    match cli.command {
        Commands::List(args) => run_list(args, settings),
        Commands::Info(args) => run_info(args, settings),
        Commands::Dump(args) => run_dump(args, settings),
        Commands::Bc2pg(args) => run_bc2pg(args, settings),
    }
}

fn build_app(settings: Settings) -> Result<App<CatalogHttpClient, WfsHttpClient>, BcdataError> {
    let cache = match CatalogCache::default_path() {
        Ok(path) => CatalogCache::persistent(path),
        Err(err) => {
            warn!(error = %err, "catalogue cache will not be persisted");
            CatalogCache::in_memory()
        }
    };
    let catalog = CatalogHttpClient::new(&settings.catalog_url, settings.http_timeout)?;
    let wfs = WfsHttpClient::new(&settings.wfs_url, settings.http_timeout)?;
    let resolver = CatalogResolver::new(catalog, Arc::new(cache));
    Ok(App::new(settings, resolver, wfs))
}

fn run_list(args: ListArgs, settings: Settings) -> miette::Result<()> {
    let app = build_app(settings)?;
    let result = app.list(args.refresh)?;
    JsonOutput::print_list(&result).into_diagnostic()?;
    Ok(())
}

fn run_info(args: InfoArgs, settings: Settings) -> miette::Result<()> {
    let app = build_app(settings)?;
    if args.name {
        println!("{}", app.resolve(&args.dataset)?);
        return Ok(());
    }
    if args.count {
        println!("{}", app.count(&args.dataset)?);
        return Ok(());
    }
    let result = app.info(&args.dataset)?;
    JsonOutput::print_info(&result, args.indent).into_diagnostic()?;
    Ok(())
}

fn run_dump(args: DumpArgs, settings: Settings) -> miette::Result<()> {
    let options = QueryOptions::from(args.query);
    options.validate()?;
    let app = build_app(settings)?;
    match &args.out_file {
        Some(path) => {
            let file = File::create(path).into_diagnostic()?;
            let result = app.dump(&args.dataset, &options, args.stream, BufWriter::new(file))?;
            JsonOutput::print_dump(&result).into_diagnostic()?;
        }
        None => {
            let stdout = io::stdout().lock();
            app.dump(&args.dataset, &options, args.stream, BufWriter::new(stdout))?;
        }
    }
    Ok(())
}

fn run_bc2pg(args: Bc2pgArgs, settings: Settings) -> miette::Result<()> {
    let options = QueryOptions::from(args.query);
    options.validate()?;
    let load = Bc2pgOptions {
        schema: args.schema,
        table: args.table,
        workers: args.workers,
        fid: args.fid,
        dim: args.dim,
    };
    load.validate()?;

    let db_url = args
        .db_url
        .or_else(|| settings.database_url.clone())
        .ok_or_else(|| {
            BcdataError::Configuration(
                "no database url: pass --db-url or set DATABASE_URL".to_string(),
            )
        })?;
    let connection = PgConnectionInfo::from_url(&db_url)?;
    let timeout = args
        .timeout
        .map(Duration::from_secs)
        .or(settings.load_timeout);
    let loader = Ogr2OgrLoader::new(settings.ogr2ogr.clone(), &connection, timeout);
    if loader.program().is_none() {
        return Err(BcdataError::MissingTool("ogr2ogr".to_string()).into());
    }
    let db = PgDatabase::connect(&db_url)?;

    let app = build_app(settings)?;
    let report = app.bc2pg(&args.dataset, &options, &load, &loader, &db)?;
    JsonOutput::print_load(&report).into_diagnostic()?;
    Ok(())
}
