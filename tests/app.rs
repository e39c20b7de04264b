use std::io::{Cursor, Read};
use std::sync::{Arc, Mutex};

use assert_matches::assert_matches;
use serde_json::{Value, json};

use bcdata::app::{App, Bc2pgOptions, QueryOptions};
use bcdata::bulk::LoadReport;
use bcdata::catalog::{CatalogCache, CatalogClient, CatalogEntry, CatalogResolver};
use bcdata::config::Settings;
use bcdata::db::Database;
use bcdata::domain::{ObjectName, TableRef};
use bcdata::error::BcdataError;
use bcdata::loader::{LoadJob, Loader};
use bcdata::planner::{Filter, PageRequest};
use bcdata::wfs::{FeatureType, WfsClient};

#[derive(Default)]
struct MockCatalog {
    calls: Mutex<usize>,
}

impl CatalogClient for MockCatalog {
    fn search(&self) -> Result<Vec<CatalogEntry>, BcdataError> {
        *self.calls.lock().unwrap() += 1;
        Ok(vec![
            CatalogEntry {
                alias: "bc-airports".to_string(),
                object_name: "WHSE_IMAGERY_AND_BASE_MAPS.GSR_AIRPORTS_SVW".parse().unwrap(),
            },
            CatalogEntry {
                alias: "freshwater-atlas-lakes".to_string(),
                object_name: "WHSE_BASEMAPPING.FWA_LAKES_POLY".parse().unwrap(),
            },
        ])
    }
}

struct MockWfs {
    total: u64,
    calls: Mutex<usize>,
    describes: Arc<Mutex<usize>>,
}

impl MockWfs {
    fn new(total: u64) -> Self {
        Self {
            total,
            calls: Mutex::new(0),
            describes: Arc::default(),
        }
    }
}

impl WfsClient for MockWfs {
    fn hits(&self, _object_name: &ObjectName, _filter: &Filter) -> Result<u64, BcdataError> {
        *self.calls.lock().unwrap() += 1;
        Ok(self.total)
    }

    fn describe(&self, object_name: &ObjectName) -> Result<FeatureType, BcdataError> {
        *self.calls.lock().unwrap() += 1;
        *self.describes.lock().unwrap() += 1;
        Ok(serde_json::from_value(json!({
            "typeName": object_name.table(),
            "properties": [
                {"name": "SHAPE", "type": "gml:Point"},
                {"name": "AIRPORT_NAME", "type": "xsd:string"}
            ]
        }))
        .unwrap())
    }

    fn get_features(&self, request: &PageRequest) -> Result<Box<dyn Read + Send>, BcdataError> {
        *self.calls.lock().unwrap() += 1;
        let start = request.start_index.unwrap_or(0);
        let end = request
            .count
            .map(|count| (start + count).min(self.total))
            .unwrap_or(self.total);
        let features = (start..end)
            .map(|index| json!({"type": "Feature", "id": index, "geometry": null, "properties": {}}))
            .collect::<Vec<_>>();
        let body = json!({"type": "FeatureCollection", "features": features});
        Ok(Box::new(Cursor::new(serde_json::to_vec(&body).unwrap())))
    }
}

struct NopLoader;

impl Loader for NopLoader {
    fn load(&self, _job: &LoadJob) -> Result<(), BcdataError> {
        panic!("loader must not be called");
    }
}

struct NopDb;

impl Database for NopDb {
    fn schema_exists(&self, _schema: &str) -> Result<bool, BcdataError> {
        panic!("database must not be called");
    }

    fn create_schema(&self, _schema: &str) -> Result<(), BcdataError> {
        unreachable!()
    }

    fn table_exists(&self, _table: &TableRef) -> Result<bool, BcdataError> {
        unreachable!()
    }

    fn create_table_like(&self, _template: &TableRef, _table: &TableRef) -> Result<(), BcdataError> {
        unreachable!()
    }

    fn append(
        &self,
        _source: &TableRef,
        _destination: &TableRef,
        _skip_column: Option<&str>,
    ) -> Result<u64, BcdataError> {
        unreachable!()
    }

    fn drop_table(&self, _table: &TableRef) -> Result<(), BcdataError> {
        unreachable!()
    }

    fn set_logged(&self, _table: &TableRef) -> Result<(), BcdataError> {
        unreachable!()
    }

    fn create_spatial_index(&self, _table: &TableRef, _column: &str) -> Result<(), BcdataError> {
        unreachable!()
    }

    fn regenerate_primary_key(&self, _table: &TableRef, _column: &str) -> Result<(), BcdataError> {
        unreachable!()
    }

    fn row_count(&self, _table: &TableRef) -> Result<u64, BcdataError> {
        unreachable!()
    }
}

fn app(total: u64) -> App<MockCatalog, MockWfs> {
    let resolver = CatalogResolver::new(MockCatalog::default(), Arc::new(CatalogCache::in_memory()));
    App::new(Settings::default(), resolver, MockWfs::new(total))
}

#[test]
fn three_element_bounds_fail_before_any_request() {
    let cache = Arc::new(CatalogCache::in_memory());
    let app = App::new(
        Settings::default(),
        CatalogResolver::new(MockCatalog::default(), Arc::clone(&cache)),
        MockWfs::new(10),
    );
    let options = QueryOptions {
        bounds: Some("1,2,3".to_string()),
        ..QueryOptions::default()
    };

    let err = app.plan("bc-airports", &options).unwrap_err();
    assert_matches!(err, BcdataError::Validation { ref field, .. } if field == "bounds");
    assert!(!cache.is_warm());
}

#[test]
fn unknown_alias_is_not_found() {
    let app = app(10);
    let err = app.info("no-such-layer").unwrap_err();
    assert_matches!(err, BcdataError::NotFound(_));
}

#[test]
fn list_is_sorted_object_names() {
    let result = app(10).list(false).unwrap();
    assert_eq!(
        result.datasets,
        vec![
            "WHSE_BASEMAPPING.FWA_LAKES_POLY".to_string(),
            "WHSE_IMAGERY_AND_BASE_MAPS.GSR_AIRPORTS_SVW".to_string()
        ]
    );
}

#[test]
fn info_reports_count_and_geometry() {
    let result = app(455).info("BC-Airports").unwrap();
    assert_eq!(result.name, "WHSE_IMAGERY_AND_BASE_MAPS.GSR_AIRPORTS_SVW");
    assert_eq!(result.count, 455);
    assert_eq!(result.geometry_column.as_deref(), Some("SHAPE"));
}

#[test]
fn count_skips_describe_feature_type() {
    let wfs = MockWfs::new(455);
    let describes = Arc::clone(&wfs.describes);
    let resolver = CatalogResolver::new(MockCatalog::default(), Arc::new(CatalogCache::in_memory()));
    let app = App::new(Settings::default(), resolver, wfs);

    assert_eq!(app.count("bc-airports").unwrap(), 455);
    assert_eq!(*describes.lock().unwrap(), 0);

    app.info("bc-airports").unwrap();
    assert_eq!(*describes.lock().unwrap(), 1);
}

#[test]
fn dump_writes_one_collection() {
    let options = QueryOptions {
        pagesize: Some(250),
        ..QueryOptions::default()
    };
    let mut out = Vec::new();
    let result = app(455)
        .dump("bc-airports", &options, false, &mut out)
        .unwrap();
    assert_eq!(result.pages, 2);
    assert_eq!(result.features, 455);

    let value: Value = serde_json::from_slice(&out).unwrap();
    assert_eq!(value["type"], "FeatureCollection");
    assert_eq!(value["features"].as_array().unwrap().len(), 455);
}

#[test]
fn dump_stream_writes_feature_per_line() {
    let options = QueryOptions {
        pagesize: Some(4),
        ..QueryOptions::default()
    };
    let mut out = Vec::new();
    let result = app(10)
        .dump("bc-airports", &options, true, &mut out)
        .unwrap();
    assert_eq!(result.pages, 3);

    let text = String::from_utf8(out).unwrap();
    let ids = text
        .lines()
        .map(|line| serde_json::from_str::<Value>(line).unwrap()["id"].as_u64().unwrap())
        .collect::<Vec<_>>();
    assert_eq!(ids, (0..10).collect::<Vec<_>>());
}

#[test]
fn bc2pg_rejects_bad_dim_before_any_request() {
    let app = app(10);
    let load = Bc2pgOptions {
        dim: Some(4),
        ..Bc2pgOptions::default()
    };
    let result: Result<LoadReport, _> =
        app.bc2pg("bc-airports", &QueryOptions::default(), &load, &NopLoader, &NopDb);
    assert_matches!(result, Err(BcdataError::Validation { .. }));
}
