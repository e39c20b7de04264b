use std::collections::HashSet;
use std::io::{Cursor, Read};
use std::sync::Mutex;

use assert_matches::assert_matches;
use serde_json::{Value, json};

use bcdata::domain::{Bounds, ObjectName};
use bcdata::error::BcdataError;
use bcdata::fetch::FetchExecutor;
use bcdata::planner::{FeatureQuery, Filter, PageRequest, RequestPlanner};
use bcdata::wfs::{FeatureType, WfsClient};

struct MockWfs {
    total: u64,
    hits_calls: Mutex<usize>,
    describe_calls: Mutex<usize>,
    filters: Mutex<Vec<Filter>>,
    properties: Value,
}

impl MockWfs {
    fn new(total: u64) -> Self {
        Self {
            total,
            hits_calls: Mutex::new(0),
            describe_calls: Mutex::new(0),
            filters: Mutex::new(Vec::new()),
            properties: json!([
                {"name": "SHAPE", "type": "gml:Point"},
                {"name": "SEQUENCE_ID", "type": "xsd:decimal"},
                {"name": "AIRPORT_NAME", "type": "xsd:string"}
            ]),
        }
    }
}

impl WfsClient for MockWfs {
    fn hits(&self, _object_name: &ObjectName, filter: &Filter) -> Result<u64, BcdataError> {
        *self.hits_calls.lock().unwrap() += 1;
        self.filters.lock().unwrap().push(filter.clone());
        Ok(self.total)
    }

    fn describe(&self, object_name: &ObjectName) -> Result<FeatureType, BcdataError> {
        *self.describe_calls.lock().unwrap() += 1;
        Ok(serde_json::from_value(json!({
            "typeName": object_name.table(),
            "properties": self.properties,
        }))
        .unwrap())
    }

    fn get_features(&self, request: &PageRequest) -> Result<Box<dyn Read + Send>, BcdataError> {
        let start = request.start_index.unwrap_or(0);
        let end = request
            .count
            .map(|count| (start + count).min(self.total))
            .unwrap_or(self.total);
        let features = (start..end)
            .map(|index| {
                json!({
                    "type": "Feature",
                    "id": format!("GSR_AIRPORTS_SVW.fid-{index}"),
                    "geometry": {"type": "Point", "coordinates": [1_000_000.0, 500_000.0]},
                    "properties": {"SEQUENCE_ID": index}
                })
            })
            .collect::<Vec<_>>();
        let body = json!({
            "type": "FeatureCollection",
            "features": features,
            "totalFeatures": self.total,
        });
        Ok(Box::new(Cursor::new(serde_json::to_vec(&body).unwrap())))
    }
}

fn query() -> FeatureQuery {
    FeatureQuery {
        object_name: "WHSE_IMAGERY_AND_BASE_MAPS.GSR_AIRPORTS_SVW".parse().unwrap(),
        cql_filter: None,
        bounds: None,
        bounds_crs: "EPSG:3005".to_string(),
        crs: "EPSG:3005".to_string(),
        sortby: None,
    }
}

#[test]
fn paged_plan_partitions_total() {
    let wfs = MockWfs::new(455);
    let plan = RequestPlanner::new(&wfs).plan(&query(), 250).unwrap();

    assert_eq!(plan.total_count, 455);
    assert_eq!(plan.pages().len(), 2);
    assert_eq!(plan.pages()[0].offsets(), (0, 250));
    assert_eq!(plan.pages()[1].offsets(), (250, 455));
    for page in plan.pages() {
        assert_eq!(page.count, Some(250));
        assert_eq!(page.sort_by.as_deref(), Some("AIRPORT_NAME"));
    }

    let collection = FetchExecutor::new(&wfs).fetch_all(&plan).unwrap();
    assert_eq!(collection.len(), 455);
    let ids = collection
        .features
        .iter()
        .map(|feature| feature.id.clone().unwrap().to_string())
        .collect::<HashSet<_>>();
    assert_eq!(ids.len(), 455);
}

#[test]
fn small_result_is_one_unrestricted_request() {
    let wfs = MockWfs::new(42);
    let plan = RequestPlanner::new(&wfs).plan(&query(), 10_000).unwrap();

    assert!(!plan.is_paged());
    let page = &plan.pages()[0];
    assert_eq!(page.start_index, None);
    assert_eq!(page.count, None);
    assert_eq!(page.sort_by, None);
    assert_eq!(page.expected, 42);
    assert_eq!(*wfs.describe_calls.lock().unwrap(), 0);

    let keys = page
        .query_pairs()
        .into_iter()
        .map(|(key, _)| key)
        .collect::<Vec<_>>();
    assert!(!keys.contains(&"startIndex"));
    assert!(!keys.contains(&"sortBy"));
}

#[test]
fn zero_pagesize_rejected_without_requests() {
    let wfs = MockWfs::new(455);
    let err = RequestPlanner::new(&wfs).plan(&query(), 0).unwrap_err();
    assert_matches!(err, BcdataError::Validation { .. });
    assert_eq!(*wfs.hits_calls.lock().unwrap(), 0);
}

#[test]
fn caller_sort_key_skips_describe() {
    let wfs = MockWfs::new(455);
    let mut query = query();
    query.sortby = Some("SEQUENCE_ID".to_string());
    let plan = RequestPlanner::new(&wfs).plan(&query, 100).unwrap();

    assert_eq!(plan.pages().len(), 5);
    assert_eq!(plan.pages()[4].offsets(), (400, 455));
    assert_eq!(plan.pages()[0].sort_by.as_deref(), Some("SEQUENCE_ID"));
    assert_eq!(*wfs.describe_calls.lock().unwrap(), 0);
}

#[test]
fn paging_without_sortable_property_is_configuration_error() {
    let mut wfs = MockWfs::new(455);
    wfs.properties = json!([{"name": "SHAPE", "type": "gml:MultiPolygon"}]);
    let err = RequestPlanner::new(&wfs).plan(&query(), 250).unwrap_err();
    assert_matches!(err, BcdataError::Configuration(_));
}

#[test]
fn bounds_alone_use_bbox_parameter() {
    let wfs = MockWfs::new(3);
    let mut query = query();
    query.bounds = Some(Bounds::new(1_000_000.0, 500_000.0, 1_100_000.0, 600_000.0));
    RequestPlanner::new(&wfs).plan(&query, 250).unwrap();

    let filters = wfs.filters.lock().unwrap();
    assert_eq!(
        filters[0].bbox.as_deref(),
        Some("1000000,500000,1100000,600000,EPSG:3005")
    );
    assert_eq!(filters[0].cql_filter, None);
}

#[test]
fn bounds_with_cql_fold_into_filter() {
    let wfs = MockWfs::new(3);
    let mut query = query();
    query.cql_filter = Some("AIRPORT_NAME LIKE '%Victoria%'".to_string());
    query.bounds = Some(Bounds::new(1.0, 2.0, 3.0, 4.0));
    RequestPlanner::new(&wfs).plan(&query, 250).unwrap();

    let filters = wfs.filters.lock().unwrap();
    assert_eq!(filters[0].bbox, None);
    assert_eq!(
        filters[0].cql_filter.as_deref(),
        Some("(AIRPORT_NAME LIKE '%Victoria%') AND BBOX(SHAPE, 1, 2, 3, 4, 'EPSG:3005')")
    );
}

#[test]
fn zero_area_bounds_plan_empty_result() {
    let wfs = MockWfs::new(0);
    let mut query = query();
    query.bounds = Some(Bounds::new(1.0, 1.0, 1.0, 1.0));
    let plan = RequestPlanner::new(&wfs).plan(&query, 250).unwrap();
    assert_eq!(plan.total_count, 0);
    assert_eq!(plan.pages().len(), 1);

    let collection = FetchExecutor::new(&wfs).fetch_all(&plan).unwrap();
    assert!(collection.is_empty());
}

#[test]
fn stream_matches_batch() {
    let wfs = MockWfs::new(30);
    let plan = RequestPlanner::new(&wfs).plan(&query(), 250).unwrap();
    let executor = FetchExecutor::new(&wfs);

    let batch = executor.fetch(&plan.pages()[0]).unwrap();
    let streamed = executor
        .stream(&plan.pages()[0])
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(batch.features, streamed);
}

#[test]
fn page_url_carries_paging_parameters() {
    let wfs = MockWfs::new(455);
    let plan = RequestPlanner::new(&wfs).plan(&query(), 250).unwrap();
    let url = plan.pages()[1]
        .url("https://openmaps.gov.bc.ca/geo/pub/wfs")
        .unwrap();
    assert!(url.starts_with("https://openmaps.gov.bc.ca/geo/pub/wfs?service=WFS"));
    assert!(url.contains("typeNames=WHSE_IMAGERY_AND_BASE_MAPS.GSR_AIRPORTS_SVW"));
    assert!(url.contains("sortBy=AIRPORT_NAME"));
    assert!(url.contains("startIndex=250"));
    assert!(url.contains("count=250"));
}
