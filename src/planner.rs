use serde::Serialize;
use tracing::info;
use url::Url;

use crate::domain::{Bounds, ObjectName};
use crate::error::BcdataError;
use crate::wfs::{FeatureType, WFS_VERSION, WfsClient};

#[derive(Debug, Clone)]
pub struct FeatureQuery {
    pub object_name: ObjectName,
    pub cql_filter: Option<String>,
    pub bounds: Option<Bounds>,
    pub bounds_crs: String,
    pub crs: String,
    pub sortby: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Filter {
    pub cql_filter: Option<String>,
    pub bbox: Option<String>,
}

impl Filter {
    // The service rejects `bbox` alongside `CQL_FILTER`; fold the bounds into the CQL.
    pub fn new(
        query: &FeatureQuery,
        geometry_column: Option<&str>,
    ) -> Result<Self, BcdataError> {
        let bbox = query
            .bounds
            .map(|bounds| format!("{},{}", bounds.to_param(), query.bounds_crs));
        match (&query.cql_filter, query.bounds) {
            (Some(cql), Some(bounds)) => {
                let column = geometry_column.ok_or_else(|| {
                    BcdataError::Configuration(format!(
                        "cannot combine bounds with a CQL filter: {} has no geometry column",
                        query.object_name
                    ))
                })?;
                Ok(Self {
                    cql_filter: Some(format!(
                        "({cql}) AND BBOX({column}, {}, {}, {}, {}, '{}')",
                        bounds.xmin, bounds.ymin, bounds.xmax, bounds.ymax, query.bounds_crs
                    )),
                    bbox: None,
                })
            }
            _ => Ok(Self {
                cql_filter: query.cql_filter.clone(),
                bbox,
            }),
        }
    }

    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if let Some(cql) = &self.cql_filter {
            pairs.push(("CQL_FILTER", cql.clone()));
        }
        if let Some(bbox) = &self.bbox {
            pairs.push(("bbox", bbox.clone()));
        }
        pairs
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageRequest {
    pub index: usize,
    pub object_name: ObjectName,
    pub filter: Filter,
    pub sort_by: Option<String>,
    pub start_index: Option<u64>,
    pub count: Option<u64>,
    pub srs_name: String,
    pub expected: u64,
}

impl PageRequest {
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("service", "WFS".to_string()),
            ("version", WFS_VERSION.to_string()),
            ("request", "GetFeature".to_string()),
            ("typeNames", self.object_name.to_string()),
            ("outputFormat", "json".to_string()),
            ("SRSNAME", self.srs_name.clone()),
        ];
        pairs.extend(self.filter.query_pairs());
        if let Some(sort_by) = &self.sort_by {
            pairs.push(("sortBy", sort_by.clone()));
        }
        if let Some(start_index) = self.start_index {
            pairs.push(("startIndex", start_index.to_string()));
        }
        if let Some(count) = self.count {
            pairs.push(("count", count.to_string()));
        }
        pairs
    }

    pub fn url(&self, base_url: &str) -> Result<String, BcdataError> {
        let url = Url::parse_with_params(base_url, self.query_pairs())
            .map_err(|err| BcdataError::validation("WFS url", err.to_string()))?;
        Ok(url.into())
    }

    pub fn offsets(&self) -> (u64, u64) {
        let start = self.start_index.unwrap_or(0);
        (start, start + self.expected)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestPlan {
    pub total_count: u64,
    pub pagesize: u64,
    pub pages: Vec<PageRequest>,
}

impl RequestPlan {
    pub fn pages(&self) -> &[PageRequest] {
        &self.pages
    }

    pub fn is_paged(&self) -> bool {
        self.pages.len() > 1
    }
}

pub fn page_windows(total: u64, pagesize: u64) -> Vec<(u64, u64)> {
    if pagesize == 0 {
        return Vec::new();
    }
    let pages = total.div_ceil(pagesize);
    (0..pages)
        .map(|page| {
            let start = page * pagesize;
            (start, pagesize.min(total - start))
        })
        .collect()
}

pub struct RequestPlanner<'a, W: WfsClient> {
    wfs: &'a W,
}

impl<'a, W: WfsClient> RequestPlanner<'a, W> {
    pub fn new(wfs: &'a W) -> Self {
        Self { wfs }
    }

    pub fn plan(&self, query: &FeatureQuery, pagesize: u64) -> Result<RequestPlan, BcdataError> {
        if pagesize == 0 {
            return Err(BcdataError::validation("pagesize", "must be greater than zero"));
        }

        let mut feature_type: Option<FeatureType> = None;
        let filter = if query.cql_filter.is_some() && query.bounds.is_some() {
            let described = self.wfs.describe(&query.object_name)?;
            let filter = Filter::new(query, described.geometry_column())?;
            feature_type = Some(described);
            filter
        } else {
            Filter::new(query, None)?
        };

        let total_count = self.wfs.hits(&query.object_name, &filter)?;
        let page = |index: usize, sort_by: Option<String>, window: Option<(u64, u64)>| {
            PageRequest {
                index,
                object_name: query.object_name.clone(),
                filter: filter.clone(),
                sort_by,
                start_index: window.map(|(start, _)| start),
                count: window.map(|_| pagesize),
                srs_name: query.crs.clone(),
                expected: window.map(|(_, len)| len).unwrap_or(total_count),
            }
        };

        if total_count <= pagesize {
            info!(object_name = %query.object_name, total_count, "single request");
            return Ok(RequestPlan {
                total_count,
                pagesize,
                pages: vec![page(0, query.sortby.clone(), None)],
            });
        }

        let sort_by = match &query.sortby {
            Some(sortby) => sortby.clone(),
            None => {
                let described = match feature_type {
                    Some(described) => described,
                    None => self.wfs.describe(&query.object_name)?,
                };
                described
                    .default_sort_key()
                    .map(str::to_string)
                    .ok_or_else(|| {
                        BcdataError::Configuration(format!(
                            "{} needs a sort key to be paged but has no sortable properties; pass --sortby",
                            query.object_name
                        ))
                    })?
            }
        };

        let pages = page_windows(total_count, pagesize)
            .into_iter()
            .enumerate()
            .map(|(index, window)| page(index, Some(sort_by.clone()), Some(window)))
            .collect::<Vec<_>>();
        info!(
            object_name = %query.object_name,
            total_count,
            pages = pages.len(),
            sort_by = %sort_by,
            "planned paged requests"
        );
        Ok(RequestPlan {
            total_count,
            pagesize,
            pages,
        })
    }
}
