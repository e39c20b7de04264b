use std::io::Read;
use std::time::Duration;

use regex::Regex;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::ObjectName;
use crate::error::BcdataError;
use crate::http;
use crate::planner::{Filter, PageRequest};

const SERVICE: &str = "WFS";
pub const WFS_VERSION: &str = "2.0.0";

pub trait WfsClient: Send + Sync {
    fn hits(&self, object_name: &ObjectName, filter: &Filter) -> Result<u64, BcdataError>;

    fn describe(&self, object_name: &ObjectName) -> Result<FeatureType, BcdataError>;

    fn get_features(&self, request: &PageRequest) -> Result<Box<dyn Read + Send>, BcdataError>;
}

#[derive(Clone)]
pub struct WfsHttpClient {
    client: Client,
    base_url: String,
}

impl WfsHttpClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, BcdataError> {
        Ok(Self {
            client: http::build_client(SERVICE, timeout)?,
            base_url: base_url.to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn get(&self, params: &[(&str, String)]) -> Result<reqwest::blocking::Response, BcdataError> {
        let response =
            http::send_with_retries(SERVICE, || self.client.get(&self.base_url).query(params))?;
        http::check_status(SERVICE, response)
    }
}

impl WfsClient for WfsHttpClient {
    fn hits(&self, object_name: &ObjectName, filter: &Filter) -> Result<u64, BcdataError> {
        let mut params = vec![
            ("service", "WFS".to_string()),
            ("version", WFS_VERSION.to_string()),
            ("request", "GetFeature".to_string()),
            ("typeNames", object_name.to_string()),
            ("resultType", "hits".to_string()),
        ];
        params.extend(filter.query_pairs());
        let body = self
            .get(&params)?
            .text()
            .map_err(|err| BcdataError::http(SERVICE, err))?;
        let count = parse_number_matched(&body).ok_or_else(|| {
            BcdataError::decode(format!("feature count for {object_name}"), truncate(&body))
        })?;
        debug!(%object_name, count, "counted features");
        Ok(count)
    }

    fn describe(&self, object_name: &ObjectName) -> Result<FeatureType, BcdataError> {
        let params = [
            ("service", "WFS".to_string()),
            ("version", WFS_VERSION.to_string()),
            ("request", "DescribeFeatureType".to_string()),
            ("typeNames", object_name.to_string()),
            ("outputFormat", "application/json".to_string()),
        ];
        let description: Description = self
            .get(&params)?
            .json()
            .map_err(|err| BcdataError::decode(format!("schema of {object_name}"), err))?;
        description
            .feature_types
            .into_iter()
            .next()
            .ok_or_else(|| {
                BcdataError::decode(format!("schema of {object_name}"), "no feature types returned")
            })
    }

    fn get_features(&self, request: &PageRequest) -> Result<Box<dyn Read + Send>, BcdataError> {
        debug!(page = request.index, start_index = ?request.start_index, "requesting features");
        let response = self.get(&request.query_pairs())?;
        Ok(Box::new(response))
    }
}

#[derive(Debug, Deserialize)]
struct Description {
    #[serde(rename = "featureTypes", default)]
    feature_types: Vec<FeatureType>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureType {
    #[serde(rename = "typeName")]
    pub type_name: String,
    #[serde(default)]
    pub properties: Vec<Property>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(rename = "localType", default, skip_serializing_if = "Option::is_none")]
    pub local_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nillable: Option<bool>,
}

impl Property {
    pub fn is_geometry(&self) -> bool {
        self.type_name.starts_with("gml:")
    }
}

impl FeatureType {
    pub fn geometry_column(&self) -> Option<&str> {
        self.properties
            .iter()
            .find(|property| property.is_geometry())
            .map(|property| property.name.as_str())
    }

    pub fn default_sort_key(&self) -> Option<&str> {
        self.properties
            .iter()
            .filter(|property| !property.is_geometry())
            .map(|property| property.name.as_str())
            .min()
    }
}

pub fn parse_number_matched(body: &str) -> Option<u64> {
    let pattern = Regex::new(r#"numberMatched\s*[=:]\s*"?(\d+)"?"#).ok()?;
    pattern
        .captures(body)
        .and_then(|captures| captures.get(1))
        .and_then(|value| value.as_str().parse().ok())
}

fn truncate(body: &str) -> String {
    body.chars().take(200).collect()
}
