use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::BcdataError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObjectName {
    schema: String,
    table: String,
}

impl ObjectName {
    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn to_table_ref(&self) -> TableRef {
        TableRef::new(self.schema.to_lowercase(), self.table.to_lowercase())
    }
}

impl fmt::Display for ObjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

impl FromStr for ObjectName {
    type Err = BcdataError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_uppercase();
        let (schema, table) = normalized
            .split_once('.')
            .ok_or_else(|| BcdataError::validation("object name", value))?;
        let is_part = |part: &str| {
            !part.is_empty() && part.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
        };
        if !is_part(schema) || !is_part(table) {
            return Err(BcdataError::validation("object name", value));
        }
        Ok(Self {
            schema: schema.to_string(),
            table: table.to_string(),
        })
    }
}

impl TryFrom<String> for ObjectName {
    type Error = BcdataError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ObjectName> for String {
    fn from(value: ObjectName) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DatasetName(String);

impl DatasetName {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn alias_key(&self) -> String {
        self.0.to_lowercase()
    }
}

impl fmt::Display for DatasetName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DatasetName {
    type Err = BcdataError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() || trimmed.chars().any(char::is_whitespace) {
            return Err(BcdataError::validation("dataset name", value));
        }
        Ok(Self(trimmed.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Bounds {
    pub xmin: f64,
    pub ymin: f64,
    pub xmax: f64,
    pub ymax: f64,
}

impl Bounds {
    pub fn new(xmin: f64, ymin: f64, xmax: f64, ymax: f64) -> Self {
        Self {
            xmin,
            ymin,
            xmax,
            ymax,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.xmin >= self.xmax || self.ymin >= self.ymax
    }

    pub fn to_param(&self) -> String {
        format!("{},{},{},{}", self.xmin, self.ymin, self.xmax, self.ymax)
    }
}

impl FromStr for Bounds {
    type Err = BcdataError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid =
            || BcdataError::validation("bounds", format!("{value:?} is not a valid bounding box"));
        let stripped = value
            .trim_matches(|ch: char| ch == ',' || ch == '[' || ch == ']' || ch.is_whitespace());
        let coords = stripped
            .split(|ch: char| ch == ',' || ch.is_whitespace())
            .filter(|part| !part.is_empty())
            .map(|part| part.parse::<f64>().map_err(|_| invalid()))
            .collect::<Result<Vec<_>, _>>()?;
        match coords.as_slice() {
            [xmin, ymin, xmax, ymax] if coords.iter().all(|c| c.is_finite()) => {
                Ok(Self::new(*xmin, *ymin, *xmax, *ymax))
            }
            _ => Err(invalid()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TableRef {
    pub schema: String,
    pub table: String,
}

impl TableRef {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }

    pub fn with_table(&self, table: impl Into<String>) -> Self {
        Self::new(self.schema.clone(), table)
    }

    pub fn quoted(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.table))
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}
