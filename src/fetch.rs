use std::io::{BufReader, Bytes, Read};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::error::BcdataError;
use crate::planner::{PageRequest, RequestPlan};
use crate::wfs::WfsClient;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default)]
    pub geometry: Option<Value>,
    #[serde(default)]
    pub properties: Option<Map<String, Value>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureCollection {
    #[serde(rename = "type")]
    pub kind: String,
    pub features: Vec<Feature>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crs: Option<Value>,
}

impl FeatureCollection {
    pub fn empty() -> Self {
        Self {
            kind: "FeatureCollection".to_string(),
            features: Vec::new(),
            crs: None,
        }
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

pub fn parse_collection(body: &[u8], context: &str) -> Result<FeatureCollection, BcdataError> {
    let collection: FeatureCollection =
        serde_json::from_slice(body).map_err(|err| BcdataError::decode(context, err))?;
    if collection.kind != "FeatureCollection" {
        return Err(BcdataError::decode(
            context,
            format!("expected a FeatureCollection, got {}", collection.kind),
        ));
    }
    Ok(collection)
}

pub struct FetchExecutor<'a, W: WfsClient> {
    wfs: &'a W,
}

impl<'a, W: WfsClient> FetchExecutor<'a, W> {
    pub fn new(wfs: &'a W) -> Self {
        Self { wfs }
    }

    pub fn fetch(&self, page: &PageRequest) -> Result<FeatureCollection, BcdataError> {
        let mut body = self.wfs.get_features(page)?;
        let mut buffer = Vec::new();
        body.read_to_end(&mut buffer)
            .map_err(|err| BcdataError::http("WFS", err))?;
        let collection = parse_collection(&buffer, &page_context(page))?;
        debug!(page = page.index, features = collection.len(), "fetched page");
        Ok(collection)
    }

    pub fn stream(
        &self,
        page: &PageRequest,
    ) -> Result<FeatureStream<Box<dyn Read + Send>>, BcdataError> {
        let body = self.wfs.get_features(page)?;
        Ok(FeatureStream::new(body, page_context(page)))
    }

    pub fn fetch_all(&self, plan: &RequestPlan) -> Result<FeatureCollection, BcdataError> {
        let mut combined = FeatureCollection::empty();
        for page in plan.pages() {
            let collection = self.fetch(page)?;
            if combined.crs.is_none() {
                combined.crs = collection.crs;
            }
            combined.features.extend(collection.features);
        }
        info!(
            features = combined.len(),
            expected = plan.total_count,
            "fetched all pages"
        );
        Ok(combined)
    }
}

fn page_context(page: &PageRequest) -> String {
    format!("page {} of {}", page.index, page.object_name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Start,
    Items,
    Done,
}

/// Single-pass iterator over the `features` array of a GeoJSON FeatureCollection.
pub struct FeatureStream<R: Read> {
    bytes: Bytes<BufReader<R>>,
    state: StreamState,
    context: String,
}

impl<R: Read> FeatureStream<R> {
    pub fn new(reader: R, context: impl Into<String>) -> Self {
        Self {
            bytes: BufReader::new(reader).bytes(),
            state: StreamState::Start,
            context: context.into(),
        }
    }

    fn error(&self, message: impl ToString) -> BcdataError {
        BcdataError::decode(self.context.clone(), message)
    }

    fn next_byte(&mut self) -> Result<Option<u8>, BcdataError> {
        self.bytes
            .next()
            .transpose()
            .map_err(|err| BcdataError::http("WFS", err))
    }

    fn require_byte(&mut self) -> Result<u8, BcdataError> {
        self.next_byte()?
            .ok_or_else(|| self.error("response ended unexpectedly"))
    }

    fn next_non_ws(&mut self) -> Result<Option<u8>, BcdataError> {
        loop {
            match self.next_byte()? {
                Some(byte) if byte.is_ascii_whitespace() => continue,
                other => return Ok(other),
            }
        }
    }

    fn read_string(&mut self, out: &mut Vec<u8>) -> Result<(), BcdataError> {
        loop {
            let byte = self.require_byte()?;
            match byte {
                b'\\' => {
                    out.push(byte);
                    let escaped = self.require_byte()?;
                    out.push(escaped);
                }
                b'"' => return Ok(()),
                _ => out.push(byte),
            }
        }
    }

    fn seek_features(&mut self) -> Result<(), BcdataError> {
        if self.next_non_ws()? != Some(b'{') {
            return Err(self.error("expected a JSON object"));
        }
        let missing = "no features array in response";
        let mut depth = 1usize;
        loop {
            let byte = self.next_byte()?.ok_or_else(|| self.error(missing))?;
            match byte {
                b'"' => {
                    let mut text = Vec::new();
                    self.read_string(&mut text)?;
                    if depth != 1 {
                        continue;
                    }
                    match self.next_non_ws()? {
                        Some(b':') if text == b"features" => {
                            return match self.next_non_ws()? {
                                Some(b'[') => Ok(()),
                                _ => Err(self.error("features is not an array")),
                            };
                        }
                        Some(b'}') => return Err(self.error(missing)),
                        Some(_) => {}
                        None => return Err(self.error(missing)),
                    }
                }
                b'{' | b'[' => depth += 1,
                b'}' | b']' => {
                    depth -= 1;
                    if depth == 0 {
                        return Err(self.error(missing));
                    }
                }
                _ => {}
            }
        }
    }

    fn read_object(&mut self) -> Result<Vec<u8>, BcdataError> {
        let mut buffer = vec![b'{'];
        let mut depth = 1usize;
        loop {
            let byte = self.require_byte()?;
            buffer.push(byte);
            match byte {
                b'"' => {
                    self.read_string(&mut buffer)?;
                    buffer.push(b'"');
                }
                b'{' | b'[' => depth += 1,
                b'}' | b']' => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(buffer);
                    }
                }
                _ => {}
            }
        }
    }

    fn next_feature(&mut self) -> Result<Option<Feature>, BcdataError> {
        if self.state == StreamState::Start {
            self.seek_features()?;
            self.state = StreamState::Items;
        }
        loop {
            match self.next_non_ws()? {
                Some(b',') => continue,
                Some(b']') => return Ok(None),
                Some(b'{') => {
                    let buffer = self.read_object()?;
                    let feature = serde_json::from_slice(&buffer).map_err(|err| self.error(err))?;
                    return Ok(Some(feature));
                }
                Some(other) => {
                    return Err(self.error(format!(
                        "unexpected {:?} in features array",
                        char::from(other)
                    )));
                }
                None => return Err(self.error("response ended inside features array")),
            }
        }
    }
}

impl<R: Read> Iterator for FeatureStream<R> {
    type Item = Result<Feature, BcdataError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.state == StreamState::Done {
            return None;
        }
        match self.next_feature() {
            Ok(Some(feature)) => Some(Ok(feature)),
            Ok(None) => {
                self.state = StreamState::Done;
                None
            }
            Err(err) => {
                self.state = StreamState::Done;
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use assert_matches::assert_matches;

    use super::*;

    fn stream(body: &str) -> FeatureStream<Cursor<Vec<u8>>> {
        FeatureStream::new(Cursor::new(body.as_bytes().to_vec()), "test")
    }

    #[test]
    fn skips_members_before_features() {
        let body = r#"{"type": "FeatureCollection", "name": "features", "crs": {"type": "name", "properties": {"features": 1}},
            "features": [
              {"type": "Feature", "id": "a.1", "geometry": null, "properties": {"NAME": "brace } in \"string\""}},
              {"type": "Feature", "id": "a.2", "geometry": {"type": "Point", "coordinates": [1, 2]}, "properties": {}}
            ], "totalFeatures": 2}"#;
        let features = stream(body).collect::<Result<Vec<_>, _>>().unwrap();
        assert_eq!(features.len(), 2);
        assert_eq!(features[0].id, Some(Value::from("a.1")));
        assert_eq!(
            features[0].properties.as_ref().unwrap()["NAME"],
            Value::from("brace } in \"string\"")
        );
    }

    #[test]
    fn empty_array_yields_nothing() {
        let body = r#"{"type": "FeatureCollection", "features": []}"#;
        assert_eq!(stream(body).count(), 0);
    }

    #[test]
    fn truncated_body_is_decode_error() {
        let body = r#"{"type": "FeatureCollection", "features": [{"type": "Feature", "#;
        let mut items = stream(body);
        assert_matches!(items.next(), Some(Err(BcdataError::Decode { .. })));
        assert!(items.next().is_none());
    }

    #[test]
    fn non_json_is_decode_error() {
        let mut items = stream("<ServiceExceptionReport/>");
        assert_matches!(items.next(), Some(Err(BcdataError::Decode { .. })));
    }

    #[test]
    fn parse_collection_rejects_other_types() {
        let err = parse_collection(br#"{"type": "Feature", "features": []}"#, "test").unwrap_err();
        assert_matches!(err, BcdataError::Decode { .. });
    }
}
