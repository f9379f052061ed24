//! Group metadata (`.zgroup`, consolidated `.zmetadata`).

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value};

use zarr_common::{Result, ZarrError};

use super::array::ArrayMetadata;
use super::join_path;

/// A group and its direct members.
///
/// Members whose metadata failed to parse are kept in `invalid` so that one
/// broken array does not hide its siblings.
#[derive(Debug, Clone, Default)]
pub struct GroupMetadata {
    pub path: String,
    pub arrays: BTreeMap<String, Arc<ArrayMetadata>>,
    pub invalid: BTreeMap<String, ZarrError>,
    pub groups: Vec<String>,
    pub attributes: Map<String, Value>,
}

impl GroupMetadata {
    pub fn new(path: &str) -> Self {
        Self {
            path: path.trim_matches('/').to_string(),
            ..Default::default()
        }
    }

    /// Build a group from a consolidated metadata document.
    ///
    /// Keys are relative to the group (`temp/.zarray`, `sub/.zgroup`); only
    /// direct children are taken.
    pub fn from_consolidated(path: &str, raw: &[u8]) -> Result<Self> {
        let doc_path = join_path(path, ".zmetadata");
        let value: Value = serde_json::from_slice(raw)
            .map_err(|e| ZarrError::malformed(&doc_path, format!("invalid JSON: {}", e)))?;
        let entries = value
            .get("metadata")
            .and_then(Value::as_object)
            .ok_or_else(|| ZarrError::malformed(&doc_path, "missing 'metadata' object"))?;

        let mut group = Self::new(path);
        if let Some(Value::Object(attrs)) = entries.get(".zattrs") {
            group.attributes = attrs.clone();
        }

        for (key, doc) in entries {
            let Some((child, file)) = key.split_once('/') else {
                continue;
            };
            if child.is_empty() || file.contains('/') {
                continue;
            }
            let child_path = join_path(&group.path, child);
            match file {
                ".zarray" => match ArrayMetadata::from_value(&child_path, doc) {
                    Ok(array) => {
                        let attrs = entries
                            .get(&format!("{}/.zattrs", child))
                            .and_then(Value::as_object)
                            .cloned()
                            .unwrap_or_default();
                        group
                            .arrays
                            .insert(child.to_string(), Arc::new(array.with_attributes(attrs)));
                    }
                    Err(e) => {
                        group.invalid.insert(child.to_string(), e);
                    }
                },
                ".zgroup" => group.groups.push(child.to_string()),
                _ => {}
            }
        }
        group.groups.sort();
        Ok(group)
    }

    /// Validate a `.zgroup` document.
    pub fn check_group_document(path: &str, raw: &[u8]) -> Result<()> {
        let doc_path = join_path(path, ".zgroup");
        let value: Value = serde_json::from_slice(raw)
            .map_err(|e| ZarrError::malformed(&doc_path, format!("invalid JSON: {}", e)))?;
        match value.get("zarr_format").and_then(Value::as_u64) {
            Some(2) => Ok(()),
            other => Err(ZarrError::malformed(
                doc_path,
                format!("unsupported zarr_format {:?}", other),
            )),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.arrays.is_empty() && self.invalid.is_empty() && self.groups.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn array_doc(shape: u64) -> Value {
        json!({
            "zarr_format": 2,
            "shape": [shape],
            "chunks": [10],
            "dtype": "<f8",
            "compressor": null,
            "fill_value": "NaN",
            "order": "C",
            "filters": null
        })
    }

    #[test]
    fn test_consolidated_direct_members() {
        let doc = json!({
            "zarr_consolidated_format": 1,
            "metadata": {
                ".zgroup": {"zarr_format": 2},
                "lat/.zarray": array_doc(100),
                "lat/.zattrs": {"units": "degrees_north"},
                "lon/.zarray": array_doc(100),
                "sub/.zgroup": {"zarr_format": 2},
                "sub/deep/.zarray": array_doc(5),
            }
        });
        let group = GroupMetadata::from_consolidated("obs", doc.to_string().as_bytes()).unwrap();

        assert_eq!(group.arrays.keys().collect::<Vec<_>>(), vec!["lat", "lon"]);
        assert_eq!(group.groups, vec!["sub".to_string()]);
        assert_eq!(group.arrays["lat"].path, "obs/lat");
        assert_eq!(group.arrays["lat"].attributes["units"], json!("degrees_north"));
        assert!(group.invalid.is_empty());
    }

    #[test]
    fn test_broken_member_is_isolated() {
        let mut broken = array_doc(10);
        broken["dtype"] = json!("<c16");
        let doc = json!({
            "metadata": {
                "good/.zarray": array_doc(10),
                "bad/.zarray": broken,
            }
        });
        let group = GroupMetadata::from_consolidated("", doc.to_string().as_bytes()).unwrap();
        assert!(group.arrays.contains_key("good"));
        assert!(matches!(
            group.invalid.get("bad"),
            Some(ZarrError::MalformedMetadata { .. })
        ));
    }

    #[test]
    fn test_group_document() {
        assert!(GroupMetadata::check_group_document("", br#"{"zarr_format": 2}"#).is_ok());
        assert!(GroupMetadata::check_group_document("", br#"{"zarr_format": 3}"#).is_err());
        assert!(GroupMetadata::check_group_document("", b"[").is_err());
    }
}
