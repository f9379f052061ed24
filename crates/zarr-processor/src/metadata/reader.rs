//! Fetching and caching metadata documents.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tracing::{debug, instrument};

use storage::ObjectStoreClient;
use zarr_common::{Result, ZarrError};

use super::{join_path, ArrayMetadata, GroupMetadata};

struct Cached<T> {
    value: T,
    loaded_at: Instant,
}

type DocumentCache<T> = Mutex<HashMap<String, Cached<T>>>;

/// Reads array and group metadata, reusing parsed documents for a TTL.
///
/// Missing `.zarray`/`.zgroup` documents surface as
/// [`ZarrError::TableNotFound`]; parse failures as
/// [`ZarrError::MalformedMetadata`]. Nothing is retried here.
pub struct MetadataReader {
    client: Arc<dyn ObjectStoreClient>,
    ttl: Duration,
    arrays: DocumentCache<Arc<ArrayMetadata>>,
    groups: DocumentCache<Arc<GroupMetadata>>,
}

impl MetadataReader {
    pub fn new(client: Arc<dyn ObjectStoreClient>, ttl: Duration) -> Self {
        Self {
            client,
            ttl,
            arrays: Mutex::new(HashMap::new()),
            groups: Mutex::new(HashMap::new()),
        }
    }

    /// Metadata of the array at `path` (relative to the store root).
    #[instrument(skip(self))]
    pub async fn read_array_metadata(&self, path: &str) -> Result<Arc<ArrayMetadata>> {
        let path = path.trim_matches('/');
        if let Some(hit) = self.lookup(&self.arrays, path) {
            return Ok(hit);
        }

        let raw = self
            .client
            .get_object(&join_path(path, ".zarray"))
            .await
            .map_err(|e| table_not_found(e, path))?;
        let mut array = ArrayMetadata::from_json(path, &raw)?;
        if let Some(attributes) = self.read_attributes(path).await? {
            array = array.with_attributes(attributes);
        }

        debug!(
            path,
            shape = ?array.shape,
            chunks = ?array.chunks,
            dtype = %array.dtype,
            compressor = array.compressor.id(),
            "Loaded array metadata"
        );

        let array = Arc::new(array);
        self.remember(&self.arrays, path, array.clone());
        Ok(array)
    }

    /// Metadata of the group at `path`, including its direct members.
    ///
    /// Uses the consolidated `.zmetadata` document when present, otherwise
    /// lists the group prefix and reads each child's documents.
    #[instrument(skip(self))]
    pub async fn read_group_metadata(&self, path: &str) -> Result<Arc<GroupMetadata>> {
        let path = path.trim_matches('/');
        if let Some(hit) = self.lookup(&self.groups, path) {
            return Ok(hit);
        }

        let group = match self.client.get_object(&join_path(path, ".zmetadata")).await {
            Ok(raw) => GroupMetadata::from_consolidated(path, &raw)?,
            Err(e) if e.is_not_found() => self.discover_group(path).await?,
            Err(e) => return Err(e),
        };

        debug!(
            path,
            arrays = group.arrays.len(),
            groups = group.groups.len(),
            invalid = group.invalid.len(),
            "Loaded group metadata"
        );

        let group = Arc::new(group);
        self.remember(&self.groups, path, group.clone());
        Ok(group)
    }

    /// Drop every cached document.
    pub fn invalidate(&self) {
        self.arrays.lock().unwrap_or_else(PoisonError::into_inner).clear();
        self.groups.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    async fn discover_group(&self, path: &str) -> Result<GroupMetadata> {
        let raw = self
            .client
            .get_object(&join_path(path, ".zgroup"))
            .await
            .map_err(|e| table_not_found(e, path))?;
        GroupMetadata::check_group_document(path, &raw)?;

        let mut group = GroupMetadata::new(path);
        group.attributes = self.read_attributes(path).await?.unwrap_or_default();

        let listing = self.client.list_children(path).await?;
        for child in listing.prefixes {
            let child_path = join_path(path, &child);
            match self.read_array_metadata(&child_path).await {
                Ok(array) => {
                    group.arrays.insert(child, array);
                }
                Err(ZarrError::TableNotFound(_)) => {
                    match self.client.head_object(&join_path(&child_path, ".zgroup")).await {
                        Ok(_) => group.groups.push(child),
                        Err(e) if e.is_not_found() => {
                            debug!(path = %child_path, "Skipping prefix without metadata")
                        }
                        Err(e) => return Err(e),
                    }
                }
                Err(e) if e.is_schema_error() => {
                    group.invalid.insert(child, e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(group)
    }

    async fn read_attributes(&self, path: &str) -> Result<Option<Map<String, Value>>> {
        let key = join_path(path, ".zattrs");
        let raw = match self.client.get_object(&key).await {
            Ok(raw) => raw,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        match serde_json::from_slice(&raw) {
            Ok(Value::Object(attributes)) => Ok(Some(attributes)),
            Ok(_) => Err(ZarrError::malformed(key, "attributes must be a JSON object")),
            Err(e) => Err(ZarrError::malformed(key, format!("invalid JSON: {}", e))),
        }
    }

    fn lookup<T: Clone>(&self, cache: &DocumentCache<T>, path: &str) -> Option<T> {
        let entries = cache.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(path)
            .filter(|cached| cached.loaded_at.elapsed() < self.ttl)
            .map(|cached| cached.value.clone())
    }

    fn remember<T>(&self, cache: &DocumentCache<T>, path: &str, value: T) {
        let mut entries = cache.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(
            path.to_string(),
            Cached {
                value,
                loaded_at: Instant::now(),
            },
        );
    }
}

fn table_not_found(err: ZarrError, path: &str) -> ZarrError {
    if err.is_not_found() {
        ZarrError::TableNotFound(path.to_string())
    } else {
        err
    }
}
