//! Byte-range object store client (S3 compatible).

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use object_store::aws::{AmazonS3, AmazonS3Builder};
use object_store::path::Path;
use object_store::signer::Signer;
use object_store::ObjectStore;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use url::Url;

use zarr_common::{Result, ZarrError};

use crate::auth::StoreAuth;
use crate::config::{StoreConfig, StoreLocation};
use crate::endpoint::StoreEndpoint;
use crate::grants::AccessGrant;

/// Size and modification time of an object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

/// Direct children of a key prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Listing {
    /// Child "directories", as names relative to the listed prefix.
    pub prefixes: Vec<String>,
    /// Child objects, as names relative to the listed prefix.
    pub objects: Vec<String>,
}

/// Read-only access to objects below the root group.
///
/// Keys are relative to the configured [`StoreLocation`] prefix. All
/// operations are idempotent reads. A missing object is reported as
/// [`ZarrError::NotFound`] and never folded into another error kind.
#[async_trait]
pub trait ObjectStoreClient: Send + Sync + fmt::Debug {
    /// Existence, size and modification time of one object.
    async fn head_object(&self, key: &str) -> Result<ObjectInfo>;

    /// Bytes `start..=end_inclusive` of one object.
    async fn get_range(&self, key: &str, start: u64, end_inclusive: u64) -> Result<Bytes>;

    /// Whole object. The default issues a HEAD followed by a ranged GET.
    async fn get_object(&self, key: &str) -> Result<Bytes> {
        let info = self.head_object(key).await?;
        if info.size == 0 {
            return Ok(Bytes::new());
        }
        self.get_range(key, 0, info.size - 1).await
    }

    /// Direct children of `prefix` (one level, delimiter `/`).
    async fn list_children(&self, prefix: &str) -> Result<Listing>;

    /// Issue a time-limited access grant for one object.
    async fn sign(&self, key: &str, ttl: Duration) -> Result<AccessGrant>;
}

/// [`ObjectStoreClient`] backed by an `object_store` implementation.
pub struct RemoteObjectStore {
    store: Arc<dyn ObjectStore>,
    signer: Option<Arc<dyn Signer>>,
    location: StoreLocation,
}

impl fmt::Debug for RemoteObjectStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteObjectStore")
            .field("store", &self.store.to_string())
            .field("signed", &self.signer.is_some())
            .field("location", &self.location)
            .finish()
    }
}

impl RemoteObjectStore {
    /// Resolve auth and endpoint from configuration and build the S3 client.
    ///
    /// Fails with [`ZarrError::Configuration`] before any request is made.
    pub fn new(config: &StoreConfig) -> Result<Self> {
        let auth = StoreAuth::from_config(config)?;
        let location = StoreLocation::from_config(config)?;
        Self::from_parts(&auth, location)
    }

    /// Build the S3 client from already resolved strategies.
    pub fn from_parts(auth: &StoreAuth, location: StoreLocation) -> Result<Self> {
        let s3 = Arc::new(build_s3(auth, &location)?);

        let signer: Option<Arc<dyn Signer>> = match auth {
            StoreAuth::Anonymous => None,
            StoreAuth::StaticKeyPair { .. } => Some(s3.clone()),
        };

        debug!(
            bucket = location.bucket(),
            prefix = location.prefix(),
            region = location.endpoint().region(),
            anonymous = auth.is_anonymous(),
            "Created object store client"
        );

        Ok(Self {
            store: s3,
            signer,
            location,
        })
    }

    /// Wrap an existing store (in-memory, local, ...). Grants are unsigned.
    pub fn with_store(store: Arc<dyn ObjectStore>, location: StoreLocation) -> Self {
        Self {
            store,
            signer: None,
            location,
        }
    }

    pub fn location(&self) -> &StoreLocation {
        &self.location
    }

    fn path(&self, key: &str) -> Path {
        Path::from(self.location.object_key(key))
    }

    fn unsigned_url(&self, key: &str) -> Result<Url> {
        let base = self
            .location
            .endpoint()
            .bucket_url(self.location.bucket())?;
        base.join(&self.location.object_key(key))
            .map_err(|e| ZarrError::Internal(format!("invalid object url for {}: {}", key, e)))
    }
}

/// Apply the two strategies to the S3 builder.
fn build_s3(auth: &StoreAuth, location: &StoreLocation) -> Result<AmazonS3> {
    let mut builder = AmazonS3Builder::new().with_bucket_name(location.bucket());

    builder = match location.endpoint() {
        StoreEndpoint::ManagedRegion { region } => builder.with_region(region),
        StoreEndpoint::CustomUrl {
            url,
            signing_region,
        } => builder
            .with_endpoint(url.as_str().trim_end_matches('/'))
            .with_region(signing_region)
            .with_allow_http(location.endpoint().allows_http()),
    };

    builder = match auth {
        StoreAuth::Anonymous => builder.with_skip_signature(true),
        StoreAuth::StaticKeyPair {
            access_key,
            secret_key,
        } => builder
            .with_access_key_id(access_key)
            .with_secret_access_key(secret_key),
    };

    builder
        .build()
        .map_err(|e| ZarrError::Configuration(format!("failed to create S3 client: {}", e)))
}

/// Status phrases a denied request carries in its error text.
const DENIED_STATUS: [&str; 2] = ["401 Unauthorized", "403 Forbidden"];

/// Map an `object_store` error onto the connector taxonomy.
fn map_store_error(key: &str, err: object_store::Error) -> ZarrError {
    if let object_store::Error::NotFound { .. } = err {
        return ZarrError::NotFound(key.to_string());
    }

    let message = err.to_string();
    if is_access_denied(key, &err) {
        return ZarrError::AccessDenied(format!("{}: {}", key, message));
    }

    match err {
        object_store::Error::Generic { .. } | object_store::Error::JoinError { .. } => {
            ZarrError::TransientNetwork(format!("{}: {}", key, message))
        }
        _ => ZarrError::Internal(format!("{}: {}", key, message)),
    }
}

/// Classify by HTTP status: a `reqwest` status in the source chain, else the
/// status phrase of the error text with the object key removed.
fn is_access_denied(key: &str, err: &object_store::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(current) = source {
        if let Some(status) = current
            .downcast_ref::<reqwest::Error>()
            .and_then(reqwest::Error::status)
        {
            return matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN);
        }
        source = current.source();
    }

    let message = err.to_string().replace(key, "");
    DENIED_STATUS.iter().any(|phrase| message.contains(phrase))
}

fn to_usize(value: u64) -> Result<usize> {
    usize::try_from(value)
        .map_err(|_| ZarrError::Internal(format!("byte offset {} exceeds address space", value)))
}

#[async_trait]
impl ObjectStoreClient for RemoteObjectStore {
    #[instrument(skip(self), fields(bucket = %self.location.bucket()))]
    async fn head_object(&self, key: &str) -> Result<ObjectInfo> {
        let meta = self
            .store
            .head(&self.path(key))
            .await
            .map_err(|e| map_store_error(key, e))?;

        Ok(ObjectInfo {
            size: meta.size as u64,
            last_modified: meta.last_modified,
        })
    }

    #[instrument(skip(self), fields(bucket = %self.location.bucket()))]
    async fn get_range(&self, key: &str, start: u64, end_inclusive: u64) -> Result<Bytes> {
        if end_inclusive < start {
            return Err(ZarrError::Internal(format!(
                "invalid byte range {}..={} for {}",
                start, end_inclusive, key
            )));
        }

        let range = to_usize(start)?..to_usize(end_inclusive)? + 1;
        let bytes = self
            .store
            .get_range(&self.path(key), range)
            .await
            .map_err(|e| map_store_error(key, e))?;

        debug!(size = bytes.len(), "Read object range");
        Ok(bytes)
    }

    #[instrument(skip(self), fields(bucket = %self.location.bucket()))]
    async fn get_object(&self, key: &str) -> Result<Bytes> {
        let result = self
            .store
            .get(&self.path(key))
            .await
            .map_err(|e| map_store_error(key, e))?;

        let bytes = result.bytes().await.map_err(|e| map_store_error(key, e))?;

        debug!(size = bytes.len(), "Read object");
        Ok(bytes)
    }

    async fn list_children(&self, prefix: &str) -> Result<Listing> {
        let object_prefix = self.location.object_key(prefix);
        let prefix_path = if object_prefix.is_empty() {
            None
        } else {
            Some(Path::from(object_prefix))
        };

        let result = self
            .store
            .list_with_delimiter(prefix_path.as_ref())
            .await
            .map_err(|e| map_store_error(prefix, e))?;

        let mut listing = Listing {
            prefixes: result
                .common_prefixes
                .iter()
                .filter_map(|p| p.filename().map(str::to_string))
                .collect(),
            objects: result
                .objects
                .iter()
                .filter_map(|m| m.location.filename().map(str::to_string))
                .collect(),
        };
        listing.prefixes.sort();
        listing.objects.sort();

        Ok(listing)
    }

    #[instrument(skip(self), fields(bucket = %self.location.bucket()))]
    async fn sign(&self, key: &str, ttl: Duration) -> Result<AccessGrant> {
        let url = match &self.signer {
            Some(signer) => signer
                .signed_url(Method::GET, &self.path(key), ttl)
                .await
                .map_err(|e| map_store_error(key, e))?,
            None => self.unsigned_url(key)?,
        };

        Ok(AccessGrant::new(key, url, ttl))
    }
}
