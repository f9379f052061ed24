//! Store configuration and the resolved store location.

use serde::{Deserialize, Serialize};

use zarr_common::{Result, ZarrError};

use crate::endpoint::StoreEndpoint;

/// Raw connector configuration for the object store.
///
/// Field names follow the connector's catalog properties (`accessKey`,
/// `secretKey`, ...); snake_case spellings are accepted as aliases.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreConfig {
    /// Bucket holding the root group.
    pub bucket: String,
    /// Object key prefix of the root group inside the bucket.
    pub key: String,
    /// Read the bucket without credentials.
    pub anonymous: Option<bool>,
    /// Static access key id.
    #[serde(alias = "access_key")]
    pub access_key: Option<String>,
    /// Static secret access key.
    #[serde(alias = "secret_key")]
    pub secret_key: Option<String>,
    /// Target the managed cloud (`region`) instead of a custom URL.
    pub aws: Option<bool>,
    /// Managed cloud region, or signing region for a custom endpoint.
    pub region: Option<String>,
    /// Custom endpoint URL (MinIO, Ceph, ...).
    pub url: Option<String>,
}

impl std::fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreConfig")
            .field("bucket", &self.bucket)
            .field("key", &self.key)
            .field("anonymous", &self.anonymous)
            .field("access_key", &self.access_key)
            .field("secret_key", &self.secret_key.as_ref().map(|_| "<redacted>"))
            .field("aws", &self.aws)
            .field("region", &self.region)
            .field("url", &self.url)
            .finish()
    }
}

impl StoreConfig {
    /// Load configuration from `ZARR_*` environment variables.
    ///
    /// Unset variables stay unset; resolution into strategies reports what
    /// is missing.
    pub fn from_env() -> Self {
        Self {
            bucket: std::env::var("ZARR_BUCKET").unwrap_or_default(),
            key: std::env::var("ZARR_KEY").unwrap_or_default(),
            anonymous: env_bool("ZARR_ANONYMOUS"),
            access_key: env_string("ZARR_ACCESS_KEY"),
            secret_key: env_string("ZARR_SECRET_KEY"),
            aws: env_bool("ZARR_AWS"),
            region: env_string("ZARR_REGION"),
            url: env_string("ZARR_URL"),
        }
    }

    /// Overlay values set in `other` on top of this configuration.
    pub fn merge(mut self, other: StoreConfig) -> Self {
        if !other.bucket.is_empty() {
            self.bucket = other.bucket;
        }
        if !other.key.is_empty() {
            self.key = other.key;
        }
        self.anonymous = other.anonymous.or(self.anonymous);
        self.access_key = other.access_key.or(self.access_key);
        self.secret_key = other.secret_key.or(self.secret_key);
        self.aws = other.aws.or(self.aws);
        self.region = other.region.or(self.region);
        self.url = other.url.or(self.url);
        self
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_bool(name: &str) -> Option<bool> {
    env_string(name).map(|v| v.to_lowercase() == "true" || v == "1")
}

/// Bucket, key prefix and endpoint of the root group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreLocation {
    bucket: String,
    prefix: String,
    endpoint: StoreEndpoint,
}

impl StoreLocation {
    pub fn new(bucket: impl Into<String>, prefix: &str, endpoint: StoreEndpoint) -> Result<Self> {
        let bucket = bucket.into();
        if bucket.trim().is_empty() {
            return Err(ZarrError::Configuration("bucket must be set".to_string()));
        }

        Ok(Self {
            bucket,
            prefix: prefix.trim_matches('/').to_string(),
            endpoint,
        })
    }

    pub fn from_config(config: &StoreConfig) -> Result<Self> {
        let endpoint = StoreEndpoint::from_config(config)?;
        Self::new(config.bucket.clone(), &config.key, endpoint)
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn endpoint(&self) -> &StoreEndpoint {
        &self.endpoint
    }

    /// Absolute object key for a key relative to the root group.
    pub fn object_key(&self, relative: &str) -> String {
        let relative = relative.trim_matches('/');
        match (self.prefix.is_empty(), relative.is_empty()) {
            (true, _) => relative.to_string(),
            (false, true) => self.prefix.clone(),
            (false, false) => format!("{}/{}", self.prefix, relative),
        }
    }
}
