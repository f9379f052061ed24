//! Endpoint selection for the object store.

use url::Url;

use zarr_common::{Result, ZarrError};

use crate::config::StoreConfig;

/// Signing region used for custom endpoints when none is configured.
pub const DEFAULT_SIGNING_REGION: &str = "us-west-2";

/// Which network endpoint requests are sent to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEndpoint {
    /// A region of the managed cloud object store.
    ManagedRegion { region: String },
    /// An S3-compatible service at an arbitrary URL.
    CustomUrl { url: Url, signing_region: String },
}

impl StoreEndpoint {
    /// Select exactly one endpoint from configuration. No network calls.
    pub fn from_config(config: &StoreConfig) -> Result<Self> {
        let region = config
            .region
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty());
        let url = config.url.as_deref().map(str::trim).filter(|u| !u.is_empty());

        match (config.aws, region, url) {
            (Some(true), Some(_), Some(_)) => Err(ZarrError::Configuration(
                "aws=true conflicts with a custom url".to_string(),
            )),
            (Some(true), Some(region), None) => Ok(StoreEndpoint::ManagedRegion {
                region: region.to_string(),
            }),
            (Some(true), None, _) => Err(ZarrError::Configuration(
                "aws=true requires a region".to_string(),
            )),
            (Some(false), region, Some(url)) => Self::custom(url, region),
            (Some(false), _, None) => Err(ZarrError::Configuration(
                "aws=false requires a custom url".to_string(),
            )),
            (None, Some(region), None) => Ok(StoreEndpoint::ManagedRegion {
                region: region.to_string(),
            }),
            (None, None, Some(url)) => Self::custom(url, None),
            (None, Some(_), Some(_)) => Err(ZarrError::Configuration(
                "both region and url are set; set aws to choose one".to_string(),
            )),
            (None, None, None) => Err(ZarrError::Configuration(
                "no endpoint selected: set region or url".to_string(),
            )),
        }
    }

    /// Build a custom endpoint, validating the URL.
    pub fn custom(url: &str, signing_region: Option<&str>) -> Result<Self> {
        let parsed = Url::parse(url)
            .map_err(|e| ZarrError::Configuration(format!("invalid endpoint url '{}': {}", url, e)))?;

        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(ZarrError::Configuration(format!(
                "endpoint url '{}' must use http or https",
                url
            )));
        }
        if parsed.host_str().map_or(true, str::is_empty) {
            return Err(ZarrError::Configuration(format!(
                "endpoint url '{}' has no host",
                url
            )));
        }

        Ok(StoreEndpoint::CustomUrl {
            url: parsed,
            signing_region: signing_region
                .unwrap_or(DEFAULT_SIGNING_REGION)
                .to_string(),
        })
    }

    /// Region requests are signed for.
    pub fn region(&self) -> &str {
        match self {
            StoreEndpoint::ManagedRegion { region } => region,
            StoreEndpoint::CustomUrl { signing_region, .. } => signing_region,
        }
    }

    /// Whether plain HTTP must be allowed by the client.
    pub fn allows_http(&self) -> bool {
        match self {
            StoreEndpoint::ManagedRegion { .. } => false,
            StoreEndpoint::CustomUrl { url, .. } => url.scheme() == "http",
        }
    }

    /// Base URL under which objects of `bucket` are publicly addressable.
    ///
    /// The returned URL always ends with `/` so keys can be joined onto it.
    pub fn bucket_url(&self, bucket: &str) -> Result<Url> {
        let raw = match self {
            StoreEndpoint::ManagedRegion { region } => {
                format!("https://{}.s3.{}.amazonaws.com/", bucket, region)
            }
            StoreEndpoint::CustomUrl { url, .. } => {
                format!("{}/{}/", url.as_str().trim_end_matches('/'), bucket)
            }
        };
        Url::parse(&raw).map_err(|e| ZarrError::Configuration(format!("invalid bucket url: {}", e)))
    }
}
