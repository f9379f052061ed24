//! Credential selection for the object store.

use zarr_common::{Result, ZarrError};

use crate::config::StoreConfig;

/// Which credentials requests are made with.
#[derive(Clone, PartialEq, Eq)]
pub enum StoreAuth {
    /// Unsigned requests against a public bucket.
    Anonymous,
    /// Requests signed with a static key pair.
    StaticKeyPair {
        access_key: String,
        secret_key: String,
    },
}

impl std::fmt::Debug for StoreAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreAuth::Anonymous => write!(f, "Anonymous"),
            StoreAuth::StaticKeyPair { access_key, .. } => f
                .debug_struct("StaticKeyPair")
                .field("access_key", access_key)
                .field("secret_key", &"<redacted>")
                .finish(),
        }
    }
}

impl StoreAuth {
    /// Select exactly one credential mechanism from configuration.
    pub fn from_config(config: &StoreConfig) -> Result<Self> {
        let access_key = non_empty(config.access_key.as_deref());
        let secret_key = non_empty(config.secret_key.as_deref());

        match (config.anonymous, access_key, secret_key) {
            (Some(true), None, None) => Ok(StoreAuth::Anonymous),
            (Some(true), _, _) => Err(ZarrError::Configuration(
                "anonymous access conflicts with accessKey/secretKey".to_string(),
            )),
            (_, Some(access_key), Some(secret_key)) => Ok(StoreAuth::StaticKeyPair {
                access_key: access_key.to_string(),
                secret_key: secret_key.to_string(),
            }),
            (_, Some(_), None) => Err(ZarrError::Configuration(
                "accessKey is set but secretKey is missing".to_string(),
            )),
            (_, None, Some(_)) => Err(ZarrError::Configuration(
                "secretKey is set but accessKey is missing".to_string(),
            )),
            (_, None, None) => Err(ZarrError::Configuration(
                "no credentials selected: set anonymous=true or accessKey and secretKey"
                    .to_string(),
            )),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, StoreAuth::Anonymous)
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}
