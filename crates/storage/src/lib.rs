//! Object storage access for the zarr connector.
//!
//! Provides:
//! - Credential and endpoint selection ([`StoreAuth`], [`StoreEndpoint`])
//! - A byte-range client over S3-compatible stores ([`ObjectStoreClient`])
//! - Pre-signed access grants with per-key refresh ([`GrantStore`])
//! - Bounded exponential backoff for transient failures

pub mod auth;
pub mod config;
pub mod endpoint;
pub mod grants;
pub mod object_store;
pub mod retry;

pub use self::object_store::{Listing, ObjectInfo, ObjectStoreClient, RemoteObjectStore};
pub use auth::StoreAuth;
pub use config::{StoreConfig, StoreLocation};
pub use endpoint::StoreEndpoint;
pub use grants::{AccessGrant, GrantStore};
pub use retry::{retry_with_backoff, RetryPolicy};
