//! Common types shared by the storage, processor and service crates.

pub mod error;

pub use error::{Result, ZarrError};
