//! Zarr v2 metadata documents and their reader.

mod array;
mod dtype;
mod group;
mod reader;

pub use array::{ArrayMetadata, Order};
pub use dtype::{ByteOrder, DataType, Dtype, FillValue};
pub use group::GroupMetadata;
pub use reader::MetadataReader;

/// Join two store-relative paths with a single `/`.
pub(crate) fn join_path(parent: &str, child: &str) -> String {
    let parent = parent.trim_matches('/');
    let child = child.trim_matches('/');
    match (parent.is_empty(), child.is_empty()) {
        (true, _) => child.to_string(),
        (false, true) => parent.to_string(),
        (false, false) => format!("{}/{}", parent, child),
    }
}
