//! Tabular projection of arrays and groups.

mod column;
mod projector;

pub use column::{Column, ColumnBatch, ColumnData, ColumnField, ColumnType, TableSchema};
pub use projector::{TableProjector, TableSource};
