//! Storage layer for the fishing statistics pipeline.
//!
//! Shared by the importer, the series stages and the API:
//! - table allow-list and DDL
//! - region registry
//! - whole-table reads and staging-swap writes
//! - the read-only query service

pub mod db;
pub mod error;
pub mod query;
pub mod registry;
pub mod schema;
pub mod tables;
pub mod value;

pub use error::{StoreError, StoreResult};
pub use query::{query, YearRange};
pub use registry::{Area, Region, RegionRegistry};
pub use tables::{Metric, StoreKind, Table};
pub use value::{Cell, Record};
