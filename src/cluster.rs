//! Read-only view of the managed cluster.

pub mod live;
pub mod query;
pub mod types;

pub use query::ClusterQuery;
pub use types::*;
