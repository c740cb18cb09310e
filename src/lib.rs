//! Quiver: an embedded property-graph database.
//!
//! Storage is columnar and paged (4 KiB), mutations are redo-logged and
//! committed by a single writer under snapshot-isolated readers, and
//! queries run through a vectorized, pull-based operator pipeline.

pub mod catalog;
pub mod db;
pub mod error;
pub mod exec;
pub mod function;
pub mod pager;
pub mod statistics;
pub mod storage;
pub mod transaction;
pub mod types;
pub mod vector;

pub use crate::db::{Config, Connection, Database, PreparedStatement, SyncMode};
pub use crate::error::{QuiverError, Result};
pub use crate::exec::plan::{AggregateSpec, BoundExpr, BoundPlan, PathEmission};
pub use crate::exec::QueryResult;
pub use crate::types::{Direction, NodeId, RelId, TableId};
pub use crate::vector::{LogicalType, Value};
