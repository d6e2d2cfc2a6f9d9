//! # Trellis Database
//!
//! Aggregation and annotation layer of the Trellis ORM.
//!
//! Queries are described against a [`SchemaRegistry`](orm::SchemaRegistry) of
//! models and relations, compiled to SQL with sea-query and executed through
//! a [`Materializer`](orm::Materializer).
//!
//! ## Features
//!
//! - **Terminal aggregates**: `aggregate()` returns one row of values
//! - **Annotations**: per-row aggregates with automatic GROUP BY
//! - **Relation spanning**: `book__authors__age` style lookups across
//!   forward and reverse foreign keys and many-to-many relations
//! - **HAVING**: filters on annotations become group conditions
//! - **Join reuse**: aggregates share joins, filters get their own
//!
//! ## Feature Flags
//!
//! - `sqlite` (default): [`SqliteMaterializer`](orm::SqliteMaterializer) backed by sqlx

pub mod orm;
pub mod settings;

/// Commonly used types
pub mod prelude {
	pub use crate::orm::{
		Aggregate, AggregateFunction, AggregateQuery, ExecutionError, Filter, FilterOperator,
		FilterValue, Materializer, ModelDef, QueryError, QuerySet, QueryValue, Row,
		SchemaRegistry, ThroughTable,
	};
	#[cfg(feature = "sqlite")]
	pub use crate::orm::SqliteMaterializer;
	pub use crate::settings::{DbBackend, OrmSettings};
}

pub use orm::{QueryError, QuerySet};
pub use settings::{DbBackend, OrmSettings};
