//! Django-style aggregation and annotation
//!
//! ## Building blocks
//!
//! - [`registry`]: model metadata, relations and their derived reverses
//! - [`lookup`]: `a__b__c` path resolution against the registry
//! - [`join_graph`]: join reuse, lineages and alias allocation
//! - [`aggregation`]: `COUNT`/`SUM`/`AVG`/`MIN`/`MAX` descriptors
//! - [`filters`]: predicates and lookup suffixes
//! - [`query`]: the chainable [`QuerySet`] and terminal [`AggregateQuery`]
//! - [`materializer`]: compiled plans and their execution
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use trellis_db::orm::{Aggregate, Filter, QuerySet, SchemaRegistry, SqliteMaterializer};
//!
//! # async fn example(registry: Arc<SchemaRegistry>, pool: sqlx::SqlitePool) -> Result<(), Box<dyn std::error::Error>> {
//! let materializer = SqliteMaterializer::new(pool);
//! let totals = QuerySet::new(registry, "Author")?
//!     .filter([Filter::lookup("age__gt", 29)?])?
//!     .aggregate([Aggregate::sum("age")])?
//!     .execute(&materializer)
//!     .await?;
//! println!("{:?}", totals.get("age__sum"));
//! # Ok(())
//! # }
//! ```

pub mod aggregation;
pub mod compiler;
pub mod error;
pub mod filters;
pub mod join_graph;
pub mod lookup;
pub mod materializer;
pub mod query;
pub mod registry;

pub use aggregation::{Aggregate, AggregateFunction};
pub use error::{ExecutionError, QueryError};
pub use filters::{Filter, FilterOperator, FilterValue};
pub use lookup::{LOOKUP_SEP, LookupResolver, ResolvedLookup};
pub use materializer::{
	AggregateResult, Materializer, PlanMode, QueryPlan, QueryValue, ResultRow, Row,
};
#[cfg(feature = "sqlite")]
pub use materializer::SqliteMaterializer;
pub use query::{AggregateQuery, QuerySet};
pub use registry::{
	FieldInfo, FieldKind, ModelDef, ModelMeta, SchemaRegistry, SchemaRegistryBuilder,
	ThroughTable,
};
