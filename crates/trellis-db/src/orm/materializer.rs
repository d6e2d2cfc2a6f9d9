//! Query plans and result materialization
//!
//! A [`QueryPlan`] is the finished, driver-independent output of a query:
//! the statement, the names of the columns it emits and how its rows are to
//! be read. A [`Materializer`] runs a plan against some storage and hands
//! back rows of [`QueryValue`]s in column order.

use super::error::ExecutionError;
use crate::settings::DbBackend;
use async_trait::async_trait;
use indexmap::IndexMap;
use sea_query::{SelectStatement, Value};
use serde::{Deserialize, Serialize};

/// How the rows of a plan are consumed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlanMode {
	/// Exactly one row mapping aggregate aliases to values
	ScalarAggregate,
	/// Any number of rows, one per group (or per base row)
	AnnotatedRows,
}

/// Compiled query ready for execution.
///
/// The statement is rendered once, when the plan is built; a plan only
/// carries strings and [`QueryValue`]s and can be moved across tasks freely.
#[derive(Debug, Clone)]
pub struct QueryPlan {
	sql: String,
	values: Vec<QueryValue>,
	inline_sql: String,
	mode: PlanMode,
	columns: Vec<String>,
	backend: DbBackend,
}

impl QueryPlan {
	pub(crate) fn new(
		statement: SelectStatement,
		mode: PlanMode,
		columns: Vec<String>,
		backend: DbBackend,
	) -> Self {
		let (sql, values) = backend.build(&statement);
		let values = values.into_iter().map(QueryValue::from).collect();
		let inline_sql = backend.to_inline_sql(&statement);
		Self {
			sql,
			values,
			inline_sql,
			mode,
			columns,
			backend,
		}
	}

	pub fn mode(&self) -> PlanMode {
		self.mode
	}

	/// Output column names, in select order
	pub fn columns(&self) -> &[String] {
		&self.columns
	}

	/// Backend the plan was rendered for
	pub fn backend(&self) -> DbBackend {
		self.backend
	}

	/// SQL with placeholders plus its parameters, in placeholder order
	pub fn to_sql(&self) -> (String, Vec<QueryValue>) {
		(self.sql.clone(), self.values.clone())
	}

	/// SQL with parameters inlined
	pub fn to_inline_sql(&self) -> String {
		self.inline_sql.clone()
	}
}

/// A single decoded value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryValue {
	Null,
	Bool(bool),
	Int(i64),
	Float(f64),
	String(String),
	Bytes(Vec<u8>),
}

impl QueryValue {
	pub fn is_null(&self) -> bool {
		matches!(self, QueryValue::Null)
	}

	pub fn as_i64(&self) -> Option<i64> {
		match self {
			QueryValue::Int(i) => Some(*i),
			QueryValue::Bool(b) => Some(i64::from(*b)),
			_ => None,
		}
	}

	/// Numeric value widened to `f64`
	pub fn as_f64(&self) -> Option<f64> {
		match self {
			QueryValue::Int(i) => Some(*i as f64),
			QueryValue::Float(f) => Some(*f),
			_ => None,
		}
	}

	pub fn as_str(&self) -> Option<&str> {
		match self {
			QueryValue::String(s) => Some(s),
			_ => None,
		}
	}
}

impl From<i64> for QueryValue {
	fn from(value: i64) -> Self {
		QueryValue::Int(value)
	}
}

impl From<f64> for QueryValue {
	fn from(value: f64) -> Self {
		QueryValue::Float(value)
	}
}

impl From<&str> for QueryValue {
	fn from(value: &str) -> Self {
		QueryValue::String(value.to_string())
	}
}

impl From<String> for QueryValue {
	fn from(value: String) -> Self {
		QueryValue::String(value)
	}
}

impl From<bool> for QueryValue {
	fn from(value: bool) -> Self {
		QueryValue::Bool(value)
	}
}

impl From<Value> for QueryValue {
	fn from(value: Value) -> Self {
		match value {
			Value::Bool(None)
			| Value::TinyInt(None)
			| Value::SmallInt(None)
			| Value::Int(None)
			| Value::BigInt(None)
			| Value::TinyUnsigned(None)
			| Value::SmallUnsigned(None)
			| Value::Unsigned(None)
			| Value::BigUnsigned(None)
			| Value::Float(None)
			| Value::Double(None)
			| Value::String(None)
			| Value::Char(None)
			| Value::Bytes(None) => QueryValue::Null,

			Value::Bool(Some(b)) => QueryValue::Bool(b),

			Value::TinyInt(Some(v)) => QueryValue::Int(v.into()),
			Value::SmallInt(Some(v)) => QueryValue::Int(v.into()),
			Value::Int(Some(v)) => QueryValue::Int(v.into()),
			Value::BigInt(Some(v)) => QueryValue::Int(v),
			Value::TinyUnsigned(Some(v)) => QueryValue::Int(v.into()),
			Value::SmallUnsigned(Some(v)) => QueryValue::Int(v.into()),
			Value::Unsigned(Some(v)) => QueryValue::Int(v.into()),
			Value::BigUnsigned(Some(v)) => QueryValue::Int(i64::try_from(v).unwrap_or_else(|_| {
				tracing::warn!(value = v, "unsigned parameter exceeds i64::MAX, clamping");
				i64::MAX
			})),

			Value::Float(Some(v)) => QueryValue::Float(v.into()),
			Value::Double(Some(v)) => QueryValue::Float(v),

			Value::String(Some(s)) => QueryValue::String(s),
			Value::Char(Some(c)) => QueryValue::String(c.to_string()),
			Value::Bytes(Some(b)) => QueryValue::Bytes(b),

			// Variants behind sea-query features this crate does not enable
			#[allow(unreachable_patterns)]
			other => QueryValue::String(format!("{:?}", other)),
		}
	}
}

/// Raw row as returned by a materializer, in plan column order
pub type ResultRow = Vec<QueryValue>;

/// Row keyed by output column name
pub type Row = IndexMap<String, QueryValue>;

/// Result of a query
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AggregateResult {
	/// Terminal `aggregate()`: alias to value
	Scalar(Row),
	/// Annotated rows
	Rows(Vec<Row>),
}

impl AggregateResult {
	/// Key rows by the plan's column names
	pub fn from_rows(plan: &QueryPlan, rows: Vec<ResultRow>) -> Result<Self, ExecutionError> {
		let keyed = rows
			.into_iter()
			.map(|row| {
				if row.len() != plan.columns().len() {
					return Err(ExecutionError::Decode {
						column: plan.columns().join(", "),
						reason: format!(
							"row has {} values for {} columns",
							row.len(),
							plan.columns().len()
						),
					});
				}
				Ok(plan.columns().iter().cloned().zip(row).collect::<Row>())
			})
			.collect::<Result<Vec<_>, _>>()?;

		match plan.mode() {
			PlanMode::AnnotatedRows => Ok(AggregateResult::Rows(keyed)),
			PlanMode::ScalarAggregate => {
				let count = keyed.len();
				let mut keyed = keyed.into_iter();
				match (keyed.next(), keyed.next()) {
					(Some(row), None) => Ok(AggregateResult::Scalar(row)),
					_ => Err(ExecutionError::UnexpectedRowCount(count)),
				}
			}
		}
	}

	pub fn into_scalar(self) -> Option<Row> {
		match self {
			AggregateResult::Scalar(row) => Some(row),
			AggregateResult::Rows(_) => None,
		}
	}

	pub fn into_rows(self) -> Vec<Row> {
		match self {
			AggregateResult::Scalar(row) => vec![row],
			AggregateResult::Rows(rows) => rows,
		}
	}
}

/// Executes finished plans
#[async_trait]
pub trait Materializer: Send + Sync {
	/// Backend the plan has to be compiled for
	fn backend(&self) -> DbBackend;

	async fn fetch(&self, plan: &QueryPlan) -> Result<Vec<ResultRow>, ExecutionError>;
}

#[cfg(feature = "sqlite")]
pub use self::sqlite::SqliteMaterializer;

#[cfg(feature = "sqlite")]
mod sqlite {
	use super::*;
	use sqlx::query::Query;
	use sqlx::sqlite::{Sqlite, SqliteArguments, SqlitePool, SqliteRow};
	use sqlx::{Column, Row as _, TypeInfo, ValueRef};

	/// Materializer backed by a sqlx SQLite pool
	#[derive(Debug, Clone)]
	pub struct SqliteMaterializer {
		pool: SqlitePool,
	}

	impl SqliteMaterializer {
		pub fn new(pool: SqlitePool) -> Self {
			Self { pool }
		}

		pub fn pool(&self) -> &SqlitePool {
			&self.pool
		}

		fn bind_value<'q>(
			query: Query<'q, Sqlite, SqliteArguments<'q>>,
			value: &QueryValue,
		) -> Query<'q, Sqlite, SqliteArguments<'q>> {
			match value {
				QueryValue::Null => query.bind(None::<i64>),
				QueryValue::Bool(b) => query.bind(*b),
				QueryValue::Int(i) => query.bind(*i),
				QueryValue::Float(f) => query.bind(*f),
				QueryValue::String(s) => query.bind(s.clone()),
				QueryValue::Bytes(b) => query.bind(b.clone()),
			}
		}

		fn decode(row: &SqliteRow, index: usize, name: &str) -> Result<QueryValue, ExecutionError> {
			if row.try_get_raw(index)?.is_null() {
				return Ok(QueryValue::Null);
			}

			// SQLite stores booleans as integers; only the declared type tells them apart.
			let declared = row
				.columns()
				.get(index)
				.map(|column| column.type_info().name().to_uppercase())
				.unwrap_or_default();
			if declared.contains("BOOL") {
				return Ok(QueryValue::Bool(row.try_get::<i64, _>(index)? != 0));
			}

			if let Ok(value) = row.try_get::<i64, _>(index) {
				Ok(QueryValue::Int(value))
			} else if let Ok(value) = row.try_get::<f64, _>(index) {
				Ok(QueryValue::Float(value))
			} else if let Ok(value) = row.try_get::<String, _>(index) {
				Ok(QueryValue::String(value))
			} else if let Ok(value) = row.try_get::<Vec<u8>, _>(index) {
				Ok(QueryValue::Bytes(value))
			} else {
				Err(ExecutionError::Decode {
					column: name.to_string(),
					reason: format!("unsupported SQLite type {}", declared),
				})
			}
		}
	}

	#[async_trait]
	impl Materializer for SqliteMaterializer {
		fn backend(&self) -> DbBackend {
			DbBackend::Sqlite
		}

		async fn fetch(&self, plan: &QueryPlan) -> Result<Vec<ResultRow>, ExecutionError> {
			let (sql, values) = plan.to_sql();
			tracing::debug!(sql = %sql, params = values.len(), mode = ?plan.mode(), "executing query plan");

			let query = values
				.iter()
				.fold(sqlx::query(&sql), |query, value| Self::bind_value(query, value));
			let rows = query.fetch_all(&self.pool).await?;
			tracing::trace!(rows = rows.len(), "fetched rows");

			rows.iter()
				.map(|row| {
					plan.columns()
						.iter()
						.enumerate()
						.map(|(index, name)| Self::decode(row, index, name))
						.collect()
				})
				.collect()
		}
	}
}
