//! Errors raised while composing and executing ORM queries
//!
//! Composition errors ([`QueryError`]) are raised synchronously by every
//! `QuerySet` operation, before anything reaches the database. Execution
//! errors ([`ExecutionError`]) only come out of a [`Materializer`].
//!
//! [`Materializer`]: crate::orm::materializer::Materializer

/// Errors raised while building a query
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
	/// Unknown lookup segment, or a join attempted across a field that forbids it
	#[error("Cannot resolve keyword '{segment}' into field of model '{model}': {reason}")]
	FieldError {
		/// Model that was searched
		model: String,
		/// Offending lookup segment
		segment: String,
		/// Human readable explanation
		reason: String,
	},

	/// Aggregate path resolves to a relation instead of a scalar column
	#[error("Aggregate {function} on '{lookup}' targets a relation, not a column")]
	InvalidAggregateTarget {
		/// Aggregate function name
		function: String,
		/// Lookup path as written by the caller
		lookup: String,
	},

	/// Option not supported by the aggregate function (e.g. DISTINCT on SUM)
	#[error("Aggregate {function} on '{lookup}' does not support option '{option}'")]
	UnsupportedOption {
		/// Aggregate function name
		function: String,
		/// Lookup path as written by the caller
		lookup: String,
		/// The rejected option
		option: String,
	},

	/// Alias already used by a field, an annotation or an extra select
	#[error("The alias '{alias}' conflicts with an existing {existing}")]
	AliasCollision {
		/// The colliding alias
		alias: String,
		/// What the alias already names
		existing: String,
	},

	/// Malformed filter lookup or value
	#[error("Invalid lookup '{lookup}': {reason}")]
	InvalidLookup {
		/// Lookup as written by the caller
		lookup: String,
		/// Human readable explanation
		reason: String,
	},
}

impl QueryError {
	pub(crate) fn field(
		model: impl Into<String>,
		segment: impl Into<String>,
		reason: impl Into<String>,
	) -> Self {
		Self::FieldError {
			model: model.into(),
			segment: segment.into(),
			reason: reason.into(),
		}
	}

	pub(crate) fn alias_collision(alias: impl Into<String>, existing: impl Into<String>) -> Self {
		Self::AliasCollision {
			alias: alias.into(),
			existing: existing.into(),
		}
	}

	pub(crate) fn invalid_lookup(lookup: impl Into<String>, reason: impl Into<String>) -> Self {
		Self::InvalidLookup {
			lookup: lookup.into(),
			reason: reason.into(),
		}
	}
}

/// Errors that can occur while materializing a query plan
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
	/// Database driver error
	#[cfg(feature = "sqlite")]
	#[error("Database error: {0}")]
	Database(#[from] sqlx::Error),

	/// Column value that could not be mapped to a [`QueryValue`]
	///
	/// [`QueryValue`]: crate::orm::materializer::QueryValue
	#[error("Failed to decode column '{column}': {reason}")]
	Decode {
		/// Output column name
		column: String,
		/// Human readable explanation
		reason: String,
	},

	/// A scalar aggregate query returned a number of rows other than one
	#[error("Aggregate query returned {0} rows, expected exactly 1")]
	UnexpectedRowCount(usize),

	/// Composition error surfaced while preparing execution
	#[error(transparent)]
	Query(#[from] QueryError),
}
