//! Aggregate expressions (COUNT, SUM, AVG, MIN, MAX)
//!
//! An [`Aggregate`] names a function and a `__`-separated lookup path. It
//! carries no resolved state: the query resolves the path against its own
//! join graph when the aggregate is attached, so the same value can be reused
//! across queries.

use super::error::QueryError;
use super::lookup::LOOKUP_SEP;
use std::fmt;

/// Types of aggregate functions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregateFunction {
	/// COUNT aggregate function
	Count,
	/// SUM aggregate function
	Sum,
	/// AVG aggregate function
	Avg,
	/// MIN aggregate function
	Min,
	/// MAX aggregate function
	Max,
}

impl AggregateFunction {
	/// SQL function name
	pub fn sql_name(self) -> &'static str {
		match self {
			AggregateFunction::Count => "COUNT",
			AggregateFunction::Sum => "SUM",
			AggregateFunction::Avg => "AVG",
			AggregateFunction::Min => "MIN",
			AggregateFunction::Max => "MAX",
		}
	}

	/// Whether `DISTINCT` may be applied to the argument
	pub fn supports_distinct(self) -> bool {
		matches!(self, AggregateFunction::Count)
	}

	/// Whether the function may target a relation (its primary key)
	pub fn accepts_relation(self) -> bool {
		matches!(self, AggregateFunction::Count)
	}
}

impl fmt::Display for AggregateFunction {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.sql_name())
	}
}

/// Aggregate over a lookup path
///
/// # Examples
///
/// ```
/// use trellis_db::orm::aggregation::Aggregate;
///
/// let avg = Aggregate::avg("friends__age");
/// assert_eq!(avg.alias(), "friends__age__avg");
///
/// let distinct = Aggregate::count("price").distinct().with_alias("prices");
/// assert_eq!(distinct.alias(), "prices");
/// assert_eq!(distinct.render("\"book\".\"price\""), "COUNT(DISTINCT \"book\".\"price\")");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Aggregate {
	function: AggregateFunction,
	lookup: String,
	distinct: bool,
	alias: Option<String>,
}

impl Aggregate {
	pub fn new(function: AggregateFunction, lookup: impl Into<String>) -> Self {
		Self {
			function,
			lookup: lookup.into(),
			distinct: false,
			alias: None,
		}
	}

	pub fn count(lookup: impl Into<String>) -> Self {
		Self::new(AggregateFunction::Count, lookup)
	}

	pub fn sum(lookup: impl Into<String>) -> Self {
		Self::new(AggregateFunction::Sum, lookup)
	}

	pub fn avg(lookup: impl Into<String>) -> Self {
		Self::new(AggregateFunction::Avg, lookup)
	}

	pub fn min(lookup: impl Into<String>) -> Self {
		Self::new(AggregateFunction::Min, lookup)
	}

	pub fn max(lookup: impl Into<String>) -> Self {
		Self::new(AggregateFunction::Max, lookup)
	}

	/// Only count distinct values. Rejected for anything but COUNT when the
	/// aggregate is attached to a query.
	pub fn distinct(mut self) -> Self {
		self.distinct = true;
		self
	}

	/// Emit the result under `alias` instead of the derived name
	pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
		self.alias = Some(alias.into());
		self
	}

	pub fn function(&self) -> AggregateFunction {
		self.function
	}

	pub fn lookup(&self) -> &str {
		&self.lookup
	}

	pub fn segments(&self) -> impl Iterator<Item = &str> {
		self.lookup.split(LOOKUP_SEP)
	}

	pub fn is_distinct(&self) -> bool {
		self.distinct
	}

	/// Whether the caller supplied an explicit alias
	pub fn has_explicit_alias(&self) -> bool {
		self.alias.is_some()
	}

	/// `<lookup>__<function>`, e.g. `friends__age__avg`
	pub fn default_alias(&self) -> String {
		format!(
			"{}{}{}",
			self.lookup,
			LOOKUP_SEP,
			self.function.sql_name().to_lowercase()
		)
	}

	/// Output name: the explicit alias, or [`default_alias`](Self::default_alias)
	pub fn alias(&self) -> String {
		self.alias.clone().unwrap_or_else(|| self.default_alias())
	}

	/// Check options against the function
	pub fn validate(&self) -> Result<(), QueryError> {
		if self.lookup.is_empty() {
			return Err(QueryError::invalid_lookup(
				&self.lookup,
				format!("{} requires a lookup path", self.function),
			));
		}
		if self.distinct && !self.function.supports_distinct() {
			return Err(QueryError::UnsupportedOption {
				function: self.function.to_string(),
				lookup: self.lookup.clone(),
				option: "distinct".to_string(),
			});
		}
		if let Some(alias) = &self.alias
			&& alias.is_empty()
		{
			return Err(QueryError::invalid_lookup(&self.lookup, "alias must not be empty"));
		}
		Ok(())
	}

	/// Render the aggregate over an already quoted column reference.
	///
	/// SUM is wrapped in `COALESCE(.., 0)` so an empty group sums to zero.
	pub fn render(&self, column_sql: &str) -> String {
		let inner = if self.distinct {
			format!("{}(DISTINCT {})", self.function.sql_name(), column_sql)
		} else {
			format!("{}({})", self.function.sql_name(), column_sql)
		};
		match self.function {
			AggregateFunction::Sum => format!("COALESCE({}, 0)", inner),
			_ => inner,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use proptest::prelude::*;
	use rstest::rstest;

	#[rstest]
	#[case(Aggregate::count("book"), "book__count")]
	#[case(Aggregate::sum("age"), "age__sum")]
	#[case(Aggregate::avg("friends__age"), "friends__age__avg")]
	#[case(Aggregate::min("book__publisher__num_awards"), "book__publisher__num_awards__min")]
	#[case(Aggregate::max("books__authors__age"), "books__authors__age__max")]
	fn test_default_alias(#[case] aggregate: Aggregate, #[case] expected: &str) {
		assert_eq!(aggregate.alias(), expected);
		assert!(!aggregate.has_explicit_alias());
	}

	#[rstest]
	fn test_explicit_alias_overrides_default() {
		let aggregate = Aggregate::avg("books__price").with_alias("amazon_mean");
		assert_eq!(aggregate.alias(), "amazon_mean");
		assert_eq!(aggregate.default_alias(), "books__price__avg");
	}

	#[rstest]
	#[case(Aggregate::count("\"book\".\"id\""), "COUNT(\"book\".\"id\")")]
	#[case(Aggregate::avg("x"), "AVG(x)")]
	#[case(Aggregate::min("x"), "MIN(x)")]
	#[case(Aggregate::max("x"), "MAX(x)")]
	#[case(Aggregate::sum("x"), "COALESCE(SUM(x), 0)")]
	fn test_render(#[case] aggregate: Aggregate, #[case] expected: &str) {
		let column = aggregate.lookup().to_string();
		assert_eq!(aggregate.render(&column), expected);
	}

	#[rstest]
	fn test_count_distinct_render() {
		let aggregate = Aggregate::count("price").distinct();
		aggregate.validate().unwrap();
		assert_eq!(
			aggregate.render("\"book\".\"price\""),
			"COUNT(DISTINCT \"book\".\"price\")"
		);
	}

	#[rstest]
	#[case(Aggregate::sum("age").distinct())]
	#[case(Aggregate::avg("age").distinct())]
	#[case(Aggregate::min("age").distinct())]
	#[case(Aggregate::max("age").distinct())]
	fn test_distinct_rejected_for_non_count(#[case] aggregate: Aggregate) {
		let err = aggregate.validate().unwrap_err();
		assert!(matches!(err, QueryError::UnsupportedOption { ref option, .. } if option == "distinct"));
	}

	#[rstest]
	fn test_empty_lookup_rejected() {
		assert!(matches!(
			Aggregate::count("").validate(),
			Err(QueryError::InvalidLookup { .. })
		));
	}

	proptest! {
		#[test]
		fn prop_default_alias_ends_with_function(
			segments in proptest::collection::vec("[a-z][a-z_]{0,8}[a-z]", 1..4),
			index in 0usize..5,
		) {
			let functions = [
				AggregateFunction::Count,
				AggregateFunction::Sum,
				AggregateFunction::Avg,
				AggregateFunction::Min,
				AggregateFunction::Max,
			];
			let function = functions[index];
			let lookup = segments.join(LOOKUP_SEP);
			let aggregate = Aggregate::new(function, lookup.clone());
			let expected = format!("{}__{}", lookup, function.sql_name().to_lowercase());
			prop_assert_eq!(aggregate.alias(), expected);
		}
	}
}
