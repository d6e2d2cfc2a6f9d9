//! Filter predicates
//!
//! A [`Filter`] pairs a lookup path with an operator and a value. Filters can
//! be built explicitly or parsed from Django-style lookups such as
//! `price__lt` or `num_books__range`.

use super::error::QueryError;
use super::lookup::LOOKUP_SEP;
use sea_query::{Expr, ExprTrait, LikeExpr, Value};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterOperator {
	Eq,
	Ne,
	Gt,
	Gte,
	Lt,
	Lte,
	In,
	NotIn,
	/// Inclusive `BETWEEN`, takes a two element list
	Range,
	/// Takes a boolean: `true` for `IS NULL`, `false` for `IS NOT NULL`
	IsNull,
	Contains,
	StartsWith,
	EndsWith,
}

impl FilterOperator {
	/// Operator named by a lookup suffix (`gt`, `in`, `isnull`, ...)
	pub fn from_suffix(suffix: &str) -> Option<Self> {
		let op = match suffix {
			"exact" => FilterOperator::Eq,
			"ne" => FilterOperator::Ne,
			"gt" => FilterOperator::Gt,
			"gte" | "ge" => FilterOperator::Gte,
			"lt" => FilterOperator::Lt,
			"lte" | "le" => FilterOperator::Lte,
			"in" => FilterOperator::In,
			"range" => FilterOperator::Range,
			"isnull" => FilterOperator::IsNull,
			"contains" => FilterOperator::Contains,
			"startswith" => FilterOperator::StartsWith,
			"endswith" => FilterOperator::EndsWith,
			_ => return None,
		};
		Some(op)
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FilterValue {
	String(String),
	Integer(i64),
	Float(f64),
	Boolean(bool),
	Null,
	List(Vec<FilterValue>),
}

impl FilterValue {
	fn to_value(&self) -> Value {
		match self {
			FilterValue::String(s) => s.clone().into(),
			FilterValue::Integer(i) => (*i).into(),
			FilterValue::Float(f) => (*f).into(),
			FilterValue::Boolean(b) => (*b).into(),
			FilterValue::Null | FilterValue::List(_) => Option::<i64>::None.into(),
		}
	}

	fn as_pattern(&self) -> String {
		match self {
			FilterValue::String(s) => s.clone(),
			FilterValue::Integer(i) => i.to_string(),
			FilterValue::Float(f) => f.to_string(),
			FilterValue::Boolean(b) => b.to_string(),
			FilterValue::Null | FilterValue::List(_) => String::new(),
		}
	}
}

impl From<&str> for FilterValue {
	fn from(value: &str) -> Self {
		FilterValue::String(value.to_string())
	}
}

impl From<String> for FilterValue {
	fn from(value: String) -> Self {
		FilterValue::String(value)
	}
}

impl From<i64> for FilterValue {
	fn from(value: i64) -> Self {
		FilterValue::Integer(value)
	}
}

impl From<i32> for FilterValue {
	fn from(value: i32) -> Self {
		FilterValue::Integer(value.into())
	}
}

impl From<f64> for FilterValue {
	fn from(value: f64) -> Self {
		FilterValue::Float(value)
	}
}

impl From<bool> for FilterValue {
	fn from(value: bool) -> Self {
		FilterValue::Boolean(value)
	}
}

impl<T: Into<FilterValue>> From<Vec<T>> for FilterValue {
	fn from(values: Vec<T>) -> Self {
		FilterValue::List(values.into_iter().map(Into::into).collect())
	}
}

impl<T: Into<FilterValue>> From<Option<T>> for FilterValue {
	fn from(value: Option<T>) -> Self {
		value.map(Into::into).unwrap_or(FilterValue::Null)
	}
}

/// A single `field <op> value` predicate
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
	pub field: String,
	pub operator: FilterOperator,
	pub value: FilterValue,
}

impl Filter {
	pub fn new(field: impl Into<String>, operator: FilterOperator, value: impl Into<FilterValue>) -> Self {
		Self {
			field: field.into(),
			operator,
			value: value.into(),
		}
	}

	/// Equality shorthand
	pub fn exact(field: impl Into<String>, value: impl Into<FilterValue>) -> Self {
		Self::new(field, FilterOperator::Eq, value)
	}

	/// Parse a Django-style lookup: the last segment selects the operator
	/// when it names one, otherwise the filter is an exact match.
	///
	/// ```
	/// use trellis_db::orm::filters::{Filter, FilterOperator};
	///
	/// let filter = Filter::lookup("book__price__lt", 40).unwrap();
	/// assert_eq!(filter.field, "book__price");
	/// assert_eq!(filter.operator, FilterOperator::Lt);
	/// ```
	pub fn lookup(lookup: &str, value: impl Into<FilterValue>) -> Result<Self, QueryError> {
		let (field, operator) = match lookup.rsplit_once(LOOKUP_SEP) {
			Some((field, suffix)) => match FilterOperator::from_suffix(suffix) {
				Some(op) => (field, op),
				None => (lookup, FilterOperator::Eq),
			},
			None => (lookup, FilterOperator::Eq),
		};
		if field.is_empty() {
			return Err(QueryError::invalid_lookup(lookup, "missing field name"));
		}
		let filter = Self::new(field, operator, value);
		filter.validate()?;
		Ok(filter)
	}

	/// Check that the value has the shape the operator needs
	pub fn validate(&self) -> Result<(), QueryError> {
		let reason = match (&self.operator, &self.value) {
			(FilterOperator::In | FilterOperator::NotIn, FilterValue::List(_)) => None,
			(FilterOperator::In | FilterOperator::NotIn, _) => Some("expects a list of values"),
			(FilterOperator::Range, FilterValue::List(bounds)) if bounds.len() == 2 => None,
			(FilterOperator::Range, _) => Some("expects exactly two bounds"),
			(FilterOperator::IsNull, FilterValue::Boolean(_)) => None,
			(FilterOperator::IsNull, _) => Some("expects a boolean"),
			(_, FilterValue::List(_)) => Some("does not accept a list"),
			(
				FilterOperator::Gt | FilterOperator::Gte | FilterOperator::Lt | FilterOperator::Lte,
				FilterValue::Null,
			) => Some("cannot compare against NULL"),
			_ => None,
		};
		match reason {
			Some(reason) => Err(QueryError::invalid_lookup(
				&self.field,
				format!("{:?} {}", self.operator, reason),
			)),
			None => Ok(()),
		}
	}

	/// `IS NULL` test, in either spelling
	pub(crate) fn is_null_test(&self) -> bool {
		matches!(
			(self.operator, &self.value),
			(FilterOperator::IsNull, FilterValue::Boolean(true))
				| (FilterOperator::Eq, FilterValue::Null)
		)
	}

	/// Apply the operator to an already built left-hand side
	pub(crate) fn apply(&self, lhs: Expr) -> Expr {
		let value = &self.value;
		match self.operator {
			FilterOperator::Eq if *value == FilterValue::Null => lhs.is_null(),
			FilterOperator::Ne if *value == FilterValue::Null => lhs.is_not_null(),
			FilterOperator::Eq => lhs.eq(value.to_value()),
			FilterOperator::Ne => lhs.ne(value.to_value()),
			FilterOperator::Gt => lhs.gt(value.to_value()),
			FilterOperator::Gte => lhs.gte(value.to_value()),
			FilterOperator::Lt => lhs.lt(value.to_value()),
			FilterOperator::Lte => lhs.lte(value.to_value()),
			FilterOperator::In => lhs.is_in(list_values(value)),
			FilterOperator::NotIn => lhs.is_not_in(list_values(value)),
			FilterOperator::Range => {
				let bounds = list_values(value);
				match (bounds.first(), bounds.get(1)) {
					(Some(low), Some(high)) => lhs.between(low.clone(), high.clone()),
					_ => lhs.is_null(),
				}
			}
			FilterOperator::IsNull => match value {
				FilterValue::Boolean(false) => lhs.is_not_null(),
				_ => lhs.is_null(),
			},
			FilterOperator::Contains => lhs.like(like_pattern("%", value, "%")),
			FilterOperator::StartsWith => lhs.like(like_pattern("", value, "%")),
			FilterOperator::EndsWith => lhs.like(like_pattern("%", value, "")),
		}
	}
}

/// Escape character of generated LIKE patterns
const LIKE_ESCAPE: char = '!';

/// The value matched literally, between the given wildcards
fn like_pattern(prefix: &str, value: &FilterValue, suffix: &str) -> LikeExpr {
	let mut pattern = String::from(prefix);
	for c in value.as_pattern().chars() {
		if matches!(c, LIKE_ESCAPE | '%' | '_') {
			pattern.push(LIKE_ESCAPE);
		}
		pattern.push(c);
	}
	pattern.push_str(suffix);
	LikeExpr::new(pattern).escape(LIKE_ESCAPE)
}

fn list_values(value: &FilterValue) -> Vec<Value> {
	match value {
		FilterValue::List(items) => items.iter().map(FilterValue::to_value).collect(),
		other => vec![other.to_value()],
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use rstest::rstest;
	use sea_query::{Alias, Query, SqliteQueryBuilder};

	fn render(filter: &Filter) -> String {
		let lhs = Expr::col((Alias::new("t".to_string()), Alias::new("c".to_string())));
		Query::select()
			.expr(Expr::val(1))
			.and_where(filter.apply(lhs))
			.to_string(SqliteQueryBuilder)
	}

	#[rstest]
	#[case("age__gt", "age", FilterOperator::Gt)]
	#[case("book__price__lt", "book__price", FilterOperator::Lt)]
	#[case("name__contains", "name", FilterOperator::Contains)]
	#[case("name", "name", FilterOperator::Eq)]
	#[case("name__exact", "name", FilterOperator::Eq)]
	#[case("num_authors__ge", "num_authors", FilterOperator::Gte)]
	#[case("num_authors__le", "num_authors", FilterOperator::Lte)]
	#[case("publisher__name", "publisher__name", FilterOperator::Eq)]
	fn test_lookup_parsing(#[case] lookup: &str, #[case] field: &str, #[case] op: FilterOperator) {
		let filter = Filter::lookup(lookup, "x").unwrap();
		assert_eq!(filter.field, field);
		assert_eq!(filter.operator, op);
	}

	#[rstest]
	fn test_range_requires_two_bounds() {
		let err = Filter::lookup("num_books__range", vec![1]).unwrap_err();
		assert!(matches!(err, QueryError::InvalidLookup { .. }));
		assert!(Filter::lookup("num_books__range", vec![1, 3]).is_ok());
	}

	#[rstest]
	fn test_in_requires_list() {
		assert!(Filter::lookup("num_books__in", 1).is_err());
		assert!(Filter::lookup("num_books__in", vec![1, 3]).is_ok());
	}

	#[rstest]
	fn test_isnull_requires_boolean() {
		assert!(Filter::lookup("num_books__isnull", 1).is_err());
		assert!(Filter::lookup("num_books__isnull", true).is_ok());
	}

	#[rstest]
	fn test_missing_field_name() {
		assert!(Filter::lookup("__gt", 1).is_err());
	}

	#[rstest]
	#[case(Filter::new("c", FilterOperator::Gt, 29), r#""t"."c" > 29"#)]
	#[case(Filter::new("c", FilterOperator::Contains, "Norvig"), r#""t"."c" LIKE '%Norvig%' ESCAPE '!'"#)]
	#[case(Filter::new("c", FilterOperator::StartsWith, "50%_off!"), r#""t"."c" LIKE '50!%!_off!!%' ESCAPE '!'"#)]
	#[case(Filter::new("c", FilterOperator::EndsWith, "a_b"), r#""t"."c" LIKE '%a!_b' ESCAPE '!'"#)]
	#[case(Filter::new("c", FilterOperator::IsNull, true), r#""t"."c" IS NULL"#)]
	#[case(Filter::new("c", FilterOperator::IsNull, false), r#""t"."c" IS NOT NULL"#)]
	#[case(Filter::exact("c", FilterValue::Null), r#""t"."c" IS NULL"#)]
	#[case(Filter::new("c", FilterOperator::Range, vec![1, 3]), r#""t"."c" BETWEEN 1 AND 3"#)]
	#[case(Filter::new("c", FilterOperator::In, vec![1, 3]), r#""t"."c" IN (1, 3)"#)]
	fn test_apply(#[case] filter: Filter, #[case] expected: &str) {
		let sql = render(&filter);
		assert!(sql.contains(expected), "{sql}");
	}
}
