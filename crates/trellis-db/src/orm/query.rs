//! QuerySet: the composable query
//!
//! Every chain call takes `&self` and returns a new [`QuerySet`]. The state
//! is a set of `Arc`-shared parts; a call clones only the parts it changes,
//! so branches built from one base query never see each other's joins,
//! filters or alias counters.
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//! use trellis_db::orm::aggregation::Aggregate;
//! use trellis_db::orm::filters::Filter;
//! use trellis_db::orm::query::QuerySet;
//! use trellis_db::orm::registry::{ModelDef, SchemaRegistry};
//! use trellis_db::settings::DbBackend;
//!
//! let registry = Arc::new(
//!     SchemaRegistry::builder()
//!         .model(ModelDef::new("Publisher", "publisher").field("name"))
//!         .model(
//!             ModelDef::new("Book", "book")
//!                 .field("price")
//!                 .foreign_key("publisher", "Publisher"),
//!         )
//!         .build()
//!         .unwrap(),
//! );
//!
//! let publishers = QuerySet::new(registry, "Publisher")
//!     .unwrap()
//!     .annotate([Aggregate::count("book").with_alias("num_books")])
//!     .unwrap()
//!     .filter([Filter::lookup("num_books__gt", 1).unwrap()])
//!     .unwrap();
//!
//! let (sql, params) = publishers.render(DbBackend::Sqlite).unwrap();
//! let (_, having) = sql.split_once(" HAVING ").unwrap();
//! assert!(having.contains("COUNT(\"book\".\"id\")"));
//! assert_eq!(params.len(), 1);
//! ```

use super::aggregation::Aggregate;
use super::compiler;
use super::error::{ExecutionError, QueryError};
use super::filters::Filter;
use super::join_graph::{JoinGraph, Lineage};
use super::lookup::{LOOKUP_SEP, LookupResolver, PK};
use super::materializer::{AggregateResult, Materializer, PlanMode, QueryPlan, QueryValue, Row};
use super::registry::{ModelMeta, SchemaRegistry};
use crate::settings::{DbBackend, OrmSettings};
use indexmap::IndexMap;
use std::sync::Arc;

/// A column reached through the join graph (`None` is the base table)
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ColumnRef {
	pub join: Option<usize>,
	pub column: String,
}

/// An aggregate bound to the column it ranges over
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Annotation {
	pub aggregate: Aggregate,
	pub target: ColumnRef,
}

/// Left-hand side of a predicate or an ordering term
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Operand {
	Column(ColumnRef),
	Annotation(String),
	Extra(String),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Predicate {
	pub operand: Operand,
	pub filter: Filter,
}

/// Entry of a `values()` restriction
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Selected {
	Column { name: String, column: ColumnRef },
	Annotation(String),
	Extra(String),
}

impl Selected {
	fn name(&self) -> &str {
		match self {
			Selected::Column { name, .. } => name,
			Selected::Annotation(name) | Selected::Extra(name) => name,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum GroupByItem {
	Column(ColumnRef),
	/// Raw SQL of an extra select
	Raw(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct OrderTerm {
	pub operand: Operand,
	pub descending: bool,
}

/// Structurally shared query state
#[derive(Debug, Clone)]
pub(crate) struct QueryState {
	pub model: String,
	pub joins: Arc<JoinGraph>,
	/// WHERE predicates on columns and extra selects
	pub predicates: Arc<Vec<Predicate>>,
	/// HAVING predicates on annotations
	pub having: Arc<Vec<Predicate>>,
	pub values: Option<Arc<Vec<Selected>>>,
	pub annotations: Arc<IndexMap<String, Annotation>>,
	pub extra: Arc<IndexMap<String, String>>,
	/// `Some` once grouping is active
	pub group_by: Option<Arc<Vec<GroupByItem>>>,
	pub order_by: Arc<Vec<OrderTerm>>,
	pub filter_generation: usize,
}

impl QueryState {
	fn new(meta: &ModelMeta, alias_prefix: &str) -> Self {
		Self {
			model: meta.name().to_string(),
			joins: Arc::new(JoinGraph::new(meta.table(), alias_prefix)),
			predicates: Arc::default(),
			having: Arc::default(),
			values: None,
			annotations: Arc::default(),
			extra: Arc::default(),
			group_by: None,
			order_by: Arc::default(),
			filter_generation: 0,
		}
	}

	/// Non-aggregate, non-extra columns in output order
	pub(crate) fn emitted_columns(&self, meta: &ModelMeta) -> Vec<(String, ColumnRef)> {
		match &self.values {
			Some(values) if !values.is_empty() => values
				.iter()
				.filter_map(|selected| match selected {
					Selected::Column { name, column } => Some((name.clone(), column.clone())),
					_ => None,
				})
				.collect(),
			_ => meta
				.concrete_fields()
				.map(|field| {
					(
						field.attname(),
						ColumnRef {
							join: None,
							column: field.column().unwrap_or(field.name()).to_string(),
						},
					)
				})
				.collect(),
		}
	}

	fn extra_emitted(&self, alias: &str) -> bool {
		match &self.values {
			Some(values) if !values.is_empty() => values
				.iter()
				.any(|selected| matches!(selected, Selected::Extra(name) if name == alias)),
			_ => true,
		}
	}

	/// Extra selects in output order
	pub(crate) fn emitted_extras(&self) -> Vec<(&str, &str)> {
		self.extra
			.iter()
			.filter(|(alias, _)| self.extra_emitted(alias))
			.map(|(alias, sql)| (alias.as_str(), sql.as_str()))
			.collect()
	}

	pub(crate) fn output_columns(&self, meta: &ModelMeta) -> Vec<String> {
		let mut columns: Vec<String> = self
			.emitted_columns(meta)
			.into_iter()
			.map(|(name, _)| name)
			.collect();
		columns.extend(self.emitted_extras().into_iter().map(|(name, _)| name.to_string()));
		columns.extend(self.annotations.keys().cloned());
		columns
	}

	/// Non-aggregate selection as GROUP BY items
	fn selection_group_by(&self, meta: &ModelMeta) -> Vec<GroupByItem> {
		let mut items: Vec<GroupByItem> = Vec::new();
		let selection = self
			.emitted_columns(meta)
			.into_iter()
			.map(|(_, column)| GroupByItem::Column(column))
			.chain(
				self.emitted_extras()
					.into_iter()
					.map(|(_, sql)| GroupByItem::Raw(sql.to_string())),
			);
		for item in selection {
			if !items.contains(&item) {
				items.push(item);
			}
		}
		items
	}

	/// Replace GROUP BY with the current selection
	fn regroup(&mut self, meta: &ModelMeta) {
		let items = self.selection_group_by(meta);
		tracing::debug!(model = %self.model, items = items.len(), "recomputed GROUP BY");
		self.group_by = Some(Arc::new(items));
	}

	/// Append selected columns missing from an active GROUP BY
	fn extend_group_by(&mut self, meta: &ModelMeta) {
		if self.group_by.is_none() {
			return;
		}
		let selection = self.selection_group_by(meta);
		if let Some(group_by) = self.group_by.as_mut() {
			let group_by = Arc::make_mut(group_by);
			for item in selection {
				if !group_by.contains(&item) {
					tracing::trace!(?item, "extending GROUP BY");
					group_by.push(item);
				}
			}
		}
	}
}

/// A lazily evaluated, composable query over one model
#[derive(Debug, Clone)]
pub struct QuerySet {
	registry: Arc<SchemaRegistry>,
	settings: Arc<OrmSettings>,
	state: QueryState,
}

impl QuerySet {
	/// Query all rows of `model` with default settings
	pub fn new(registry: Arc<SchemaRegistry>, model: &str) -> Result<Self, QueryError> {
		Self::with_settings(registry, model, OrmSettings::default())
	}

	pub fn with_settings(
		registry: Arc<SchemaRegistry>,
		model: &str,
		settings: OrmSettings,
	) -> Result<Self, QueryError> {
		let state = QueryState::new(registry.model(model)?, &settings.alias_prefix);
		Ok(Self {
			registry,
			settings: Arc::new(settings),
			state,
		})
	}

	pub fn model(&self) -> &str {
		&self.state.model
	}

	pub fn settings(&self) -> &OrmSettings {
		&self.settings
	}

	pub fn registry(&self) -> &SchemaRegistry {
		&self.registry
	}

	/// Whether any annotation (and hence grouping) is present
	pub fn is_grouped(&self) -> bool {
		self.state.group_by.is_some()
	}

	/// Output column names, in select order
	pub fn columns(&self) -> Result<Vec<String>, QueryError> {
		Ok(self.state.output_columns(self.meta()?))
	}

	fn meta(&self) -> Result<&ModelMeta, QueryError> {
		self.registry.model(&self.state.model)
	}

	fn derive(&self) -> Self {
		self.clone()
	}

	/// Resolve a name against annotations, extra selects and model paths
	fn resolve_operand(&mut self, name: &str, intent: Lineage) -> Result<Operand, QueryError> {
		if self.state.annotations.contains_key(name) {
			return Ok(Operand::Annotation(name.to_string()));
		}
		if self.state.extra.contains_key(name) {
			return Ok(Operand::Extra(name.to_string()));
		}
		let resolved = LookupResolver::new(&self.registry).resolve(&self.state.model, name)?;
		let join = Arc::make_mut(&mut self.state.joins).add_path(&resolved.hops, intent);
		Ok(Operand::Column(ColumnRef {
			join,
			column: resolved.column,
		}))
	}

	fn check_alias(&self, meta: &ModelMeta, alias: &str) -> Result<(), QueryError> {
		if meta.field(alias).is_some() || meta.concrete_fields().any(|f| f.attname() == alias) {
			return Err(QueryError::alias_collision(alias, "field"));
		}
		if self.state.annotations.contains_key(alias) {
			return Err(QueryError::alias_collision(alias, "annotation"));
		}
		if self.state.extra.contains_key(alias) {
			return Err(QueryError::alias_collision(alias, "extra select"));
		}
		if let Some(values) = &self.state.values
			&& values
				.iter()
				.any(|s| matches!(s, Selected::Column { name, .. } if name == alias))
		{
			return Err(QueryError::alias_collision(alias, "selected column"));
		}
		Ok(())
	}

	/// Add predicates. All filters of one call constrain the same related
	/// rows; separate calls through a multi-valued relation are independent.
	///
	/// A filter naming an annotation becomes a HAVING condition, one naming
	/// an extra select compares its SQL expression.
	pub fn filter<I>(&self, filters: I) -> Result<Self, QueryError>
	where
		I: IntoIterator<Item = Filter>,
	{
		let mut next = self.derive();
		next.state.filter_generation += 1;
		let generation = next.state.filter_generation;

		for filter in filters {
			filter.validate()?;
			let operand = next.resolve_operand(&filter.field, Lineage::Filter(generation))?;
			let having = matches!(operand, Operand::Annotation(_));
			let predicate = Predicate { operand, filter };
			if having {
				Arc::make_mut(&mut next.state.having).push(predicate);
			} else {
				Arc::make_mut(&mut next.state.predicates).push(predicate);
			}
		}

		tracing::debug!(model = %self.state.model, generation, "filter applied");
		Ok(next)
	}

	/// Attach per-row aggregates and group by the current selection.
	///
	/// Every call recomputes GROUP BY from what is selected at that point,
	/// so interleaving `order_by`, `values` and further `annotate` calls
	/// keeps the grouping in step with the output.
	pub fn annotate<I>(&self, aggregates: I) -> Result<Self, QueryError>
	where
		I: IntoIterator<Item = Aggregate>,
	{
		let aggregates: Vec<Aggregate> = aggregates.into_iter().collect();
		if aggregates.is_empty() {
			return Ok(self.derive());
		}

		let meta = self.meta()?;
		let mut next = self.derive();
		for aggregate in aggregates {
			aggregate.validate()?;
			let alias = aggregate.alias();
			next.check_alias(meta, &alias)?;

			let resolved =
				LookupResolver::new(&self.registry).resolve(&self.state.model, aggregate.lookup())?;
			if resolved.ends_on_relation && !aggregate.function().accepts_relation() {
				return Err(QueryError::InvalidAggregateTarget {
					function: aggregate.function().to_string(),
					lookup: aggregate.lookup().to_string(),
				});
			}
			let join = Arc::make_mut(&mut next.state.joins).add_path(&resolved.hops, Lineage::Select);
			tracing::debug!(alias = %alias, function = %aggregate.function(), lookup = %aggregate.lookup(), "annotation added");
			Arc::make_mut(&mut next.state.annotations).insert(
				alias,
				Annotation {
					aggregate,
					target: ColumnRef {
						join,
						column: resolved.column,
					},
				},
			);
		}
		next.state.regroup(meta);
		Ok(next)
	}

	/// Restrict the emitted columns. An empty list selects every column.
	///
	/// Before `annotate` this defines the grouping. Afterwards it only
	/// projects: annotations stay emitted and newly referenced columns join
	/// the existing GROUP BY.
	pub fn values<I, S>(&self, fields: I) -> Result<Self, QueryError>
	where
		I: IntoIterator<Item = S>,
		S: AsRef<str>,
	{
		let meta = self.meta()?;
		let mut next = self.derive();
		let mut selected: Vec<Selected> = Vec::new();

		for field in fields {
			let name = field.as_ref();
			if selected.iter().any(|s| s.name() == name) {
				continue;
			}
			let entry = match next.resolve_operand(name, Lineage::Select)? {
				Operand::Annotation(alias) => Selected::Annotation(alias),
				Operand::Extra(alias) => Selected::Extra(alias),
				Operand::Column(column) => Selected::Column {
					name: name.to_string(),
					column,
				},
			};
			selected.push(entry);
		}

		next.state.values = Some(Arc::new(selected));
		next.state.extend_group_by(meta);
		Ok(next)
	}

	/// Add raw SQL select columns, keyed by alias
	pub fn extra<I, K, V>(&self, select: I) -> Result<Self, QueryError>
	where
		I: IntoIterator<Item = (K, V)>,
		K: Into<String>,
		V: Into<String>,
	{
		let meta = self.meta()?;
		let mut next = self.derive();
		for (alias, sql) in select {
			let alias = alias.into();
			let sql = sql.into();
			next.check_alias(meta, &alias)?;
			Arc::make_mut(&mut next.state.extra).insert(alias, sql);
		}
		next.state.extend_group_by(meta);
		Ok(next)
	}

	/// Replace the ordering; a leading `-` sorts descending
	pub fn order_by<I, S>(&self, fields: I) -> Result<Self, QueryError>
	where
		I: IntoIterator<Item = S>,
		S: AsRef<str>,
	{
		let mut next = self.derive();
		let mut terms = Vec::new();
		for field in fields {
			let field = field.as_ref();
			let (name, descending) = match field.strip_prefix('-') {
				Some(name) => (name, true),
				None => (field, false),
			};
			let operand = next.resolve_operand(name, Lineage::Select)?;
			terms.push(OrderTerm {
				operand,
				descending,
			});
		}
		next.state.order_by = Arc::new(terms);
		Ok(next)
	}

	/// Terminal aggregation.
	///
	/// Without annotations the aggregates run over the filtered base rows.
	/// With annotations they run over the annotated rows, and each lookup has
	/// to name one output column of that query.
	pub fn aggregate<I>(&self, aggregates: I) -> Result<AggregateQuery, QueryError>
	where
		I: IntoIterator<Item = Aggregate>,
	{
		let aggregates: Vec<Aggregate> = aggregates.into_iter().collect();
		let mut aliases: Vec<String> = Vec::new();
		for aggregate in &aggregates {
			aggregate.validate()?;
			let alias = aggregate.alias();
			if aliases.contains(&alias) {
				return Err(QueryError::alias_collision(alias, "aggregate"));
			}
			aliases.push(alias);
		}

		let kind = if aggregates.is_empty() {
			AggregateKind::Empty
		} else if self.state.annotations.is_empty() {
			let mut state = self.state.clone();
			let mut bound = Vec::new();
			for (alias, aggregate) in aliases.iter().zip(aggregates) {
				let resolved =
					LookupResolver::new(&self.registry).resolve(&state.model, aggregate.lookup())?;
				if resolved.ends_on_relation && !aggregate.function().accepts_relation() {
					return Err(QueryError::InvalidAggregateTarget {
						function: aggregate.function().to_string(),
						lookup: aggregate.lookup().to_string(),
					});
				}
				let join = Arc::make_mut(&mut state.joins).add_path(&resolved.hops, Lineage::Select);
				bound.push((
					alias.clone(),
					Annotation {
						aggregate,
						target: ColumnRef {
							join,
							column: resolved.column,
						},
					},
				));
			}
			AggregateKind::Plain {
				state,
				aggregates: bound,
			}
		} else {
			let meta = self.meta()?;
			let columns = self.state.output_columns(meta);
			let mut bound = Vec::new();
			for (alias, aggregate) in aliases.iter().zip(aggregates) {
				let lookup = aggregate.lookup();
				if lookup.contains(LOOKUP_SEP) {
					return Err(QueryError::field(
						&self.state.model,
						lookup,
						"Joins are not allowed here",
					));
				}
				let column = if lookup == PK { meta.pk_name() } else { lookup };
				if !columns.iter().any(|c| c == column) {
					return Err(QueryError::field(
						&self.state.model,
						lookup,
						format!(
							"not an output column of the annotated query; choices are: {}",
							columns.join(", ")
						),
					));
				}
				let column = column.to_string();
				bound.push((alias.clone(), aggregate, column));
			}
			AggregateKind::OverAnnotations {
				state: self.state.clone(),
				aggregates: bound,
			}
		};

		Ok(AggregateQuery {
			registry: Arc::clone(&self.registry),
			settings: Arc::clone(&self.settings),
			kind,
		})
	}

	/// Compile for the configured backend
	pub fn plan(&self) -> Result<QueryPlan, QueryError> {
		self.plan_for(self.settings.backend)
	}

	pub fn plan_for(&self, backend: DbBackend) -> Result<QueryPlan, QueryError> {
		let (statement, columns) = compiler::compile_rows(&self.state, &self.registry, backend, true)?;
		let plan = QueryPlan::new(statement, PlanMode::AnnotatedRows, columns, backend);
		if self.settings.echo {
			tracing::debug!(sql = %plan.to_inline_sql(), "compiled query");
		}
		Ok(plan)
	}

	/// SQL with placeholders and its parameters
	pub fn render(&self, backend: DbBackend) -> Result<(String, Vec<QueryValue>), QueryError> {
		Ok(self.plan_for(backend)?.to_sql())
	}

	/// Execute and return rows keyed by output column
	pub async fn fetch(&self, materializer: &dyn Materializer) -> Result<Vec<Row>, ExecutionError> {
		let plan = self.plan_for(materializer.backend())?;
		let rows = materializer.fetch(&plan).await?;
		Ok(AggregateResult::from_rows(&plan, rows)?.into_rows())
	}
}

#[derive(Debug, Clone)]
enum AggregateKind {
	Empty,
	Plain {
		state: QueryState,
		aggregates: Vec<(String, Annotation)>,
	},
	OverAnnotations {
		state: QueryState,
		aggregates: Vec<(String, Aggregate, String)>,
	},
}

/// Result of [`QuerySet::aggregate`], ready to compile or execute
#[derive(Debug, Clone)]
pub struct AggregateQuery {
	registry: Arc<SchemaRegistry>,
	settings: Arc<OrmSettings>,
	kind: AggregateKind,
}

impl AggregateQuery {
	/// Whether no aggregates were requested; executing returns an empty map
	pub fn is_empty(&self) -> bool {
		matches!(self.kind, AggregateKind::Empty)
	}

	/// Output aliases, in select order
	pub fn aliases(&self) -> Vec<String> {
		match &self.kind {
			AggregateKind::Empty => Vec::new(),
			AggregateKind::Plain { aggregates, .. } => {
				aggregates.iter().map(|(alias, _)| alias.clone()).collect()
			}
			AggregateKind::OverAnnotations { aggregates, .. } => {
				aggregates.iter().map(|(alias, _, _)| alias.clone()).collect()
			}
		}
	}

	/// Compile for the configured backend; `None` when empty
	pub fn plan(&self) -> Result<Option<QueryPlan>, QueryError> {
		self.plan_for(self.settings.backend)
	}

	pub fn plan_for(&self, backend: DbBackend) -> Result<Option<QueryPlan>, QueryError> {
		let (statement, columns) = match &self.kind {
			AggregateKind::Empty => return Ok(None),
			AggregateKind::Plain { state, aggregates } => {
				compiler::compile_aggregate(state, aggregates, backend)
			}
			AggregateKind::OverAnnotations { state, aggregates } => {
				compiler::compile_aggregate_over_annotations(state, aggregates, &self.registry, backend)?
			}
		};
		let plan = QueryPlan::new(statement, PlanMode::ScalarAggregate, columns, backend);
		if self.settings.echo {
			tracing::debug!(sql = %plan.to_inline_sql(), "compiled aggregate");
		}
		Ok(Some(plan))
	}

	pub fn render(&self, backend: DbBackend) -> Result<Option<(String, Vec<QueryValue>)>, QueryError> {
		Ok(self.plan_for(backend)?.map(|plan| plan.to_sql()))
	}

	/// Execute and return alias to value. Empty aggregations never reach
	/// the materializer.
	pub async fn execute(&self, materializer: &dyn Materializer) -> Result<Row, ExecutionError> {
		let Some(plan) = self.plan_for(materializer.backend())? else {
			return Ok(Row::new());
		};
		let rows = materializer.fetch(&plan).await?;
		AggregateResult::from_rows(&plan, rows)?
			.into_scalar()
			.ok_or(ExecutionError::UnexpectedRowCount(0))
	}
}
