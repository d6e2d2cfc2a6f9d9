//! Compiles query state into sea-query statements
//!
//! Three shapes come out of here:
//!
//! - annotated rows: the projected columns, extra selects and annotations
//!   with GROUP BY/HAVING/ORDER BY, joins pruned to the ones referenced;
//! - a plain aggregate: one row of aggregates over the filtered base rows;
//! - an aggregate over annotated rows: the annotated query wrapped as a
//!   derived table named `subquery`.
//!
//! Filter-lineage joins never reach the outer FROM clause. Predicates on
//! them are grouped by the join their path starts at and rendered as one
//! correlated `EXISTS (...)` per group. A null test on such a path becomes
//! `NOT EXISTS (...) OR EXISTS (... IS NULL)`, so rows without any related
//! row match it.

use super::aggregation::Aggregate;
use super::error::QueryError;
use super::filters::Filter;
use super::join_graph::{JoinGraph, JoinKind, JoinSpec};
use super::query::{Annotation, ColumnRef, GroupByItem, Operand, QueryState};
use super::registry::SchemaRegistry;
use crate::settings::DbBackend;
use indexmap::IndexMap;
use sea_query::{Alias, Expr, ExprTrait, JoinType, Order, Query, SelectStatement};
use std::collections::BTreeSet;

/// Alias of the derived table used by aggregates over annotated rows
pub const SUBQUERY_ALIAS: &str = "subquery";

fn ident(name: &str) -> Alias {
	Alias::new(name.to_string())
}

fn column_expr(graph: &JoinGraph, column: &ColumnRef) -> Expr {
	Expr::col((ident(graph.alias_of(column.join)), ident(&column.column)))
}

fn join_condition(spec: &JoinSpec) -> Expr {
	Expr::col((ident(&spec.from_alias), ident(&spec.from_column)))
		.equals((ident(&spec.alias), ident(&spec.to_column)))
}

fn render_annotation(graph: &JoinGraph, annotation: &Annotation, backend: DbBackend) -> String {
	let column = backend.qualified(
		graph.alias_of(annotation.target.join),
		&annotation.target.column,
	);
	annotation.aggregate.render(&column)
}

fn add_from(stmt: &mut SelectStatement, table: &str, alias: &str) {
	if table == alias {
		stmt.from(ident(table));
	} else {
		stmt.from_as(ident(table), ident(alias));
	}
}

fn add_join(stmt: &mut SelectStatement, join_type: JoinType, spec: &JoinSpec) {
	if spec.table == spec.alias {
		stmt.join(join_type, ident(&spec.table), join_condition(spec));
	} else {
		stmt.join_as(
			join_type,
			ident(&spec.table),
			ident(&spec.alias),
			join_condition(spec),
		);
	}
}

/// Joins referenced by the statement, with their ancestors
struct NeededJoins<'a> {
	graph: &'a JoinGraph,
	indices: BTreeSet<usize>,
}

impl<'a> NeededJoins<'a> {
	fn new(graph: &'a JoinGraph) -> Self {
		Self {
			graph,
			indices: BTreeSet::new(),
		}
	}

	fn add(&mut self, join: Option<usize>) {
		self.indices.extend(self.graph.chain(join));
	}

	/// Parents always precede children in the graph, so index order is a
	/// valid join order.
	fn apply(self, stmt: &mut SelectStatement) {
		for index in self.indices {
			let Some(spec) = self.graph.join(index) else {
				continue;
			};
			if spec.lineage.is_filter() {
				continue;
			}
			let join_type = match spec.kind {
				JoinKind::LeftOuter => JoinType::LeftJoin,
				JoinKind::Inner => JoinType::InnerJoin,
			};
			add_join(stmt, join_type, spec);
		}
	}
}

fn apply_where(
	stmt: &mut SelectStatement,
	state: &QueryState,
	needed: &mut NeededJoins<'_>,
) {
	let graph = &*state.joins;
	let mut exists: IndexMap<usize, Vec<(&ColumnRef, &Filter)>> = IndexMap::new();

	for predicate in state.predicates.iter() {
		match &predicate.operand {
			Operand::Column(column) => match graph.filter_root(column.join) {
				Some(root) => exists
					.entry(root)
					.or_default()
					.push((column, &predicate.filter)),
				None => {
					needed.add(column.join);
					stmt.and_where(predicate.filter.apply(column_expr(graph, column)));
				}
			},
			Operand::Extra(name) => {
				if let Some(sql) = state.extra.get(name) {
					stmt.and_where(predicate.filter.apply(Expr::cust(sql.clone())));
				}
			}
			Operand::Annotation(_) => {}
		}
	}

	for (root, predicates) in exists {
		let Some(root_spec) = graph.join(root) else {
			continue;
		};
		needed.add(root_spec.parent);

		// A null test through a multi-valued path also holds for rows with no
		// related row at all, which no inner-joined subquery can see.
		let (nulls, rest): (Vec<_>, Vec<_>) = predicates
			.into_iter()
			.partition(|(_, filter)| filter.is_null_test());
		if !rest.is_empty() {
			let conditions: Vec<_> = rest.into_iter().map(|(c, f)| (c, Some(f))).collect();
			stmt.and_where(Expr::exists(correlated(graph, root, &conditions)));
		}
		for (column, filter) in nulls {
			let absent = correlated(graph, root, &[(column, None)]);
			let null_row = correlated(graph, root, &[(column, Some(filter))]);
			stmt.and_where(Expr::not_exists(absent).or(Expr::exists(null_row)));
		}
	}
}

/// `SELECT 1` over the filter joins from `root` down to the given columns,
/// correlated with the outer row and restricted by the given filters
fn correlated(
	graph: &JoinGraph,
	root: usize,
	conditions: &[(&ColumnRef, Option<&Filter>)],
) -> SelectStatement {
	let mut sub = Query::select();
	sub.expr(Expr::val(1));
	let Some(root_spec) = graph.join(root) else {
		return sub;
	};

	let mut inner = BTreeSet::new();
	for (column, _) in conditions {
		inner.extend(
			graph
				.chain(column.join)
				.into_iter()
				.skip_while(|index| *index != root)
				.skip(1),
		);
	}

	add_from(&mut sub, &root_spec.table, &root_spec.alias);
	for index in inner {
		if let Some(spec) = graph.join(index) {
			add_join(&mut sub, JoinType::InnerJoin, spec);
		}
	}
	sub.and_where(
		Expr::col((ident(&root_spec.alias), ident(&root_spec.to_column)))
			.equals((ident(&root_spec.from_alias), ident(&root_spec.from_column))),
	);
	for (column, filter) in conditions {
		let Some(filter) = filter else {
			continue;
		};
		sub.and_where(filter.apply(column_expr(graph, column)));
	}
	sub
}

/// Compile the annotated-rows statement and its output column names
pub(crate) fn compile_rows(
	state: &QueryState,
	registry: &SchemaRegistry,
	backend: DbBackend,
	with_ordering: bool,
) -> Result<(SelectStatement, Vec<String>), QueryError> {
	let meta = registry.model(&state.model)?;
	let graph = &*state.joins;
	let mut stmt = Query::select();
	let mut needed = NeededJoins::new(graph);
	let mut columns = Vec::new();

	for (name, column) in state.emitted_columns(meta) {
		stmt.expr_as(column_expr(graph, &column), ident(&name));
		needed.add(column.join);
		columns.push(name);
	}
	for (name, sql) in state.emitted_extras() {
		stmt.expr_as(Expr::cust(sql.to_string()), ident(name));
		columns.push(name.to_string());
	}
	for (alias, annotation) in state.annotations.iter() {
		stmt.expr_as(
			Expr::cust(render_annotation(graph, annotation, backend)),
			ident(alias),
		);
		needed.add(annotation.target.join);
		columns.push(alias.clone());
	}

	add_from(&mut stmt, graph.base_table(), graph.base_alias());
	apply_where(&mut stmt, state, &mut needed);

	if let Some(group_by) = &state.group_by {
		let exprs: Vec<Expr> = group_by
			.iter()
			.map(|item| match item {
				GroupByItem::Column(column) => {
					needed.add(column.join);
					column_expr(graph, column)
				}
				GroupByItem::Raw(sql) => Expr::cust(sql.clone()),
			})
			.collect();
		if !exprs.is_empty() {
			stmt.add_group_by(exprs);
		}
	}

	for predicate in state.having.iter() {
		if let Operand::Annotation(name) = &predicate.operand
			&& let Some(annotation) = state.annotations.get(name)
		{
			let sql = render_annotation(graph, annotation, backend);
			stmt.and_having(predicate.filter.apply(Expr::cust(sql)));
		}
	}

	if with_ordering {
		for term in state.order_by.iter() {
			let order = if term.descending { Order::Desc } else { Order::Asc };
			match &term.operand {
				Operand::Column(column) => {
					needed.add(column.join);
					stmt.order_by_expr(column_expr(graph, column), order);
				}
				Operand::Annotation(name) => {
					if let Some(annotation) = state.annotations.get(name) {
						let sql = render_annotation(graph, annotation, backend);
						stmt.order_by_expr(Expr::cust(sql), order);
					}
				}
				Operand::Extra(name) => {
					if let Some(sql) = state.extra.get(name) {
						stmt.order_by_expr(Expr::cust(sql.clone()), order);
					}
				}
			}
		}
	}

	needed.apply(&mut stmt);
	Ok((stmt, columns))
}

/// Compile a single-row aggregate over the filtered base rows.
///
/// `state` must already contain the joins of `aggregates`; projected
/// columns, extra selects and ordering are ignored.
pub(crate) fn compile_aggregate(
	state: &QueryState,
	aggregates: &[(String, Annotation)],
	backend: DbBackend,
) -> (SelectStatement, Vec<String>) {
	let graph = &*state.joins;
	let mut stmt = Query::select();
	let mut needed = NeededJoins::new(graph);
	let mut columns = Vec::new();

	for (alias, annotation) in aggregates {
		stmt.expr_as(
			Expr::cust(render_annotation(graph, annotation, backend)),
			ident(alias),
		);
		needed.add(annotation.target.join);
		columns.push(alias.clone());
	}

	add_from(&mut stmt, graph.base_table(), graph.base_alias());
	apply_where(&mut stmt, state, &mut needed);
	needed.apply(&mut stmt);
	(stmt, columns)
}

/// Compile aggregates over the output columns of the annotated query
pub(crate) fn compile_aggregate_over_annotations(
	state: &QueryState,
	aggregates: &[(String, Aggregate, String)],
	registry: &SchemaRegistry,
	backend: DbBackend,
) -> Result<(SelectStatement, Vec<String>), QueryError> {
	let (inner, _) = compile_rows(state, registry, backend, false)?;
	let mut stmt = Query::select();
	let mut columns = Vec::new();

	for (alias, aggregate, column) in aggregates {
		let column = backend.qualified(SUBQUERY_ALIAS, column);
		stmt.expr_as(Expr::cust(aggregate.render(&column)), ident(alias));
		columns.push(alias.clone());
	}
	stmt.from_subquery(inner, ident(SUBQUERY_ALIAS));
	Ok((stmt, columns))
}
