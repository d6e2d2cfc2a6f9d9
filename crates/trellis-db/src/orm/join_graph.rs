//! Join graph with lineage-aware reuse
//!
//! Every join carries the [`Lineage`] that created it. Single-valued hops
//! leading off the base table are [`Lineage::Shared`]; once a path crosses a
//! multi-valued relation, the rest of it belongs to whoever asked for it:
//! the select side (annotations, `values`, ordering) or one `filter()` call.
//! A join is only reused when parent, relation step and lineage all match,
//! so an aggregate never ranges over rows a filter restricted, and two
//! `filter()` calls through the same relation constrain independent rows.

use super::lookup::PathHop;
use super::registry::JoinStep;

/// SQL join type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JoinKind {
	Inner,
	LeftOuter,
}

/// Who a join belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lineage {
	/// Forward foreign keys off the base table, usable by everyone
	Shared,
	/// Annotations, projected columns and ordering
	Select,
	/// Joins created by one `filter()` call (its generation number)
	Filter(usize),
}

impl Lineage {
	pub fn is_filter(self) -> bool {
		matches!(self, Lineage::Filter(_))
	}
}

/// One join in the graph
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinSpec {
	/// Index of the join this one hangs off, `None` for the base table
	pub parent: Option<usize>,
	pub from_alias: String,
	pub from_column: String,
	pub table: String,
	pub alias: String,
	pub to_column: String,
	pub kind: JoinKind,
	pub lineage: Lineage,
	step: JoinStep,
}

/// Ordered, deduplicated set of joins hanging off one base table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinGraph {
	base_table: String,
	alias_prefix: String,
	joins: Vec<JoinSpec>,
	alias_counter: usize,
}

impl JoinGraph {
	pub fn new(base_table: impl Into<String>, alias_prefix: impl Into<String>) -> Self {
		Self {
			base_table: base_table.into(),
			alias_prefix: alias_prefix.into(),
			joins: Vec::new(),
			alias_counter: 0,
		}
	}

	pub fn base_table(&self) -> &str {
		&self.base_table
	}

	/// The base table is aliased by its own name
	pub fn base_alias(&self) -> &str {
		&self.base_table
	}

	pub fn joins(&self) -> &[JoinSpec] {
		&self.joins
	}

	pub fn join(&self, index: usize) -> Option<&JoinSpec> {
		self.joins.get(index)
	}

	pub fn is_empty(&self) -> bool {
		self.joins.is_empty()
	}

	/// Alias of a join, or of the base table for `None`
	pub fn alias_of(&self, join: Option<usize>) -> &str {
		join.and_then(|index| self.joins.get(index))
			.map(|spec| spec.alias.as_str())
			.unwrap_or(self.base_table.as_str())
	}

	/// Add (or reuse) the joins for `hops` and return the join the path ends
	/// on, `None` when the path stays on the base table.
	pub fn add_path(&mut self, hops: &[PathHop], intent: Lineage) -> Option<usize> {
		let mut current: Option<usize> = None;
		let mut crossed_multi_valued = false;

		for hop in hops {
			crossed_multi_valued |= hop.kind.is_multi_valued();
			let lineage = if crossed_multi_valued {
				intent
			} else {
				Lineage::Shared
			};
			for step in &hop.steps {
				current = Some(self.add_step(current, step, lineage));
			}
		}
		current
	}

	fn add_step(&mut self, parent: Option<usize>, step: &JoinStep, lineage: Lineage) -> usize {
		if let Some(index) = self
			.joins
			.iter()
			.position(|j| j.parent == parent && j.step == *step && j.lineage == lineage)
		{
			tracing::trace!(
				table = %step.table,
				alias = %self.joins[index].alias,
				?lineage,
				"reusing join"
			);
			return index;
		}

		let alias = self.allocate_alias(&step.table);
		let kind = if lineage.is_filter() {
			JoinKind::Inner
		} else {
			JoinKind::LeftOuter
		};
		let from_alias = self.alias_of(parent).to_string();
		tracing::debug!(table = %step.table, alias = %alias, ?lineage, ?kind, "allocating join");
		self.joins.push(JoinSpec {
			parent,
			from_alias,
			from_column: step.from_column.clone(),
			table: step.table.clone(),
			alias,
			to_column: step.to_column.clone(),
			kind,
			lineage,
			step: step.clone(),
		});
		self.joins.len() - 1
	}

	/// First use of a table takes its name, later ones `<prefix><n>`
	fn allocate_alias(&mut self, table: &str) -> String {
		let taken = |alias: &str, graph: &JoinGraph| {
			alias == graph.base_table || graph.joins.iter().any(|j| j.alias == alias)
		};
		if !taken(table, self) {
			return table.to_string();
		}
		loop {
			self.alias_counter += 1;
			let candidate = format!("{}{}", self.alias_prefix, self.alias_counter);
			if !taken(&candidate, self) {
				return candidate;
			}
		}
	}

	/// Indices from the outermost join down to `join`
	pub fn chain(&self, join: Option<usize>) -> Vec<usize> {
		let mut chain = Vec::new();
		let mut current = join;
		while let Some(index) = current {
			chain.push(index);
			current = self.joins.get(index).and_then(|j| j.parent);
		}
		chain.reverse();
		chain
	}

	/// The outermost filter-lineage join on the chain leading to `join`.
	///
	/// Predicates below such a root are evaluated inside a correlated
	/// `EXISTS` anchored at it.
	pub fn filter_root(&self, join: Option<usize>) -> Option<usize> {
		self.chain(join)
			.into_iter()
			.find(|index| self.joins[*index].lineage.is_filter())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::orm::lookup::LookupResolver;
	use crate::orm::registry::{ModelDef, SchemaRegistry, ThroughTable};
	use rstest::*;

	#[fixture]
	fn registry() -> SchemaRegistry {
		SchemaRegistry::builder()
			.model(
				ModelDef::new("Author", "author").field("age").many_to_many(
					"friends",
					"Author",
					ThroughTable::new("author_friends", "from_author_id", "to_author_id"),
				),
			)
			.model(ModelDef::new("Publisher", "publisher").field("num_awards"))
			.model(
				ModelDef::new("Book", "book")
					.field("price")
					.foreign_key("publisher", "Publisher")
					.many_to_many(
						"authors",
						"Author",
						ThroughTable::new("book_authors", "book_id", "author_id"),
					),
			)
			.build()
			.unwrap()
	}

	fn hops(registry: &SchemaRegistry, model: &str, lookup: &str) -> Vec<PathHop> {
		LookupResolver::new(registry).resolve(model, lookup).unwrap().hops
	}

	#[rstest]
	fn test_same_path_same_lineage_is_reused(registry: SchemaRegistry) {
		// Arrange
		let mut graph = JoinGraph::new("book", "T");
		let path = hops(&registry, "Book", "authors__age");

		// Act
		let first = graph.add_path(&path, Lineage::Select);
		let second = graph.add_path(&path, Lineage::Select);

		// Assert
		assert_eq!(first, second);
		assert_eq!(graph.joins().len(), 2);
	}

	#[rstest]
	fn test_filter_and_select_lineages_get_distinct_joins(registry: SchemaRegistry) {
		let mut graph = JoinGraph::new("book", "T");
		let path = hops(&registry, "Book", "authors__age");

		let filtered = graph.add_path(&path, Lineage::Filter(1));
		let selected = graph.add_path(&path, Lineage::Select);

		assert_ne!(graph.alias_of(filtered), graph.alias_of(selected));
		assert_eq!(graph.joins().len(), 4);
		assert_eq!(graph.join(filtered.unwrap()).unwrap().kind, JoinKind::Inner);
		assert_eq!(graph.join(selected.unwrap()).unwrap().kind, JoinKind::LeftOuter);
	}

	#[rstest]
	fn test_separate_filter_generations_do_not_share(registry: SchemaRegistry) {
		let mut graph = JoinGraph::new("book", "T");
		let path = hops(&registry, "Book", "authors__age");

		let first = graph.add_path(&path, Lineage::Filter(1));
		let second = graph.add_path(&path, Lineage::Filter(2));

		assert_ne!(first, second);
	}

	#[rstest]
	fn test_forward_fk_prefix_is_shared(registry: SchemaRegistry) {
		let mut graph = JoinGraph::new("book", "T");
		let path = hops(&registry, "Book", "publisher__num_awards");

		let filtered = graph.add_path(&path, Lineage::Filter(1));
		let selected = graph.add_path(&path, Lineage::Select);

		assert_eq!(filtered, selected);
		assert_eq!(graph.joins()[0].lineage, Lineage::Shared);
		assert_eq!(graph.filter_root(filtered), None);
	}

	#[rstest]
	fn test_alias_naming(registry: SchemaRegistry) {
		let mut graph = JoinGraph::new("author", "T");
		let path = hops(&registry, "Author", "friends__age");

		let end = graph.add_path(&path, Lineage::Select);

		let aliases: Vec<&str> = graph.joins().iter().map(|j| j.alias.as_str()).collect();
		assert_eq!(aliases, vec!["author_friends", "T1"]);
		assert_eq!(graph.alias_of(end), "T1");
		assert_eq!(graph.joins()[1].from_alias, "author_friends");
	}

	#[rstest]
	fn test_filter_root_is_first_filter_join(registry: SchemaRegistry) {
		let mut graph = JoinGraph::new("book", "T");
		let path = hops(&registry, "Book", "authors__age");

		let end = graph.add_path(&path, Lineage::Filter(3));

		assert_eq!(graph.chain(end), vec![0, 1]);
		assert_eq!(graph.filter_root(end), Some(0));
	}

	#[rstest]
	fn test_alias_counter_is_per_graph(registry: SchemaRegistry) {
		let path = hops(&registry, "Author", "friends__age");
		let mut base = JoinGraph::new("author", "T");
		base.add_path(&path, Lineage::Select);

		let mut left = base.clone();
		let mut right = base.clone();
		let l = left.add_path(&path, Lineage::Filter(1));
		let r = right.add_path(&path, Lineage::Filter(1));

		assert_eq!(left.alias_of(l), right.alias_of(r));
	}
}
