//! Lookup path resolution
//!
//! Turns `publisher__book__authors__age` into the relation hops that have to
//! be joined and the column that terminates the path.

use super::error::QueryError;
use super::registry::{FieldKind, JoinStep, SchemaRegistry};

/// Separator between lookup path segments
pub const LOOKUP_SEP: &str = "__";

/// Pseudo-field naming the primary key of any model
pub const PK: &str = "pk";

/// One relation traversed by a lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathHop {
	/// Relation field name on the source model
	pub field: String,
	pub kind: FieldKind,
	/// Model reached by the hop
	pub target_model: String,
	pub steps: Vec<JoinStep>,
}

/// Outcome of resolving a lookup path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedLookup {
	pub hops: Vec<PathHop>,
	/// Model owning `column`
	pub model: String,
	pub column: String,
	/// The last segment named a relation rather than a scalar field
	pub ends_on_relation: bool,
}

impl ResolvedLookup {
	/// Whether any hop can multiply rows
	pub fn is_multi_valued(&self) -> bool {
		self.hops.iter().any(|hop| hop.kind.is_multi_valued())
	}
}

/// Walks lookup paths through a [`SchemaRegistry`]
#[derive(Debug, Clone, Copy)]
pub struct LookupResolver<'a> {
	registry: &'a SchemaRegistry,
}

impl<'a> LookupResolver<'a> {
	pub fn new(registry: &'a SchemaRegistry) -> Self {
		Self { registry }
	}

	/// Resolve `lookup` starting at `model`.
	///
	/// Non-terminal segments must be relations. A terminal relation resolves
	/// to the related primary key; for a forward foreign key that is the
	/// local column, so no join is emitted.
	pub fn resolve(&self, model: &str, lookup: &str) -> Result<ResolvedLookup, QueryError> {
		let segments: Vec<&str> = lookup.split(LOOKUP_SEP).collect();
		let mut current = self.registry.model(model)?;
		let mut hops = Vec::new();

		for (position, segment) in segments.iter().enumerate() {
			let terminal = position + 1 == segments.len();
			if segment.is_empty() {
				return Err(QueryError::field(current.name(), *segment, "empty lookup segment"));
			}

			let field = if *segment == PK {
				self.registry.field(current.name(), current.pk_name())?
			} else {
				self.registry.field(current.name(), segment)?
			};

			match field.kind() {
				FieldKind::Scalar => {
					if !terminal {
						return Err(QueryError::field(
							current.name(),
							*segment,
							"join attempted across a field that forbids joins",
						));
					}
					let column = field.column().unwrap_or(field.name()).to_string();
					return Ok(ResolvedLookup {
						hops,
						model: current.name().to_string(),
						column,
						ends_on_relation: false,
					});
				}
				FieldKind::ForeignKey if terminal => {
					let column = field.column().unwrap_or(field.name()).to_string();
					return Ok(ResolvedLookup {
						hops,
						model: current.name().to_string(),
						column,
						ends_on_relation: true,
					});
				}
				kind => {
					let target = field.target_model().ok_or_else(|| {
						QueryError::field(current.name(), *segment, "relation has no target model")
					})?;
					hops.push(PathHop {
						field: field.name().to_string(),
						kind,
						target_model: target.to_string(),
						steps: field.steps().to_vec(),
					});
					current = self.registry.model(target)?;
					if terminal {
						return Ok(ResolvedLookup {
							hops,
							model: current.name().to_string(),
							column: current.pk_column().to_string(),
							ends_on_relation: true,
						});
					}
				}
			}
		}

		// Unreachable for non-empty input; `split` always yields one segment.
		Err(QueryError::field(model, lookup, "empty lookup"))
	}
}
