//! Schema registry for lookup resolution
//!
//! The registry answers one question for the query engine: given a model and
//! a field name, what kind of field is it, which column backs it, and which
//! joins lead to the related model. Models are declared with [`ModelDef`] and
//! frozen by [`SchemaRegistryBuilder::build`], which also derives the reverse
//! side of every relation.
//!
//! # Examples
//!
//! ```
//! use trellis_db::orm::registry::{FieldKind, ModelDef, SchemaRegistry, ThroughTable};
//!
//! let registry = SchemaRegistry::builder()
//!     .model(ModelDef::new("Publisher", "publisher").field("name"))
//!     .model(
//!         ModelDef::new("Book", "book")
//!             .field("price")
//!             .foreign_key("publisher", "Publisher"),
//!     )
//!     .build()
//!     .unwrap();
//!
//! let reverse = registry.field("Publisher", "book").unwrap();
//! assert_eq!(reverse.kind(), FieldKind::ReverseForeignKey);
//! assert_eq!(reverse.target_model(), Some("Book"));
//! ```

use super::error::QueryError;
use indexmap::IndexMap;

/// What a model field is, as far as lookups are concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
	/// Plain column
	Scalar,
	/// Forward foreign key (many-to-one)
	ForeignKey,
	/// Forward many-to-many
	ManyToMany,
	/// Reverse side of a foreign key (one-to-many)
	ReverseForeignKey,
	/// Reverse side of a many-to-many
	ReverseManyToMany,
}

impl FieldKind {
	/// Whether the field leads to another model
	pub fn is_relation(self) -> bool {
		!matches!(self, FieldKind::Scalar)
	}

	/// Whether following the field can yield more than one related row
	pub fn is_multi_valued(self) -> bool {
		matches!(
			self,
			FieldKind::ManyToMany | FieldKind::ReverseForeignKey | FieldKind::ReverseManyToMany
		)
	}
}

/// One table hop: `<previous alias>.from_column = <table alias>.to_column`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JoinStep {
	pub table: String,
	pub from_column: String,
	pub to_column: String,
}

impl JoinStep {
	fn new(
		table: impl Into<String>,
		from_column: impl Into<String>,
		to_column: impl Into<String>,
	) -> Self {
		Self {
			table: table.into(),
			from_column: from_column.into(),
			to_column: to_column.into(),
		}
	}
}

/// Resolved field metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldInfo {
	name: String,
	kind: FieldKind,
	column: Option<String>,
	target_model: Option<String>,
	steps: Vec<JoinStep>,
}

impl FieldInfo {
	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn kind(&self) -> FieldKind {
		self.kind
	}

	/// Backing column on the model's own table (scalars and forward FKs)
	pub fn column(&self) -> Option<&str> {
		self.column.as_deref()
	}

	/// Related model name, for relations
	pub fn target_model(&self) -> Option<&str> {
		self.target_model.as_deref()
	}

	/// Join steps from the model's table to the related model's table
	pub fn steps(&self) -> &[JoinStep] {
		&self.steps
	}

	/// Key under which the field's value is emitted (`publisher_id` for a
	/// `publisher` foreign key)
	pub fn attname(&self) -> String {
		match self.kind {
			FieldKind::ForeignKey => format!("{}_id", self.name),
			_ => self.name.clone(),
		}
	}
}

/// Frozen model metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelMeta {
	name: String,
	table: String,
	pk_name: String,
	pk_column: String,
	fields: IndexMap<String, FieldInfo>,
}

impl ModelMeta {
	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn table(&self) -> &str {
		&self.table
	}

	/// Primary key field name
	pub fn pk_name(&self) -> &str {
		&self.pk_name
	}

	/// Primary key column name
	pub fn pk_column(&self) -> &str {
		&self.pk_column
	}

	pub fn field(&self, name: &str) -> Option<&FieldInfo> {
		self.fields.get(name)
	}

	pub fn fields(&self) -> impl Iterator<Item = &FieldInfo> {
		self.fields.values()
	}

	/// Fields stored on the model's own table, in declaration order
	pub fn concrete_fields(&self) -> impl Iterator<Item = &FieldInfo> {
		self.fields
			.values()
			.filter(|f| matches!(f.kind, FieldKind::Scalar | FieldKind::ForeignKey))
	}
}

/// Intermediate table of a many-to-many relation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThroughTable {
	pub table: String,
	/// Column pointing at the model declaring the relation
	pub source_column: String,
	/// Column pointing at the related model
	pub target_column: String,
}

impl ThroughTable {
	pub fn new(
		table: impl Into<String>,
		source_column: impl Into<String>,
		target_column: impl Into<String>,
	) -> Self {
		Self {
			table: table.into(),
			source_column: source_column.into(),
			target_column: target_column.into(),
		}
	}
}

#[derive(Debug, Clone)]
enum FieldDef {
	Scalar {
		name: String,
		column: String,
	},
	ForeignKey {
		name: String,
		target: String,
		column: String,
		related_name: Option<String>,
	},
	ManyToMany {
		name: String,
		target: String,
		through: ThroughTable,
		related_name: Option<String>,
	},
}

/// Model declaration consumed by [`SchemaRegistryBuilder`]
#[derive(Debug, Clone)]
pub struct ModelDef {
	name: String,
	table: String,
	pk_name: String,
	pk_column: String,
	fields: Vec<FieldDef>,
}

impl ModelDef {
	/// Declare a model with an `id` primary key
	pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			table: table.into(),
			pk_name: "id".to_string(),
			pk_column: "id".to_string(),
			fields: Vec::new(),
		}
	}

	pub fn primary_key(self, name: impl Into<String>) -> Self {
		let name = name.into();
		self.primary_key_with_column(name.clone(), name)
	}

	pub fn primary_key_with_column(
		mut self,
		name: impl Into<String>,
		column: impl Into<String>,
	) -> Self {
		self.pk_name = name.into();
		self.pk_column = column.into();
		self
	}

	/// Scalar field stored in a column of the same name
	pub fn field(self, name: impl Into<String>) -> Self {
		let name = name.into();
		self.field_with_column(name.clone(), name)
	}

	pub fn field_with_column(mut self, name: impl Into<String>, column: impl Into<String>) -> Self {
		self.fields.push(FieldDef::Scalar {
			name: name.into(),
			column: column.into(),
		});
		self
	}

	/// Foreign key stored in `<name>_id`
	pub fn foreign_key(self, name: impl Into<String>, target: impl Into<String>) -> Self {
		let name = name.into();
		let column = format!("{}_id", name);
		self.foreign_key_with_column(name, target, column)
	}

	pub fn foreign_key_with_column(
		mut self,
		name: impl Into<String>,
		target: impl Into<String>,
		column: impl Into<String>,
	) -> Self {
		self.fields.push(FieldDef::ForeignKey {
			name: name.into(),
			target: target.into(),
			column: column.into(),
			related_name: None,
		});
		self
	}

	pub fn many_to_many(
		mut self,
		name: impl Into<String>,
		target: impl Into<String>,
		through: ThroughTable,
	) -> Self {
		self.fields.push(FieldDef::ManyToMany {
			name: name.into(),
			target: target.into(),
			through,
			related_name: None,
		});
		self
	}

	/// Override the reverse accessor name of the most recently declared relation
	pub fn related_name(mut self, related: impl Into<String>) -> Self {
		match self.fields.last_mut() {
			Some(FieldDef::ForeignKey { related_name, .. })
			| Some(FieldDef::ManyToMany { related_name, .. }) => {
				*related_name = Some(related.into());
			}
			_ => {
				tracing::warn!(model = %self.name, "related_name() ignored: no relation declared yet");
			}
		}
		self
	}
}

/// Immutable model registry
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
	models: IndexMap<String, ModelMeta>,
}

impl SchemaRegistry {
	pub fn builder() -> SchemaRegistryBuilder {
		SchemaRegistryBuilder::default()
	}

	pub fn model(&self, name: &str) -> Result<&ModelMeta, QueryError> {
		self.models
			.get(name)
			.ok_or_else(|| QueryError::field(name, name, "model is not registered"))
	}

	/// Look up `field` on `model`
	pub fn field(&self, model: &str, field: &str) -> Result<&FieldInfo, QueryError> {
		let meta = self.model(model)?;
		meta.field(field).ok_or_else(|| {
			let choices = meta.fields.keys().cloned().collect::<Vec<_>>().join(", ");
			QueryError::field(model, field, format!("choices are: {}", choices))
		})
	}

	pub fn models(&self) -> impl Iterator<Item = &ModelMeta> {
		self.models.values()
	}
}

/// Collects [`ModelDef`]s and resolves them into a [`SchemaRegistry`]
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistryBuilder {
	defs: Vec<ModelDef>,
}

impl SchemaRegistryBuilder {
	pub fn model(mut self, def: ModelDef) -> Self {
		self.defs.push(def);
		self
	}

	pub fn build(self) -> Result<SchemaRegistry, QueryError> {
		let mut models: IndexMap<String, ModelMeta> = IndexMap::new();

		for def in &self.defs {
			if models.contains_key(&def.name) {
				return Err(QueryError::field(&def.name, &def.name, "model registered twice"));
			}
			let mut fields = IndexMap::new();
			fields.insert(
				def.pk_name.clone(),
				FieldInfo {
					name: def.pk_name.clone(),
					kind: FieldKind::Scalar,
					column: Some(def.pk_column.clone()),
					target_model: None,
					steps: Vec::new(),
				},
			);
			models.insert(
				def.name.clone(),
				ModelMeta {
					name: def.name.clone(),
					table: def.table.clone(),
					pk_name: def.pk_name.clone(),
					pk_column: def.pk_column.clone(),
					fields,
				},
			);
		}

		// Forward fields need the target's table and primary key, reverse
		// fields are collected and attached afterwards.
		let mut reverse: Vec<(String, FieldInfo)> = Vec::new();
		for def in &self.defs {
			for field in &def.fields {
				let info = match field {
					FieldDef::Scalar { name, column } => FieldInfo {
						name: name.clone(),
						kind: FieldKind::Scalar,
						column: Some(column.clone()),
						target_model: None,
						steps: Vec::new(),
					},
					FieldDef::ForeignKey {
						name,
						target,
						column,
						related_name,
					} => {
						let target_meta = target_of(&models, &def.name, name, target)?;
						reverse.push((
							target.clone(),
							FieldInfo {
								name: related_name
									.clone()
									.unwrap_or_else(|| def.name.to_lowercase()),
								kind: FieldKind::ReverseForeignKey,
								column: None,
								target_model: Some(def.name.clone()),
								steps: vec![JoinStep::new(
									&def.table,
									&target_meta.pk_column,
									column,
								)],
							},
						));
						FieldInfo {
							name: name.clone(),
							kind: FieldKind::ForeignKey,
							column: Some(column.clone()),
							target_model: Some(target.clone()),
							steps: vec![JoinStep::new(
								&target_meta.table,
								column,
								&target_meta.pk_column,
							)],
						}
					}
					FieldDef::ManyToMany {
						name,
						target,
						through,
						related_name,
					} => {
						let target_meta = target_of(&models, &def.name, name, target)?;
						// Symmetric self relations store both directions in
						// the through table and have no reverse accessor.
						if *target != def.name {
							reverse.push((
								target.clone(),
								FieldInfo {
									name: related_name
										.clone()
										.unwrap_or_else(|| def.name.to_lowercase()),
									kind: FieldKind::ReverseManyToMany,
									column: None,
									target_model: Some(def.name.clone()),
									steps: vec![
										JoinStep::new(
											&through.table,
											&target_meta.pk_column,
											&through.target_column,
										),
										JoinStep::new(
											&def.table,
											&through.source_column,
											&def.pk_column,
										),
									],
								},
							));
						}
						FieldInfo {
							name: name.clone(),
							kind: FieldKind::ManyToMany,
							column: None,
							target_model: Some(target.clone()),
							steps: vec![
								JoinStep::new(&through.table, &def.pk_column, &through.source_column),
								JoinStep::new(
									&target_meta.table,
									&through.target_column,
									&target_meta.pk_column,
								),
							],
						}
					}
				};
				attach(&mut models, &def.name, info)?;
			}
		}

		for (model, info) in reverse {
			attach(&mut models, &model, info)?;
		}

		tracing::debug!(models = models.len(), "schema registry built");
		Ok(SchemaRegistry { models })
	}
}

fn target_of(
	models: &IndexMap<String, ModelMeta>,
	model: &str,
	field: &str,
	target: &str,
) -> Result<ModelMeta, QueryError> {
	models.get(target).cloned().ok_or_else(|| {
		QueryError::field(
			model,
			field,
			format!("related model '{}' is not registered", target),
		)
	})
}

fn attach(
	models: &mut IndexMap<String, ModelMeta>,
	model: &str,
	info: FieldInfo,
) -> Result<(), QueryError> {
	let meta = models
		.get_mut(model)
		.ok_or_else(|| QueryError::field(model, &info.name, "model is not registered"))?;
	if meta.fields.contains_key(&info.name) {
		return Err(QueryError::field(
			model,
			&info.name,
			"field name clashes with another field or reverse accessor",
		));
	}
	meta.fields.insert(info.name.clone(), info);
	Ok(())
}
