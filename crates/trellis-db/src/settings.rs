//! Query engine settings
//!
//! Settings can be built in code with the `with_*` setters or loaded from a
//! TOML document:
//!
//! ```
//! use trellis_db::settings::{DbBackend, OrmSettings};
//!
//! let settings = OrmSettings::from_toml_str(
//!     r#"
//!     backend = "postgres"
//!     alias_prefix = "U"
//!     echo = true
//!     "#,
//! )
//! .unwrap();
//! assert_eq!(settings.backend, DbBackend::Postgres);
//! assert_eq!(settings.alias_prefix, "U");
//! ```

use sea_query::{
	MysqlQueryBuilder, PostgresQueryBuilder, SelectStatement, SqliteQueryBuilder, Value,
};
use serde::{Deserialize, Serialize};

/// Database backend type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbBackend {
	Postgres,
	Mysql,
	#[default]
	Sqlite,
}

impl DbBackend {
	/// Quote an identifier for raw SQL fragments
	pub fn quote(&self, ident: &str) -> String {
		match self {
			DbBackend::Mysql => format!("`{}`", ident.replace('`', "``")),
			DbBackend::Postgres | DbBackend::Sqlite => format!("\"{}\"", ident.replace('"', "\"\"")),
		}
	}

	/// `"alias"."column"`
	pub fn qualified(&self, alias: &str, column: &str) -> String {
		format!("{}.{}", self.quote(alias), self.quote(column))
	}

	/// Build `stmt` into SQL with placeholders and its parameters
	pub fn build(&self, stmt: &SelectStatement) -> (String, Vec<Value>) {
		let (sql, values) = match self {
			DbBackend::Postgres => stmt.build(PostgresQueryBuilder),
			DbBackend::Mysql => stmt.build(MysqlQueryBuilder),
			DbBackend::Sqlite => stmt.build(SqliteQueryBuilder),
		};
		(sql, values.0)
	}

	/// Build `stmt` into SQL with parameters inlined
	pub fn to_inline_sql(&self, stmt: &SelectStatement) -> String {
		match self {
			DbBackend::Postgres => stmt.to_string(PostgresQueryBuilder),
			DbBackend::Mysql => stmt.to_string(MysqlQueryBuilder),
			DbBackend::Sqlite => stmt.to_string(SqliteQueryBuilder),
		}
	}
}

/// Errors raised while loading settings
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
	#[error("Invalid settings document: {0}")]
	Toml(#[from] toml::de::Error),

	#[error("Invalid alias prefix '{0}': must be a non-empty ASCII identifier")]
	InvalidAliasPrefix(String),
}

/// Query engine configuration
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrmSettings {
	/// Backend used for quoting when no materializer dictates one
	pub backend: DbBackend,

	/// Prefix of synthesized join aliases (`T1`, `T2`, ...)
	pub alias_prefix: String,

	/// Log every compiled statement at debug level
	pub echo: bool,
}

impl Default for OrmSettings {
	fn default() -> Self {
		Self {
			backend: DbBackend::default(),
			alias_prefix: "T".to_string(),
			echo: false,
		}
	}
}

impl OrmSettings {
	pub fn new(backend: DbBackend) -> Self {
		Self {
			backend,
			..Default::default()
		}
	}

	pub fn with_backend(mut self, backend: DbBackend) -> Self {
		self.backend = backend;
		self
	}

	pub fn with_alias_prefix(mut self, prefix: impl Into<String>) -> Self {
		self.alias_prefix = prefix.into();
		self
	}

	pub fn with_echo(mut self, echo: bool) -> Self {
		self.echo = echo;
		self
	}

	/// Parse settings from TOML; missing keys keep their defaults
	pub fn from_toml_str(source: &str) -> Result<Self, SettingsError> {
		let settings: OrmSettings = toml::from_str(source)?;
		settings.validate()?;
		Ok(settings)
	}

	pub fn validate(&self) -> Result<(), SettingsError> {
		let valid = self
			.alias_prefix
			.chars()
			.next()
			.is_some_and(|c| c.is_ascii_alphabetic())
			&& self
				.alias_prefix
				.chars()
				.all(|c| c.is_ascii_alphanumeric() || c == '_');
		if valid {
			Ok(())
		} else {
			Err(SettingsError::InvalidAliasPrefix(self.alias_prefix.clone()))
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use rstest::rstest;

	#[rstest]
	fn test_defaults() {
		let settings = OrmSettings::default();
		assert_eq!(settings.backend, DbBackend::Sqlite);
		assert_eq!(settings.alias_prefix, "T");
		assert!(!settings.echo);
	}

	#[rstest]
	fn test_builder_setters() {
		let settings = OrmSettings::new(DbBackend::Mysql)
			.with_alias_prefix("J")
			.with_echo(true);
		assert_eq!(settings.backend, DbBackend::Mysql);
		assert_eq!(settings.alias_prefix, "J");
		assert!(settings.echo);
	}

	#[rstest]
	fn test_partial_toml_keeps_defaults() {
		let settings = OrmSettings::from_toml_str("backend = \"mysql\"").unwrap();
		assert_eq!(settings.backend, DbBackend::Mysql);
		assert_eq!(settings.alias_prefix, "T");
	}

	#[rstest]
	#[case("alias_prefix = \"\"")]
	#[case("alias_prefix = \"1x\"")]
	#[case("alias_prefix = \"a-b\"")]
	fn test_invalid_alias_prefix(#[case] source: &str) {
		assert!(matches!(
			OrmSettings::from_toml_str(source),
			Err(SettingsError::InvalidAliasPrefix(_))
		));
	}

	#[rstest]
	fn test_unknown_backend_is_rejected() {
		assert!(matches!(
			OrmSettings::from_toml_str("backend = \"oracle\""),
			Err(SettingsError::Toml(_))
		));
	}

	#[rstest]
	#[case(DbBackend::Postgres, "\"Entry ID\"")]
	#[case(DbBackend::Sqlite, "\"Entry ID\"")]
	#[case(DbBackend::Mysql, "`Entry ID`")]
	fn test_quote(#[case] backend: DbBackend, #[case] expected: &str) {
		assert_eq!(backend.quote("Entry ID"), expected);
	}

	#[rstest]
	fn test_quote_escapes_embedded_quotes() {
		assert_eq!(DbBackend::Postgres.quote("a\"b"), "\"a\"\"b\"");
		assert_eq!(DbBackend::Mysql.quote("a`b"), "`a``b`");
	}
}
