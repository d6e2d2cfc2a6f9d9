//! Bookstore schema and data
//!
//! Nine authors (with a symmetric friendship relation), four publishers, six
//! books and three stores, seeded into an in-memory SQLite database. The
//! `Entries`/`Clues` pair exercises columns with spaces and mixed case and
//! stays empty.

use rstest::fixture;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Pool, Sqlite};
use std::sync::Arc;
use trellis_db::orm::{
	ModelDef, QuerySet, QueryValue, Row, SchemaRegistry, SqliteMaterializer, ThroughTable,
};

// ============================================================================
// Schema
// ============================================================================

pub fn bookstore_registry() -> SchemaRegistry {
	SchemaRegistry::builder()
		.model(
			ModelDef::new("Author", "author")
				.field("name")
				.field("age")
				.many_to_many(
					"friends",
					"Author",
					ThroughTable::new("author_friends", "from_author_id", "to_author_id"),
				),
		)
		.model(
			ModelDef::new("Publisher", "publisher")
				.field("name")
				.field("num_awards"),
		)
		.model(
			ModelDef::new("Book", "book")
				.field("isbn")
				.field("name")
				.field("pages")
				.field("price")
				.many_to_many(
					"authors",
					"Author",
					ThroughTable::new("book_authors", "book_id", "author_id"),
				)
				.foreign_key("publisher", "Publisher"),
		)
		.model(ModelDef::new("Store", "store").field("name").many_to_many(
			"books",
			"Book",
			ThroughTable::new("store_books", "store_id", "book_id"),
		))
		.model(
			ModelDef::new("Entries", "entries")
				.primary_key_with_column("EntryID", "Entry ID")
				.field("Entry")
				.field("Exclude"),
		)
		.model(
			ModelDef::new("Clues", "clues")
				.primary_key("ID")
				.foreign_key_with_column("EntryID", "Entries", "Entry ID")
				.field("Clue"),
		)
		.build()
		.expect("bookstore registry is valid")
}

const SCHEMA: &[&str] = &[
	"CREATE TABLE author (id INTEGER PRIMARY KEY, name TEXT NOT NULL, age INTEGER NOT NULL)",
	"CREATE TABLE author_friends (id INTEGER PRIMARY KEY, from_author_id INTEGER NOT NULL, to_author_id INTEGER NOT NULL)",
	"CREATE TABLE publisher (id INTEGER PRIMARY KEY, name TEXT NOT NULL, num_awards INTEGER NOT NULL)",
	"CREATE TABLE book (id INTEGER PRIMARY KEY, isbn TEXT NOT NULL, name TEXT NOT NULL, pages INTEGER NOT NULL, price REAL NOT NULL, publisher_id INTEGER NOT NULL)",
	"CREATE TABLE book_authors (id INTEGER PRIMARY KEY, book_id INTEGER NOT NULL, author_id INTEGER NOT NULL)",
	"CREATE TABLE store (id INTEGER PRIMARY KEY, name TEXT NOT NULL)",
	"CREATE TABLE store_books (id INTEGER PRIMARY KEY, store_id INTEGER NOT NULL, book_id INTEGER NOT NULL)",
	r#"CREATE TABLE entries ("Entry ID" INTEGER PRIMARY KEY, "Entry" TEXT NOT NULL UNIQUE, "Exclude" BOOLEAN NOT NULL)"#,
	r#"CREATE TABLE clues ("ID" INTEGER PRIMARY KEY, "Entry ID" INTEGER NOT NULL, "Clue" TEXT NOT NULL)"#,
];

// ============================================================================
// Data
// ============================================================================

pub const AUTHORS: &[(i64, &str, i64)] = &[
	(1, "Adrian Holovaty", 34),
	(2, "Jacob Kaplan-Moss", 35),
	(3, "Brad Dayley", 45),
	(4, "James Bennett", 29),
	(5, "Jeffrey Forcier", 37),
	(6, "Paul Bissex", 29),
	(7, "Wesley J. Chun", 25),
	(8, "Peter Norvig", 57),
	(9, "Stuart Russell", 46),
];

/// Friendships, stored in both directions
const FRIENDS: &[(i64, i64)] = &[(1, 2), (1, 4), (2, 7), (5, 6), (5, 7), (6, 7), (8, 9)];

pub const PUBLISHERS: &[(i64, &str, i64)] = &[
	(1, "Apress", 3),
	(2, "Sams", 1),
	(3, "Prentice Hall", 7),
	(4, "Morgan Kaufmann", 9),
];

/// id, isbn, name, pages, price, publisher
pub const BOOKS: &[(i64, &str, &str, i64, f64, i64)] = &[
	(
		1,
		"159059725",
		"The Definitive Guide to Django: Web Development Done Right",
		447,
		30.0,
		1,
	),
	(
		2,
		"067232959",
		"Sams Teach Yourself Django in 24 Hours",
		528,
		23.09,
		2,
	),
	(3, "159059996", "Practical Django Projects", 300, 29.69, 1),
	(
		4,
		"013235613",
		"Python Web Development with Django",
		350,
		29.69,
		3,
	),
	(
		5,
		"013790395",
		"Artificial Intelligence: A Modern Approach",
		1132,
		82.80,
		3,
	),
	(
		6,
		"155860191",
		"Paradigms of Artificial Intelligence Programming: Case Studies in Common Lisp",
		946,
		75.00,
		4,
	),
];

/// book, author
const BOOK_AUTHORS: &[(i64, i64)] = &[
	(1, 1),
	(1, 2),
	(2, 3),
	(3, 4),
	(4, 5),
	(4, 6),
	(4, 7),
	(5, 8),
	(5, 9),
	(6, 8),
];

const STORES: &[(i64, &str, &[i64])] = &[
	(1, "Amazon.com", &[1, 2, 3, 4, 5, 6]),
	(2, "Books.com", &[1, 3, 5]),
	(3, "Mamma and Pappa's Books", &[3, 4, 6]),
];

// ============================================================================
// Fixture
// ============================================================================

/// Seeded database plus the registry describing it
pub struct Bookstore {
	pub registry: Arc<SchemaRegistry>,
	pub pool: Pool<Sqlite>,
	pub materializer: SqliteMaterializer,
}

impl Bookstore {
	pub fn query(&self, model: &str) -> QuerySet {
		QuerySet::new(Arc::clone(&self.registry), model).expect("model is registered")
	}

	pub async fn execute(&self, sql: &str) {
		sqlx::query(sql)
			.execute(&self.pool)
			.await
			.unwrap_or_else(|e| panic!("Failed to execute {sql}: {e}"));
	}

	/// Add a publisher with two expensive books and one cheap one
	pub async fn add_expensive_publisher(&self) {
		self.execute("INSERT INTO publisher (id, name, num_awards) VALUES (5, 'Expensive Publisher', 0)")
			.await;
		for (id, isbn, price) in [(7, "111", 1000.0), (8, "222", 1000.0), (9, "333", 35.0)] {
			sqlx::query(
				"INSERT INTO book (id, isbn, name, pages, price, publisher_id) VALUES (?, ?, ?, 1, ?, 5)",
			)
			.bind(id)
			.bind(isbn)
			.bind(format!("ExpensiveBook{}", id - 6))
			.bind(price)
			.execute(&self.pool)
			.await
			.expect("Failed to insert expensive book");
		}
	}
}

async fn setup_database() -> Pool<Sqlite> {
	// One connection: every connection to `sqlite::memory:` opens its own database.
	let pool = SqlitePoolOptions::new()
		.max_connections(1)
		.connect("sqlite::memory:")
		.await
		.expect("Failed to create database pool");

	for statement in SCHEMA {
		sqlx::query(statement)
			.execute(&pool)
			.await
			.expect("Failed to create table");
	}
	pool
}

async fn seed(pool: &Pool<Sqlite>) {
	for (id, name, age) in AUTHORS {
		sqlx::query("INSERT INTO author (id, name, age) VALUES (?, ?, ?)")
			.bind(id)
			.bind(name)
			.bind(age)
			.execute(pool)
			.await
			.expect("Failed to insert author");
	}
	for (a, b) in FRIENDS {
		for (from, to) in [(a, b), (b, a)] {
			sqlx::query("INSERT INTO author_friends (from_author_id, to_author_id) VALUES (?, ?)")
				.bind(from)
				.bind(to)
				.execute(pool)
				.await
				.expect("Failed to insert friendship");
		}
	}
	for (id, name, awards) in PUBLISHERS {
		sqlx::query("INSERT INTO publisher (id, name, num_awards) VALUES (?, ?, ?)")
			.bind(id)
			.bind(name)
			.bind(awards)
			.execute(pool)
			.await
			.expect("Failed to insert publisher");
	}
	for (id, isbn, name, pages, price, publisher) in BOOKS {
		sqlx::query(
			"INSERT INTO book (id, isbn, name, pages, price, publisher_id) VALUES (?, ?, ?, ?, ?, ?)",
		)
		.bind(id)
		.bind(isbn)
		.bind(name)
		.bind(pages)
		.bind(price)
		.bind(publisher)
		.execute(pool)
		.await
		.expect("Failed to insert book");
	}
	for (book, author) in BOOK_AUTHORS {
		sqlx::query("INSERT INTO book_authors (book_id, author_id) VALUES (?, ?)")
			.bind(book)
			.bind(author)
			.execute(pool)
			.await
			.expect("Failed to insert book author");
	}
	for (id, name, books) in STORES {
		sqlx::query("INSERT INTO store (id, name) VALUES (?, ?)")
			.bind(id)
			.bind(name)
			.execute(pool)
			.await
			.expect("Failed to insert store");
		for book in *books {
			sqlx::query("INSERT INTO store_books (store_id, book_id) VALUES (?, ?)")
				.bind(id)
				.bind(book)
				.execute(pool)
				.await
				.expect("Failed to insert store book");
		}
	}
}

#[fixture]
pub async fn bookstore() -> Bookstore {
	let pool = setup_database().await;
	seed(&pool).await;
	Bookstore {
		registry: Arc::new(bookstore_registry()),
		materializer: SqliteMaterializer::new(pool.clone()),
		pool,
	}
}

// ============================================================================
// Assertion helpers
// ============================================================================

/// Numeric value of `key`, panicking on NULL or text
pub fn number(row: &Row, key: &str) -> f64 {
	row.get(key)
		.and_then(QueryValue::as_f64)
		.unwrap_or_else(|| panic!("{key} is not numeric in {row:?}"))
}

pub fn assert_close(row: &Row, key: &str, expected: f64) {
	let actual = number(row, key);
	assert!(
		(actual - expected).abs() < 0.01,
		"{key}: expected {expected}, got {actual}"
	);
}

/// Text column of every row, in order
pub fn texts(rows: &[Row], key: &str) -> Vec<String> {
	rows.iter()
		.map(|row| {
			row.get(key)
				.and_then(QueryValue::as_str)
				.unwrap_or_else(|| panic!("{key} is not text in {row:?}"))
				.to_string()
		})
		.collect()
}

/// Integer column of every row, in order
pub fn ints(rows: &[Row], key: &str) -> Vec<i64> {
	rows.iter()
		.map(|row| {
			row.get(key)
				.and_then(QueryValue::as_i64)
				.unwrap_or_else(|| panic!("{key} is not an integer in {row:?}"))
		})
		.collect()
}
