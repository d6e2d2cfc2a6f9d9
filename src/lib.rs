//! # Trellis
//!
//! Django-style aggregation and annotation for Rust.
//!
//! This facade re-exports [`trellis_db`]; see its documentation for the
//! query API.
//!
//! ## Feature Flags
//!
//! - `sqlite` (default): SQLite materializer backed by sqlx

pub use trellis_db::*;
