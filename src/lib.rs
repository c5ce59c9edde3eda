//! Weir ingests RSS and Atom feeds on a schedule and builds a deduplicated
//! corpus of article content in SQLite.
//!
//! The [`ingest`] module owns the fetch/parse/extract pipeline, [`storage`]
//! owns the schema and queries, and [`export`] renders the stored corpus to
//! disk. The binary wires them together behind a small CLI.

pub mod config;
pub mod export;
pub mod ingest;
pub mod storage;
pub mod util;

pub use config::Config;
pub use storage::Database;
