//! Database module: row models and SQL repositories.
//!
//! - `model`: typed rows returned by repositories.
//! - `repo`: SQL-only functions (pool setup, keyed documents, run history).
//!
//! Callers import from `studio_sync::db`; the repository API is re-exported.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{StoredDocument, SyncRunRow};
