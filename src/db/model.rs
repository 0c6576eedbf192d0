//! Row models returned by repositories.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! should live in higher layers.

use chrono::{DateTime, Utc};

/// A keyed JSON document and its revision counter.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredDocument {
    pub key: String,
    pub body: String,
    pub revision: i64,
}

/// Summary of a recorded import run.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SyncRunRow {
    pub id: String,
    pub database_id: String,
    pub success: bool,
    pub imported: i64,
    pub skipped: i64,
    pub errors: i64,
    pub conflicts: i64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}
