use super::model::{StoredDocument, SyncRunRow};
use crate::sync::SyncReport;
use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized)
        .await
        .with_context(|| format!("failed to open {}", normalized))?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/`, ensure the parent
/// directory exists and ask SQLite to create the file. In-memory URLs pass
/// through untouched.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = format!("sqlite://{}", expanded_path);
    match query_part {
        Some(q) if q.contains("mode=") => {
            rebuilt.push('?');
            rebuilt.push_str(q);
        }
        Some(q) => {
            rebuilt.push('?');
            rebuilt.push_str(q);
            rebuilt.push_str("&mode=rwc");
        }
        None => rebuilt.push_str("?mode=rwc"),
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn get_document(pool: &Pool, key: &str) -> Result<Option<StoredDocument>> {
    let doc = sqlx::query_as::<_, StoredDocument>(
        "SELECT key, body, revision FROM documents WHERE key = ?",
    )
    .bind(key)
    .fetch_optional(pool)
    .await?;
    Ok(doc)
}

/// Replace a document's body in one transaction. Returns `false` without
/// touching the row when the body is unchanged.
#[instrument(skip_all)]
pub async fn put_document(pool: &Pool, key: &str, body: &str) -> Result<bool> {
    let mut tx = pool.begin().await?;
    let current: Option<String> = sqlx::query_scalar("SELECT body FROM documents WHERE key = ?")
        .bind(key)
        .fetch_optional(&mut *tx)
        .await?;
    if current.as_deref() == Some(body) {
        tx.rollback().await?;
        return Ok(false);
    }
    sqlx::query(
        "INSERT INTO documents (key, body) VALUES (?, ?)
         ON CONFLICT(key) DO UPDATE SET body = excluded.body,
             revision = documents.revision + 1,
             updated_at = CURRENT_TIMESTAMP",
    )
    .bind(key)
    .bind(body)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(true)
}

#[instrument(skip_all)]
pub async fn insert_sync_run(pool: &Pool, report: &SyncReport) -> Result<()> {
    let body = serde_json::to_string(report).context("failed to serialize sync report")?;
    sqlx::query(
        "INSERT INTO sync_runs
            (id, database_id, success, imported, skipped, errors, conflicts, report, started_at, finished_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(report.run_id.to_string())
    .bind(&report.database_id)
    .bind(report.success)
    .bind(report.imported as i64)
    .bind(report.skipped as i64)
    .bind(report.errors.len() as i64)
    .bind(report.conflicts.len() as i64)
    .bind(body)
    .bind(report.started_at)
    .bind(report.finished_at)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn recent_sync_runs(pool: &Pool, limit: i64) -> Result<Vec<SyncRunRow>> {
    let rows = sqlx::query_as::<_, SyncRunRow>(
        "SELECT id, database_id, success, imported, skipped, errors, conflicts, started_at, finished_at
         FROM sync_runs ORDER BY started_at DESC LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

#[instrument(skip_all)]
pub async fn get_sync_report(pool: &Pool, run_id: &str) -> Result<Option<serde_json::Value>> {
    let body: Option<String> = sqlx::query_scalar("SELECT report FROM sync_runs WHERE id = ?")
        .bind(run_id)
        .fetch_optional(pool)
        .await?;
    body.map(|b| serde_json::from_str(&b).context("stored sync report is not JSON"))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup_pool() -> Pool {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    #[test]
    fn prepare_url_adds_create_mode() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        let tmp = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}/nested/studio.db", tmp.path().display());
        let prepared = prepare_sqlite_url(&url);
        assert!(prepared.ends_with("studio.db?mode=rwc"));
        assert!(tmp.path().join("nested").exists());
        assert_eq!(
            prepare_sqlite_url("sqlite://x.db?mode=ro"),
            "sqlite://x.db?mode=ro"
        );
    }

    #[tokio::test]
    async fn put_document_bumps_revision_only_on_change() {
        let pool = setup_pool().await;
        assert!(get_document(&pool, "k").await.unwrap().is_none());

        assert!(put_document(&pool, "k", "[1]").await.unwrap());
        assert!(!put_document(&pool, "k", "[1]").await.unwrap());
        assert_eq!(get_document(&pool, "k").await.unwrap().unwrap().revision, 1);

        assert!(put_document(&pool, "k", "[2]").await.unwrap());
        let doc = get_document(&pool, "k").await.unwrap().unwrap();
        assert_eq!(doc.body, "[2]");
        assert_eq!(doc.revision, 2);
    }
}
