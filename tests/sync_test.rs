use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use studio_sync::config::{ConflictPolicy, RestoreMode};
use studio_sync::error::{FetchError, StoreError};
use studio_sync::mapping::{CaseStudyField, FieldMapping, MappingStore, SqliteMappingStore};
use studio_sync::model::{CaseStatus, CaseStudy, VersionedDocument};
use studio_sync::notion::model::RawPage;
use studio_sync::notion::NotionSource;
use studio_sync::store::{ContentStore, FileContentStore};
use studio_sync::sync::{ConflictKind, ReportErrorKind, SyncOptions, SyncOrchestrator, SyncPhase};
use tempfile::TempDir;
use tokio::sync::Mutex;

async fn setup_pool() -> sqlx::SqlitePool {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

/// Serves scripted fetch results first, then the current page set.
#[derive(Clone, Default)]
struct ScriptedNotion {
    responses: Arc<Mutex<VecDeque<Result<Vec<RawPage>, FetchError>>>>,
    pages: Arc<Mutex<Vec<RawPage>>>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedNotion {
    fn with_pages(pages: Vec<RawPage>) -> Self {
        Self {
            pages: Arc::new(Mutex::new(pages)),
            ..Default::default()
        }
    }

    async fn set_pages(&self, pages: Vec<RawPage>) {
        *self.pages.lock().await = pages;
    }

    async fn push_response(&self, response: Result<Vec<RawPage>, FetchError>) {
        self.responses.lock().await.push_back(response);
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl NotionSource for ScriptedNotion {
    async fn fetch_all_pages(&self, _database_id: &str) -> Result<Vec<RawPage>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(response) = self.responses.lock().await.pop_front() {
            return response;
        }
        Ok(self.pages.lock().await.clone())
    }

    async fn fetch_page(&self, page_id: &str) -> Result<RawPage, FetchError> {
        self.pages
            .lock()
            .await
            .iter()
            .find(|p| p.id == page_id)
            .cloned()
            .ok_or(FetchError::Http {
                status: 404,
                body: "not found".into(),
            })
    }
}

fn page(id: &str, name: &str, status: &str) -> RawPage {
    RawPage::from_value(json!({
        "object": "page",
        "id": id,
        "last_edited_time": "2024-05-01T08:00:00.000Z",
        "properties": {
            "Name": { "id": "title", "type": "title", "title": [{ "plain_text": name }] },
            "Client": { "id": "c", "type": "rich_text", "rich_text": [{ "plain_text": "Acme" }] },
            "Status": { "id": "s", "type": "select", "select": { "name": status } }
        }
    }))
    .unwrap()
}

fn fast_options() -> SyncOptions {
    SyncOptions {
        fetch_attempts: 3,
        backoff_base: Duration::from_millis(1),
        max_backoff: Duration::from_millis(10),
        concurrency: 2,
        conflict_policy: ConflictPolicy::AutoOverwrite,
    }
}

struct Harness {
    _dir: TempDir,
    notion: ScriptedNotion,
    store: Arc<FileContentStore>,
    mappings: Arc<SqliteMappingStore>,
}

impl Harness {
    async fn new(pages: Vec<RawPage>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = FileContentStore::open(dir.path(), RestoreMode::NewVersion)
            .await
            .unwrap();
        Self {
            _dir: dir,
            notion: ScriptedNotion::with_pages(pages),
            store: Arc::new(store),
            mappings: Arc::new(SqliteMappingStore::new(setup_pool().await)),
        }
    }

    fn orchestrator(&self, options: SyncOptions) -> SyncOrchestrator {
        self.orchestrator_with_store(self.store.clone(), options)
    }

    fn orchestrator_with_store(
        &self,
        store: Arc<dyn ContentStore>,
        options: SyncOptions,
    ) -> SyncOrchestrator {
        SyncOrchestrator::new(
            Arc::new(self.notion.clone()),
            store,
            self.mappings.clone(),
            options,
        )
    }
}

/// Delegates to a real store but fails `save` for one slug.
struct FailingSaveStore {
    inner: Arc<FileContentStore>,
    failing_slug: String,
}

#[async_trait::async_trait]
impl ContentStore for FailingSaveStore {
    async fn get_by_slug(&self, slug: &str) -> Result<Option<CaseStudy>, StoreError> {
        self.inner.get_by_slug(slug).await
    }

    async fn find_by_notion_id(&self, notion_id: &str) -> Result<Option<CaseStudy>, StoreError> {
        self.inner.find_by_notion_id(notion_id).await
    }

    async fn list(&self) -> Result<Vec<CaseStudy>, StoreError> {
        self.inner.list().await
    }

    async fn save(&self, case_study: &CaseStudy) -> Result<VersionedDocument, StoreError> {
        if case_study.slug == self.failing_slug {
            return Err(StoreError::Write {
                path: format!("case-studies/{}.json", case_study.slug),
                source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
            });
        }
        self.inner.save(case_study).await
    }

    async fn get_versions(&self, slug: &str) -> Result<Vec<VersionedDocument>, StoreError> {
        self.inner.get_versions(slug).await
    }

    async fn restore_version(&self, slug: &str, version: u32) -> Result<CaseStudy, StoreError> {
        self.inner.restore_version(slug, version).await
    }
}

#[tokio::test]
async fn first_import_creates_new_items() {
    let h = Harness::new(vec![page("p1", "Acme Rebrand", "Draft")]).await;
    let report = h.orchestrator(fast_options()).run_import("db").await;

    assert!(report.success);
    assert_eq!(report.phase, SyncPhase::Completed);
    assert_eq!(report.imported, 1);
    let new_items: Vec<_> = report.conflicts_of(ConflictKind::NewItem).collect();
    assert_eq!(new_items.len(), 1);
    assert!(new_items[0].affected_fields.contains("anything"));

    let stored = h.store.get_by_slug("acme-rebrand").await.unwrap().unwrap();
    assert!(stored.synced);
    assert!(!stored.id.is_empty());
    assert_eq!(stored.client, "Acme");
    assert_eq!(stored.source_notion_id.as_deref(), Some("p1"));
    assert_eq!(h.store.get_versions("acme-rebrand").await.unwrap().len(), 1);

    let v = serde_json::to_value(&report).unwrap();
    assert_eq!(v["conflicts"][0]["affectedFields"], "*");
}

#[tokio::test]
async fn changed_status_writes_new_version_and_keeps_history() {
    let h = Harness::new(vec![page("p1", "Acme Rebrand", "Draft")]).await;
    h.orchestrator(fast_options()).run_import("db").await;
    let first = h.store.get_by_slug("acme-rebrand").await.unwrap().unwrap();

    h.notion.set_pages(vec![page("p1", "Acme Rebrand", "Published")]).await;
    let report = h.orchestrator(fast_options()).run_import("db").await;

    assert!(report.success);
    assert_eq!(report.imported, 1);
    let diffs: Vec<_> = report.conflicts_of(ConflictKind::DifferentValues).collect();
    assert_eq!(diffs.len(), 1);
    assert!(diffs[0].affected_fields.contains("status"));
    assert!(!diffs[0].affected_fields.contains("title"));
    assert!(diffs[0].written);

    let versions = h.store.get_versions("acme-rebrand").await.unwrap();
    assert_eq!(versions.len(), 2);
    assert_eq!(versions[0].payload.status, CaseStatus::Draft);
    let current = h.store.get_by_slug("acme-rebrand").await.unwrap().unwrap();
    assert_eq!(current.status, CaseStatus::Published);
    assert_eq!(current.id, first.id);
}

#[tokio::test]
async fn unchanged_rerun_writes_nothing() {
    let h = Harness::new(vec![page("p1", "Acme Rebrand", "Draft")]).await;
    h.orchestrator(fast_options()).run_import("db").await;
    let report = h.orchestrator(fast_options()).run_import("db").await;

    assert!(report.success);
    assert_eq!(report.imported, 0);
    assert_eq!(report.skipped, 1);
    assert!(report.conflicts.is_empty());
    assert_eq!(h.store.get_versions("acme-rebrand").await.unwrap().len(), 1);
}

#[tokio::test]
async fn page_gone_from_notion_is_flagged_not_removed() {
    let h = Harness::new(vec![
        page("p1", "Acme Rebrand", "Draft"),
        page("p2", "Globex Launch", "Published"),
    ])
    .await;
    h.orchestrator(fast_options()).run_import("db").await;

    h.notion.set_pages(vec![page("p1", "Acme Rebrand", "Draft")]).await;
    let report = h.orchestrator(fast_options()).run_import("db").await;

    let deleted: Vec<_> = report.conflicts_of(ConflictKind::DeletedInNotion).collect();
    assert_eq!(deleted.len(), 1);
    assert_eq!(deleted[0].slug.as_deref(), Some("globex-launch"));
    assert!(!deleted[0].written);
    assert!(h.store.get_by_slug("globex-launch").await.unwrap().is_some());
}

#[tokio::test]
async fn archived_page_counts_as_deleted() {
    let h = Harness::new(vec![page("p1", "Acme Rebrand", "Draft")]).await;
    h.orchestrator(fast_options()).run_import("db").await;

    let mut archived = page("p1", "Acme Rebrand", "Draft");
    archived.archived = true;
    h.notion.set_pages(vec![archived]).await;
    let report = h.orchestrator(fast_options()).run_import("db").await;

    assert_eq!(report.conflicts_of(ConflictKind::DeletedInNotion).count(), 1);
    assert_eq!(report.imported, 0);
}

#[tokio::test]
async fn page_without_title_fails_alone() {
    let untitled = RawPage::from_value(json!({
        "id": "p2",
        "properties": {
            "Client": { "type": "rich_text", "rich_text": [{ "plain_text": "Initech" }] }
        }
    }))
    .unwrap();
    let h = Harness::new(vec![page("p1", "Acme Rebrand", "Draft"), untitled]).await;
    let report = h.orchestrator(fast_options()).run_import("db").await;

    assert!(report.success);
    assert_eq!(report.imported, 1);
    let failed: Vec<_> = report
        .errors
        .iter()
        .filter(|e| e.kind == ReportErrorKind::Field && e.fatal)
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].page_id.as_deref(), Some("p2"));
    assert_eq!(h.store.list().await.unwrap().len(), 1);
}

#[tokio::test]
async fn rate_limit_is_retried() {
    let h = Harness::new(vec![page("p1", "Acme Rebrand", "Draft")]).await;
    h.notion
        .push_response(Err(FetchError::RateLimited { retry_after_secs: None }))
        .await;
    h.notion
        .push_response(Err(FetchError::Http { status: 503, body: String::new() }))
        .await;
    let report = h.orchestrator(fast_options()).run_import("db").await;

    assert!(report.success);
    assert_eq!(h.notion.calls(), 3);
    assert_eq!(report.imported, 1);
}

#[tokio::test]
async fn retries_are_bounded() {
    let h = Harness::new(vec![page("p1", "Acme Rebrand", "Draft")]).await;
    for _ in 0..3 {
        h.notion
            .push_response(Err(FetchError::Http { status: 502, body: String::new() }))
            .await;
    }
    let report = h.orchestrator(fast_options()).run_import("db").await;

    assert!(!report.success);
    assert_eq!(h.notion.calls(), 3);
    assert_eq!(report.failed_in, Some(SyncPhase::Fetching));
}

#[tokio::test]
async fn unauthorized_fails_without_retry() {
    let h = Harness::new(vec![page("p1", "Acme Rebrand", "Draft")]).await;
    h.notion
        .push_response(Err(FetchError::Unauthorized { status: 401, body: "bad token".into() }))
        .await;
    let report = h.orchestrator(fast_options()).run_import("db").await;

    assert!(!report.success);
    assert_eq!(report.phase, SyncPhase::Failed);
    assert_eq!(report.failed_in, Some(SyncPhase::Fetching));
    assert_eq!(h.notion.calls(), 1);
    assert_eq!(report.errors[0].kind, ReportErrorKind::Fetch);
    assert!(h.store.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn manual_policy_reports_without_writing() {
    let h = Harness::new(vec![page("p1", "Acme Rebrand", "Draft")]).await;
    h.orchestrator(fast_options()).run_import("db").await;

    h.notion.set_pages(vec![page("p1", "Acme Rebrand", "Published")]).await;
    let options = SyncOptions {
        conflict_policy: ConflictPolicy::Manual,
        ..fast_options()
    };
    let report = h.orchestrator(options).run_import("db").await;

    let diffs: Vec<_> = report.conflicts_of(ConflictKind::DifferentValues).collect();
    assert_eq!(diffs.len(), 1);
    assert!(!diffs[0].written);
    assert_eq!(report.imported, 0);
    assert_eq!(h.store.get_versions("acme-rebrand").await.unwrap().len(), 1);
}

#[tokio::test]
async fn cancelled_run_writes_nothing() {
    let h = Harness::new(vec![page("p1", "Acme Rebrand", "Draft")]).await;
    let orchestrator = h.orchestrator(fast_options());
    orchestrator.cancel_handle().cancel();
    let report = orchestrator.run_import("db").await;

    assert!(!report.success);
    assert_eq!(report.failed_in, Some(SyncPhase::Fetching));
    assert!(report.errors.iter().any(|e| e.kind == ReportErrorKind::Cancelled));
    assert!(h.store.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn incompatible_property_is_a_type_mismatch_conflict() {
    let mut featured = page("p1", "Acme Rebrand", "Draft");
    featured.properties.insert(
        "Featured".into(),
        studio_sync::notion::model::RawProperty::decode(
            json!({ "type": "rich_text", "rich_text": [{ "plain_text": "yes" }] }),
        ),
    );
    let h = Harness::new(vec![featured]).await;
    let report = h.orchestrator(fast_options()).run_import("db").await;

    let mismatches: Vec<_> = report.conflicts_of(ConflictKind::TypeMismatch).collect();
    assert_eq!(mismatches.len(), 1);
    assert!(mismatches[0].affected_fields.contains("featured"));
    assert_eq!(report.imported, 1);
    let stored = h.store.get_by_slug("acme-rebrand").await.unwrap().unwrap();
    assert!(!stored.featured);
}

#[tokio::test]
async fn stored_mappings_take_precedence() {
    let project = RawPage::from_value(json!({
        "id": "p1",
        "properties": {
            "Project": { "type": "title", "title": [{ "plain_text": "Orbit" }] },
            "Handle": { "type": "rich_text", "rich_text": [{ "plain_text": "orbit-app" }] }
        }
    }))
    .unwrap();
    let h = Harness::new(vec![project]).await;
    h.mappings
        .save_mappings(&[
            FieldMapping::new("Project", CaseStudyField::Title),
            FieldMapping::new("Handle", CaseStudyField::Slug),
        ])
        .await
        .unwrap();
    let report = h.orchestrator(fast_options()).run_import("db").await;

    assert!(report.success);
    let stored = h.store.get_by_slug("orbit-app").await.unwrap().unwrap();
    assert_eq!(stored.title, "Orbit");
}

#[tokio::test]
async fn duplicate_slug_in_one_pull_keeps_first_page() {
    let h = Harness::new(vec![
        page("p1", "Acme Rebrand", "Draft"),
        page("p2", "Acme  Rebrand!", "Published"),
    ])
    .await;
    let report = h.orchestrator(fast_options()).run_import("db").await;

    assert_eq!(report.imported, 1);
    let dup: Vec<_> = report
        .errors
        .iter()
        .filter(|e| e.kind == ReportErrorKind::DuplicateSlug)
        .collect();
    assert_eq!(dup.len(), 1);
    assert_eq!(dup[0].page_id.as_deref(), Some("p2"));
    let stored = h.store.get_by_slug("acme-rebrand").await.unwrap().unwrap();
    assert_eq!(stored.source_notion_id.as_deref(), Some("p1"));
}

#[tokio::test]
async fn renamed_page_keeps_its_slug() {
    let h = Harness::new(vec![page("p1", "Acme Rebrand", "Draft")]).await;
    h.orchestrator(fast_options()).run_import("db").await;

    h.notion.set_pages(vec![page("p1", "Acme Rebrand 2024", "Draft")]).await;
    let report = h.orchestrator(fast_options()).run_import("db").await;

    assert!(report.errors.iter().any(|e| e.kind == ReportErrorKind::SlugChanged));
    let diffs: Vec<_> = report.conflicts_of(ConflictKind::DifferentValues).collect();
    assert_eq!(diffs.len(), 1);
    assert!(diffs[0].affected_fields.contains("title"));
    assert!(!diffs[0].affected_fields.contains("slug"));
    assert!(h.store.get_by_slug("acme-rebrand-2024").await.unwrap().is_none());
    let current = h.store.get_by_slug("acme-rebrand").await.unwrap().unwrap();
    assert_eq!(current.title, "Acme Rebrand 2024");
    assert_eq!(report.conflicts_of(ConflictKind::DeletedInNotion).count(), 0);
}

#[tokio::test]
async fn unavailable_store_fails_writing_with_resume_list() {
    let h = Harness::new(vec![
        page("p1", "Acme Rebrand", "Draft"),
        page("p2", "Globex Launch", "Draft"),
        page("p3", "Initech Portal", "Draft"),
    ])
    .await;
    std::fs::remove_dir_all(h.store.root()).unwrap();
    let report = h.orchestrator(fast_options()).run_import("db").await;

    assert!(!report.success);
    assert_eq!(report.phase, SyncPhase::Failed);
    assert!(!report.unprocessed_slugs.is_empty());
    assert_eq!(report.imported, 0);
}

#[tokio::test]
async fn client_title_mapping_yields_acme() {
    let acme = RawPage::from_value(json!({
        "id": "p9",
        "properties": {
            "Client": { "type": "title", "title": [{ "plain_text": "Acme" }] },
            "Status": { "type": "select", "select": { "name": "Published" } }
        }
    }))
    .unwrap();
    let h = Harness::new(vec![acme]).await;
    h.mappings
        .save_mappings(&[
            FieldMapping::new("Client", CaseStudyField::Title),
            FieldMapping::new("Status", CaseStudyField::Status),
        ])
        .await
        .unwrap();
    let report = h.orchestrator(fast_options()).run_import("db").await;

    assert_eq!(report.imported, 1);
    assert_eq!(report.conflicts_of(ConflictKind::NewItem).count(), 1);
    let versions = h.store.get_versions("acme").await.unwrap();
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].version, 1);
    assert_eq!(versions[0].payload.status, CaseStatus::Published);
    assert!(versions[0].payload.client.is_empty());
}

#[tokio::test]
async fn one_failed_write_does_not_stop_the_batch() {
    let h = Harness::new(vec![
        page("p1", "Acme Rebrand", "Draft"),
        page("p2", "Globex Launch", "Draft"),
        page("p3", "Initech Portal", "Draft"),
    ])
    .await;
    let store = Arc::new(FailingSaveStore {
        inner: h.store.clone(),
        failing_slug: "globex-launch".into(),
    });
    let report = h.orchestrator_with_store(store, fast_options()).run_import("db").await;

    assert!(report.success);
    assert_eq!(report.phase, SyncPhase::Completed);
    assert_eq!(report.imported, 2);
    let write_errors: Vec<_> = report
        .errors
        .iter()
        .filter(|e| e.kind == ReportErrorKind::Write)
        .collect();
    assert_eq!(write_errors.len(), 1);
    assert_eq!(write_errors[0].slug.as_deref(), Some("globex-launch"));
    assert!(h.store.get_by_slug("acme-rebrand").await.unwrap().is_some());
    assert!(h.store.get_by_slug("initech-portal").await.unwrap().is_some());
    assert!(h.store.get_by_slug("globex-launch").await.unwrap().is_none());

    let failed = report
        .conflicts_of(ConflictKind::NewItem)
        .find(|c| c.slug.as_deref() == Some("globex-launch"))
        .unwrap();
    assert!(!failed.written);
    let written = report
        .conflicts_of(ConflictKind::NewItem)
        .filter(|c| c.written)
        .count();
    assert_eq!(written, 2);
}

#[tokio::test]
async fn new_page_cannot_take_over_a_renamed_pages_slug() {
    let h = Harness::new(vec![page("p1", "Acme", "Draft")]).await;
    h.orchestrator(fast_options()).run_import("db").await;

    h.notion
        .set_pages(vec![page("p1", "Acme Old", "Draft"), page("p2", "Acme", "Published")])
        .await;
    let report = h.orchestrator(fast_options()).run_import("db").await;

    assert!(report.success);
    assert_eq!(report.imported, 1);
    let dup: Vec<_> = report
        .errors
        .iter()
        .filter(|e| e.kind == ReportErrorKind::DuplicateSlug)
        .collect();
    assert_eq!(dup.len(), 1);
    assert_eq!(dup[0].page_id.as_deref(), Some("p2"));

    let diffs: Vec<_> = report.conflicts_of(ConflictKind::DifferentValues).collect();
    assert_eq!(diffs.len(), 1);
    assert_eq!(diffs[0].notion_page_id.as_deref(), Some("p1"));
    assert!(!diffs[0].affected_fields.contains("sourceNotionId"));

    let current = h.store.get_by_slug("acme").await.unwrap().unwrap();
    assert_eq!(current.title, "Acme Old");
    assert_eq!(current.source_notion_id.as_deref(), Some("p1"));
    let owners: Vec<Option<String>> = h
        .store
        .get_versions("acme")
        .await
        .unwrap()
        .into_iter()
        .map(|d| d.payload.source_notion_id)
        .collect();
    assert!(owners.iter().all(|o| o.as_deref() == Some("p1")));
}

#[tokio::test]
async fn replacement_page_does_not_hide_a_deleted_one() {
    let h = Harness::new(vec![page("p1", "Acme", "Draft")]).await;
    h.orchestrator(fast_options()).run_import("db").await;

    h.notion.set_pages(vec![page("p3", "Acme", "Published")]).await;
    let report = h.orchestrator(fast_options()).run_import("db").await;

    assert_eq!(report.imported, 0);
    assert_eq!(report.conflicts_of(ConflictKind::DifferentValues).count(), 0);
    let deleted: Vec<_> = report.conflicts_of(ConflictKind::DeletedInNotion).collect();
    assert_eq!(deleted.len(), 1);
    assert_eq!(deleted[0].notion_page_id.as_deref(), Some("p1"));
    assert!(report
        .errors
        .iter()
        .any(|e| e.kind == ReportErrorKind::DuplicateSlug && e.page_id.as_deref() == Some("p3")));

    let current = h.store.get_by_slug("acme").await.unwrap().unwrap();
    assert_eq!(current.source_notion_id.as_deref(), Some("p1"));
    assert_eq!(current.status, CaseStatus::Draft);
    assert_eq!(h.store.get_versions("acme").await.unwrap().len(), 1);
}
