//! Local content store: versioned case study documents keyed by slug.
use async_trait::async_trait;

use crate::error::StoreError;
use crate::model::{CaseStudy, VersionedDocument};

pub mod file;

pub use file::FileContentStore;

#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn get_by_slug(&self, slug: &str) -> Result<Option<CaseStudy>, StoreError>;

    /// Lookup through the `sourceNotionId` back-reference.
    async fn find_by_notion_id(&self, notion_id: &str) -> Result<Option<CaseStudy>, StoreError>;

    async fn list(&self) -> Result<Vec<CaseStudy>, StoreError>;

    /// Make `case_study` current and append it to the slug's history.
    async fn save(&self, case_study: &CaseStudy) -> Result<VersionedDocument, StoreError>;

    /// Full history of a slug, oldest first.
    async fn get_versions(&self, slug: &str) -> Result<Vec<VersionedDocument>, StoreError>;

    async fn restore_version(&self, slug: &str, version: u32) -> Result<CaseStudy, StoreError>;
}

/// Resolve `related` Notion page ids to slugs of stored case studies.
/// Ids with no stored counterpart are dropped.
pub async fn resolve_related(
    store: &dyn ContentStore,
    case_study: &CaseStudy,
) -> Result<Vec<String>, StoreError> {
    let mut slugs = Vec::with_capacity(case_study.related.len());
    for id in &case_study.related {
        if let Some(found) = store.find_by_notion_id(id).await? {
            slugs.push(found.slug);
        }
    }
    Ok(slugs)
}
