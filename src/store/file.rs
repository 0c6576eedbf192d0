//! File-backed content store.
//!
//! Layout under the root directory:
//! - `index.json`: slug → summary, so listings never open every document
//! - `case-studies/<slug>.json`: the current document
//! - `versions/<slug>/<version>.json`: append-only history
//!
//! Every file is written to a temp path and renamed into place, so readers see
//! either the old or the new document, never a partial one.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use super::ContentStore;
use crate::config::RestoreMode;
use crate::error::StoreError;
use crate::model::{slugify, CaseStatus, CaseStudy, VersionedDocument};

const INDEX_FORMAT_VERSION: u32 = 2;
const INDEX_FILE: &str = "index.json";
const DOCS_DIR: &str = "case-studies";
const VERSIONS_DIR: &str = "versions";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IndexEntry {
    pub id: String,
    pub title: String,
    pub status: CaseStatus,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_notion_id: Option<String>,
    pub latest_version: u32,
    pub current_version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Index {
    format_version: u32,
    entries: BTreeMap<String, IndexEntry>,
}

impl Default for Index {
    fn default() -> Self {
        Self {
            format_version: INDEX_FORMAT_VERSION,
            entries: BTreeMap::new(),
        }
    }
}

/// Format 1 index: a bare array of summaries without version pointers.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyEntry {
    slug: String,
    #[serde(default)]
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    status: CaseStatus,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    source_notion_id: Option<String>,
}

#[derive(Debug)]
pub struct FileContentStore {
    root: PathBuf,
    restore_mode: RestoreMode,
    index: Mutex<Index>,
}

impl FileContentStore {
    /// Open (creating if needed) a store rooted at `root`, migrating a
    /// format 1 index after backing it up to `index.json.bak`.
    #[instrument(skip_all, fields(root = %root.as_ref().display()))]
    pub async fn open(root: impl AsRef<Path>, restore_mode: RestoreMode) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join(DOCS_DIR))
            .await
            .map_err(StoreError::Unavailable)?;
        fs::create_dir_all(root.join(VERSIONS_DIR))
            .await
            .map_err(StoreError::Unavailable)?;

        let store = Self {
            root,
            restore_mode,
            index: Mutex::new(Index::default()),
        };
        let index = store.load_index().await?;
        *store.index.lock().await = index;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Index summaries, keyed by slug.
    pub async fn summaries(&self) -> BTreeMap<String, IndexEntry> {
        self.index.lock().await.entries.clone()
    }

    fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILE)
    }

    fn doc_path(&self, slug: &str) -> PathBuf {
        self.root.join(DOCS_DIR).join(format!("{slug}.json"))
    }

    fn version_dir(&self, slug: &str) -> PathBuf {
        self.root.join(VERSIONS_DIR).join(slug)
    }

    fn version_path(&self, slug: &str, version: u32) -> PathBuf {
        self.version_dir(slug).join(format!("{version:06}.json"))
    }

    async fn load_index(&self) -> Result<Index, StoreError> {
        let path = self.index_path();
        let raw = match fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Index::default()),
            Err(e) => return Err(StoreError::Unavailable(e)),
        };
        match serde_json::from_slice::<Index>(&raw) {
            Ok(index) => Ok(index),
            Err(current_err) => match serde_json::from_slice::<Vec<LegacyEntry>>(&raw) {
                Ok(legacy) => self.migrate_legacy(legacy).await,
                Err(_) => Err(StoreError::Corrupt {
                    path: path.display().to_string(),
                    source: current_err,
                }),
            },
        }
    }

    async fn migrate_legacy(&self, legacy: Vec<LegacyEntry>) -> Result<Index, StoreError> {
        let path = self.index_path();
        let backup = self.root.join(format!("{INDEX_FILE}.bak"));
        fs::copy(&path, &backup).await.map_err(|source| StoreError::Write {
            path: backup.display().to_string(),
            source,
        })?;

        let mut index = Index::default();
        for entry in legacy {
            let latest = self.highest_version_on_disk(&entry.slug).await?;
            index.entries.insert(
                entry.slug,
                IndexEntry {
                    id: entry.id,
                    title: entry.title,
                    status: entry.status,
                    updated_at: entry.updated_at,
                    source_notion_id: entry.source_notion_id,
                    latest_version: latest,
                    current_version: latest,
                },
            );
        }
        self.write_json(&path, &index).await?;
        info!(entries = index.entries.len(), backup = %backup.display(), "migrated content index");
        Ok(index)
    }

    async fn highest_version_on_disk(&self, slug: &str) -> Result<u32, StoreError> {
        let mut dir = match fs::read_dir(self.version_dir(slug)).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(StoreError::Unavailable(e)),
        };
        let mut highest = 0;
        while let Some(item) = dir.next_entry().await.map_err(StoreError::Unavailable)? {
            let name = item.file_name();
            let parsed = name
                .to_str()
                .and_then(|n| n.strip_suffix(".json"))
                .and_then(|n| n.parse::<u32>().ok());
            if let Some(v) = parsed {
                highest = highest.max(v);
            }
        }
        Ok(highest)
    }

    async fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>, StoreError> {
        let raw = match fs::read(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::Unavailable(e)),
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|source| StoreError::Corrupt {
                path: path.display().to_string(),
                source,
            })
    }

    async fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), StoreError> {
        let body = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Corrupt {
            path: path.display().to_string(),
            source,
        })?;
        if !self.root.exists() {
            return Err(StoreError::Unavailable(std::io::Error::new(
                ErrorKind::NotFound,
                format!("{} is missing", self.root.display()),
            )));
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| self.write_error(path, e))?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &body)
            .await
            .map_err(|e| self.write_error(path, e))?;
        fs::rename(&tmp, path)
            .await
            .map_err(|e| self.write_error(path, e))
    }

    /// A missing root means the store itself is gone, not just one document.
    fn write_error(&self, path: &Path, source: std::io::Error) -> StoreError {
        if !self.root.exists() {
            return StoreError::Unavailable(source);
        }
        StoreError::Write {
            path: path.display().to_string(),
            source,
        }
    }

    fn check_slug(slug: &str) -> Result<(), StoreError> {
        if slug.is_empty() || slugify(slug) != slug {
            return Err(StoreError::InvalidSlug(slug.to_string()));
        }
        Ok(())
    }

    /// Append `payload` as the next version and make it current. The version
    /// number also accounts for files on disk that a failed index write never
    /// recorded, so existing versions are never overwritten. The in-memory
    /// index changes only once `index.json` is written.
    async fn append_locked(
        &self,
        index: &mut Index,
        payload: &CaseStudy,
    ) -> Result<VersionedDocument, StoreError> {
        let slug = payload.slug.as_str();
        let recorded = index.entries.get(slug).map(|e| e.latest_version).unwrap_or(0);
        let next = recorded.max(self.highest_version_on_disk(slug).await?) + 1;
        let doc = VersionedDocument {
            version: next,
            payload: payload.clone(),
            created_at: Utc::now(),
        };
        self.write_json(&self.version_path(slug, next), &doc).await?;
        self.write_json(&self.doc_path(slug), payload).await?;

        let mut updated = index.clone();
        updated.entries.insert(
            slug.to_string(),
            IndexEntry {
                id: payload.id.clone(),
                title: payload.title.clone(),
                status: payload.status,
                updated_at: payload.updated_at,
                source_notion_id: payload.source_notion_id.clone(),
                latest_version: next,
                current_version: next,
            },
        );
        self.write_json(&self.index_path(), &updated).await?;
        *index = updated;
        Ok(doc)
    }
}

#[async_trait]
impl ContentStore for FileContentStore {
    async fn get_by_slug(&self, slug: &str) -> Result<Option<CaseStudy>, StoreError> {
        Self::check_slug(slug)?;
        self.read_json(&self.doc_path(slug)).await
    }

    async fn find_by_notion_id(&self, notion_id: &str) -> Result<Option<CaseStudy>, StoreError> {
        let slug = {
            let index = self.index.lock().await;
            index
                .entries
                .iter()
                .find(|(_, e)| e.source_notion_id.as_deref() == Some(notion_id))
                .map(|(slug, _)| slug.clone())
        };
        match slug {
            Some(slug) => self.get_by_slug(&slug).await,
            None => Ok(None),
        }
    }

    async fn list(&self) -> Result<Vec<CaseStudy>, StoreError> {
        let slugs: Vec<String> = self.index.lock().await.entries.keys().cloned().collect();
        let mut out = Vec::with_capacity(slugs.len());
        for slug in slugs {
            match self.get_by_slug(&slug).await? {
                Some(cs) => out.push(cs),
                None => warn!(%slug, "index entry without document"),
            }
        }
        Ok(out)
    }

    #[instrument(skip_all, fields(slug = %case_study.slug))]
    async fn save(&self, case_study: &CaseStudy) -> Result<VersionedDocument, StoreError> {
        Self::check_slug(&case_study.slug)?;
        let mut index = self.index.lock().await;
        self.append_locked(&mut index, case_study).await
    }

    async fn get_versions(&self, slug: &str) -> Result<Vec<VersionedDocument>, StoreError> {
        Self::check_slug(slug)?;
        let latest = self.highest_version_on_disk(slug).await?;
        let mut versions = Vec::with_capacity(latest as usize);
        for v in 1..=latest {
            if let Some(doc) = self.read_json(&self.version_path(slug, v)).await? {
                versions.push(doc);
            }
        }
        Ok(versions)
    }

    #[instrument(skip(self))]
    async fn restore_version(&self, slug: &str, version: u32) -> Result<CaseStudy, StoreError> {
        Self::check_slug(slug)?;
        let mut index = self.index.lock().await;
        if !index.entries.contains_key(slug) {
            return Err(StoreError::NotFound(slug.to_string()));
        }
        let doc: VersionedDocument = self
            .read_json(&self.version_path(slug, version))
            .await?
            .ok_or_else(|| StoreError::VersionNotFound {
                slug: slug.to_string(),
                version,
            })?;

        let mut payload = doc.payload;
        match self.restore_mode {
            RestoreMode::NewVersion => {
                payload.updated_at = Utc::now();
                let appended = self.append_locked(&mut index, &payload).await?;
                info!(slug, from = version, to = appended.version, "restored version as new version");
            }
            RestoreMode::PointerOnly => {
                self.write_json(&self.doc_path(slug), &payload).await?;
                let mut updated = index.clone();
                if let Some(entry) = updated.entries.get_mut(slug) {
                    entry.current_version = version;
                    entry.title = payload.title.clone();
                    entry.status = payload.status;
                    entry.updated_at = payload.updated_at;
                }
                self.write_json(&self.index_path(), &updated).await?;
                *index = updated;
                info!(slug, version, "pointed current document at older version");
            }
        }
        Ok(payload)
    }
}
