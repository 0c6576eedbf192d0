//! Import orchestration: fetch → transform → diff → write.
//!
//! A run always ends in a [`SyncReport`]; failures become report entries and,
//! when unrecoverable, a `Failed` phase with the slugs left unprocessed.
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::ser::{SerializeSeq, Serializer};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::config::{ConflictPolicy, SyncSettings};
use crate::error::{FetchError, FieldError, FieldErrorKind, StoreError};
use crate::mapping::{effective_mappings, FieldMapping, MappingStore};
use crate::model::CaseStudy;
use crate::notion::model::RawPage;
use crate::notion::NotionSource;
use crate::store::ContentStore;
use crate::transform::transform;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Fetching,
    Transforming,
    Diffing,
    Writing,
    Completed,
    Failed,
}

impl SyncPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::Idle => "idle",
            SyncPhase::Fetching => "fetching",
            SyncPhase::Transforming => "transforming",
            SyncPhase::Diffing => "diffing",
            SyncPhase::Writing => "writing",
            SyncPhase::Completed => "completed",
            SyncPhase::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    TypeMismatch,
    DeletedInNotion,
    NewItem,
    DifferentValues,
}

/// Fields a conflict touches; `All` serializes as `"*"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AffectedFields {
    All,
    Fields(Vec<String>),
}

impl AffectedFields {
    pub fn contains(&self, field: &str) -> bool {
        match self {
            AffectedFields::All => true,
            AffectedFields::Fields(fields) => fields.iter().any(|f| f == field),
        }
    }
}

impl Serialize for AffectedFields {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            AffectedFields::All => serializer.serialize_str("*"),
            AffectedFields::Fields(fields) => {
                let mut seq = serializer.serialize_seq(Some(fields.len()))?;
                for f in fields {
                    seq.serialize_element(f)?;
                }
                seq.end()
            }
        }
    }
}

/// A divergence between Notion and the local store, reported per run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub kind: ConflictKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notion_page_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notion_side: Option<CaseStudy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_side: Option<CaseStudy>,
    pub affected_fields: AffectedFields,
    /// Set once the Notion side has actually been written during this run.
    pub written: bool,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReportErrorKind {
    Fetch,
    Mapping,
    Field,
    DuplicateSlug,
    SlugChanged,
    Store,
    Write,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportError {
    pub kind: ReportErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_id: Option<String>,
    pub message: String,
    /// Fatal for the page or the run, depending on `kind`.
    pub fatal: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<FieldError>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub run_id: Uuid,
    pub database_id: String,
    pub success: bool,
    pub phase: SyncPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_in: Option<SyncPhase>,
    pub imported: usize,
    pub skipped: usize,
    pub errors: Vec<ReportError>,
    pub conflicts: Vec<Conflict>,
    /// Slugs a failed run did not get to; rerunning the import picks them up.
    pub unprocessed_slugs: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SyncReport {
    fn start(database_id: &str) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            database_id: database_id.to_string(),
            success: false,
            phase: SyncPhase::Idle,
            failed_in: None,
            imported: 0,
            skipped: 0,
            errors: Vec::new(),
            conflicts: Vec::new(),
            unprocessed_slugs: Vec::new(),
            started_at: now,
            finished_at: now,
        }
    }

    pub fn conflicts_of(&self, kind: ConflictKind) -> impl Iterator<Item = &Conflict> {
        self.conflicts.iter().filter(move |c| c.kind == kind)
    }

    fn enter(&mut self, phase: SyncPhase) {
        info!(run_id = %self.run_id, phase = phase.as_str(), "sync phase");
        self.phase = phase;
    }

    fn push_error(
        &mut self,
        kind: ReportErrorKind,
        slug: Option<&str>,
        page_id: Option<&str>,
        message: impl Into<String>,
        fatal: bool,
    ) {
        self.errors.push(ReportError {
            kind,
            slug: slug.map(str::to_string),
            page_id: page_id.map(str::to_string),
            message: message.into(),
            fatal,
            field: None,
        });
    }

    fn push_field_error(&mut self, slug: Option<&str>, page_id: &str, err: FieldError) {
        self.errors.push(ReportError {
            kind: ReportErrorKind::Field,
            slug: slug.map(str::to_string),
            page_id: Some(page_id.to_string()),
            message: err.to_string(),
            fatal: err.fatal,
            field: Some(err),
        });
    }

    /// Flip `written` on the new-item or changed-values conflict of `slug`.
    fn mark_written(&mut self, slug: &str) {
        for conflict in self.conflicts.iter_mut().filter(|c| {
            matches!(c.kind, ConflictKind::NewItem | ConflictKind::DifferentValues)
                && c.slug.as_deref() == Some(slug)
        }) {
            conflict.written = true;
        }
    }

    fn complete(mut self) -> Self {
        self.phase = SyncPhase::Completed;
        self.success = true;
        self.finished_at = Utc::now();
        info!(
            run_id = %self.run_id,
            imported = self.imported,
            skipped = self.skipped,
            errors = self.errors.len(),
            conflicts = self.conflicts.len(),
            "sync run completed"
        );
        self
    }

    fn fail(mut self, unprocessed: Vec<String>) -> Self {
        error!(
            run_id = %self.run_id,
            phase = self.phase.as_str(),
            unprocessed = unprocessed.len(),
            "sync run failed"
        );
        self.failed_in = Some(self.phase);
        self.phase = SyncPhase::Failed;
        self.success = false;
        self.unprocessed_slugs = unprocessed;
        self.finished_at = Utc::now();
        self
    }

    fn cancelled(mut self, unprocessed: Vec<String>) -> Self {
        let phase = self.phase;
        self.push_error(
            ReportErrorKind::Cancelled,
            None,
            None,
            format!("run cancelled after {}", phase.as_str()),
            true,
        );
        self.fail(unprocessed)
    }
}

/// Cooperative cancellation, checked at phase boundaries and between write
/// batches. Writes already made are kept.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub fetch_attempts: u32,
    pub backoff_base: Duration,
    pub max_backoff: Duration,
    pub concurrency: usize,
    pub conflict_policy: ConflictPolicy,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self::from(&SyncSettings::default())
    }
}

impl From<&SyncSettings> for SyncOptions {
    fn from(s: &SyncSettings) -> Self {
        Self {
            fetch_attempts: s.fetch_attempts.max(1),
            backoff_base: Duration::from_millis(s.backoff_base_ms),
            max_backoff: Duration::from_secs(s.max_backoff_seconds),
            concurrency: s.concurrency.max(1),
            conflict_policy: s.conflict_policy,
        }
    }
}

impl SyncOptions {
    /// Exponential backoff `base * 2^(attempt-1)`, capped; a server-provided
    /// `Retry-After` replaces the computed delay (still capped).
    pub fn backoff_for(&self, attempt: u32, err: &FetchError) -> Duration {
        let computed = self
            .backoff_base
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(10));
        let delay = match err {
            FetchError::RateLimited {
                retry_after_secs: Some(secs),
            } => Duration::from_secs(*secs),
            _ => computed,
        };
        if self.max_backoff.is_zero() {
            delay
        } else {
            delay.min(self.max_backoff)
        }
    }
}

pub struct SyncOrchestrator {
    source: Arc<dyn NotionSource>,
    store: Arc<dyn ContentStore>,
    mappings: Arc<dyn MappingStore>,
    options: SyncOptions,
    cancel: CancelHandle,
}

impl SyncOrchestrator {
    pub fn new(
        source: Arc<dyn NotionSource>,
        store: Arc<dyn ContentStore>,
        mappings: Arc<dyn MappingStore>,
        options: SyncOptions,
    ) -> Self {
        Self {
            source,
            store,
            mappings,
            options,
            cancel: CancelHandle::default(),
        }
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Import every page of `database_id`. Never returns an error: the
    /// report says what happened to each page.
    #[instrument(skip(self))]
    pub async fn run_import(&self, database_id: &str) -> SyncReport {
        let mut report = SyncReport::start(database_id);
        info!(run_id = %report.run_id, "sync run started");

        report.enter(SyncPhase::Fetching);
        // Archived pages count as gone from Notion.
        let pages: Vec<RawPage> = match self.fetch_with_retry(database_id).await {
            Ok(pages) => pages.into_iter().filter(|p| !p.archived).collect(),
            Err(err) => {
                report.push_error(ReportErrorKind::Fetch, None, None, err.to_string(), true);
                return report.fail(Vec::new());
            }
        };
        if self.cancel.is_cancelled() {
            return report.cancelled(Vec::new());
        }

        report.enter(SyncPhase::Transforming);
        let stored = match self.mappings.get_mappings().await {
            Ok(stored) => stored,
            Err(err) => {
                report.push_error(
                    ReportErrorKind::Mapping,
                    None,
                    None,
                    format!("failed to load mappings: {err:#}"),
                    true,
                );
                return report.fail(Vec::new());
            }
        };
        // Snapshot: later edits to the mapping store do not affect this run.
        let snapshot = effective_mappings(&stored, |name| {
            pages.iter().any(|p| p.properties.contains_key(name))
        });
        let candidates = transform_all(&mut report, &pages, &snapshot);
        if self.cancel.is_cancelled() {
            let slugs = candidates.iter().map(|c| c.slug.clone()).collect();
            return report.cancelled(slugs);
        }

        report.enter(SyncPhase::Diffing);
        let plan = match self.diff(&mut report, &pages, candidates).await {
            Ok(plan) => plan,
            Err(unprocessed) => return report.fail(unprocessed),
        };
        if self.cancel.is_cancelled() {
            let slugs = plan.iter().map(|c| c.slug.clone()).collect();
            return report.cancelled(slugs);
        }

        report.enter(SyncPhase::Writing);
        if let Err(unprocessed) = self.write_all(&mut report, plan).await {
            return report.fail(unprocessed);
        }
        report.complete()
    }

    async fn fetch_with_retry(&self, database_id: &str) -> Result<Vec<RawPage>, FetchError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.source.fetch_all_pages(database_id).await {
                Ok(pages) => return Ok(pages),
                Err(err) if err.is_retryable() && attempt < self.options.fetch_attempts => {
                    let delay = self.options.backoff_for(attempt, &err);
                    warn!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "fetch failed; retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    error!(attempt, error = %err, "fetch failed");
                    return Err(err);
                }
            }
        }
    }

    /// Existing record for a candidate: by Notion back-reference, then by
    /// slug. A slug match recorded for another Notion page is `Taken`.
    async fn lookup(&self, candidate: &CaseStudy) -> Result<StoredMatch, StoreError> {
        if let Some(id) = candidate.source_notion_id.as_deref() {
            if let Some(found) = self.store.find_by_notion_id(id).await? {
                return Ok(StoredMatch::Own(found));
            }
        }
        Ok(match self.store.get_by_slug(&candidate.slug).await? {
            Some(found) if owned_by_other_page(&found, candidate) => StoredMatch::Taken(found),
            Some(found) => StoredMatch::Own(found),
            None => StoredMatch::Absent,
        })
    }

    /// Classify every candidate and return the ones to write. On a store
    /// outage returns the slugs that were never classified.
    async fn diff(
        &self,
        report: &mut SyncReport,
        pages: &[RawPage],
        candidates: Vec<CaseStudy>,
    ) -> Result<Vec<CaseStudy>, Vec<String>> {
        // Final slug → page that claimed it in this run.
        let mut claimed: HashMap<String, String> = HashMap::new();
        let mut plan = Vec::new();
        let mut queue = candidates.into_iter();

        while let Some(mut candidate) = queue.next() {
            let existing = match self.lookup(&candidate).await {
                Ok(existing) => existing,
                Err(err) if err.is_unavailable() => {
                    report.push_error(
                        ReportErrorKind::Store,
                        Some(&candidate.slug),
                        None,
                        err.to_string(),
                        true,
                    );
                    let mut rest: Vec<String> = plan.iter().map(|c: &CaseStudy| c.slug.clone()).collect();
                    rest.push(candidate.slug);
                    rest.extend(queue.map(|c| c.slug));
                    return Err(rest);
                }
                Err(err) => {
                    report.push_error(
                        ReportErrorKind::Store,
                        Some(&candidate.slug),
                        candidate.source_notion_id.as_deref(),
                        err.to_string(),
                        false,
                    );
                    continue;
                }
            };

            let page_id = candidate.source_notion_id.clone().unwrap_or_default();
            let existing = match existing {
                StoredMatch::Own(existing) => existing,
                StoredMatch::Taken(other) => {
                    report.push_error(
                        ReportErrorKind::DuplicateSlug,
                        Some(&candidate.slug),
                        candidate.source_notion_id.as_deref(),
                        format!(
                            "slug '{}' belongs to notion page {}",
                            candidate.slug,
                            other.source_notion_id.as_deref().unwrap_or_default()
                        ),
                        true,
                    );
                    continue;
                }
                StoredMatch::Absent => {
                    if !claim_slug(report, &mut claimed, &candidate.slug, &page_id) {
                        continue;
                    }
                    candidate.id = Uuid::new_v4().to_string();
                    report.conflicts.push(Conflict {
                        kind: ConflictKind::NewItem,
                        slug: Some(candidate.slug.clone()),
                        notion_page_id: candidate.source_notion_id.clone(),
                        notion_side: Some(candidate.clone()),
                        local_side: None,
                        affected_fields: AffectedFields::All,
                        written: false,
                    });
                    plan.push(candidate);
                    continue;
                }
            };

            if existing.slug != candidate.slug {
                report.push_error(
                    ReportErrorKind::SlugChanged,
                    Some(&existing.slug),
                    candidate.source_notion_id.as_deref(),
                    format!(
                        "notion title now yields slug '{}'; keeping stored slug '{}'",
                        candidate.slug, existing.slug
                    ),
                    false,
                );
                candidate.slug = existing.slug.clone();
            }
            if !claim_slug(report, &mut claimed, &candidate.slug, &page_id) {
                continue;
            }
            candidate.id = existing.id.clone();

            let changed = existing.changed_fields(&candidate);
            if changed.is_empty() {
                report.skipped += 1;
                continue;
            }
            let write = self.options.conflict_policy == ConflictPolicy::AutoOverwrite;
            report.conflicts.push(Conflict {
                kind: ConflictKind::DifferentValues,
                slug: Some(candidate.slug.clone()),
                notion_page_id: candidate.source_notion_id.clone(),
                notion_side: Some(candidate.clone()),
                local_side: Some(existing),
                affected_fields: AffectedFields::Fields(
                    changed.into_iter().map(str::to_string).collect(),
                ),
                written: false,
            });
            if write {
                plan.push(candidate);
            }
        }

        let pulled: HashSet<&str> = pages.iter().map(|p| p.id.as_str()).collect();
        match self.store.list().await {
            Ok(stored) => {
                for local in stored {
                    // Records without a back-reference can only be matched by slug.
                    let still_in_notion = match local.source_notion_id.as_deref() {
                        Some(id) => pulled.contains(id),
                        None => claimed.contains_key(&local.slug),
                    };
                    if local.synced && !still_in_notion {
                        report.conflicts.push(Conflict {
                            kind: ConflictKind::DeletedInNotion,
                            slug: Some(local.slug.clone()),
                            notion_page_id: local.source_notion_id.clone(),
                            notion_side: None,
                            local_side: Some(local),
                            affected_fields: AffectedFields::All,
                            written: false,
                        });
                    }
                }
            }
            Err(err) if err.is_unavailable() => {
                report.push_error(ReportErrorKind::Store, None, None, err.to_string(), true);
                return Err(plan.into_iter().map(|c| c.slug).collect());
            }
            Err(err) => {
                report.push_error(ReportErrorKind::Store, None, None, err.to_string(), false);
            }
        }
        Ok(plan)
    }

    /// Write planned records in batches of `concurrency`. Per-slug failures
    /// are reported; an unavailable store stops the phase.
    async fn write_all(&self, report: &mut SyncReport, plan: Vec<CaseStudy>) -> Result<(), Vec<String>> {
        let chunks: Vec<&[CaseStudy]> = plan.chunks(self.options.concurrency).collect();
        for (i, chunk) in chunks.iter().enumerate() {
            if self.cancel.is_cancelled() {
                let rest = chunks[i..].iter().flat_map(|c| c.iter().map(|cs| cs.slug.clone()));
                report.push_error(
                    ReportErrorKind::Cancelled,
                    None,
                    None,
                    "run cancelled during writing",
                    true,
                );
                return Err(rest.collect());
            }

            let results = join_all(chunk.iter().map(|cs| self.write_one(cs))).await;
            let mut unavailable = Vec::new();
            for (cs, result) in chunk.iter().zip(results) {
                match result {
                    Ok(version) => {
                        report.imported += 1;
                        report.mark_written(&cs.slug);
                        info!(slug = %cs.slug, version, "case study written");
                    }
                    Err(err) if err.is_unavailable() => {
                        report.push_error(ReportErrorKind::Store, Some(&cs.slug), None, err.to_string(), true);
                        unavailable.push(cs.slug.clone());
                    }
                    Err(err) => {
                        warn!(slug = %cs.slug, error = %err, "write failed");
                        report.push_error(
                            ReportErrorKind::Write,
                            Some(&cs.slug),
                            cs.source_notion_id.as_deref(),
                            err.to_string(),
                            false,
                        );
                    }
                }
            }
            if !unavailable.is_empty() {
                let rest = chunks[i + 1..].iter().flat_map(|c| c.iter().map(|cs| cs.slug.clone()));
                unavailable.extend(rest);
                return Err(unavailable);
            }
        }
        Ok(())
    }

    async fn write_one(&self, candidate: &CaseStudy) -> Result<u32, StoreError> {
        let mut record = candidate.clone();
        record.synced = true;
        record.updated_at = Utc::now();
        Ok(self.store.save(&record).await?.version)
    }
}

/// Result of looking up the stored record for a candidate.
enum StoredMatch {
    Own(CaseStudy),
    Taken(CaseStudy),
    Absent,
}

fn owned_by_other_page(found: &CaseStudy, candidate: &CaseStudy) -> bool {
    match found.source_notion_id.as_deref() {
        Some(owner) if !owner.is_empty() => candidate.source_notion_id.as_deref() != Some(owner),
        _ => false,
    }
}

/// Reserve `slug` for `page_id` in this run; a second page ending on the same
/// slug gets a fatal duplicate error instead of a write.
fn claim_slug(
    report: &mut SyncReport,
    claimed: &mut HashMap<String, String>,
    slug: &str,
    page_id: &str,
) -> bool {
    match claimed.get(slug) {
        Some(first) if first != page_id => {
            let message = format!("slug '{}' already claimed by page {}", slug, first);
            report.push_error(ReportErrorKind::DuplicateSlug, Some(slug), Some(page_id), message, true);
            false
        }
        _ => {
            claimed.insert(slug.to_string(), page_id.to_string());
            true
        }
    }
}

/// Transform every page, reporting field problems. Pages with fatal errors
/// and pages whose slug is already taken in this pull are left out.
fn transform_all(report: &mut SyncReport, pages: &[RawPage], mappings: &[FieldMapping]) -> Vec<CaseStudy> {
    let mut candidates = Vec::with_capacity(pages.len());
    let mut seen: HashMap<String, String> = HashMap::new();

    for page in pages {
        match transform(page, mappings) {
            Ok(out) => {
                let slug = out.case_study.slug.clone();
                for warning in out.warnings {
                    if warning.kind == FieldErrorKind::TypeMismatch {
                        report.conflicts.push(Conflict {
                            kind: ConflictKind::TypeMismatch,
                            slug: Some(slug.clone()),
                            notion_page_id: Some(page.id.clone()),
                            notion_side: None,
                            local_side: None,
                            affected_fields: AffectedFields::Fields(vec![warning.field.clone()]),
                            written: false,
                        });
                    }
                    report.push_field_error(Some(&slug), &page.id, warning);
                }
                if let Some(first) = seen.get(&slug) {
                    report.push_error(
                        ReportErrorKind::DuplicateSlug,
                        Some(&slug),
                        Some(&page.id),
                        format!("slug '{}' already produced by page {}", slug, first),
                        true,
                    );
                    continue;
                }
                seen.insert(slug, page.id.clone());
                candidates.push(out.case_study);
            }
            Err(errors) => {
                warn!(page_id = %page.id, errors = errors.len(), "page skipped");
                for err in errors {
                    if err.kind == FieldErrorKind::TypeMismatch {
                        report.conflicts.push(Conflict {
                            kind: ConflictKind::TypeMismatch,
                            slug: None,
                            notion_page_id: Some(page.id.clone()),
                            notion_side: None,
                            local_side: None,
                            affected_fields: AffectedFields::Fields(vec![err.field.clone()]),
                            written: false,
                        });
                    }
                    report.push_field_error(None, &page.id, err);
                }
            }
        }
    }
    candidates
}
