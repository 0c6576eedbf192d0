use chrono::{DateTime, NaiveDate, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    #[default]
    Draft,
    Published,
}

impl CaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaseStatus::Draft => "draft",
            CaseStatus::Published => "published",
        }
    }

    /// Loose parse of an editor-facing status label. Anything not recognised
    /// as live content is a draft.
    pub fn parse_label(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "published" | "live" | "public" => CaseStatus::Published,
            _ => CaseStatus::Draft,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
    Gallery,
}

impl MediaKind {
    /// Guess the media kind from a URL's file extension.
    pub fn from_url(url: &str) -> Self {
        let path = url.split(['?', '#']).next().unwrap_or(url);
        let ext = path
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "mp4" | "mov" | "webm" | "m4v" | "avi" => MediaKind::Video,
            _ => MediaKind::Image,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaItem {
    #[serde(rename = "type")]
    pub kind: MediaKind,
    pub url: String,
    #[serde(default)]
    pub alt: String,
}

/// The site's canonical content record for one project.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CaseStudy {
    pub id: String,
    pub slug: String,
    pub title: String,
    #[serde(default)]
    pub client: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub media_items: Vec<MediaItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover_image: Option<MediaItem>,
    #[serde(default)]
    pub status: CaseStatus,
    #[serde(default)]
    pub featured: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<f64>,
    /// Notion page ids of related case studies; resolved to slugs on read.
    #[serde(default)]
    pub related: Vec<String>,
    #[serde(default)]
    pub synced: bool,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_notion_id: Option<String>,
}

impl CaseStudy {
    /// An empty draft carrying only identity. Field defaults are the
    /// transformer's fallbacks for unmapped or missing properties.
    pub fn blank(slug: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            slug: slug.into(),
            title: title.into(),
            client: String::new(),
            description: String::new(),
            tags: Vec::new(),
            media_items: Vec::new(),
            cover_image: None,
            status: CaseStatus::Draft,
            featured: false,
            project_url: None,
            completed_at: None,
            year: None,
            related: Vec::new(),
            synced: false,
            updated_at: Utc::now(),
            source_notion_id: None,
        }
    }

    /// Content fields that differ between `self` and `other`. Bookkeeping
    /// (`id`, `synced`, `updatedAt`) never counts as a change.
    pub fn changed_fields(&self, other: &CaseStudy) -> Vec<&'static str> {
        let mut changed = Vec::new();
        if self.slug != other.slug {
            changed.push("slug");
        }
        if self.title != other.title {
            changed.push("title");
        }
        if self.client != other.client {
            changed.push("client");
        }
        if self.description != other.description {
            changed.push("description");
        }
        if self.tags != other.tags {
            changed.push("tags");
        }
        if self.media_items != other.media_items {
            changed.push("mediaItems");
        }
        if self.cover_image != other.cover_image {
            changed.push("coverImage");
        }
        if self.status != other.status {
            changed.push("status");
        }
        if self.featured != other.featured {
            changed.push("featured");
        }
        if self.project_url != other.project_url {
            changed.push("projectUrl");
        }
        if self.completed_at != other.completed_at {
            changed.push("completedAt");
        }
        if self.year != other.year {
            changed.push("year");
        }
        if self.related != other.related {
            changed.push("related");
        }
        if self.source_notion_id != other.source_notion_id {
            changed.push("sourceNotionId");
        }
        changed
    }
}

/// One immutable entry in a slug's version history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VersionedDocument {
    pub version: u32,
    pub payload: CaseStudy,
    pub created_at: DateTime<Utc>,
}

static NON_SLUG: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-z0-9]+").expect("static regex"));

/// URL-safe slug: lowercase ASCII alphanumerics separated by single dashes.
pub fn slugify(input: &str) -> String {
    let lowered = input.trim().to_lowercase();
    NON_SLUG
        .replace_all(&lowered, "-")
        .trim_matches('-')
        .to_string()
}
