//! Error taxonomy shared by the adapter, mapping store, content store and
//! transformer. Orchestration code turns all of these into report entries.
use serde::Serialize;
use std::fmt;
use thiserror::Error;

use crate::compat::{Coercion, NotionPropertyType, WebsiteFieldType};

/// Failure talking to Notion.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("notion rejected credentials ({status}): {body}")]
    Unauthorized { status: u16, body: String },
    #[error("rate limited by notion")]
    RateLimited { retry_after_secs: Option<u64> },
    #[error("notion error {status}: {body}")]
    Http { status: u16, body: String },
    #[error("failed to reach notion: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid notion response: {0}")]
    Decode(String),
}

impl FetchError {
    /// Transient failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::RateLimited { .. } => true,
            FetchError::Http { status, .. } => *status >= 500,
            FetchError::Transport(_) => true,
            FetchError::Unauthorized { .. } | FetchError::Decode(_) => false,
        }
    }

    pub fn from_status(status: u16, body: String, retry_after_secs: Option<u64>) -> Self {
        match status {
            401 | 403 => FetchError::Unauthorized { status, body },
            429 => FetchError::RateLimited { retry_after_secs },
            _ => FetchError::Http { status, body },
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FieldErrorKind {
    MissingProperty,
    TypeMismatch,
}

/// Per-field problem found while transforming one page.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FieldError {
    pub kind: FieldErrorKind,
    pub field: String,
    pub notion_property: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<WebsiteFieldType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub found: Option<NotionPropertyType>,
    /// Set when the field is required; the page produces no case study.
    pub fatal: bool,
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            FieldErrorKind::MissingProperty => write!(
                f,
                "property '{}' for field '{}' is missing",
                self.notion_property, self.field
            ),
            FieldErrorKind::TypeMismatch => write!(
                f,
                "property '{}' has type {} which cannot feed field '{}' ({})",
                self.notion_property,
                self.found.map(|t| t.as_str()).unwrap_or("unknown"),
                self.field,
                self.expected.map(|t| t.as_str()).unwrap_or("unknown"),
            ),
        }
    }
}

/// A mapping set that cannot be saved.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("field '{field}' is mapped more than once (last mapping: '{notion_property}')")]
    DuplicateField { field: String, notion_property: String },
    #[error("property '{notion_property}' feeds both '{first}' and '{second}'")]
    AmbiguousProperty {
        notion_property: String,
        first: String,
        second: String,
    },
    #[error("coercion '{coercion}' is not allowed for field '{field}'")]
    UnsupportedCoercion { field: String, coercion: Coercion },
    #[error("mapping for field '{field}' has an empty property name")]
    EmptyPropertyName { field: String },
}

/// Local content store failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no case study with slug '{0}'")]
    NotFound(String),
    #[error("slug '{slug}' has no version {version}")]
    VersionNotFound { slug: String, version: u32 },
    #[error("invalid slug '{0}'")]
    InvalidSlug(String),
    #[error("corrupt document {path}: {source}")]
    Corrupt {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    /// The store as a whole cannot be used (e.g. its directory vanished).
    #[error("content store unavailable: {0}")]
    Unavailable(#[source] std::io::Error),
    #[error("failed to write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

#[derive(Debug, Error)]
pub enum MappingStoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("mapping storage failed: {0}")]
    Storage(#[from] anyhow::Error),
}
