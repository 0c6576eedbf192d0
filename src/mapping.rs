//! Operator-declared mappings from Notion properties onto case study fields,
//! their validation, and their durable storage.
use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tracing::info;

use crate::compat::{self, Coercion, NotionPropertyType, WebsiteFieldType};
use crate::db::{self, Pool};
use crate::error::{MappingStoreError, ValidationError};

/// Key of the mapping set in the documents table.
pub const MAPPINGS_DOCUMENT: &str = "field_mappings";

/// Destination fields of a [`crate::model::CaseStudy`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub enum CaseStudyField {
    Title,
    Slug,
    Client,
    Description,
    Tags,
    MediaItems,
    CoverImage,
    Status,
    Featured,
    ProjectUrl,
    CompletedAt,
    Year,
    Related,
}

impl CaseStudyField {
    pub const ALL: [CaseStudyField; 13] = [
        CaseStudyField::Title,
        CaseStudyField::Slug,
        CaseStudyField::Client,
        CaseStudyField::Description,
        CaseStudyField::Tags,
        CaseStudyField::MediaItems,
        CaseStudyField::CoverImage,
        CaseStudyField::Status,
        CaseStudyField::Featured,
        CaseStudyField::ProjectUrl,
        CaseStudyField::CompletedAt,
        CaseStudyField::Year,
        CaseStudyField::Related,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CaseStudyField::Title => "title",
            CaseStudyField::Slug => "slug",
            CaseStudyField::Client => "client",
            CaseStudyField::Description => "description",
            CaseStudyField::Tags => "tags",
            CaseStudyField::MediaItems => "mediaItems",
            CaseStudyField::CoverImage => "coverImage",
            CaseStudyField::Status => "status",
            CaseStudyField::Featured => "featured",
            CaseStudyField::ProjectUrl => "projectUrl",
            CaseStudyField::CompletedAt => "completedAt",
            CaseStudyField::Year => "year",
            CaseStudyField::Related => "related",
        }
    }

    pub fn field_type(&self) -> WebsiteFieldType {
        match self {
            CaseStudyField::Title | CaseStudyField::Slug | CaseStudyField::Client => {
                WebsiteFieldType::Text
            }
            CaseStudyField::Status => WebsiteFieldType::Text,
            CaseStudyField::Description => WebsiteFieldType::RichText,
            CaseStudyField::Tags => WebsiteFieldType::Tags,
            CaseStudyField::MediaItems => WebsiteFieldType::Gallery,
            CaseStudyField::CoverImage => WebsiteFieldType::Image,
            CaseStudyField::Featured => WebsiteFieldType::Boolean,
            CaseStudyField::ProjectUrl => WebsiteFieldType::Link,
            CaseStudyField::CompletedAt => WebsiteFieldType::Date,
            CaseStudyField::Year => WebsiteFieldType::Number,
            CaseStudyField::Related => WebsiteFieldType::Reference,
        }
    }

    /// A page that cannot fill a required field yields no case study.
    pub fn is_required(&self) -> bool {
        matches!(self, CaseStudyField::Title | CaseStudyField::Slug)
    }
}

impl fmt::Display for CaseStudyField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FieldMapping {
    pub notion_property_name: String,
    pub case_study_field: CaseStudyField,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<Coercion>,
}

impl FieldMapping {
    pub fn new(notion_property_name: impl Into<String>, case_study_field: CaseStudyField) -> Self {
        Self {
            notion_property_name: notion_property_name.into(),
            case_study_field,
            transform: None,
        }
    }

    pub fn with_transform(mut self, coercion: Coercion) -> Self {
        self.transform = Some(coercion);
        self
    }
}

/// Property names the studio's Notion template uses out of the box. The slug
/// has no default: when unmapped it is derived from the title.
pub fn default_mappings() -> Vec<FieldMapping> {
    use CaseStudyField as F;
    vec![
        FieldMapping::new("Name", F::Title),
        FieldMapping::new("Client", F::Client),
        FieldMapping::new("Description", F::Description),
        FieldMapping::new("Tags", F::Tags),
        FieldMapping::new("Media", F::MediaItems),
        FieldMapping::new("Cover", F::CoverImage),
        FieldMapping::new("Status", F::Status),
        FieldMapping::new("Featured", F::Featured),
        FieldMapping::new("Website", F::ProjectUrl),
        FieldMapping::new("Completed", F::CompletedAt),
        FieldMapping::new("Year", F::Year),
        FieldMapping::new("Related", F::Related),
    ]
}

/// Operator mappings followed by the defaults they leave room for. A default
/// is kept only if its field is not mapped by the operator, its property is
/// not already claimed, and `available` reports the property exists.
pub fn effective_mappings<F>(stored: &[FieldMapping], available: F) -> Vec<FieldMapping>
where
    F: Fn(&str) -> bool,
{
    let mut out: Vec<FieldMapping> = stored.to_vec();
    for default in default_mappings() {
        let field_taken = out
            .iter()
            .any(|m| m.case_study_field == default.case_study_field);
        let property_taken = out
            .iter()
            .any(|m| m.notion_property_name == default.notion_property_name);
        if !field_taken && !property_taken && available(&default.notion_property_name) {
            out.push(default);
        }
    }
    out
}

/// Reject ambiguous mapping sets. The later of two mappings for one field is
/// the one reported.
pub fn validate_mappings(mappings: &[FieldMapping]) -> Result<(), ValidationError> {
    let mut by_field: HashMap<CaseStudyField, &FieldMapping> = HashMap::new();
    let mut by_property: HashMap<&str, CaseStudyField> = HashMap::new();

    for m in mappings {
        if m.notion_property_name.trim().is_empty() {
            return Err(ValidationError::EmptyPropertyName {
                field: m.case_study_field.to_string(),
            });
        }
        if let Some(coercion) = m.transform {
            if !compat::allows_coercion(m.case_study_field.field_type(), coercion) {
                return Err(ValidationError::UnsupportedCoercion {
                    field: m.case_study_field.to_string(),
                    coercion,
                });
            }
        }
        if by_field.insert(m.case_study_field, m).is_some() {
            return Err(ValidationError::DuplicateField {
                field: m.case_study_field.to_string(),
                notion_property: m.notion_property_name.clone(),
            });
        }
        if let Some(first) = by_property.insert(&m.notion_property_name, m.case_study_field) {
            return Err(ValidationError::AmbiguousProperty {
                notion_property: m.notion_property_name.clone(),
                first: first.to_string(),
                second: m.case_study_field.to_string(),
            });
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaProblem {
    UnknownProperty,
    Incompatible {
        found: NotionPropertyType,
        accepted: &'static [NotionPropertyType],
    },
}

/// A mapping that will not work against a given database schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaIssue {
    pub field: CaseStudyField,
    pub notion_property: String,
    pub problem: SchemaProblem,
}

impl fmt::Display for SchemaIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.problem {
            SchemaProblem::UnknownProperty => write!(
                f,
                "{}: database has no property '{}'",
                self.field, self.notion_property
            ),
            SchemaProblem::Incompatible { found, accepted } => {
                let accepted: Vec<&str> = accepted.iter().map(|t| t.as_str()).collect();
                write!(
                    f,
                    "{}: property '{}' is {} but {} needs one of [{}]",
                    self.field,
                    self.notion_property,
                    found,
                    self.field.field_type(),
                    accepted.join(", ")
                )
            }
        }
    }
}

/// Authoring-time check of mappings against a database's property types.
pub fn check_against_schema(
    mappings: &[FieldMapping],
    schema: &BTreeMap<String, NotionPropertyType>,
) -> Vec<SchemaIssue> {
    mappings
        .iter()
        .filter_map(|m| {
            let field_type = m.case_study_field.field_type();
            let problem = match schema.get(&m.notion_property_name) {
                None => SchemaProblem::UnknownProperty,
                Some(found) if !compat::is_compatible(field_type, *found) => {
                    SchemaProblem::Incompatible {
                        found: *found,
                        accepted: compat::compatible_types(field_type),
                    }
                }
                Some(_) => return None,
            };
            Some(SchemaIssue {
                field: m.case_study_field,
                notion_property: m.notion_property_name.clone(),
                problem,
            })
        })
        .collect()
}

pub fn parse_mappings_json(raw: &str) -> anyhow::Result<Vec<FieldMapping>> {
    serde_json::from_str(raw).context("mapping file must be a JSON array of mappings")
}

pub fn mappings_to_json(mappings: &[FieldMapping]) -> anyhow::Result<String> {
    serde_json::to_string_pretty(mappings).context("failed to serialize mappings")
}

#[async_trait]
pub trait MappingStore: Send + Sync {
    async fn get_mappings(&self) -> anyhow::Result<Vec<FieldMapping>>;

    /// Replace the whole mapping set, or reject it and keep the old one.
    async fn save_mappings(&self, mappings: &[FieldMapping]) -> Result<(), MappingStoreError>;
}

/// Mapping set persisted as a JSON array document in SQLite.
#[derive(Debug, Clone)]
pub struct SqliteMappingStore {
    pool: Pool,
}

impl SqliteMappingStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MappingStore for SqliteMappingStore {
    async fn get_mappings(&self) -> anyhow::Result<Vec<FieldMapping>> {
        match db::get_document(&self.pool, MAPPINGS_DOCUMENT).await? {
            Some(doc) => serde_json::from_str(&doc.body)
                .with_context(|| format!("stored document '{}' is not a mapping array", MAPPINGS_DOCUMENT)),
            None => Ok(Vec::new()),
        }
    }

    async fn save_mappings(&self, mappings: &[FieldMapping]) -> Result<(), MappingStoreError> {
        validate_mappings(mappings)?;
        let body = serde_json::to_string(mappings).context("failed to serialize mappings")?;
        let written = db::put_document(&self.pool, MAPPINGS_DOCUMENT, &body).await?;
        if written {
            info!(count = mappings.len(), "saved field mappings");
        }
        Ok(())
    }
}
