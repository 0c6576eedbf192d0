//! Typed view of Notion pages. Every property is decoded into a
//! [`RawProperty`] variant here, before any mapping logic sees it.
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::compat::NotionPropertyType;

#[derive(Deserialize, Debug)]
pub struct DatabaseProperty {
    pub id: String,
    #[serde(rename = "type")]
    pub typ: String,
}

impl DatabaseProperty {
    pub fn property_type(&self) -> NotionPropertyType {
        NotionPropertyType::parse_type(&self.typ)
    }
}

#[derive(Deserialize, Debug)]
pub struct RetrieveDatabaseResp {
    pub id: String,
    #[serde(default)]
    pub title: Vec<Value>,
    pub properties: BTreeMap<String, DatabaseProperty>,
}

/// One page of a `databases/{id}/query` response.
#[derive(Deserialize, Debug)]
pub struct QueryDatabaseResp {
    pub results: Vec<Value>,
    #[serde(default)]
    pub has_more: bool,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RichText {
    #[serde(default)]
    pub plain_text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectOption {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileUrl {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileObject {
    #[serde(default)]
    pub name: String,
    pub file: Option<FileUrl>,
    pub external: Option<FileUrl>,
}

impl FileObject {
    /// Notion-hosted file URL wins over an external link.
    pub fn resolved_url(&self) -> Option<&str> {
        self.file
            .as_ref()
            .or(self.external.as_ref())
            .map(|f| f.url.as_str())
            .filter(|u| !u.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DateValue {
    pub start: String,
    pub end: Option<String>,
}

impl DateValue {
    /// Calendar date of `start`, whether given as a date or a datetime.
    pub fn start_date(&self) -> Option<NaiveDate> {
        let head = self.start.get(..10)?;
        NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationRef {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FormulaValue {
    String { string: Option<String> },
    Number { number: Option<f64> },
    Boolean { boolean: Option<bool> },
    Date { date: Option<DateValue> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RawProperty {
    Title { title: Vec<RichText> },
    RichText { rich_text: Vec<RichText> },
    Select { select: Option<SelectOption> },
    Status { status: Option<SelectOption> },
    MultiSelect { multi_select: Vec<SelectOption> },
    Checkbox { checkbox: bool },
    Number { number: Option<f64> },
    Url { url: Option<String> },
    Email { email: Option<String> },
    PhoneNumber { phone_number: Option<String> },
    Files { files: Vec<FileObject> },
    Date { date: Option<DateValue> },
    Relation { relation: Vec<RelationRef> },
    Formula { formula: FormulaValue },
    CreatedTime { created_time: DateTime<Utc> },
    LastEditedTime { last_edited_time: DateTime<Utc> },
    /// A type we do not read, or a known type whose payload did not match
    /// the expected shape.
    #[serde(skip)]
    Unsupported { type_name: String },
}

impl RawProperty {
    /// Decode a single property value. Never fails: drift in the payload
    /// shows up as `Unsupported` and is reported as a type mismatch later.
    pub fn decode(value: Value) -> Self {
        let type_name = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        serde_json::from_value(value).unwrap_or(RawProperty::Unsupported { type_name })
    }

    pub fn property_type(&self) -> NotionPropertyType {
        match self {
            RawProperty::Title { .. } => NotionPropertyType::Title,
            RawProperty::RichText { .. } => NotionPropertyType::RichText,
            RawProperty::Select { .. } => NotionPropertyType::Select,
            RawProperty::Status { .. } => NotionPropertyType::Status,
            RawProperty::MultiSelect { .. } => NotionPropertyType::MultiSelect,
            RawProperty::Checkbox { .. } => NotionPropertyType::Checkbox,
            RawProperty::Number { .. } => NotionPropertyType::Number,
            RawProperty::Url { .. } => NotionPropertyType::Url,
            RawProperty::Email { .. } => NotionPropertyType::Email,
            RawProperty::PhoneNumber { .. } => NotionPropertyType::PhoneNumber,
            RawProperty::Files { .. } => NotionPropertyType::Files,
            RawProperty::Date { .. } => NotionPropertyType::Date,
            RawProperty::Relation { .. } => NotionPropertyType::Relation,
            RawProperty::Formula { .. } => NotionPropertyType::Formula,
            RawProperty::CreatedTime { .. } => NotionPropertyType::CreatedTime,
            RawProperty::LastEditedTime { .. } => NotionPropertyType::LastEditedTime,
            RawProperty::Unsupported { .. } => NotionPropertyType::Unsupported,
        }
    }
}

/// A decoded Notion page.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPage {
    pub id: String,
    pub archived: bool,
    pub last_edited_time: Option<DateTime<Utc>>,
    pub properties: BTreeMap<String, RawProperty>,
}

#[derive(Deserialize)]
struct PageEnvelope {
    id: String,
    #[serde(default)]
    archived: bool,
    last_edited_time: Option<DateTime<Utc>>,
    #[serde(default)]
    properties: BTreeMap<String, Value>,
}

impl RawPage {
    /// Decode a page object. Only the envelope (`id`, `properties`) is
    /// mandatory; property payloads decode individually.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        let env: PageEnvelope = serde_json::from_value(value)?;
        Ok(Self {
            id: env.id,
            archived: env.archived,
            last_edited_time: env.last_edited_time,
            properties: env
                .properties
                .into_iter()
                .map(|(name, v)| (name, RawProperty::decode(v)))
                .collect(),
        })
    }

    pub fn property(&self, name: &str) -> Option<&RawProperty> {
        self.properties.get(name)
    }
}
