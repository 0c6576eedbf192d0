//! Compatibility table between Notion property types and site field types.
//!
//! Both the transformer and the mapping validation path go through
//! [`is_compatible`]; nothing else decides whether a property may feed a field.
use serde::{Deserialize, Serialize};
use std::fmt;

/// Property types as reported by the Notion API (`"type"` on a property).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum NotionPropertyType {
    Title,
    RichText,
    Select,
    Status,
    MultiSelect,
    Checkbox,
    Number,
    Url,
    Files,
    Date,
    Relation,
    PhoneNumber,
    Email,
    Formula,
    CreatedTime,
    LastEditedTime,
    /// Anything this crate does not decode (people, rollup, ...).
    Unsupported,
}

impl NotionPropertyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotionPropertyType::Title => "title",
            NotionPropertyType::RichText => "rich_text",
            NotionPropertyType::Select => "select",
            NotionPropertyType::Status => "status",
            NotionPropertyType::MultiSelect => "multi_select",
            NotionPropertyType::Checkbox => "checkbox",
            NotionPropertyType::Number => "number",
            NotionPropertyType::Url => "url",
            NotionPropertyType::Files => "files",
            NotionPropertyType::Date => "date",
            NotionPropertyType::Relation => "relation",
            NotionPropertyType::PhoneNumber => "phone_number",
            NotionPropertyType::Email => "email",
            NotionPropertyType::Formula => "formula",
            NotionPropertyType::CreatedTime => "created_time",
            NotionPropertyType::LastEditedTime => "last_edited_time",
            NotionPropertyType::Unsupported => "unsupported",
        }
    }

    /// Parse the API's type tag; unknown tags map to `Unsupported`.
    pub fn parse_type(s: &str) -> Self {
        match s {
            "title" => NotionPropertyType::Title,
            "rich_text" => NotionPropertyType::RichText,
            "select" => NotionPropertyType::Select,
            "status" => NotionPropertyType::Status,
            "multi_select" => NotionPropertyType::MultiSelect,
            "checkbox" => NotionPropertyType::Checkbox,
            "number" => NotionPropertyType::Number,
            "url" => NotionPropertyType::Url,
            "files" => NotionPropertyType::Files,
            "date" => NotionPropertyType::Date,
            "relation" => NotionPropertyType::Relation,
            "phone_number" => NotionPropertyType::PhoneNumber,
            "email" => NotionPropertyType::Email,
            "formula" => NotionPropertyType::Formula,
            "created_time" => NotionPropertyType::CreatedTime,
            "last_edited_time" => NotionPropertyType::LastEditedTime,
            _ => NotionPropertyType::Unsupported,
        }
    }
}

impl fmt::Display for NotionPropertyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shape a case study field expects.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum WebsiteFieldType {
    Text,
    RichText,
    Boolean,
    Tags,
    Link,
    Image,
    Gallery,
    Date,
    Reference,
    Number,
}

impl WebsiteFieldType {
    pub const ALL: [WebsiteFieldType; 10] = [
        WebsiteFieldType::Text,
        WebsiteFieldType::RichText,
        WebsiteFieldType::Boolean,
        WebsiteFieldType::Tags,
        WebsiteFieldType::Link,
        WebsiteFieldType::Image,
        WebsiteFieldType::Gallery,
        WebsiteFieldType::Date,
        WebsiteFieldType::Reference,
        WebsiteFieldType::Number,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WebsiteFieldType::Text => "text",
            WebsiteFieldType::RichText => "richText",
            WebsiteFieldType::Boolean => "boolean",
            WebsiteFieldType::Tags => "tags",
            WebsiteFieldType::Link => "link",
            WebsiteFieldType::Image => "image",
            WebsiteFieldType::Gallery => "gallery",
            WebsiteFieldType::Date => "date",
            WebsiteFieldType::Reference => "reference",
            WebsiteFieldType::Number => "number",
        }
    }

    pub fn parse_type(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }
}

impl fmt::Display for WebsiteFieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional value transform attached to a field mapping.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Coercion {
    Trim,
    Lowercase,
    Slugify,
    /// Split a text value on commas into tags.
    SplitComma,
}

impl Coercion {
    pub fn as_str(&self) -> &'static str {
        match self {
            Coercion::Trim => "trim",
            Coercion::Lowercase => "lowercase",
            Coercion::Slugify => "slugify",
            Coercion::SplitComma => "split_comma",
        }
    }
}

impl fmt::Display for Coercion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the compatibility table. `accepts[0]` is the canonical source type.
#[derive(Debug)]
pub struct CompatibilityEntry {
    pub field: WebsiteFieldType,
    pub accepts: &'static [NotionPropertyType],
    pub coercions: &'static [Coercion],
}

use NotionPropertyType as P;

static TABLE: [CompatibilityEntry; 10] = [
    CompatibilityEntry {
        field: WebsiteFieldType::Text,
        accepts: &[
            P::RichText,
            P::Title,
            P::Select,
            P::Status,
            P::Url,
            P::Email,
            P::PhoneNumber,
            P::Formula,
        ],
        coercions: &[Coercion::Trim, Coercion::Lowercase, Coercion::Slugify],
    },
    CompatibilityEntry {
        field: WebsiteFieldType::RichText,
        accepts: &[P::RichText, P::Title],
        coercions: &[Coercion::Trim],
    },
    CompatibilityEntry {
        field: WebsiteFieldType::Boolean,
        accepts: &[P::Checkbox, P::Formula],
        coercions: &[],
    },
    CompatibilityEntry {
        field: WebsiteFieldType::Tags,
        accepts: &[P::MultiSelect, P::Select, P::RichText],
        coercions: &[Coercion::SplitComma, Coercion::Lowercase],
    },
    CompatibilityEntry {
        field: WebsiteFieldType::Link,
        accepts: &[P::Url, P::RichText],
        coercions: &[Coercion::Trim],
    },
    CompatibilityEntry {
        field: WebsiteFieldType::Image,
        accepts: &[P::Files, P::Url],
        coercions: &[],
    },
    CompatibilityEntry {
        field: WebsiteFieldType::Gallery,
        accepts: &[P::Files],
        coercions: &[],
    },
    CompatibilityEntry {
        field: WebsiteFieldType::Date,
        accepts: &[P::Date, P::CreatedTime, P::LastEditedTime],
        coercions: &[],
    },
    CompatibilityEntry {
        field: WebsiteFieldType::Reference,
        accepts: &[P::Relation],
        coercions: &[],
    },
    CompatibilityEntry {
        field: WebsiteFieldType::Number,
        accepts: &[P::Number, P::Formula],
        coercions: &[],
    },
];

pub fn entry(field: WebsiteFieldType) -> Option<&'static CompatibilityEntry> {
    TABLE.iter().find(|e| e.field == field)
}

/// Accepted Notion property types for `field`, preferred first.
pub fn compatible_types(field: WebsiteFieldType) -> &'static [NotionPropertyType] {
    entry(field).map(|e| e.accepts).unwrap_or(&[])
}

pub fn is_compatible(field: WebsiteFieldType, prop: NotionPropertyType) -> bool {
    compatible_types(field).contains(&prop)
}

/// Name-based lookup used by authoring input. Unknown names fail closed.
pub fn compatible_types_by_name(field: &str) -> &'static [NotionPropertyType] {
    WebsiteFieldType::parse_type(field)
        .map(compatible_types)
        .unwrap_or(&[])
}

pub fn is_compatible_by_name(field: &str, prop: NotionPropertyType) -> bool {
    compatible_types_by_name(field).contains(&prop)
}

pub fn allows_coercion(field: WebsiteFieldType, coercion: Coercion) -> bool {
    entry(field)
        .map(|e| e.coercions.contains(&coercion))
        .unwrap_or(false)
}

/// Field types a property of type `prop` can feed, in table order.
pub fn fields_fed_by(prop: NotionPropertyType) -> Vec<WebsiteFieldType> {
    TABLE
        .iter()
        .filter(|e| e.accepts.contains(&prop))
        .map(|e| e.field)
        .collect()
}
