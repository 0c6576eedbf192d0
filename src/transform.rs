//! Turns one decoded Notion page into a [`CaseStudy`] by following a mapping
//! set. Pure: no I/O, no clock reads beyond the page's own timestamps.
use chrono::{NaiveDate, Utc};

use crate::compat::{self, Coercion, WebsiteFieldType};
use crate::error::{FieldError, FieldErrorKind};
use crate::mapping::{CaseStudyField, FieldMapping};
use crate::model::{slugify, CaseStatus, CaseStudy, MediaItem, MediaKind};
use crate::notion::model::{FileObject, FormulaValue, RawPage, RawProperty, RichText};

/// Notion property label used in errors for a required field nobody mapped.
pub const UNMAPPED: &str = "(unmapped)";

/// A case study plus the non-fatal problems met while building it.
#[derive(Debug, Clone)]
pub struct Transformed {
    pub case_study: CaseStudy,
    pub warnings: Vec<FieldError>,
}

/// Extracted value, shaped by the destination's [`WebsiteFieldType`].
#[derive(Debug, Clone, PartialEq)]
enum FieldValue {
    Text(String),
    Tags(Vec<String>),
    Media(Vec<MediaItem>),
    Bool(bool),
    Date(Option<NaiveDate>),
    Number(Option<f64>),
    Refs(Vec<String>),
}

/// Build a case study from `page`. Errors on required fields are fatal and
/// the page yields nothing; every other field error leaves that field at its
/// default and is returned as a warning.
pub fn transform(page: &RawPage, mappings: &[FieldMapping]) -> Result<Transformed, Vec<FieldError>> {
    let mut cs = CaseStudy::blank("", "");
    cs.source_notion_id = Some(page.id.clone());
    cs.updated_at = page.last_edited_time.unwrap_or_else(Utc::now);

    let mut errors: Vec<FieldError> = Vec::new();
    let mut slug_mapped = false;

    for mapping in mappings {
        let field = mapping.case_study_field;
        slug_mapped |= field == CaseStudyField::Slug;
        match read_field(page, mapping) {
            Ok(value) => assign(&mut cs, field, value),
            Err(err) => errors.push(err),
        }
    }

    let title_failed = errors
        .iter()
        .any(|e| e.fatal && e.field == CaseStudyField::Title.as_str());
    if !title_failed && cs.title.trim().is_empty() {
        let notion_property = mappings
            .iter()
            .find(|m| m.case_study_field == CaseStudyField::Title)
            .map(|m| m.notion_property_name.clone())
            .unwrap_or_else(|| UNMAPPED.to_string());
        errors.push(missing(CaseStudyField::Title, notion_property));
    }

    let title_ok = !errors
        .iter()
        .any(|e| e.fatal && e.field == CaseStudyField::Title.as_str());
    if title_ok {
        let source = if slug_mapped && !cs.slug.is_empty() {
            cs.slug.clone()
        } else {
            cs.title.clone()
        };
        let slug_failed = errors
            .iter()
            .any(|e| e.fatal && e.field == CaseStudyField::Slug.as_str());
        cs.slug = slugify(&source);
        if !slug_failed && cs.slug.is_empty() {
            let notion_property = mappings
                .iter()
                .find(|m| m.case_study_field == CaseStudyField::Slug)
                .map(|m| m.notion_property_name.clone())
                .unwrap_or_else(|| UNMAPPED.to_string());
            errors.push(missing(CaseStudyField::Slug, notion_property));
        }
    }

    if errors.iter().any(|e| e.fatal) {
        return Err(errors);
    }
    Ok(Transformed {
        case_study: cs,
        warnings: errors,
    })
}

fn missing(field: CaseStudyField, notion_property: String) -> FieldError {
    FieldError {
        kind: FieldErrorKind::MissingProperty,
        field: field.to_string(),
        notion_property,
        expected: Some(field.field_type()),
        found: None,
        fatal: field.is_required(),
    }
}

fn read_field(page: &RawPage, mapping: &FieldMapping) -> Result<FieldValue, FieldError> {
    let field = mapping.case_study_field;
    let field_type = field.field_type();
    let Some(prop) = page.property(&mapping.notion_property_name) else {
        return Err(missing(field, mapping.notion_property_name.clone()));
    };

    let mismatch = || FieldError {
        kind: FieldErrorKind::TypeMismatch,
        field: field.to_string(),
        notion_property: mapping.notion_property_name.clone(),
        expected: Some(field_type),
        found: Some(prop.property_type()),
        fatal: field.is_required(),
    };

    if !compat::is_compatible(field_type, prop.property_type()) {
        return Err(mismatch());
    }
    let value = extract(field_type, prop).ok_or_else(mismatch)?;
    Ok(match mapping.transform {
        Some(coercion) => coerce(value, coercion),
        None => value,
    })
}

fn plain_text(runs: &[RichText]) -> String {
    runs.iter().map(|r| r.plain_text.as_str()).collect()
}

fn media_item(file: &FileObject) -> Option<MediaItem> {
    file.resolved_url().map(|url| MediaItem {
        kind: MediaKind::from_url(url),
        url: url.to_string(),
        alt: file.name.clone(),
    })
}

fn formula_text(formula: &FormulaValue) -> String {
    match formula {
        FormulaValue::String { string } => string.clone().unwrap_or_default(),
        FormulaValue::Number { number } => number.map(|n| n.to_string()).unwrap_or_default(),
        FormulaValue::Boolean { boolean } => boolean.map(|b| b.to_string()).unwrap_or_default(),
        FormulaValue::Date { date } => date.as_ref().map(|d| d.start.clone()).unwrap_or_default(),
    }
}

/// Type-specific extraction. `None` means the payload cannot produce this
/// field type even though the property type is listed as compatible
/// (e.g. a formula that evaluates to text feeding a boolean).
fn extract(field_type: WebsiteFieldType, prop: &RawProperty) -> Option<FieldValue> {
    use RawProperty as R;
    use WebsiteFieldType as W;

    let value = match (field_type, prop) {
        (W::Text | W::RichText | W::Link, R::Title { title: runs })
        | (W::Text | W::RichText | W::Link, R::RichText { rich_text: runs }) => {
            FieldValue::Text(plain_text(runs))
        }
        (W::Text, R::Select { select: opt }) | (W::Text, R::Status { status: opt }) => {
            FieldValue::Text(opt.as_ref().map(|o| o.name.clone()).unwrap_or_default())
        }
        (W::Text | W::Link, R::Url { url: s })
        | (W::Text, R::Email { email: s })
        | (W::Text, R::PhoneNumber { phone_number: s }) => {
            FieldValue::Text(s.clone().unwrap_or_default())
        }
        (W::Text, R::Formula { formula }) => FieldValue::Text(formula_text(formula)),

        (W::Boolean, R::Checkbox { checkbox }) => FieldValue::Bool(*checkbox),
        (W::Boolean, R::Formula { formula: FormulaValue::Boolean { boolean } }) => {
            FieldValue::Bool(boolean.unwrap_or(false))
        }

        (W::Tags, R::MultiSelect { multi_select }) => {
            FieldValue::Tags(multi_select.iter().map(|o| o.name.clone()).collect())
        }
        (W::Tags, R::Select { select }) => {
            FieldValue::Tags(select.iter().map(|o| o.name.clone()).collect())
        }
        (W::Tags, R::RichText { rich_text }) => {
            let text = plain_text(rich_text);
            FieldValue::Tags(if text.is_empty() { Vec::new() } else { vec![text] })
        }

        (W::Image, R::Files { files }) => {
            FieldValue::Media(files.iter().filter_map(media_item).take(1).collect())
        }
        (W::Image, R::Url { url }) => FieldValue::Media(
            url.iter()
                .filter(|u| !u.is_empty())
                .map(|u| MediaItem {
                    kind: MediaKind::from_url(u),
                    url: u.clone(),
                    alt: String::new(),
                })
                .collect(),
        ),
        (W::Gallery, R::Files { files }) => {
            FieldValue::Media(files.iter().filter_map(media_item).collect())
        }

        (W::Date, R::Date { date }) => {
            FieldValue::Date(date.as_ref().and_then(|d| d.start_date()))
        }
        (W::Date, R::CreatedTime { created_time: ts })
        | (W::Date, R::LastEditedTime { last_edited_time: ts }) => {
            FieldValue::Date(Some(ts.date_naive()))
        }

        (W::Reference, R::Relation { relation }) => {
            FieldValue::Refs(relation.iter().map(|r| r.id.clone()).collect())
        }

        (W::Number, R::Number { number }) => FieldValue::Number(*number),
        (W::Number, R::Formula { formula: FormulaValue::Number { number } }) => {
            FieldValue::Number(*number)
        }

        _ => return None,
    };
    Some(value)
}

fn coerce(value: FieldValue, coercion: Coercion) -> FieldValue {
    match (value, coercion) {
        (FieldValue::Text(s), Coercion::Trim) => FieldValue::Text(s.trim().to_string()),
        (FieldValue::Text(s), Coercion::Lowercase) => FieldValue::Text(s.to_lowercase()),
        (FieldValue::Text(s), Coercion::Slugify) => FieldValue::Text(slugify(&s)),
        (FieldValue::Tags(tags), Coercion::Lowercase) => {
            FieldValue::Tags(tags.into_iter().map(|t| t.to_lowercase()).collect())
        }
        (FieldValue::Tags(tags), Coercion::SplitComma) => FieldValue::Tags(
            tags.iter()
                .flat_map(|t| t.split(','))
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect(),
        ),
        (value, _) => value,
    }
}

/// Value kinds always follow `field.field_type()`, so the fallthrough arm
/// only guards against a table edit that forgets to update `extract`.
fn assign(cs: &mut CaseStudy, field: CaseStudyField, value: FieldValue) {
    use CaseStudyField as F;
    match (field, value) {
        (F::Title, FieldValue::Text(s)) => cs.title = s,
        (F::Slug, FieldValue::Text(s)) => cs.slug = s,
        (F::Client, FieldValue::Text(s)) => cs.client = s,
        (F::Description, FieldValue::Text(s)) => cs.description = s,
        (F::Status, FieldValue::Text(s)) => cs.status = CaseStatus::parse_label(&s),
        (F::ProjectUrl, FieldValue::Text(s)) => {
            cs.project_url = Some(s.trim().to_string()).filter(|s| !s.is_empty())
        }
        (F::Tags, FieldValue::Tags(tags)) => cs.tags = tags,
        (F::MediaItems, FieldValue::Media(items)) => cs.media_items = items,
        (F::CoverImage, FieldValue::Media(items)) => cs.cover_image = items.into_iter().next(),
        (F::Featured, FieldValue::Bool(b)) => cs.featured = b,
        (F::CompletedAt, FieldValue::Date(d)) => cs.completed_at = d,
        (F::Year, FieldValue::Number(n)) => cs.year = n,
        (F::Related, FieldValue::Refs(ids)) => cs.related = ids,
        (field, value) => {
            tracing::warn!(%field, ?value, "extracted value does not fit field; ignored")
        }
    }
}
