//! Reshape raw search-index records into per-category ingestion batches.

use crate::config::Config;
use crate::pipeline::types::{FormattedBatch, FormattedRecord, UNCATEGORIZED};
use crate::solr::RawRecord;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Search-index bookkeeping attribute never forwarded to the backend.
const INDEX_VERSION_FIELD: &str = "_version_";

/// Record attributes the formatter interprets.
#[derive(Debug, Clone)]
pub struct FormatterSettings {
    /// Attribute selecting the category.
    pub category_field: String,
    /// Attribute holding the stable identifier.
    pub id_field: String,
    /// Attribute holding nested child records.
    pub children_field: String,
}

impl FormatterSettings {
    /// Derive settings from the loaded configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            category_field: config.category_field.clone(),
            id_field: config.id_field.clone(),
            children_field: config.children_field.clone(),
        }
    }
}

impl Default for FormatterSettings {
    fn default() -> Self {
        Self {
            category_field: "categoria".into(),
            id_field: "id".into(),
            children_field: "_childDocuments_".into(),
        }
    }
}

/// Group records by category, preserving encounter order of categories and of records within
/// a category. Records without a usable category land in the [`UNCATEGORIZED`] batch.
pub fn format_records(records: &[RawRecord], settings: &FormatterSettings) -> Vec<FormattedBatch> {
    let mut batches: Vec<FormattedBatch> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();

    for record in records {
        let formatted = format_record(record, None, settings);
        let position = *positions
            .entry(formatted.category.clone())
            .or_insert_with(|| {
                batches.push(FormattedBatch {
                    category: formatted.category.clone(),
                    records: Vec::new(),
                });
                batches.len() - 1
            });
        batches[position].records.push(formatted);
    }

    tracing::debug!(
        records = records.len(),
        batches = batches.len(),
        "Formatted records into category batches"
    );
    batches
}

/// Reshape one record. Children inherit the parent's category when they carry none.
fn format_record(
    record: &RawRecord,
    inherited_category: Option<&str>,
    settings: &FormatterSettings,
) -> FormattedRecord {
    let category = extract_category(record.get(&settings.category_field))
        .or_else(|| inherited_category.map(str::to_string))
        .unwrap_or_else(|| UNCATEGORIZED.to_string());

    let mut fields: Map<String, Value> = record.clone();
    fields.remove(INDEX_VERSION_FIELD);
    let mut children = Vec::new();
    match fields.remove(&settings.children_field) {
        Some(Value::Array(items)) => {
            let mut scalars = Vec::new();
            for item in items {
                match item {
                    Value::Object(child) => {
                        children.push(format_record(&child, Some(&category), settings));
                    }
                    other => scalars.push(other),
                }
            }
            if !scalars.is_empty() {
                tracing::warn!(
                    count = scalars.len(),
                    "Child entries that are not objects stay on the parent record"
                );
                fields.insert(settings.children_field.clone(), Value::Array(scalars));
            }
        }
        Some(Value::Object(child)) => {
            children.push(format_record(&child, Some(&category), settings));
        }
        Some(other) => {
            fields.insert(settings.children_field.clone(), other);
        }
        None => {}
    }

    let document_id = extract_identifier(record.get(&settings.id_field))
        .unwrap_or_else(|| content_identifier(&fields));

    FormattedRecord {
        document_id,
        category,
        fields,
        children,
    }
}

/// Usable category value: a non-blank string or number, or the first such value of an array.
fn extract_category(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(text) => {
            let trimmed = text.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(number) => Some(number.to_string()),
        Value::Array(items) => extract_category(items.first()),
        _ => None,
    }
}

fn extract_identifier(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

/// Deterministic identifier for records that carry none: SHA-256 of the canonical JSON.
fn content_identifier(fields: &Map<String, Value>) -> String {
    let canonical = serde_json::to_string(fields).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}
