use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use std::collections::{BTreeSet, HashSet};
use std::sync::LazyLock;

use crate::models::{
    CleanBatch, ColumnSchema, ColumnType, ColumnsSchema, FieldValue, Inserts, LoaderInserts,
    PrimitiveType, RawRecord,
};

fn pattern(re: &str) -> Regex {
    Regex::new(re).expect("static pattern compiles")
}

static CAMEL_BOUNDARY: LazyLock<Regex> = LazyLock::new(|| pattern(r"([a-z])([A-Z])"));
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| pattern(r"\s+"));
static HYPHENS: LazyLock<Regex> = LazyLock::new(|| pattern(r"-+"));
static UNDERSCORES: LazyLock<Regex> = LazyLock::new(|| pattern(r"__+"));
static ISO_DATETIME: LazyLock<Regex> = LazyLock::new(|| {
    pattern(r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:\d{2})$")
});
static ISO_DATE: LazyLock<Regex> = LazyLock::new(|| pattern(r"^\d{4}-\d{2}-\d{2}$"));

/// Canonical column name: `userId` -> `user_id`, `First Name` -> `first_name`
pub fn to_snake_case(name: &str) -> String {
    let name = CAMEL_BOUNDARY.replace_all(name, "${1}_${2}");
    let name = WHITESPACE.replace_all(&name, "_");
    let name = HYPHENS.replace_all(&name, "_");
    let name = name.replace(':', "_");
    let name = UNDERSCORES.replace_all(&name, "_");
    name.to_lowercase().trim_matches('_').to_string()
}

/// Promote ISO date and datetime strings to their typed variants
pub fn clean_value(value: FieldValue) -> FieldValue {
    match value {
        FieldValue::Str(s) => {
            if ISO_DATETIME.is_match(&s) {
                if let Ok(dt) = DateTime::parse_from_rfc3339(&s) {
                    return FieldValue::DateTime(dt.with_timezone(&Utc));
                }
            } else if ISO_DATE.is_match(&s) {
                if let Ok(date) = NaiveDate::parse_from_str(&s, "%Y-%m-%d") {
                    return FieldValue::Date(date);
                }
            }
            FieldValue::Str(s)
        }
        FieldValue::Array(items) => FieldValue::Array(items.into_iter().map(clean_value).collect()),
        other => other,
    }
}

/// Observed kind of a non-null value, in resolution precedence order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
enum ValueKind {
    String,
    Number,
    Date,
    DateTime,
    Boolean,
    BigInt,
    Blob,
    Array,
    Object,
}

fn value_kind(value: &FieldValue) -> Option<ValueKind> {
    match value {
        FieldValue::Null => None,
        FieldValue::Str(_) => Some(ValueKind::String),
        FieldValue::Num(_) => Some(ValueKind::Number),
        FieldValue::Date(_) => Some(ValueKind::Date),
        FieldValue::DateTime(_) => Some(ValueKind::DateTime),
        FieldValue::Bool(_) => Some(ValueKind::Boolean),
        FieldValue::BigInt(_) => Some(ValueKind::BigInt),
        FieldValue::Blob(_) => Some(ValueKind::Blob),
        FieldValue::Array(_) => Some(ValueKind::Array),
        FieldValue::Object(_) => Some(ValueKind::Object),
    }
}

fn primitive_for(kind: ValueKind) -> PrimitiveType {
    match kind {
        ValueKind::String => PrimitiveType::Varchar,
        ValueKind::Number => PrimitiveType::Double,
        ValueKind::Date => PrimitiveType::Date,
        ValueKind::DateTime => PrimitiveType::Timestamp,
        ValueKind::Boolean => PrimitiveType::Boolean,
        ValueKind::BigInt => PrimitiveType::Bigint,
        ValueKind::Blob => PrimitiveType::Blob,
        // Nested values inside arrays are stored as JSON text
        ValueKind::Array | ValueKind::Object => PrimitiveType::Varchar,
    }
}

#[derive(Default)]
struct ColumnObservation {
    kinds: BTreeSet<ValueKind>,
    array_inner: Option<PrimitiveType>,
}

/// Resolve one column type per column over a rectangular record set
///
/// Any string value widens the whole column to VARCHAR, even when every other
/// value is numeric.
pub fn infer_column_schema(records: &[RawRecord], primary_keys: &[String]) -> ColumnsSchema {
    let mut observed: std::collections::BTreeMap<&str, ColumnObservation> = Default::default();

    for record in records {
        for (name, value) in record {
            let observation = observed.entry(name.as_str()).or_default();
            let Some(kind) = value_kind(value) else {
                continue;
            };
            if let FieldValue::Array(items) = value {
                if observation.array_inner.is_none() {
                    observation.array_inner = items
                        .iter()
                        .find_map(value_kind)
                        .map(primitive_for);
                }
            }
            observation.kinds.insert(kind);
        }
    }

    observed
        .into_iter()
        .map(|(name, observation)| {
            // BTreeSet iterates in precedence order
            let column_type = match observation.kinds.iter().next() {
                Some(ValueKind::Array) => {
                    ColumnType::Array(observation.array_inner.unwrap_or(PrimitiveType::Varchar))
                }
                Some(ValueKind::Object) => ColumnType::Primitive(PrimitiveType::Json),
                Some(kind) => ColumnType::Primitive(primitive_for(*kind)),
                None => ColumnType::Primitive(PrimitiveType::Varchar),
            };
            let is_primary_key = primary_keys.iter().any(|pk| pk == name);
            (name.to_string(), ColumnSchema::new(column_type, is_primary_key))
        })
        .collect()
}

/// Canonicalize, rectangularize and type every batch of a loader page
///
/// Keys that never carry a non-null value in a batch are dropped; every other
/// key is present in every record, padded with explicit nulls.
pub fn clean_inserts(inserts: Inserts, schema_name: &str) -> LoaderInserts {
    let mut cleaned = LoaderInserts::new();

    for (batch_name, batch) in inserts {
        let primary_keys: Vec<String> = batch.primary_keys.iter().map(|pk| to_snake_case(pk)).collect();
        let mut all_keys: HashSet<String> = HashSet::new();

        let first_pass: Vec<RawRecord> = batch
            .records
            .into_iter()
            .map(|record| {
                record
                    .into_iter()
                    .map(|(key, value)| {
                        let key = to_snake_case(&key);
                        if !value.is_null() {
                            all_keys.insert(key.clone());
                        }
                        (key, clean_value(value))
                    })
                    .collect()
            })
            .collect();

        let records: Vec<RawRecord> = first_pass
            .into_iter()
            .map(|mut record| {
                record.retain(|key, _| all_keys.contains(key));
                for key in &all_keys {
                    record.entry(key.clone()).or_insert(FieldValue::Null);
                }
                record
            })
            .collect();

        let column_schema = infer_column_schema(&records, &primary_keys);
        cleaned.insert(
            batch_name,
            CleanBatch {
                schema_name: schema_name.to_string(),
                records,
                column_schema,
            },
        );
    }

    cleaned
}
