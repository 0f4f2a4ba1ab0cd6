use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use datafusion::arrow::array::{
    ArrayRef, BinaryBuilder, BooleanBuilder, Date32Builder, Float64Builder, Int64Array,
    Int64Builder, ListArray, RecordBatch, StringBuilder, TimestampMicrosecondArray,
    TimestampMicrosecondBuilder,
};
use datafusion::arrow::buffer::{NullBuffer, OffsetBuffer, ScalarBuffer};
use datafusion::arrow::compute::cast;
use datafusion::arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use datafusion::parquet::arrow::ArrowWriter;
use datafusion::parquet::file::properties::WriterProperties;
use datafusion::parquet::file::metadata::KeyValue;
use std::path::Path;
use std::sync::Arc;

use super::staging::StagedRow;
use crate::error::{EngineError, Result};
use crate::models::{ColumnType, ColumnsSchema, FieldValue, PrimitiveType};

/// Write time of a row version
pub const UPDATED_AT_COLUMN: &str = "_swamp_updated_at";
/// Process-monotonic order of row versions written in the same instant
pub const WRITE_SEQ_COLUMN: &str = "_swamp_write_seq";

pub fn primitive_arrow_type(primitive: PrimitiveType) -> DataType {
    match primitive {
        PrimitiveType::Varchar | PrimitiveType::Json => DataType::Utf8,
        PrimitiveType::Double => DataType::Float64,
        PrimitiveType::Date => DataType::Date32,
        PrimitiveType::Timestamp => DataType::Timestamp(TimeUnit::Microsecond, None),
        PrimitiveType::Boolean => DataType::Boolean,
        PrimitiveType::Bigint => DataType::Int64,
        PrimitiveType::Blob => DataType::Binary,
    }
}

pub fn arrow_type(column_type: &ColumnType) -> DataType {
    match column_type {
        ColumnType::Primitive(primitive) => primitive_arrow_type(*primitive),
        ColumnType::Array(inner) => {
            DataType::List(Arc::new(Field::new_list_field(primitive_arrow_type(*inner), true)))
        }
    }
}

/// Arrow schema of a materialized file: data columns by name, then version columns
pub fn table_schema(column_schema: &ColumnsSchema) -> SchemaRef {
    let mut fields: Vec<Field> = column_schema
        .iter()
        .map(|(name, column)| Field::new(name, arrow_type(&column.column_type), true))
        .collect();
    fields.push(Field::new(
        UPDATED_AT_COLUMN,
        DataType::Timestamp(TimeUnit::Microsecond, None),
        false,
    ));
    fields.push(Field::new(WRITE_SEQ_COLUMN, DataType::Int64, false));
    Arc::new(Schema::new(fields))
}

/// Encode staged rows into one record batch shaped by `table_schema`
pub fn encode_rows(column_schema: &ColumnsSchema, rows: &[StagedRow]) -> Result<RecordBatch> {
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(column_schema.len() + 2);

    for (name, column) in column_schema {
        let values: Vec<&FieldValue> = rows
            .iter()
            .map(|row| row.values.get(name).unwrap_or(&FieldValue::Null))
            .collect();
        let array = match column.column_type {
            ColumnType::Primitive(primitive) => encode_primitive(name, primitive, &values)?,
            ColumnType::Array(inner) => encode_list(name, inner, &values)?,
        };
        columns.push(array);
    }

    columns.push(Arc::new(TimestampMicrosecondArray::from(
        rows.iter()
            .map(|row| row.updated_at.timestamp_micros())
            .collect::<Vec<_>>(),
    )));
    columns.push(Arc::new(Int64Array::from(
        rows.iter().map(|row| row.write_seq as i64).collect::<Vec<_>>(),
    )));

    Ok(RecordBatch::try_new(table_schema(column_schema), columns)?)
}

/// Reshape a query result to `table_schema`, stamping every row as one version
pub fn conform_batch(
    batch: &RecordBatch,
    column_schema: &ColumnsSchema,
    updated_at: DateTime<Utc>,
    first_seq: u64,
) -> Result<RecordBatch> {
    let target = table_schema(column_schema);
    let rows = batch.num_rows();
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(target.fields().len());

    for field in target.fields().iter().take(column_schema.len()) {
        let source = batch.column_by_name(field.name()).ok_or_else(|| {
            EngineError::Schema(format!("Result set has no column {}", field.name()))
        })?;
        columns.push(cast(source, field.data_type())?);
    }

    columns.push(Arc::new(TimestampMicrosecondArray::from(vec![
        updated_at.timestamp_micros();
        rows
    ])));
    columns.push(Arc::new(Int64Array::from(
        (0..rows as u64)
            .map(|i| (first_seq + i) as i64)
            .collect::<Vec<_>>(),
    )));

    Ok(RecordBatch::try_new(target, columns)?)
}

fn writer_properties() -> WriterProperties {
    let created_by = KeyValue {
        key: "created_by".to_string(),
        value: Some("swamp".to_string()),
    };
    WriterProperties::builder()
        .set_key_value_metadata(Some(vec![created_by]))
        .build()
}

/// Write batches to a new parquet file, returning the row count
pub fn write_parquet(path: &Path, schema: SchemaRef, batches: &[RecordBatch]) -> Result<usize> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::File::create(path)?;
    let mut writer = ArrowWriter::try_new(file, schema, Some(writer_properties()))?;
    let mut rows = 0;
    for batch in batches {
        writer.write(batch)?;
        rows += batch.num_rows();
    }
    writer.close()?;
    Ok(rows)
}

fn coercion_error(column: &str, value: &FieldValue, target: PrimitiveType) -> EngineError {
    EngineError::Schema(format!(
        "Cannot store {:?} in {} column {}",
        value,
        target.as_str(),
        column
    ))
}

fn epoch_days(date: NaiveDate) -> i32 {
    date.signed_duration_since(DateTime::UNIX_EPOCH.date_naive())
        .num_days() as i32
}

fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .map(|d| d.and_time(NaiveTime::MIN).and_utc())
}

fn to_double(value: &FieldValue) -> Option<f64> {
    match value {
        FieldValue::Num(n) => Some(*n),
        FieldValue::BigInt(i) => Some(*i as f64),
        FieldValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        FieldValue::Str(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn to_bigint(value: &FieldValue) -> Option<i64> {
    match value {
        FieldValue::BigInt(i) => Some(*i),
        FieldValue::Num(n) if n.fract() == 0.0 => Some(*n as i64),
        FieldValue::Bool(b) => Some(i64::from(*b)),
        FieldValue::Str(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn to_bool(value: &FieldValue) -> Option<bool> {
    match value {
        FieldValue::Bool(b) => Some(*b),
        FieldValue::Num(n) => Some(*n != 0.0),
        FieldValue::BigInt(i) => Some(*i != 0),
        FieldValue::Str(s) => match s.to_ascii_lowercase().as_str() {
            "true" | "t" | "1" => Some(true),
            "false" | "f" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn to_timestamp(value: &FieldValue) -> Option<DateTime<Utc>> {
    match value {
        FieldValue::DateTime(dt) => Some(*dt),
        FieldValue::Date(d) => Some(d.and_time(NaiveTime::MIN).and_utc()),
        FieldValue::Str(s) => parse_datetime(s),
        _ => None,
    }
}

fn to_date(value: &FieldValue) -> Option<NaiveDate> {
    match value {
        FieldValue::Date(d) => Some(*d),
        FieldValue::DateTime(dt) => Some(dt.date_naive()),
        FieldValue::Str(s) => parse_datetime(s).map(|dt| dt.date_naive()),
        _ => None,
    }
}

fn to_json_text(value: &FieldValue) -> String {
    match value {
        FieldValue::Str(s) => s.clone(),
        other => other.to_json().to_string(),
    }
}

fn encode_primitive(column: &str, primitive: PrimitiveType, values: &[&FieldValue]) -> Result<ArrayRef> {
    macro_rules! build {
        ($builder:expr, $convert:expr) => {{
            let mut builder = $builder;
            for value in values {
                if value.is_null() {
                    builder.append_null();
                    continue;
                }
                match ($convert)(*value) {
                    Some(v) => builder.append_value(v),
                    None => return Err(coercion_error(column, value, primitive)),
                }
            }
            Arc::new(builder.finish()) as ArrayRef
        }};
    }

    let array = match primitive {
        PrimitiveType::Varchar => build!(StringBuilder::new(), |v: &FieldValue| v.to_text()),
        PrimitiveType::Json => build!(StringBuilder::new(), |v: &FieldValue| Some(to_json_text(v))),
        PrimitiveType::Double => build!(Float64Builder::new(), to_double),
        PrimitiveType::Bigint => build!(Int64Builder::new(), to_bigint),
        PrimitiveType::Boolean => build!(BooleanBuilder::new(), to_bool),
        PrimitiveType::Date => build!(Date32Builder::new(), |v: &FieldValue| to_date(v).map(epoch_days)),
        PrimitiveType::Timestamp => build!(TimestampMicrosecondBuilder::new(), |v: &FieldValue| {
            to_timestamp(v).map(|dt| dt.timestamp_micros())
        }),
        PrimitiveType::Blob => build!(BinaryBuilder::new(), |v: &FieldValue| match v {
            FieldValue::Blob(bytes) => Some(bytes.clone()),
            FieldValue::Str(s) => Some(s.as_bytes().to_vec()),
            _ => None,
        }),
    };
    Ok(array)
}

/// A scalar stored in an array column becomes a one-element list
fn encode_list(column: &str, inner: PrimitiveType, values: &[&FieldValue]) -> Result<ArrayRef> {
    let mut offsets: Vec<i32> = Vec::with_capacity(values.len() + 1);
    let mut validity = Vec::with_capacity(values.len());
    let mut flattened: Vec<&FieldValue> = Vec::new();
    offsets.push(0);

    for value in values {
        match value {
            FieldValue::Null => validity.push(false),
            FieldValue::Array(items) => {
                flattened.extend(items.iter());
                validity.push(true);
            }
            scalar => {
                flattened.push(scalar);
                validity.push(true);
            }
        }
        let end = i32::try_from(flattened.len())
            .map_err(|_| EngineError::Schema(format!("Array column {} is too large", column)))?;
        offsets.push(end);
    }

    let items = encode_primitive(column, inner, &flattened)?;
    let field = Arc::new(Field::new_list_field(primitive_arrow_type(inner), true));
    let list = ListArray::try_new(
        field,
        OffsetBuffer::new(ScalarBuffer::from(offsets)),
        items,
        Some(NullBuffer::from(validity)),
    )?;
    Ok(Arc::new(list))
}
