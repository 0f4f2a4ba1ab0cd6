// DataFusion ResultConverter
//
// Converts DataFusion RecordBatch results to the JSON QueryResult model and
// maps Arrow types back onto catalog column types.

use datafusion::arrow::array::*;
use datafusion::arrow::datatypes::{DataType, Schema, SchemaRef, TimeUnit};
use datafusion::arrow::record_batch::RecordBatch;
use datafusion::arrow::util::display::array_value_to_string;
use serde_json::{json, Value as JsonValue};
use anyhow::{Result, anyhow};
use chrono::{DateTime, NaiveDate};

use crate::models::{ColumnInfo, ColumnType, PrimitiveType, QueryResult};

/// Converts DataFusion query results to JSON format
pub struct DataFusionResultConverter;

impl DataFusionResultConverter {
    /// Convert query execution results to QueryResult model
    ///
    /// # Arguments
    /// * `schema` - Arrow schema defining column types
    /// * `batches` - Record batches containing query results
    pub fn convert_to_query_result(
        schema: SchemaRef,
        batches: Vec<RecordBatch>,
    ) -> Result<QueryResult> {
        let columns: Vec<ColumnInfo> = schema
            .fields()
            .iter()
            .map(|field| ColumnInfo {
                name: field.name().clone(),
                data_type: column_type_for(field.data_type()).sql_name(),
            })
            .collect();

        let mut rows = Vec::new();
        for batch in &batches {
            rows.extend(Self::batch_to_json_rows(&schema, batch)?);
        }

        let row_count = rows.len();
        Ok(QueryResult {
            columns,
            rows,
            row_count,
        })
    }

    fn batch_to_json_rows(schema: &Schema, batch: &RecordBatch) -> Result<Vec<Vec<JsonValue>>> {
        let num_rows = batch.num_rows();
        let num_cols = batch.num_columns();

        let mut rows = Vec::with_capacity(num_rows);

        for row_idx in 0..num_rows {
            let mut row = Vec::with_capacity(num_cols);

            for col_idx in 0..num_cols {
                let column = batch.column(col_idx);
                let field = schema.field(col_idx);

                row.push(Self::array_value_to_json(column, row_idx, field.data_type())?);
            }

            rows.push(row);
        }

        Ok(rows)
    }

    /// Convert a single array value to JSON
    pub fn array_value_to_json(
        array: &ArrayRef,
        row_idx: usize,
        data_type: &DataType,
    ) -> Result<JsonValue> {
        if array.is_null(row_idx) {
            return Ok(JsonValue::Null);
        }

        let value = match data_type {
            DataType::Boolean => json!(downcast::<BooleanArray>(array)?.value(row_idx)),

            DataType::Int8 => json!(downcast::<Int8Array>(array)?.value(row_idx)),
            DataType::Int16 => json!(downcast::<Int16Array>(array)?.value(row_idx)),
            DataType::Int32 => json!(downcast::<Int32Array>(array)?.value(row_idx)),
            DataType::Int64 => json!(downcast::<Int64Array>(array)?.value(row_idx)),
            DataType::UInt8 => json!(downcast::<UInt8Array>(array)?.value(row_idx)),
            DataType::UInt16 => json!(downcast::<UInt16Array>(array)?.value(row_idx)),
            DataType::UInt32 => json!(downcast::<UInt32Array>(array)?.value(row_idx)),
            DataType::UInt64 => json!(downcast::<UInt64Array>(array)?.value(row_idx)),

            DataType::Float32 => json!(downcast::<Float32Array>(array)?.value(row_idx)),
            DataType::Float64 => json!(downcast::<Float64Array>(array)?.value(row_idx)),

            DataType::Decimal128(_, scale) => {
                let value = downcast::<Decimal128Array>(array)?.value(row_idx);
                let divisor = 10_f64.powi(*scale as i32);
                json!(value as f64 / divisor)
            }

            DataType::Utf8 => json!(downcast::<StringArray>(array)?.value(row_idx)),
            DataType::LargeUtf8 => json!(downcast::<LargeStringArray>(array)?.value(row_idx)),
            DataType::Utf8View => json!(downcast::<StringViewArray>(array)?.value(row_idx)),

            // Binary is rendered as lowercase hex
            DataType::Binary => json!(hex(downcast::<BinaryArray>(array)?.value(row_idx))),
            DataType::LargeBinary => json!(hex(downcast::<LargeBinaryArray>(array)?.value(row_idx))),
            DataType::BinaryView => json!(hex(downcast::<BinaryViewArray>(array)?.value(row_idx))),

            DataType::Date32 => {
                let days = downcast::<Date32Array>(array)?.value(row_idx);
                // Date32 counts days since the Unix epoch
                let date = NaiveDate::from_num_days_from_ce_opt(days + 719_163)
                    .ok_or_else(|| anyhow!("Invalid date value"))?;
                json!(date.format("%Y-%m-%d").to_string())
            }
            DataType::Date64 => {
                let millis = downcast::<Date64Array>(array)?.value(row_idx);
                let datetime = DateTime::from_timestamp_millis(millis)
                    .ok_or_else(|| anyhow!("Invalid date value"))?;
                json!(datetime.format("%Y-%m-%d").to_string())
            }

            DataType::Timestamp(unit, _) => {
                let timestamp = match unit {
                    TimeUnit::Second => {
                        DateTime::from_timestamp(downcast::<TimestampSecondArray>(array)?.value(row_idx), 0)
                    }
                    TimeUnit::Millisecond => DateTime::from_timestamp_millis(
                        downcast::<TimestampMillisecondArray>(array)?.value(row_idx),
                    ),
                    TimeUnit::Microsecond => DateTime::from_timestamp_micros(
                        downcast::<TimestampMicrosecondArray>(array)?.value(row_idx),
                    ),
                    TimeUnit::Nanosecond => Some(DateTime::from_timestamp_nanos(
                        downcast::<TimestampNanosecondArray>(array)?.value(row_idx),
                    )),
                };

                let dt = timestamp.ok_or_else(|| anyhow!("Invalid timestamp value"))?;
                json!(dt.to_rfc3339())
            }

            DataType::List(field) => {
                let values = downcast::<ListArray>(array)?.value(row_idx);
                list_to_json(&values, field.data_type())?
            }
            DataType::LargeList(field) => {
                let values = downcast::<LargeListArray>(array)?.value(row_idx);
                list_to_json(&values, field.data_type())?
            }

            _ => {
                let text = array_value_to_string(array, row_idx)?;
                json!(text)
            }
        };

        Ok(value)
    }
}

fn downcast<T: 'static>(array: &ArrayRef) -> Result<&T> {
    array
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| anyhow!("Failed to downcast to {}", std::any::type_name::<T>()))
}

fn list_to_json(values: &ArrayRef, inner: &DataType) -> Result<JsonValue> {
    let items = (0..values.len())
        .map(|i| DataFusionResultConverter::array_value_to_json(values, i, inner))
        .collect::<Result<Vec<_>>>()?;
    Ok(JsonValue::Array(items))
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn primitive_for(data_type: &DataType) -> PrimitiveType {
    match data_type {
        DataType::Boolean => PrimitiveType::Boolean,
        DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::Int64
        | DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32
        | DataType::UInt64 => PrimitiveType::Bigint,
        DataType::Float16
        | DataType::Float32
        | DataType::Float64
        | DataType::Decimal128(_, _)
        | DataType::Decimal256(_, _) => PrimitiveType::Double,
        DataType::Date32 | DataType::Date64 => PrimitiveType::Date,
        DataType::Timestamp(_, _) => PrimitiveType::Timestamp,
        DataType::Binary | DataType::LargeBinary | DataType::BinaryView | DataType::FixedSizeBinary(_) => {
            PrimitiveType::Blob
        }
        DataType::Struct(_) | DataType::Map(_, _) => PrimitiveType::Json,
        _ => PrimitiveType::Varchar,
    }
}

/// Catalog column type for a result column
pub fn column_type_for(data_type: &DataType) -> ColumnType {
    match data_type {
        DataType::List(field) | DataType::LargeList(field) | DataType::FixedSizeList(field, _) => {
            match field.data_type() {
                DataType::List(_) | DataType::LargeList(_) => ColumnType::Array(PrimitiveType::Varchar),
                inner => ColumnType::Array(primitive_for(inner)),
            }
        }
        other => ColumnType::Primitive(primitive_for(other)),
    }
}
