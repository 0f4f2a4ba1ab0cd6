use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Primitive column kinds a table column can hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PrimitiveType {
    Varchar,
    Double,
    Date,
    Timestamp,
    Boolean,
    Bigint,
    Blob,
    Json,
}

impl PrimitiveType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrimitiveType::Varchar => "VARCHAR",
            PrimitiveType::Double => "DOUBLE",
            PrimitiveType::Date => "DATE",
            PrimitiveType::Timestamp => "TIMESTAMP",
            PrimitiveType::Boolean => "BOOLEAN",
            PrimitiveType::Bigint => "BIGINT",
            PrimitiveType::Blob => "BLOB",
            PrimitiveType::Json => "JSON",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "VARCHAR" => Some(PrimitiveType::Varchar),
            "DOUBLE" => Some(PrimitiveType::Double),
            "DATE" => Some(PrimitiveType::Date),
            "TIMESTAMP" => Some(PrimitiveType::Timestamp),
            "BOOLEAN" => Some(PrimitiveType::Boolean),
            "BIGINT" => Some(PrimitiveType::Bigint),
            "BLOB" => Some(PrimitiveType::Blob),
            "JSON" => Some(PrimitiveType::Json),
            _ => None,
        }
    }
}

/// Column type: a primitive or a typed array of a primitive
///
/// Serialized as `{"type": "VARCHAR"}` or `{"type": "ARRAY", "innerType": "DOUBLE"}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "ColumnTypeRepr", into = "ColumnTypeRepr")]
pub enum ColumnType {
    Primitive(PrimitiveType),
    Array(PrimitiveType),
}

impl ColumnType {
    pub fn sql_name(&self) -> String {
        match self {
            ColumnType::Primitive(p) => p.as_str().to_string(),
            ColumnType::Array(inner) => format!("{}[]", inner.as_str()),
        }
    }
}

impl From<PrimitiveType> for ColumnType {
    fn from(p: PrimitiveType) -> Self {
        ColumnType::Primitive(p)
    }
}

#[derive(Serialize, Deserialize)]
struct ColumnTypeRepr {
    #[serde(rename = "type")]
    kind: String,
    #[serde(rename = "innerType", default, skip_serializing_if = "Option::is_none")]
    inner_type: Option<PrimitiveType>,
}

impl TryFrom<ColumnTypeRepr> for ColumnType {
    type Error = String;

    fn try_from(repr: ColumnTypeRepr) -> Result<Self, Self::Error> {
        if repr.kind.eq_ignore_ascii_case("ARRAY") {
            let inner = repr
                .inner_type
                .ok_or_else(|| "ARRAY column type requires innerType".to_string())?;
            return Ok(ColumnType::Array(inner));
        }
        PrimitiveType::from_str(&repr.kind)
            .map(ColumnType::Primitive)
            .ok_or_else(|| format!("Unknown column type: {}", repr.kind))
    }
}

impl From<ColumnType> for ColumnTypeRepr {
    fn from(column_type: ColumnType) -> Self {
        match column_type {
            ColumnType::Primitive(p) => ColumnTypeRepr {
                kind: p.as_str().to_string(),
                inner_type: None,
            },
            ColumnType::Array(inner) => ColumnTypeRepr {
                kind: "ARRAY".to_string(),
                inner_type: Some(inner),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnSchema {
    pub column_type: ColumnType,
    pub is_primary_key: bool,
}

impl ColumnSchema {
    pub fn new(column_type: impl Into<ColumnType>, is_primary_key: bool) -> Self {
        Self {
            column_type: column_type.into(),
            is_primary_key,
        }
    }
}

/// Column name -> column schema, ordered by column name
pub type ColumnsSchema = BTreeMap<String, ColumnSchema>;

/// Primary key column names of a schema, in column order
pub fn primary_keys(schema: &ColumnsSchema) -> Vec<String> {
    schema
        .iter()
        .filter(|(_, column)| column.is_primary_key)
        .map(|(name, _)| name.clone())
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileDataType {
    Json,
    Parquet,
}

impl FileDataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileDataType::Json => "json",
            FileDataType::Parquet => "parquet",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "json" => Some(FileDataType::Json),
            "parquet" => Some(FileDataType::Parquet),
            _ => None,
        }
    }
}

/// Where a table's files live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileLocation {
    Local,
    #[serde(rename = "s3")]
    Remote,
}

impl FileLocation {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileLocation::Local => "local",
            FileLocation::Remote => "s3",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "local" => Some(FileLocation::Local),
            "s3" | "remote" => Some(FileLocation::Remote),
            _ => None,
        }
    }
}

/// Identity of a table: (schema, table)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableKey {
    pub schema_name: String,
    pub table_name: String,
}

impl TableKey {
    pub fn new(schema_name: impl Into<String>, table_name: impl Into<String>) -> Self {
        Self {
            schema_name: schema_name.into(),
            table_name: table_name.into(),
        }
    }
}

impl fmt::Display for TableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema_name, self.table_name)
    }
}

/// One catalog row: where the current data for a table lives and its schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogEntry {
    pub schema_name: String,
    pub table_name: String,
    pub location: String,
    pub data_type: FileDataType,
    pub file_location: FileLocation,
    pub column_schema: ColumnsSchema,
}

impl CatalogEntry {
    pub fn key(&self) -> TableKey {
        TableKey::new(self.schema_name.clone(), self.table_name.clone())
    }

    pub fn primary_keys(&self) -> Vec<String> {
        primary_keys(&self.column_schema)
    }
}
