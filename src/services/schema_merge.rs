use crate::error::{EngineError, Result};
use crate::models::{primary_keys, ColumnSchema, ColumnsSchema, TableKey};

/// One additive change to a table's schema
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaChange {
    AddColumn { name: String, column: ColumnSchema },
}

/// Outcome of merging a batch's schema into a table's schema
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaMerge {
    pub merged: ColumnsSchema,
    pub changes: Vec<SchemaChange>,
}

impl SchemaMerge {
    pub fn is_unchanged(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Additively merge `incoming` into `existing`
///
/// Existing columns keep their type and primary-key flag even when the batch
/// observed something different; columns absent from the batch are retained.
pub fn merge_schemas(key: &TableKey, existing: &ColumnsSchema, incoming: &ColumnsSchema) -> Result<SchemaMerge> {
    let mut merged = existing.clone();
    let mut changes = Vec::new();

    for (name, column) in incoming {
        if merged.contains_key(name) {
            continue;
        }
        merged.insert(name.clone(), column.clone());
        changes.push(SchemaChange::AddColumn {
            name: name.clone(),
            column: column.clone(),
        });
    }

    ensure_primary_key(key, &merged)?;
    Ok(SchemaMerge { merged, changes })
}

/// A table must keep at least one primary-key column
pub fn ensure_primary_key(key: &TableKey, schema: &ColumnsSchema) -> Result<()> {
    if primary_keys(schema).is_empty() {
        return Err(EngineError::MissingPrimaryKey {
            schema_name: key.schema_name.clone(),
            table_name: key.table_name.clone(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ColumnType, PrimitiveType};

    fn schema(columns: &[(&str, PrimitiveType, bool)]) -> ColumnsSchema {
        columns
            .iter()
            .map(|(name, ty, pk)| (name.to_string(), ColumnSchema::new(*ty, *pk)))
            .collect()
    }

    #[test]
    fn test_new_columns_are_added() {
        let key = TableKey::new("crm", "users");
        let existing = schema(&[("id", PrimitiveType::Double, true), ("name", PrimitiveType::Varchar, false)]);
        let incoming = schema(&[("id", PrimitiveType::Double, true), ("email", PrimitiveType::Varchar, false)]);

        let merge = merge_schemas(&key, &existing, &incoming).unwrap();

        assert_eq!(merge.merged.len(), 3);
        assert!(merge.merged.contains_key("name"));
        assert_eq!(
            merge.changes,
            vec![SchemaChange::AddColumn {
                name: "email".to_string(),
                column: ColumnSchema::new(PrimitiveType::Varchar, false),
            }]
        );
    }

    #[test]
    fn test_existing_types_never_change() {
        let key = TableKey::new("crm", "users");
        let existing = schema(&[("id", PrimitiveType::Double, true), ("v", PrimitiveType::Double, false)]);
        let incoming = schema(&[("id", PrimitiveType::Varchar, true), ("v", PrimitiveType::Varchar, false)]);

        let merge = merge_schemas(&key, &existing, &incoming).unwrap();

        assert!(merge.is_unchanged());
        assert_eq!(merge.merged["v"].column_type, ColumnType::Primitive(PrimitiveType::Double));
    }

    #[test]
    fn test_merge_without_primary_key_fails() {
        let key = TableKey::new("crm", "events");
        let existing = ColumnsSchema::new();
        let incoming = schema(&[("name", PrimitiveType::Varchar, false)]);

        let err = merge_schemas(&key, &existing, &incoming).unwrap_err();
        assert!(matches!(err, EngineError::MissingPrimaryKey { .. }));
    }

    #[test]
    fn test_sequence_of_batches_is_superset() {
        let key = TableKey::new("crm", "users");
        let batches = vec![
            schema(&[("id", PrimitiveType::Double, true)]),
            schema(&[("id", PrimitiveType::Double, true), ("a", PrimitiveType::Boolean, false)]),
            schema(&[("id", PrimitiveType::Double, true), ("b", PrimitiveType::Date, false)]),
            schema(&[("id", PrimitiveType::Double, true), ("a", PrimitiveType::Varchar, false)]),
        ];

        let mut current = ColumnsSchema::new();
        for batch in &batches {
            current = merge_schemas(&key, &current, batch).unwrap().merged;
        }

        for batch in &batches {
            assert!(batch.keys().all(|name| current.contains_key(name)));
        }
        assert_eq!(current["a"].column_type, ColumnType::Primitive(PrimitiveType::Boolean));
    }
}
