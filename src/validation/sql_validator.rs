use sqlparser::ast::Statement;
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use crate::error::{EngineError, Result};

/// Checks on SQL that defines derived tables
pub struct SqlValidator;

impl SqlValidator {
    /// Require exactly one read-only query; returns it without a trailing `;`
    pub fn validate_single_query(sql: &str) -> Result<String> {
        let dialect = PostgreSqlDialect {};
        let mut parser = Parser::new(&dialect)
            .try_with_sql(sql)
            .map_err(|e| EngineError::InvalidSql(format!("SQL parsing error: {}", e)))?;

        let ast = parser
            .parse_statements()
            .map_err(|e| EngineError::InvalidSql(format!("SQL parsing error: {}", e)))?;

        match ast.as_slice() {
            [] => Err(EngineError::InvalidSql("Empty SQL query".to_string())),
            [Statement::Query(_)] => Ok(sql.trim().trim_end_matches(';').trim_end().to_string()),
            [other] => Err(EngineError::InvalidSql(format!(
                "Only SELECT queries can define a table. Found: {}",
                statement_kind(other)
            ))),
            statements => Err(EngineError::InvalidSql(format!(
                "Expected one statement, found {}",
                statements.len()
            ))),
        }
    }
}

fn statement_kind(stmt: &Statement) -> String {
    let text = stmt.to_string();
    text.split_whitespace()
        .take(2)
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase()
}

/// Names usable as unquoted identifiers in the query engine: `-` becomes `_`
pub fn sanitize_name(name: &str) -> String {
    name.replace('-', "_")
}

/// Double-quote an identifier, escaping embedded quotes
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_single_select() {
        let sql = SqlValidator::validate_single_query("SELECT id, name FROM crm.users;").unwrap();
        assert_eq!(sql, "SELECT id, name FROM crm.users");

        assert!(SqlValidator::validate_single_query(
            "WITH recent AS (SELECT * FROM crm.users) SELECT id FROM recent"
        )
        .is_ok());
    }

    #[test]
    fn test_rejects_writes() {
        for sql in [
            "INSERT INTO users VALUES (1)",
            "UPDATE users SET name = 'test'",
            "DELETE FROM users",
            "DROP TABLE users",
        ] {
            let err = SqlValidator::validate_single_query(sql).unwrap_err();
            assert!(matches!(err, EngineError::InvalidSql(_)), "{} should be rejected", sql);
        }
    }

    #[test]
    fn test_rejects_multiple_statements() {
        let err = SqlValidator::validate_single_query("SELECT 1; SELECT 2").unwrap_err();
        assert!(err.to_string().contains("found 2"));
    }

    #[test]
    fn test_rejects_empty_and_garbage() {
        assert!(SqlValidator::validate_single_query("").is_err());
        assert!(SqlValidator::validate_single_query("SELEC nothing").is_err());
    }

    #[test]
    fn test_identifier_helpers() {
        assert_eq!(sanitize_name("my-loader"), "my_loader");
        assert_eq!(quote_ident("users"), "\"users\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
