pub mod sql_validator;

pub use sql_validator::{quote_ident, sanitize_name, SqlValidator};
