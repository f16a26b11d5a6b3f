//! SQL identifier handling
//!
//! Identifiers (relation and column names) cannot be bound as parameters,
//! so they are validated against a strict charset and double-quote escaped
//! before being spliced into statements. Values always go through parameter
//! binding and never touch this module.

use crate::error::{OrmError, OrmResult};

/// Escape a SQL identifier for safe use in a statement.
///
/// Doubles any embedded double quotes and wraps the identifier in double
/// quotes (PostgreSQL-style quoting).
pub fn escape_identifier(identifier: &str) -> String {
    let escaped = identifier.replace('"', "\"\"");
    format!("\"{}\"", escaped)
}

/// Escape a qualified `alias.column` pair.
pub fn escape_qualified(alias: &str, column: &str) -> String {
    format!("{}.{}", escape_identifier(alias), escape_identifier(column))
}

/// Validate that an identifier is usable as a relation or column name.
pub fn validate_identifier(identifier: &str) -> OrmResult<()> {
    if identifier.is_empty() {
        return Err(OrmError::Schema("identifier cannot be empty".to_string()));
    }
    // PostgreSQL truncates identifiers beyond 63 bytes
    if identifier.len() > 63 {
        return Err(OrmError::Schema(format!(
            "identifier '{}' is too long (max 63 characters)",
            identifier
        )));
    }
    if identifier
        .chars()
        .next()
        .map(|c| c.is_ascii_digit())
        .unwrap_or(false)
    {
        return Err(OrmError::Schema(format!(
            "identifier '{}' cannot start with a digit",
            identifier
        )));
    }
    for c in identifier.chars() {
        if !(c.is_ascii_alphanumeric() || c == '_' || c == '$') {
            return Err(OrmError::Schema(format!(
                "identifier '{}' contains disallowed character '{}'",
                identifier, c
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_plain_identifiers() {
        assert_eq!(escape_identifier("users"), "\"users\"");
    }

    #[test]
    fn doubles_embedded_quotes() {
        assert_eq!(escape_identifier("us\"ers"), "\"us\"\"ers\"");
    }

    #[test]
    fn rejects_bad_identifiers() {
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("9lives").is_err());
        assert!(validate_identifier("name; DROP TABLE").is_err());
        assert!(validate_identifier(&"x".repeat(64)).is_err());
        assert!(validate_identifier("user_name$1").is_ok());
    }
}
