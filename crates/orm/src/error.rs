//! Error types for the ORM
//!
//! A single crate-wide error enum covering validation, access control,
//! schema, migration, and datastore failures. Each kind carries an
//! HTTP-like status code so host applications can map errors directly
//! onto responses.

use std::fmt;

/// Result type alias for ORM operations
pub type OrmResult<T> = Result<T, OrmError>;

/// Error type for all ORM operations
#[derive(Debug, Clone)]
pub enum OrmError {
    /// Malformed or disallowed input (empty where-map on remove,
    /// non-settable property in a set-map, password confirmation mismatch)
    BadRequest(String),
    /// No actor resolved where one is required, or credential mismatch
    Unauthenticated(String),
    /// Actor present but denied by an access-control policy
    Forbidden(String),
    /// Record not found (`get_one`, token lookup)
    NotFound(String),
    /// Unknown property reference, duplicate/reserved property name,
    /// unresolvable association target, missing table
    Schema(String),
    /// Migration ordering/version conflict or aborted task list
    Migration(String),
    /// Datastore failure, passed through unmodified
    Execution(String),
    /// Value conversion or serialization failure
    Serialization(String),
}

impl OrmError {
    /// HTTP-equivalent status code for this error kind
    pub fn status_code(&self) -> u16 {
        match self {
            OrmError::BadRequest(_) => 400,
            OrmError::Unauthenticated(_) => 401,
            OrmError::Forbidden(_) => 403,
            OrmError::NotFound(_) => 404,
            OrmError::Schema(_)
            | OrmError::Migration(_)
            | OrmError::Execution(_)
            | OrmError::Serialization(_) => 500,
        }
    }
}

impl fmt::Display for OrmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrmError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            OrmError::Unauthenticated(msg) => write!(f, "Unauthenticated: {}", msg),
            OrmError::Forbidden(msg) => write!(f, "Forbidden: {}", msg),
            OrmError::NotFound(msg) => write!(f, "Not found: {}", msg),
            OrmError::Schema(msg) => write!(f, "Schema error: {}", msg),
            OrmError::Migration(msg) => write!(f, "Migration error: {}", msg),
            OrmError::Execution(msg) => write!(f, "Execution error: {}", msg),
            OrmError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
        }
    }
}

impl std::error::Error for OrmError {}

impl From<sqlx::Error> for OrmError {
    fn from(err: sqlx::Error) -> Self {
        OrmError::Execution(err.to_string())
    }
}

impl From<serde_json::Error> for OrmError {
    fn from(err: serde_json::Error) -> Self {
        OrmError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_error_kinds() {
        assert_eq!(OrmError::BadRequest("x".into()).status_code(), 400);
        assert_eq!(OrmError::Unauthenticated("x".into()).status_code(), 401);
        assert_eq!(OrmError::Forbidden("x".into()).status_code(), 403);
        assert_eq!(OrmError::NotFound("x".into()).status_code(), 404);
        assert_eq!(OrmError::Schema("x".into()).status_code(), 500);
    }

    #[test]
    fn display_includes_kind_and_message() {
        let err = OrmError::NotFound("user".to_string());
        assert_eq!(err.to_string(), "Not found: user");
    }
}
