use std::fmt;
use thiserror::Error;

/// Errors raised while evaluating transform mapping rules.
///
/// Carries the output path being assembled when the failure happened so
/// callers can surface "mapping error at 'foo.bar': ..." messages.
#[derive(Debug)]
pub struct MappingError {
    pub message: String,
    pub path: Option<String>,
}

impl MappingError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            path: None,
        }
    }

    pub fn at(message: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            path: Some(path.into()),
        }
    }
}

impl fmt::Display for MappingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            Some(path) => write!(f, "mapping error at '{path}': {}", self.message),
            None => write!(f, "mapping error: {}", self.message),
        }
    }
}

impl std::error::Error for MappingError {}

/// The error taxonomy of the execution core.
///
/// Every variant maps to a user-facing status code via [`EngineError::status_code`];
/// handlers convert these into process failure messages or 4xx responses.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A definition or payload violates its declared schema or structural
    /// rules (duplicate execution ids, missing required response map keys).
    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    /// A body failed validation against an attribute schema.
    #[error("invalid body at '{path}': {reason}")]
    InvalidObjectSchema { path: String, reason: String },

    /// A malformed `REF:` string or an unknown execution id / response key.
    #[error("invalid reference: {0}")]
    InvalidReference(String),

    /// Definition file could not be found.
    #[error("unable to load definition {0}: file not found")]
    MissingDefinition(String),

    /// Definition file exists but could not be parsed.
    #[error("invalid definition file {path}: {reason}")]
    InvalidDefinition { path: String, reason: String },

    /// Storage returned 403 or `entity_has_access = false`.
    #[error("unauthorized: {0}")]
    AccessDenied(String),

    /// Unexpected non-2xx from storage on a required write.
    #[error("failed to create file {path}: {reason}")]
    FileCreationFailure { path: String, reason: String },

    /// Token could not be verified or refreshed.
    #[error("JWT verification failed: {0}")]
    JwtVerification(String),

    /// A transform pipeline failed.
    #[error(transparent)]
    Mapping(#[from] MappingError),

    /// A leaf tool reported failure; propagated up the process tree unchanged.
    #[error("tool execution failed: {0}")]
    ToolExecutionFailed(String),

    /// Anything the taxonomy does not classify (transport failures, etc).
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    /// The HTTP-style status code user surfaces report for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            EngineError::InvalidSchema(_)
            | EngineError::InvalidObjectSchema { .. }
            | EngineError::InvalidReference(_)
            | EngineError::MissingDefinition(_)
            | EngineError::InvalidDefinition { .. }
            | EngineError::Mapping(_) => 400,
            EngineError::AccessDenied(_) => 403,
            EngineError::JwtVerification(_) => 401,
            EngineError::FileCreationFailure { .. }
            | EngineError::ToolExecutionFailed(_)
            | EngineError::Other(_) => 500,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(EngineError::InvalidSchema("dup".into()).status_code(), 400);
        assert_eq!(EngineError::AccessDenied("nope".into()).status_code(), 403);
        assert_eq!(
            EngineError::JwtVerification("expired".into()).status_code(),
            401
        );
        assert_eq!(
            EngineError::FileCreationFailure {
                path: "/a".into(),
                reason: "503".into()
            }
            .status_code(),
            500
        );
    }

    #[test]
    fn test_mapping_error_path_prefix() {
        let err = MappingError::at("key 'x' not found", "summary.total");
        assert_eq!(
            err.to_string(),
            "mapping error at 'summary.total': key 'x' not found"
        );
        let bare = MappingError::new("first argument must be an array, got string");
        assert!(bare.path.is_none());
        assert!(bare.to_string().starts_with("mapping error: "));
    }
}
