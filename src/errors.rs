use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("VALIDATION: {0}")]
    Validation(String),
    #[error("DUPLICATE_IMPORT: content hash {content_hash} already imported by run {existing_run_id}")]
    DuplicateImport {
        run_id: String,
        content_hash: String,
        existing_run_id: String,
    },
    #[error("CONCURRENT_IMPORT: source {source_name} is busy with run {active_run_id}")]
    ConcurrentImport {
        run_id: String,
        source_name: String,
        active_run_id: String,
    },
    #[error("MISSING_REFERENCE: {0}")]
    MissingReference(String),
    #[error("EXTERNAL_TIMEOUT: {0}")]
    ExternalTimeout(String),
    #[error("COMPUTATION: {0}")]
    Computation(String),
    #[error("CONFIG_INVALID: {0}")]
    Config(String),
    #[error("IO_FAILURE: {0}")]
    Io(String),
    #[error("NOT_FOUND: {0}")]
    NotFound(String),
    #[error("INTERNAL: {0}")]
    Internal(String),
}

impl AppError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION",
            Self::DuplicateImport { .. } => "DUPLICATE_IMPORT",
            Self::ConcurrentImport { .. } => "CONCURRENT_IMPORT",
            Self::MissingReference(_) => "MISSING_REFERENCE",
            Self::ExternalTimeout(_) => "EXTERNAL_TIMEOUT",
            Self::Computation(_) => "COMPUTATION",
            Self::Config(_) => "CONFIG_INVALID",
            Self::Io(_) => "IO_FAILURE",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// The ledger row created for a rejected import, if this error is a rejection.
    pub fn rejected_run_id(&self) -> Option<&str> {
        match self {
            Self::DuplicateImport { run_id, .. } | Self::ConcurrentImport { run_id, .. } => Some(run_id),
            _ => None,
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        Self::Validation(value.to_string())
    }
}

impl From<serde_yaml::Error> for AppError {
    fn from(value: serde_yaml::Error) -> Self {
        Self::Config(value.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(value: anyhow::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::AppError;

    #[test]
    fn display_carries_stable_prefix() {
        let error = AppError::ConcurrentImport {
            run_id: "r2".to_string(),
            source_name: "manual_sheet".to_string(),
            active_run_id: "r1".to_string(),
        };
        assert!(error.to_string().starts_with("CONCURRENT_IMPORT: "));
        assert_eq!(error.code(), "CONCURRENT_IMPORT");
        assert_eq!(error.rejected_run_id(), Some("r2"));
        assert_eq!(AppError::Computation("x".to_string()).rejected_run_id(), None);
    }
}
