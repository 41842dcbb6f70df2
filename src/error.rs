// ⚠️ Error taxonomy for the consolidation engine
//
// Only two conditions abort a run: the store is unreachable at start, and no
// input files were found. Everything else is either recovered locally or
// turned into a ValidationIssue in the audit report.

use thiserror::Error;

/// Result alias used across the library
pub type Result<T> = std::result::Result<T, ConsolidationError>;

#[derive(Error, Debug)]
pub enum ConsolidationError {
    /// No candidate encoding produced a parseable table
    #[error("could not decode {source_name}: no candidate encoding produced a parseable table ({tried})")]
    Decode { source_name: String, tried: String },

    /// Checkpoint file still unreadable after reinitialization
    #[error("checkpoint corrupted at {path} after {attempts} attempts: {reason}")]
    CheckpointCorruption {
        path: String,
        attempts: u32,
        reason: String,
    },

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("no input files found: {0}")]
    NoInputFiles(String),

    #[error("registry feed error: {0}")]
    Registry(String),

    #[error("archive error: {0}")]
    Archive(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

impl ConsolidationError {
    /// Fatal errors abort the run before any checkpoint mutation
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ConsolidationError::StoreUnavailable(_) | ConsolidationError::NoInputFiles(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_store_and_input_errors_are_fatal() {
        assert!(ConsolidationError::StoreUnavailable("db".into()).is_fatal());
        assert!(ConsolidationError::NoInputFiles("dir".into()).is_fatal());
        assert!(!ConsolidationError::Registry("feed".into()).is_fatal());
        assert!(!ConsolidationError::Decode {
            source_name: "1T2025.csv".into(),
            tried: "UTF-8".into()
        }
        .is_fatal());
    }
}
