//! Fatal pipeline errors.
//!
//! Per-record problems (malformed cells, missing ids, duplicates, missing
//! numeric values) never surface here; ingestion and the enricher absorb them
//! and count them.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The input header does not match the raw record schema.
    #[error("schema violation: missing columns [{missing}], unexpected columns [{unexpected}]")]
    ColumnSet { missing: String, unexpected: String },

    #[error("invalid config {path}: {detail}")]
    Config { path: PathBuf, detail: String },

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("snapshot store error at {path}: {source}")]
    Snapshot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no published snapshot under {0}")]
    NoSnapshot(PathBuf),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    /// Input whose shape cannot be trusted: a wrong column set, a row with the
    /// wrong number of cells, or bytes that are not UTF-8.
    pub fn is_schema_violation(&self) -> bool {
        match self {
            Self::ColumnSet { .. } => true,
            Self::Csv(err) => matches!(
                err.kind(),
                csv::ErrorKind::UnequalLengths { .. } | csv::ErrorKind::Utf8 { .. }
            ),
            _ => false,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn snapshot(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Snapshot {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_failures_are_not_schema_violations() {
        let err = PipelineError::io(
            "raw.csv",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert!(!err.is_schema_violation());
        assert!(!PipelineError::NoSnapshot(PathBuf::from("snapshots")).is_schema_violation());
    }

    #[test]
    fn column_set_is_a_schema_violation() {
        let err = PipelineError::ColumnSet {
            missing: "wait_days".to_string(),
            unexpected: String::new(),
        };
        assert!(err.is_schema_violation());
        assert!(err.to_string().contains("wait_days"));
    }
}
