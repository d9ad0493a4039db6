use thiserror::Error;

/// Failure modes shared by the importer, the series stages and the API.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A remote source answered with a non-success status or could not be
    /// reached. Recoverable: the source is skipped.
    #[error("fetch failed for {url}: {reason}")]
    FetchFailure { url: String, reason: String },

    /// A fact row names a region that is not in the registry.
    #[error("unresolved region: '{name}'")]
    UnresolvedRegion { name: String },

    /// A fact row is missing a field or carries an unparsable value.
    #[error("invalid row at line {line}: {reason}")]
    InvalidRow { line: usize, reason: String },

    /// A requested table, column or filter does not exist for the target.
    #[error("schema mismatch: {message}")]
    SchemaMismatch { message: String },

    /// A pipeline stage found its input table absent.
    #[error("table '{table}' does not exist; run the importer first")]
    MissingTable { table: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
}

impl StoreError {
    pub fn schema_mismatch(message: impl Into<String>) -> Self {
        Self::SchemaMismatch {
            message: message.into(),
        }
    }

    pub fn invalid_row(line: usize, reason: impl Into<String>) -> Self {
        Self::InvalidRow {
            line,
            reason: reason.into(),
        }
    }

    /// True for errors caused by caller input rather than the storage layer.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::SchemaMismatch { .. } | Self::UnresolvedRegion { .. } | Self::InvalidRow { .. }
        )
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
