use std::time::Duration;

use thiserror::Error;

/// Failures surfaced by the store and the query paths built on it.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("item '{0}' not found")]
    NotFound(String),

    #[error("conflicting log record: {0}")]
    Conflict(String),

    #[error("failed to append log record for '{item}': {source}")]
    WriteFailed {
        item: String,
        #[source]
        source: Box<StoreError>,
    },

    #[error("store operation exceeded {0:?}")]
    StoreTimeout(Duration),

    #[error("bad value: {0}")]
    BadValue(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("database worker is not running")]
    Closed,

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    pub(crate) fn write_failed(item: &str, source: StoreError) -> Self {
        StoreError::WriteFailed {
            item: item.to_string(),
            source: Box::new(source),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

/// Maps a unique/primary key violation on insert to `Conflict`.
pub(crate) fn map_insert_error(err: rusqlite::Error, what: impl FnOnce() -> String) -> StoreError {
    match err {
        rusqlite::Error::SqliteFailure(ref code, _)
            if code.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            StoreError::Conflict(what())
        }
        other => StoreError::Sqlite(other),
    }
}
