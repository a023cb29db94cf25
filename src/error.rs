//! Storage and index error types.

use std::io;

use thiserror::Error;
use tracing::error;

use crate::config::ConfigError;
use crate::location::SourceHandle;

/// Result alias used by the page, tree, catalog and codec layers.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Result alias used by the [`Index`](crate::Index) facade.
pub type IndexResult<T> = std::result::Result<T, IndexError>;

/// Failures raised below the index facade.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Reading or writing the page file or its log failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// On-disk bytes do not match the expected format.
    #[error("corruption detected: {0}")]
    Corruption(String),
    /// A caller passed something the store cannot accept.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// A value does not fit the on-disk format.
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),
    /// A stored location uses a marker with no registered codec.
    #[error("unknown location type marker '{0}'")]
    UnknownLocationMarker(char),
    /// Two codecs were registered for the same marker.
    #[error("location type marker '{0}' registered twice")]
    DuplicateLocationMarker(char),
    /// No layer with this id is configured.
    #[error("unknown layer '{0}'")]
    UnknownLayer(String),
    /// A record the operation needs is absent.
    #[error("{0} not found")]
    NotFound(&'static str),
    /// A catalog id is tombstoned or was never assigned.
    #[error("catalog id {0} is unknown or deleted")]
    UnknownCatalogId(i32),
    /// The store was opened read-only.
    #[error("index opened read-only")]
    ReadOnly,
}

impl StorageError {
    /// Shorthand for building a [`StorageError::Corruption`].
    pub fn corruption(msg: impl Into<String>) -> Self {
        StorageError::Corruption(msg.into())
    }

    /// Whether the error means the on-disk structure can no longer be trusted.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            StorageError::Corruption(_) | StorageError::UnknownLocationMarker(_)
        )
    }
}

/// Caller-facing error taxonomy of the index.
#[derive(Debug, Error)]
pub enum IndexError {
    /// A mutation could not be applied; the whole file should be re-indexed.
    #[error("index request failed for {file}: {source}")]
    IndexRequestFailed {
        file: SourceHandle,
        #[source]
        source: StorageError,
    },
    /// The on-disk index is unusable and must be rebuilt from scratch.
    #[error("index requires a full rebuild: {reason}")]
    IndexRequiresFullRebuild {
        reason: String,
        files: Vec<SourceHandle>,
    },
    /// The index is unavailable right now; retry later.
    #[error("index temporarily non-operational: {0}")]
    IndexTemporarilyNonOperational(String),
    /// A rebuild is in progress and query results would be incomplete.
    #[error("index is still building")]
    IndexIsStillBuilding,
    /// A catalog id resolved to a tombstone or to nothing.
    #[error("corrupt index: {detail}")]
    CorruptIndex { detail: String },
    /// The index config is unusable.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// A storage failure outside any file transaction.
    #[error(transparent)]
    Storage(StorageError),
}

impl IndexError {
    /// Wraps a storage error raised while applying a file transaction.
    pub fn request_failed(file: &SourceHandle, source: StorageError) -> Self {
        if source.is_structural() {
            error!(file = %file, error = %source, "index.request.structural");
        }
        IndexError::IndexRequestFailed {
            file: file.clone(),
            source,
        }
    }

    /// Whether the caller has to throw the index away.
    pub fn requires_rebuild(&self) -> bool {
        matches!(self, IndexError::IndexRequiresFullRebuild { .. })
    }
}

impl From<StorageError> for IndexError {
    fn from(err: StorageError) -> Self {
        match err {
            err if err.is_structural() => IndexError::IndexRequiresFullRebuild {
                reason: err.to_string(),
                files: Vec::new(),
            },
            StorageError::UnknownCatalogId(id) => IndexError::CorruptIndex {
                detail: format!("catalog id {id} is unknown or deleted"),
            },
            other => IndexError::Storage(other),
        }
    }
}
