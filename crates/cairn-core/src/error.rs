use std::path::PathBuf;

use thiserror::Error;

pub type CairnResult<T> = Result<T, CairnError>;

#[derive(Debug, Error)]
pub enum CairnError {
    /// A source file or directory could not be read (vanished, permissions, ...)
    #[error("reading source {}: {source}", path.display())]
    SourceRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("store write failed for {key}: {reason}")]
    StoreWrite { key: String, reason: String },

    #[error("store read failed for {key}: {reason}")]
    StoreRead { key: String, reason: String },

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("corrupt entry: {0}")]
    CorruptEntry(String),

    #[error("hash mismatch for {id}: stored bytes hash to {actual}")]
    HashMismatch { id: String, actual: String },

    #[error("config error: {0}")]
    Config(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CairnError {
    pub fn source_read(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CairnError::SourceRead {
            path: path.into(),
            source,
        }
    }

    pub fn corrupt(msg: impl Into<String>) -> Self {
        CairnError::CorruptEntry(msg.into())
    }

    /// Errors confined to a single source entry. The tree builder records these
    /// in its report and keeps going unless fail-fast is set; everything else
    /// aborts the snapshot.
    pub fn is_entry_local(&self) -> bool {
        matches!(self, CairnError::SourceRead { .. })
    }

    /// Errors that affect a single branch of the read path.
    pub fn is_branch_local(&self) -> bool {
        matches!(
            self,
            CairnError::NotFound(_)
                | CairnError::StoreRead { .. }
                | CairnError::CorruptEntry(_)
                | CairnError::HashMismatch { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_read_is_entry_local() {
        let err = CairnError::source_read(
            "/tmp/gone",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert!(err.is_entry_local());
        assert!(err.to_string().contains("/tmp/gone"));
    }

    #[test]
    fn store_errors_abort() {
        let err = CairnError::StoreWrite {
            key: "objects/ab/abc".into(),
            reason: "denied".into(),
        };
        assert!(!err.is_entry_local());
        assert!(!err.is_branch_local());
        assert!(CairnError::NotFound("x".into()).is_branch_local());
    }
}
