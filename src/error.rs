use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the delta-document engine.
///
/// Argument validation happens before any mutation, so an `IndexOutOfRange`
/// never leaves a document partially modified.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A position or range falls outside the document's current size.
    #[error("position {position} with length {length} out of range for size {size}")]
    IndexOutOfRange {
        position: u64,
        length: u64,
        size: u64,
    },

    /// A swap, source, or save-target I/O operation failed.
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    /// A document or source was used after being disposed.
    #[error("data source used after dispose")]
    SourceUnavailable,

    /// An operation requiring exclusive source ownership was attempted on a
    /// source shared by more than one document.
    #[error("data source is shared by other documents; exclusive ownership required")]
    SourceShared,

    /// `save()` was called on a document whose source has no backing file.
    #[error("document has no backing file; use save_to with an explicit target")]
    NotFileBacked,

    /// An atomic in-place save could not replace the original file.
    #[error("failed to replace {path:?}: {source}")]
    Persist {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl Error {
    pub(crate) fn out_of_range(position: u64, length: u64, size: u64) -> Self {
        Error::IndexOutOfRange {
            position,
            length,
            size,
        }
    }
}
