use thiserror::Error;

pub type Result<T> = std::result::Result<T, PlfError>;

/// Result alias for per-record scanning failures.
pub type ScanResult<T> = std::result::Result<T, ScanError>;

/// Fatal failures. Only I/O on the input file propagates to the caller;
/// everything else in the pipeline is a recoverable [`ScanError`].
#[derive(Debug, Error)]
pub enum PlfError {
    #[error("Failed to open file {}", path.display())]
    FailedToOpenFile {
        source: std::io::Error,
        path: std::path::PathBuf,
    },

    #[error("An I/O error has occurred")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

/// Per-record failures raised while walking the container.
///
/// Each pass catches these, logs them at Warn with the offending byte
/// offset, and skips to its next record. They never abort a pass.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Offset {offset}: not a valid zlib stream")]
    MalformedZlibStream {
        offset: usize,
        source: std::io::Error,
    },

    #[error("Offset {offset}: fragment is not well-formed XML")]
    MalformedXmlFragment {
        offset: usize,
        source: roxmltree::Error,
    },

    #[error("Offset {offset}: {what} needs {need} bytes, {have} available")]
    TokenizationMismatch {
        what: &'static str,
        offset: usize,
        need: usize,
        have: usize,
    },

    #[error("Offset {offset}: address token `{token}` has no parseable number")]
    UnparseableAddress { token: String, offset: usize },

    #[error("Offset {offset}: no block kind inferable for `{name}`")]
    UnclassifiedBlock { name: String, offset: usize },

    #[error("Element `{id}` has no XML, raw, or reference link")]
    UnmatchedElement { id: String },

    #[error("Offset {offset}: expected `{field}` shaped `{expected}`, found `{value}`")]
    FormatViolation {
        field: &'static str,
        expected: &'static str,
        value: String,
        offset: usize,
    },

    #[error("Offset {offset}: {what} exceeded its scan budget")]
    ScanBudgetExceeded { what: &'static str, offset: usize },
}

impl ScanError {
    /// Byte offset the failure was observed at, where one is known.
    pub fn offset(&self) -> Option<usize> {
        match self {
            ScanError::MalformedZlibStream { offset, .. }
            | ScanError::MalformedXmlFragment { offset, .. }
            | ScanError::TokenizationMismatch { offset, .. }
            | ScanError::UnparseableAddress { offset, .. }
            | ScanError::UnclassifiedBlock { offset, .. }
            | ScanError::FormatViolation { offset, .. }
            | ScanError::ScanBudgetExceeded { offset, .. } => Some(*offset),
            ScanError::UnmatchedElement { .. } => None,
        }
    }
}
