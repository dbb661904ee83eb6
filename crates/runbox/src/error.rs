//! Error types shared across the crate.

use thiserror::Error;

/// Rejection of an untrusted job submission.
///
/// Each variant corresponds to exactly one validation rule and carries a
/// stable error code that is part of the HTTP contract.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Submission used a protocol version other than the supported one.
    #[error("only protocolVersion = {0} is supported")]
    UnsupportedProtocol(u32),

    /// Submission named a language other than Python.
    #[error("only Python is supported, got {0:?}")]
    UnsupportedLanguage(String),

    /// Submission carried no files at all.
    #[error("at least one file is required")]
    EmptyFiles,

    /// Submission exceeded the file-count bound.
    #[error("too many files (limit {0})")]
    FileCountExceeded(usize),

    /// A path was empty, absolute, drive-prefixed, backslashed or escaped
    /// the workspace via `..` segments.
    #[error("invalid file path {0:?}")]
    InvalidFilePath(String),

    /// Two files normalized to the same path.
    #[error("duplicate file path {0:?}")]
    DuplicateFilePath(String),

    /// Encoding tag was neither `utf8` nor `base64`.
    #[error("unsupported encoding, expected utf8 or base64")]
    InvalidEncoding,

    /// Declared base64 content did not decode.
    #[error("file {0:?} is not valid base64")]
    InvalidFileContent(String),

    /// Decoded content exceeded the size bound for its encoding.
    #[error("file {path:?} exceeds the size limit ({limit} bytes)")]
    FileTooLarge {
        /// Offending file path.
        path: String,
        /// Applicable byte limit.
        limit: usize,
    },

    /// Entry path did not carry the interpreter source extension.
    #[error("entry file must be a Python source file")]
    InvalidEntry,

    /// Entry path was not a member of the file list.
    #[error("entry file is missing from the files list")]
    EntryNotFound,
}

impl ValidationError {
    /// Stable machine-readable code reported to submitters.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnsupportedProtocol(_) => "UNSUPPORTED_PROTOCOL",
            Self::UnsupportedLanguage(_) => "UNSUPPORTED_LANGUAGE",
            Self::EmptyFiles => "EMPTY_FILES",
            Self::FileCountExceeded(_) => "FILE_COUNT_EXCEEDED",
            Self::InvalidFilePath(_) => "INVALID_FILE_PATH",
            Self::DuplicateFilePath(_) => "DUPLICATE_FILE_PATH",
            Self::InvalidEncoding => "INVALID_ENCODING",
            Self::InvalidFileContent(_) => "INVALID_FILE_CONTENT",
            Self::FileTooLarge { .. } => "FILE_TOO_LARGE",
            Self::InvalidEntry => "INVALID_ENTRY",
            Self::EntryNotFound => "ENTRY_NOT_FOUND",
        }
    }
}

/// Failure while preparing or running a sandboxed job.
///
/// These never escape to a sibling job; the worker loop logs them and moves
/// on. A `failed` runner event is always reported before one of these is
/// returned.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// Workspace creation or file materialization failed.
    #[error("workspace setup failed: {0}")]
    Workspace(#[source] std::io::Error),

    /// A claimed job carried a path the validator would have rejected.
    #[error(transparent)]
    UnsafePath(#[from] ValidationError),

    /// The interpreter process could not be spawned.
    #[error("failed to spawn interpreter {binary:?}: {source}")]
    Spawn {
        /// Configured interpreter binary.
        binary: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// Waiting on the child process failed at the OS level.
    #[error("failed waiting for interpreter exit: {0}")]
    Wait(#[source] std::io::Error),
}

/// Failure while claiming work from a claim source.
#[derive(Debug, Error)]
pub enum ClaimError {
    /// Transport-level failure talking to a remote claim endpoint.
    #[error("claim request failed: {0}")]
    Transport(String),

    /// The claim endpoint rejected the worker's credentials.
    #[error("claim request unauthorized (status {0})")]
    Unauthorized(u16),
}
