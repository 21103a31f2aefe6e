//! Error taxonomy for the ingestion and retrieval core.
//!
//! Per-file problems ([`Error::UnsupportedFileType`], [`Error::ExtractionFailure`])
//! are absorbed by the pipeline and reported as warnings. Everything else
//! propagates to the caller. Failures in the chunk, embed, index and persist
//! stages are wrapped in [`Error::Stage`] so the caller can tell which step
//! of an ingestion broke.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Pipeline stage that produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Chunk,
    Embed,
    Index,
    Persist,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Chunk => "chunk",
            Stage::Embed => "embed",
            Stage::Index => "index",
            Stage::Persist => "persist",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for portal operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A namespace directory or index file could not be created or written.
    #[error("storage unavailable at {}: {source}", path.display())]
    StorageUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unsupported file type: {0}")]
    UnsupportedFileType(String),

    #[error("extraction failed for {file}: {reason}")]
    ExtractionFailure { file: String, reason: String },

    /// No uploaded file produced any text.
    #[error("no ingestible content: none of the {received} uploaded file(s) yielded text")]
    NoIngestibleContent { received: usize },

    #[error("invalid chunk configuration: {0}")]
    InvalidChunkConfig(String),

    #[error("invalid session id '{0}'")]
    InvalidSessionId(String),

    #[error("embedding failed: {0}")]
    EmbeddingFailure(String),

    #[error("dimension mismatch: expected {expected}, found {found}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("cannot build an index from zero chunks")]
    EmptyIndex,

    /// A persisted index was embedded with a different model than the one
    /// now configured, so similarity scores would be meaningless.
    #[error("index was built with model '{index}' but the provider is '{provider}'")]
    ModelMismatch { index: String, provider: String },

    #[error("no index found at {}", .0.display())]
    IndexNotFound(PathBuf),

    #[error("{stage} stage timed out after {}s", after.as_secs())]
    Timeout { stage: Stage, after: Duration },

    /// The persisted index exists but could not be read or written.
    #[error("index error: {0}")]
    Index(String),

    #[error("config error: {0}")]
    Config(String),

    /// Failure inside one of the post-extraction pipeline stages.
    #[error("ingestion failed at {stage} stage: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Wraps `self` as a failure of `stage`. Timeouts and already-wrapped
    /// errors are returned unchanged.
    pub fn at_stage(self, stage: Stage) -> Error {
        match self {
            Error::Stage { .. } | Error::Timeout { .. } => self,
            other => Error::Stage {
                stage,
                source: Box::new(other),
            },
        }
    }

    /// Returns the innermost error, skipping stage wrappers.
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::Stage { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Stage that failed, if the error came out of the pipeline.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Error::Stage { stage, .. } | Error::Timeout { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// True when the caller supplied something unusable (bad input or
    /// unknown session) rather than hitting an infrastructure failure.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self.root_cause(),
            Error::UnsupportedFileType(_)
                | Error::ExtractionFailure { .. }
                | Error::NoIngestibleContent { .. }
                | Error::InvalidChunkConfig(_)
                | Error::InvalidSessionId(_)
                | Error::IndexNotFound(_)
        )
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        Error::Index(e.to_string())
    }
}

/// Result type alias for portal operations.
pub type Result<T> = std::result::Result<T, Error>;
