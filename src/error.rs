use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Failures of the class file codec.
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("malformed class file: {0}")]
    Malformed(String),

    #[error("cannot encode method {method}: {reason}")]
    Unencodable { method: String, reason: String },

    #[error("constant pool exceeds 65535 entries")]
    PoolOverflow,
}

impl FormatError {
    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        FormatError::Malformed(msg.into())
    }

    /// Names the method an encode failure belongs to.
    pub(crate) fn in_method(self, name: &str) -> Self {
        match self {
            FormatError::Unencodable { method, reason } if method.is_empty() => {
                FormatError::Unencodable {
                    method: name.to_string(),
                    reason,
                }
            }
            other => other,
        }
    }
}

#[derive(Debug, Error)]
pub enum InstrumentationError {
    #[error("method {method}: no free local slot for a long (max_locals = {max_locals})")]
    SlotOverflow { method: String, max_locals: u16 },

    #[error(transparent)]
    Format(#[from] FormatError),
}

/// One failed transform job, kept after the worker that ran it is gone.
#[derive(Debug, Clone)]
pub struct JobFailure {
    pub source: PathBuf,
    pub message: String,
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.source.display(), self.message)
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("archive error on {}: {source}", .path.display())]
    Archive {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },

    #[error("{}: {source}", .path.display())]
    Format {
        path: PathBuf,
        #[source]
        source: FormatError,
    },

    #[error("{}: {source}", .path.display())]
    Instrumentation {
        path: PathBuf,
        #[source]
        source: InstrumentationError,
    },

    #[error("cannot walk {}: {source}", .path.display())]
    Walk {
        path: PathBuf,
        #[source]
        source: ignore::Error,
    },

    #[error(
        "inputs {first:?} and {second:?} would share the output {}",
        .location.display()
    )]
    OutputCollision {
        first: String,
        second: String,
        location: PathBuf,
    },

    #[error("cannot start worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error("{} transform job(s) failed; first: {}", .0.len(), first_failure(.0))]
    Aggregate(Vec<JobFailure>),
}

fn first_failure(failures: &[JobFailure]) -> String {
    failures
        .first()
        .map(|f| f.to_string())
        .unwrap_or_default()
}

impl EngineError {
    /// Flattens the error into per-job failures attributed to `source`.
    pub fn into_failures(self, source: &std::path::Path) -> Vec<JobFailure> {
        match self {
            EngineError::Aggregate(failures) => failures,
            other => vec![JobFailure {
                source: source.to_path_buf(),
                message: other.to_string(),
            }],
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        EngineError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn archive(path: impl Into<PathBuf>, source: zip::result::ZipError) -> Self {
        EngineError::Archive {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn instrumentation(path: impl Into<PathBuf>, source: InstrumentationError) -> Self {
        match source {
            InstrumentationError::Format(source) => EngineError::Format {
                path: path.into(),
                source,
            },
            source => EngineError::Instrumentation {
                path: path.into(),
                source,
            },
        }
    }
}
