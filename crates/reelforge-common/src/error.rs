//! Common error types used throughout reelforge.
//!
//! Every failure maps onto one [`ErrorKind`]: malformed timelines are
//! configuration errors, bounded waits fail with time-limit errors, a worker
//! whose parent died fails with a parent error, and bookkeeping
//! inconsistencies are system errors.

use std::time::Duration;

/// Common error type for reelforge.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed timeline or settings. Never retried.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A bounded wait exceeded its hard deadline.
    #[error("Time limit ({limit:?}) exceeded {what}")]
    TimeLimit { what: String, limit: Duration },

    /// A subprocess was terminated by a broken pipe.
    #[error("Broken pipe: {command}")]
    BrokenPipe { command: String },

    /// The supervising parent of a worker is no longer running.
    #[error("Parent worker `{parent}` of `{worker}` is dead")]
    Parent { worker: String, parent: String },

    /// Supervision bookkeeping inconsistency or an unrecoverable process.
    #[error("System error: {0}")]
    System(String),

    /// A subprocess exited with a non-zero status.
    #[error("{command} ({status}):\n{stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    /// A subprocess could not be launched.
    #[error("Failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// Silence detection produced inconsistent markers.
    #[error("Silence detection error: {0}")]
    Silence(String),

    /// A worker panicked or was cancelled.
    #[error("Worker `{name}` failed: {message}")]
    Worker { name: String, message: String },

    /// An output was compiled a second time.
    #[error("Output #{output} has already been compiled")]
    AlreadyCompiled { output: usize },

    /// An I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    TimeLimit,
    BrokenPipe,
    Parent,
    System,
    Command,
    Silence,
    Worker,
    Io,
}

impl Error {
    /// Create a new Configuration error.
    pub fn configuration<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a new System error.
    pub fn system<S: Into<String>>(msg: S) -> Self {
        Self::System(msg.into())
    }

    /// Create a new Silence error.
    pub fn silence<S: Into<String>>(msg: S) -> Self {
        Self::Silence(msg.into())
    }

    /// Create a new TimeLimit error.
    pub fn time_limit<S: Into<String>>(what: S, limit: Duration) -> Self {
        Self::TimeLimit {
            what: what.into(),
            limit,
        }
    }

    /// The taxonomy bucket this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) | Self::AlreadyCompiled { .. } => ErrorKind::Configuration,
            Self::TimeLimit { .. } => ErrorKind::TimeLimit,
            Self::BrokenPipe { .. } => ErrorKind::BrokenPipe,
            Self::Parent { .. } => ErrorKind::Parent,
            Self::System(_) => ErrorKind::System,
            Self::CommandFailed { .. } | Self::Spawn { .. } => ErrorKind::Command,
            Self::Silence(_) => ErrorKind::Silence,
            Self::Worker { .. } => ErrorKind::Worker,
            Self::Io(_) => ErrorKind::Io,
        }
    }
}

/// Result type alias using the common Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Render an error and all of its nested causes, outermost first.
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> Vec<String> {
    let mut chain = vec![err.to_string()];
    let mut cause = err.source();
    while let Some(c) = cause {
        chain.push(c.to_string());
        cause = c.source();
    }
    chain
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::configuration("No time to roll (after: 0)");
        assert_eq!(
            err.to_string(),
            "Configuration error: No time to roll (after: 0)"
        );

        let err = Error::BrokenPipe {
            command: "ffmpeg -i a.wav b.wav".to_string(),
        };
        assert_eq!(err.to_string(), "Broken pipe: ffmpeg -i a.wav b.wav");

        let err = Error::Parent {
            worker: "reader".to_string(),
            parent: "process".to_string(),
        };
        assert_eq!(err.to_string(), "Parent worker `process` of `reader` is dead");
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(Error::configuration("x").kind(), ErrorKind::Configuration);
        assert_eq!(
            Error::AlreadyCompiled { output: 0 }.kind(),
            ErrorKind::Configuration
        );
        assert_eq!(
            Error::time_limit("joining", Duration::from_secs(1)).kind(),
            ErrorKind::TimeLimit
        );
        assert_eq!(Error::system("lost child").kind(), ErrorKind::System);
        assert_eq!(Error::silence("bad marks").kind(), ErrorKind::Silence);
    }

    #[test]
    fn test_error_chain_includes_causes() {
        let err = Error::Spawn {
            command: "nonexistent".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
        };
        let chain = error_chain(&err);
        assert_eq!(chain.len(), 2);
        assert!(chain[0].contains("nonexistent"));
        assert_eq!(chain[1], "no such file");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err = Error::from(io_err);
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(err.kind(), ErrorKind::Io);
    }
}
