use std::io;

use thiserror::Error;

pub type Result<T, E = ChangerError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum ChangerError {
    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("timeout {0}")]
    Timeout(String),

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl ChangerError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// errno-style process exit status for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::InvalidArgument(_) => 22,
            Self::NotFound(_) => 2,
            Self::Conflict(_) => 16,
            Self::Timeout(_) => 110,
            Self::Io { source, .. } => source
                .raw_os_error()
                .and_then(|c| u8::try_from(c).ok())
                .filter(|c| *c != 0)
                .unwrap_or(5),
        }
    }
}

/// Attaches a lazily built message to an `io::Result`.
pub trait IoContext<T> {
    fn io_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn io_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| ChangerError::io(f(), e))
    }
}
