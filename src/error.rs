use std::time::Duration;
use thiserror::Error;

/// Errors surfaced to users of a logical connection or a dialer. Everything below this layer
///  (link failures, decode errors) is absorbed and retried internally.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnError {
    #[error("no link became alive within {0:?}")]
    Timeout(Duration),
    #[error("connection is closed")]
    Closed,
    #[error("write failed on every selected link: {0}")]
    WriteFailed(String),
}

impl ConnError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ConnError::Timeout(_))
    }
}

impl From<ConnError> for std::io::Error {
    fn from(value: ConnError) -> Self {
        let kind = match &value {
            ConnError::Timeout(_) => std::io::ErrorKind::TimedOut,
            ConnError::Closed => std::io::ErrorKind::BrokenPipe,
            ConnError::WriteFailed(_) => std::io::ErrorKind::Other,
        };
        std::io::Error::new(kind, value)
    }
}
