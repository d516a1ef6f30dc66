use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StreamError>;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("IO Error: {0}")]
    Io(#[source] io::Error),
    /// Peer closed or reset the socket. Handled by teardown, never returned
    /// from `Stream::write` or `Stream::flush`.
    #[error("Connection lost: {0}")]
    ConnectionLost(#[source] io::Error),
    #[error("Stream is closed")]
    Closed,
    #[error("Stream is already attached to a handle")]
    AlreadyAttached,
    #[error("Event loop is already running")]
    AlreadyRunning,
    #[error("Configuration Error: {0}")]
    Configuration(String),
}

impl From<io::Error> for StreamError {
    fn from(err: io::Error) -> Self {
        if is_connection_lost(&err) {
            StreamError::ConnectionLost(err)
        } else {
            StreamError::Io(err)
        }
    }
}

impl StreamError {
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, StreamError::ConnectionLost(_))
    }
}

/// Errors that mean the peer is gone rather than the socket being broken.
pub fn is_connection_lost(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::WriteZero
            | io::ErrorKind::NotConnected
    )
}
