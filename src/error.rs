//! error -- FCGI protocol failures.
//!
//! Every one of these ends the connection. None are retried.
//
use std::io;
use thiserror::Error;

/// Protocol-level failure on one connection.
#[derive(Debug, Error)]
pub enum FcgiError {
    /// A read step ran past its deadline.
    #[error("FCGI read timed out")]
    Timeout,
    /// Peer closed the connection in the middle of a record.
    #[error("FCGI connection closed mid-record")]
    ConnectionClosed,
    /// Fixed-structure content missing or short.
    #[error("FCGI bad request: {0}")]
    BadRequest(String),
    /// Param block or length encoding could not be decoded.
    #[error("FCGI decode failure: {0}")]
    Decode(String),
    /// Saw a second request ID on the same connection.
    #[error("FCGI record IDs differ, expected {expected}, got {got}. Multiplex mode not supported.")]
    Multiplex { expected: u16, got: u16 },
    /// Params or body over the configured limit.
    #[error("FCGI request too large: {0}")]
    TooLarge(String),
    /// Writing response frames failed.
    #[error("FCGI write failed: {0}")]
    Write(#[source] io::Error),
    /// Any other transport error.
    #[error("FCGI I/O error: {0}")]
    Io(#[from] io::Error),
}

impl FcgiError {
    /// HTTP-style status describing this failure.
    pub fn status(&self) -> u16 {
        match self {
            FcgiError::Timeout | FcgiError::ConnectionClosed => 408,
            FcgiError::BadRequest(_) | FcgiError::Decode(_) | FcgiError::Multiplex { .. } => 400,
            FcgiError::TooLarge(_) => 413,
            FcgiError::Write(_) | FcgiError::Io(_) => 500,
        }
    }
}

#[test]
fn error_status_mapping() {
    assert_eq!(FcgiError::Timeout.status(), 408);
    assert_eq!(FcgiError::BadRequest("short".into()).status(), 400);
    assert_eq!(FcgiError::Decode("overrun".into()).status(), 400);
    assert_eq!(FcgiError::TooLarge("body".into()).status(), 413);
    let e: FcgiError = io::Error::other("boom").into();
    assert_eq!(e.status(), 500);
}
