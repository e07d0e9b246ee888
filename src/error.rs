//! Error types for netmeter.

use thiserror::Error;

/// Errors that can occur while running a test
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Control-channel protocol violation
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server refused the test
    #[error("the server is busy running a test, try again later")]
    AccessDenied,

    /// The peer closed the control channel mid-test
    #[error("the control connection was closed unexpectedly")]
    ControlClosed,

    /// The client sent CLIENT_TERMINATE
    #[error("the client has terminated")]
    ClientTerminated,

    /// The server sent SERVER_TERMINATE
    #[error("the server has terminated")]
    ServerTerminated,

    /// Interrupted by a signal
    #[error("interrupted")]
    Interrupted,

    /// Invalid parameter
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// A peer did not show up in time
    #[error("timed out {0}")]
    Timeout(String),

    /// Hostname did not resolve to a usable address
    #[error("cannot resolve {0}")]
    HostResolution(String),
}

/// Result type for netmeter operations
pub type Result<T> = std::result::Result<T, Error>;
