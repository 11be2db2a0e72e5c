use std::io;

use thiserror::Error;

/// Errors returned by the eddyline reactor.
#[derive(Debug, Error)]
pub enum Error {
    /// An OS call failed. Carries the OS error code.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// No usable polling backend on this platform.
    #[error("no usable polling backend: {0}")]
    Unsupported(&'static str),
    /// Backend capacity exceeded (e.g. a descriptor beyond `FD_SETSIZE`
    /// handed to the select backend).
    #[error("descriptor limit: {0}")]
    DescriptorLimit(String),
    /// Configuration value out of range.
    #[error("config: {0}")]
    Config(String),
    /// Address resolution produced no usable address.
    #[error("address resolution: {0}")]
    Resolve(String),
    /// Operation on a descriptor that is already closed or shutting down.
    #[error("descriptor closed")]
    Closed,
    /// Operation on a handle whose reactor has been dropped.
    #[error("reactor no longer exists")]
    ReactorGone,
}

impl Error {
    /// The raw OS error code, when this error wraps one.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }
}
