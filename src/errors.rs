//! Error values surfaced by handle table operations.
//!
//! Invalid-handle conditions are deliberately *not* errors: lookup-facing
//! operations report them as `false`/`None` returns, and only allocation
//! paths produce an [`Error`].

use std::fmt;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    /// A page allocation failed.
    OutOfMemory,
    /// The index tree is at maximum depth and every high-level slot is in
    /// use; the table cannot grow further.
    TableFull,
    /// The object word passed to `create_handle` was null or had its low
    /// (lock) bit set.
    InvalidObject,
}

impl Error {
    pub fn as_str(self) -> &'static str {
        match self {
            Error::OutOfMemory => "Out of memory",
            Error::TableFull => "Handle table at maximum capacity",
            Error::InvalidObject => "Invalid object word",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::error::Error for Error {}
