//! Wire framing error types.

use thiserror::Error;

/// Framing errors
#[derive(Error, Debug)]
pub enum WireError {
    /// Declared message length exceeds the configured ceiling
    #[error("extreme message length {declared} exceeds limit {limit}")]
    Extreme {
        /// Length declared by the header
        declared: usize,
        /// Configured ceiling
        limit: usize,
    },

    /// Tracked bytes would run past the end of the buffer
    #[error("tracked {0} bytes with only {1} free")]
    Overrun(usize, usize),

    /// Written bytes do not fit the remaining free space
    #[error("write of {0} bytes does not fit {1} free")]
    Write(usize, usize),

    /// Grow requested while free space remains
    #[error("grow on a buffer that is not full")]
    NotFull,
}
