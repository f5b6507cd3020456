//! Error types for the core crate.

use thiserror::Error;

/// Core error type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Slot or element index outside of a fixed-size array.
    #[error("Out of bounds: index {index} for {len} slots")]
    OutOfBounds { index: usize, len: usize },

    /// The slot table ran out of addressable indices.
    #[error("Slot table exhausted")]
    Exhausted,
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
