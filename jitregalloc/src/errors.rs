use thiserror::Error;

/// Errors an allocator can report to its caller.
///
/// Breaches of the allocators' own invariants are bugs and panic instead.
#[derive(Error, Debug)]
pub enum RegAllocError {
    #[error("Malformed IR: {0}")]
    MalformedIR(String),
    #[error("Invalid configuration: {0}")]
    Config(String),
}
