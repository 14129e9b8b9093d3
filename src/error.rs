//! Error taxonomy.
//!
//! Library code never panics or unwraps outside tests; every fallible
//! operation returns one of these. The Tracer's trap handler is the one
//! exception noted throughout this crate. It cannot allocate, so it
//! reports "handled/not handled" directly rather than through `Result`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuilderError {
    #[error("failed to read input image: {0}")]
    Io(#[from] std::io::Error),

    #[error("section {name:?} not found in image")]
    SectionNotFound { name: String },

    #[error("malformed PE image: {0}")]
    MalformedImage(#[from] goblin::error::Error),

    #[error("failed to attach nanomite resource to image: {0}")]
    ResourceAttach(String),

    #[error("nanomite table serialization failed: {0}")]
    TableEncoding(#[from] scroll::Error),
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("nanomite resource not found in running image")]
    ResourceMissing,

    #[error("protected section {name:?} not found in running image")]
    SectionMissing { name: String },

    #[error("nanomite table layout mismatch: {0}")]
    EnvelopeMismatch(#[from] scroll::Error),

    #[error("tracing is not supported on this platform")]
    UnsupportedPlatform,
}
