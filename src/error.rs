//! Crate-level error

use crate::alias::AliasError;
use crate::buffer::{BufferError, FlushError};
use crate::config::ConfigError;
use crate::pool::PoolError;
use crate::rdf::RdfError;
use crate::session::BackendError;
use crate::writer::WriterError;
use thiserror::Error;

/// Any error raised by this crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("RDF error: {0}")]
    Rdf(#[from] RdfError),

    #[error("Alias error: {0}")]
    Alias(#[from] AliasError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Buffer error: {0}")]
    Buffer(#[from] BufferError),

    #[error("Flush error: {0}")]
    Flush(#[from] FlushError),

    #[error("Writer error: {0}")]
    Writer(#[from] WriterError),
}

pub type Result<T> = std::result::Result<T, Error>;
