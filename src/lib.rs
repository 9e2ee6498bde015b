//! Triplegate
//!
//! Vendor-neutral access layer for RDF triplestores. Backends differ in query
//! language, transaction model and client API; this crate puts a uniform
//! read/write facade in front of them and handles the concurrency between
//! callers and a backend session:
//!
//! - [`UpdateBuffer`]: thread-safe staging of ADD/DELETE updates, flushed to
//!   the backend in order and in bounded batches
//! - [`SessionPool`]: elastic pool of read sessions
//! - [`ConcurrentWriter`]: the facade, with background auto-flush on buffer
//!   size and dormancy, read-your-writes pattern reads and an ordered close
//! - [`AliasManager`]: prefix to namespace mapping used to rewrite queries
//!
//! A backend plugs in by implementing [`Session`] and [`SessionFactory`].
//! [`MemoryBackend`] is the in-process reference implementation.
//!
//! ## Example Usage
//!
//! ```rust
//! use triplegate::{
//!     ConcurrentWriter, Literal, MemoryBackend, NamedNode, RdfPredicate, ReadOptions, Triple,
//!     TriplePattern, WriterConfig,
//! };
//!
//! let backend = MemoryBackend::new();
//! let writer = ConcurrentWriter::new(WriterConfig::default(), backend.clone()).unwrap();
//!
//! let alice = Triple::new(
//!     NamedNode::new("http://example.org/alice").unwrap(),
//!     RdfPredicate::new("http://xmlns.com/foaf/0.1/name").unwrap(),
//!     Literal::new_simple_literal("Alice"),
//! );
//! writer.add(alice.clone(), false).unwrap();
//!
//! // Buffered, but already visible to pattern reads
//! let found = writer.find_triples(&TriplePattern::any(), &ReadOptions::new()).unwrap();
//! assert_eq!(found, vec![alice.clone()]);
//!
//! writer.close().unwrap();
//! assert!(backend.contains(&alice));
//! ```

#![allow(missing_docs)]
#![warn(clippy::all)]

pub mod alias;
pub mod buffer;
pub mod config;
pub mod error;
pub mod pool;
pub mod rdf;
pub mod session;
pub mod writer;

// Re-export main types for convenience
pub use alias::{rewrite_query, AliasError, AliasManager, AliasMap, AliasResult};

pub use buffer::{
    BufferError, BufferResult, FlushError, FlushErrorHandler, FlushResult, PendingUpdate,
    UpdateBuffer, UpdateOp,
};

pub use config::{
    BufferConfig, ConfigError, ConfigResult, OverflowPolicy, PoolConfig, ReadConsistency,
    WriterConfig,
};

pub use error::{Error, Result};

pub use pool::{PoolError, PoolResult, PoolStats, PooledSession, SessionPool};

pub use rdf::{
    BlankNode, Literal, NamedNode, RdfError, RdfObject, RdfPredicate, RdfResult, RdfSubject,
    Triple, TriplePattern, TripleStore,
};

pub use session::{
    BackendError, BackendResult, MemoryBackend, MemorySession, QueryLanguage, QueryResults,
    Session, SessionFactory,
};

pub use writer::{
    ConcurrentWriter, ReadOptions, WriterError, WriterResult, WriterState, WriterStats,
};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get version string
pub fn version() -> &'static str {
    VERSION
}
