//! Backend session capability
//!
//! A session is a live handle to one triplestore. Each vendor backend
//! implements [`Session`] and a [`SessionFactory`] that opens sessions; the
//! pool, the update buffer and the writer are generic over these traits only.

pub mod memory;

pub use memory::{MemoryBackend, MemorySession};

use crate::rdf::{RdfObject, Triple, TriplePattern};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors raised by a backend session. Never retried by this crate.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// Store cannot be reached
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// Query language not supported by this backend
    #[error("Unsupported query language: {0}")]
    UnsupportedLanguage(QueryLanguage),

    /// Query text could not be parsed
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// Store refused a mutation
    #[error("Update rejected: {0}")]
    Rejected(String),

    /// Session was already closed
    #[error("Session closed")]
    SessionClosed,

    /// Any other backend failure
    #[error("Backend error: {0}")]
    Other(String),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Query languages a backend may understand
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueryLanguage {
    /// SPARQL 1.1
    Sparql,
    /// RDQL
    Rdql,
    /// A single whitespace-separated triple pattern
    TriplePattern,
    /// Vendor-specific language
    Other(String),
}

impl fmt::Display for QueryLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryLanguage::Sparql => write!(f, "sparql"),
            QueryLanguage::Rdql => write!(f, "rdql"),
            QueryLanguage::TriplePattern => write!(f, "triple-pattern"),
            QueryLanguage::Other(name) => write!(f, "{}", name),
        }
    }
}

impl FromStr for QueryLanguage {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "sparql" => QueryLanguage::Sparql,
            "rdql" => QueryLanguage::Rdql,
            "triple-pattern" | "pattern" => QueryLanguage::TriplePattern,
            other => QueryLanguage::Other(other.to_string()),
        })
    }
}

/// Result of a language query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryResults {
    /// Variable bindings, one row per solution (`None` = unbound)
    Bindings {
        variables: Vec<String>,
        rows: Vec<Vec<Option<RdfObject>>>,
    },
    /// Graph result
    Triples(Vec<Triple>),
    /// ASK-style result
    Boolean(bool),
}

impl QueryResults {
    /// Number of rows, triples, or 1 for a boolean
    pub fn len(&self) -> usize {
        match self {
            QueryResults::Bindings { rows, .. } => rows.len(),
            QueryResults::Triples(triples) => triples.len(),
            QueryResults::Boolean(_) => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Live handle to a backend triplestore
///
/// `add` and `delete` are expected to be transactional per call.
pub trait Session: Send {
    /// Triples matching a pattern (absent fields are wildcards)
    fn find_triples(&mut self, pattern: &TriplePattern) -> BackendResult<Vec<Triple>>;

    /// Triples selected by a language-specific query
    fn find_triples_by_query(
        &mut self,
        language: &QueryLanguage,
        query: &str,
    ) -> BackendResult<Vec<Triple>>;

    /// Execute a language-specific query
    fn query(&mut self, query: &str, language: &QueryLanguage) -> BackendResult<QueryResults>;

    /// Add triples in one backend call
    fn add(&mut self, triples: &[Triple]) -> BackendResult<()>;

    /// Delete triples in one backend call
    fn delete(&mut self, triples: &[Triple]) -> BackendResult<()>;

    /// Release backend-native resources
    fn close(&mut self) -> BackendResult<()>;
}

/// Opens sessions against one backend
pub trait SessionFactory: Send + Sync + 'static {
    type Session: Session + 'static;

    fn create_session(&self) -> BackendResult<Self::Session>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_language_names() {
        assert_eq!("SPARQL".parse::<QueryLanguage>().unwrap(), QueryLanguage::Sparql);
        assert_eq!("pattern".parse::<QueryLanguage>().unwrap(), QueryLanguage::TriplePattern);
        assert_eq!(
            "serql".parse::<QueryLanguage>().unwrap(),
            QueryLanguage::Other("serql".to_string())
        );
        assert_eq!(QueryLanguage::TriplePattern.to_string(), "triple-pattern");
    }

    #[test]
    fn test_query_results_len() {
        assert_eq!(QueryResults::Boolean(false).len(), 1);
        assert!(QueryResults::Triples(Vec::new()).is_empty());
        let bindings = QueryResults::Bindings {
            variables: vec!["s".to_string()],
            rows: vec![vec![None], vec![None]],
        };
        assert_eq!(bindings.len(), 2);
    }
}
