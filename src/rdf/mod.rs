//! RDF value types and an in-memory triple store
//!
//! # Example
//!
//! ```rust
//! use triplegate::rdf::{Literal, NamedNode, RdfPredicate, Triple, TriplePattern, TripleStore};
//!
//! let mut store = TripleStore::new();
//!
//! let subject = NamedNode::new("http://example.org/alice").unwrap();
//! let predicate = RdfPredicate::new("http://xmlns.com/foaf/0.1/name").unwrap();
//! let triple = Triple::new(subject.clone(), predicate, Literal::new_simple_literal("Alice"));
//! store.insert(triple);
//!
//! let results = store.query(&TriplePattern::new(Some(subject.into()), None, None));
//! assert_eq!(results.len(), 1);
//! ```

mod store;
mod types;

pub use store::TripleStore;
pub use types::{
    BlankNode, Literal, NamedNode, RdfError, RdfObject, RdfPredicate, RdfResult, RdfSubject,
    Triple, TriplePattern,
};
