//! Prefix aliases for compact IRI notation
//!
//! The alias map is read by every in-flight query and may be replaced at any
//! time. Readers take an `Arc` snapshot, writers build a new map and swap it in,
//! so a single query never observes a half-updated mapping.

mod rewrite;

pub use rewrite::rewrite_query;

use indexmap::IndexMap;
use parking_lot::RwLock;
use std::sync::Arc;
use thiserror::Error;

/// Alias errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AliasError {
    /// Unknown prefix
    #[error("Unknown prefix: {0}")]
    UnknownPrefix(String),

    /// Not of the form `prefix:local`
    #[error("Invalid compact IRI: {0}")]
    InvalidCurie(String),
}

pub type AliasResult<T> = Result<T, AliasError>;

/// Insertion-ordered prefix -> namespace URI mapping
pub type AliasMap = IndexMap<String, String>;

/// Copy-on-write holder of the alias map
#[derive(Debug, Default)]
pub struct AliasManager {
    current: RwLock<Arc<AliasMap>>,
}

impl AliasManager {
    /// Create an empty alias manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an alias manager with the common RDF/RDFS/OWL prefixes
    pub fn with_defaults() -> Self {
        let mut map = AliasMap::new();
        for (prefix, uri) in [
            ("rdf", "http://www.w3.org/1999/02/22-rdf-syntax-ns#"),
            ("rdfs", "http://www.w3.org/2000/01/rdf-schema#"),
            ("xsd", "http://www.w3.org/2001/XMLSchema#"),
            ("owl", "http://www.w3.org/2002/07/owl#"),
            ("foaf", "http://xmlns.com/foaf/0.1/"),
            ("dc", "http://purl.org/dc/elements/1.1/"),
            ("dcterms", "http://purl.org/dc/terms/"),
        ] {
            map.insert(prefix.to_string(), uri.to_string());
        }
        Self::from_map(map)
    }

    /// Create an alias manager holding `map`
    pub fn from_map(map: AliasMap) -> Self {
        Self {
            current: RwLock::new(Arc::new(map)),
        }
    }

    /// Consistent snapshot of the current aliases
    pub fn aliases(&self) -> Arc<AliasMap> {
        Arc::clone(&self.current.read())
    }

    /// Add or replace a single alias
    pub fn add_alias(&self, prefix: impl Into<String>, uri: impl Into<String>) {
        let mut current = self.current.write();
        let mut next = AliasMap::clone(&current);
        next.insert(prefix.into(), uri.into());
        *current = Arc::new(next);
    }

    /// Remove an alias, returning its namespace if it was present
    pub fn remove_alias(&self, prefix: &str) -> Option<String> {
        let mut current = self.current.write();
        if !current.contains_key(prefix) {
            return None;
        }
        let mut next = AliasMap::clone(&current);
        let removed = next.shift_remove(prefix);
        *current = Arc::new(next);
        removed
    }

    /// Replace the whole mapping at once
    pub fn set_aliases(&self, map: AliasMap) {
        *self.current.write() = Arc::new(map);
    }

    /// Expand a compact IRI (`prefix:local`) to a full IRI
    pub fn expand(&self, curie: &str) -> AliasResult<String> {
        let (prefix, local) = curie
            .split_once(':')
            .ok_or_else(|| AliasError::InvalidCurie(curie.to_string()))?;
        let aliases = self.aliases();
        let namespace = aliases
            .get(prefix)
            .ok_or_else(|| AliasError::UnknownPrefix(prefix.to_string()))?;
        Ok(format!("{}{}", namespace, local))
    }

    /// Compact an IRI using the longest matching namespace
    pub fn compact(&self, iri: &str) -> Option<String> {
        let aliases = self.aliases();
        aliases
            .iter()
            .filter(|(_, namespace)| iri.starts_with(namespace.as_str()))
            .max_by_key(|(_, namespace)| namespace.len())
            .map(|(prefix, namespace)| format!("{}:{}", prefix, &iri[namespace.len()..]))
    }
}
