//! In-memory reference backend
//!
//! All sessions opened from one [`MemoryBackend`] share a single
//! [`TripleStore`]. Besides being a usable store for embedding and demos, the
//! backend can slow down or fail its writes on request, which is how the
//! buffering layer's failure and concurrency behaviour is exercised.

use super::{BackendError, BackendResult, QueryLanguage, QueryResults, Session, SessionFactory};
use crate::buffer::UpdateOp;
use crate::rdf::{
    BlankNode, Literal, NamedNode, RdfObject, RdfPredicate, RdfSubject, Triple, TriplePattern,
    TripleStore,
};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Default)]
struct Behaviour {
    write_delay: Mutex<Duration>,
    failing_writes: AtomicUsize,
    always_fail_writes: AtomicBool,
    refuse_sessions: AtomicBool,
}

#[derive(Debug, Default)]
struct Counters {
    sessions_opened: AtomicUsize,
    sessions_closed: AtomicUsize,
    write_log: Mutex<Vec<(UpdateOp, Vec<Triple>)>>,
}

/// Shared in-memory store and session factory
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    store: Arc<RwLock<TripleStore>>,
    behaviour: Arc<Behaviour>,
    counters: Arc<Counters>,
}

impl MemoryBackend {
    /// Create an empty backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a session directly (same as [`SessionFactory::create_session`])
    pub fn session(&self) -> MemorySession {
        self.counters.sessions_opened.fetch_add(1, Ordering::SeqCst);
        MemorySession {
            backend: self.clone(),
            closed: false,
        }
    }

    /// Number of stored triples
    pub fn len(&self) -> usize {
        self.store.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.read().is_empty()
    }

    /// Check if a triple is stored
    pub fn contains(&self, triple: &Triple) -> bool {
        self.store.read().contains(triple)
    }

    /// Snapshot of all stored triples in insertion order
    pub fn triples(&self) -> Vec<Triple> {
        self.store.read().iter().cloned().collect()
    }

    /// Delay every subsequent `add`/`delete` call by `delay`
    pub fn set_write_delay(&self, delay: Duration) {
        *self.behaviour.write_delay.lock() = delay;
    }

    /// Make the next `count` write calls fail with [`BackendError::Rejected`]
    pub fn fail_next_writes(&self, count: usize) {
        self.behaviour.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Make every write call fail until switched off
    pub fn set_fail_writes(&self, fail: bool) {
        self.behaviour.always_fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Refuse to open new sessions
    pub fn set_refuse_sessions(&self, refuse: bool) {
        self.behaviour.refuse_sessions.store(refuse, Ordering::SeqCst);
    }

    pub fn sessions_opened(&self) -> usize {
        self.counters.sessions_opened.load(Ordering::SeqCst)
    }

    pub fn sessions_closed(&self) -> usize {
        self.counters.sessions_closed.load(Ordering::SeqCst)
    }

    /// Every successful write call, in the order the store applied them
    pub fn write_log(&self) -> Vec<(UpdateOp, Vec<Triple>)> {
        self.counters.write_log.lock().clone()
    }

    fn apply(&self, op: UpdateOp, triples: &[Triple]) -> BackendResult<()> {
        let delay = *self.behaviour.write_delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        if self.behaviour.always_fail_writes.load(Ordering::SeqCst) {
            return Err(BackendError::Rejected(format!("{} of {} triples", op, triples.len())));
        }
        let injected = self
            .behaviour
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(BackendError::Rejected(format!("{} of {} triples", op, triples.len())));
        }

        let mut store = self.store.write();
        for triple in triples {
            match op {
                UpdateOp::Add => {
                    store.insert(triple.clone());
                }
                UpdateOp::Delete => {
                    store.remove(triple);
                }
            }
        }
        self.counters.write_log.lock().push((op, triples.to_vec()));
        debug!("memory backend applied {} of {} triples", op, triples.len());
        Ok(())
    }
}

impl SessionFactory for MemoryBackend {
    type Session = MemorySession;

    fn create_session(&self) -> BackendResult<MemorySession> {
        if self.behaviour.refuse_sessions.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("memory backend refuses sessions".to_string()));
        }
        Ok(self.session())
    }
}

/// Session on a [`MemoryBackend`]
#[derive(Debug)]
pub struct MemorySession {
    backend: MemoryBackend,
    closed: bool,
}

impl MemorySession {
    fn ensure_open(&self) -> BackendResult<()> {
        if self.closed {
            Err(BackendError::SessionClosed)
        } else {
            Ok(())
        }
    }

    fn pattern_matches(
        &self,
        language: &QueryLanguage,
        query: &str,
    ) -> BackendResult<(ParsedPattern, Vec<Triple>)> {
        self.ensure_open()?;
        if *language != QueryLanguage::TriplePattern {
            return Err(BackendError::UnsupportedLanguage(language.clone()));
        }
        let parsed = ParsedPattern::parse(query)?;
        let triples = self
            .backend
            .store
            .read()
            .query(&parsed.pattern)
            .into_iter()
            .filter(|triple| parsed.bind(triple).is_some())
            .collect();
        Ok((parsed, triples))
    }
}

impl Session for MemorySession {
    fn find_triples(&mut self, pattern: &TriplePattern) -> BackendResult<Vec<Triple>> {
        self.ensure_open()?;
        Ok(self.backend.store.read().query(pattern))
    }

    fn find_triples_by_query(
        &mut self,
        language: &QueryLanguage,
        query: &str,
    ) -> BackendResult<Vec<Triple>> {
        self.pattern_matches(language, query).map(|(_, triples)| triples)
    }

    fn query(&mut self, query: &str, language: &QueryLanguage) -> BackendResult<QueryResults> {
        let (parsed, triples) = self.pattern_matches(language, query)?;
        if parsed.variables.is_empty() {
            return Ok(QueryResults::Boolean(!triples.is_empty()));
        }
        let rows = triples
            .iter()
            .filter_map(|triple| parsed.bind(triple))
            .collect();
        Ok(QueryResults::Bindings {
            variables: parsed.variables,
            rows,
        })
    }

    fn add(&mut self, triples: &[Triple]) -> BackendResult<()> {
        self.ensure_open()?;
        self.backend.apply(UpdateOp::Add, triples)
    }

    fn delete(&mut self, triples: &[Triple]) -> BackendResult<()> {
        self.ensure_open()?;
        self.backend.apply(UpdateOp::Delete, triples)
    }

    fn close(&mut self) -> BackendResult<()> {
        if !self.closed {
            self.closed = true;
            self.backend.counters.sessions_closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Position term of a parsed pattern query
#[derive(Debug, Clone)]
enum PatternTerm {
    Variable(String),
    Fixed(RdfObject),
}

/// `s p o [.]` pattern query with its variables in order of first appearance
#[derive(Debug)]
struct ParsedPattern {
    pattern: TriplePattern,
    terms: [PatternTerm; 3],
    variables: Vec<String>,
}

impl ParsedPattern {
    fn parse(query: &str) -> BackendResult<Self> {
        let mut tokens = tokenize(query)?;
        if tokens.last().map(String::as_str) == Some(".") {
            tokens.pop();
        }
        if tokens.len() != 3 {
            return Err(BackendError::InvalidQuery(format!(
                "expected 3 terms, found {}: {}",
                tokens.len(),
                query.trim()
            )));
        }

        let subject = parse_term(&tokens[0])?;
        let predicate = parse_term(&tokens[1])?;
        let object = parse_term(&tokens[2])?;

        let pattern = TriplePattern::new(
            match &subject {
                PatternTerm::Variable(_) => None,
                PatternTerm::Fixed(RdfObject::NamedNode(n)) => Some(RdfSubject::NamedNode(n.clone())),
                PatternTerm::Fixed(RdfObject::BlankNode(b)) => Some(RdfSubject::BlankNode(b.clone())),
                PatternTerm::Fixed(RdfObject::Literal(_)) => {
                    return Err(BackendError::InvalidQuery("literal in subject position".to_string()))
                }
            },
            match &predicate {
                PatternTerm::Variable(_) => None,
                PatternTerm::Fixed(RdfObject::NamedNode(n)) => Some(RdfPredicate::from(n.clone())),
                PatternTerm::Fixed(_) => {
                    return Err(BackendError::InvalidQuery("predicate must be an IRI".to_string()))
                }
            },
            match &object {
                PatternTerm::Variable(_) => None,
                PatternTerm::Fixed(term) => Some(term.clone()),
            },
        );

        let mut variables = Vec::new();
        for term in [&subject, &predicate, &object] {
            if let PatternTerm::Variable(name) = term {
                if !variables.contains(name) {
                    variables.push(name.clone());
                }
            }
        }

        Ok(Self {
            pattern,
            terms: [subject, predicate, object],
            variables,
        })
    }

    /// Bind variables against a triple; `None` if a repeated variable disagrees
    fn bind(&self, triple: &Triple) -> Option<Vec<Option<RdfObject>>> {
        let values = [
            RdfObject::from(triple.subject.clone()),
            RdfObject::from(triple.predicate.as_named_node().clone()),
            triple.object.clone(),
        ];
        let mut row: Vec<Option<RdfObject>> = vec![None; self.variables.len()];
        for (term, value) in self.terms.iter().zip(values) {
            if let PatternTerm::Variable(name) = term {
                let idx = self.variables.iter().position(|v| v == name)?;
                if let Some(bound) = &row[idx] {
                    if *bound != value {
                        return None;
                    }
                    continue;
                }
                row[idx] = Some(value);
            }
        }
        Some(row)
    }
}

fn tokenize(query: &str) -> BackendResult<Vec<String>> {
    let mut tokens = Vec::new();
    let mut chars = query.trim().chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        let mut token = String::new();
        if c == '"' {
            token.push(c);
            chars.next();
            let mut closed = false;
            while let Some(c) = chars.next() {
                token.push(c);
                if c == '\\' {
                    if let Some(escaped) = chars.next() {
                        token.push(escaped);
                    }
                } else if c == '"' {
                    closed = true;
                    break;
                }
            }
            if !closed {
                return Err(BackendError::InvalidQuery("unterminated literal".to_string()));
            }
        }
        while let Some(&c) = chars.peek() {
            if c.is_whitespace() {
                break;
            }
            token.push(c);
            chars.next();
        }
        tokens.push(token);
    }
    Ok(tokens)
}

fn parse_term(token: &str) -> BackendResult<PatternTerm> {
    let invalid = |e: crate::rdf::RdfError| BackendError::InvalidQuery(e.to_string());

    if let Some(name) = token.strip_prefix('?') {
        if name.is_empty() {
            return Err(BackendError::InvalidQuery("empty variable name".to_string()));
        }
        return Ok(PatternTerm::Variable(name.to_string()));
    }
    if let Some(iri) = token.strip_prefix('<').and_then(|t| t.strip_suffix('>')) {
        return Ok(PatternTerm::Fixed(NamedNode::new(iri).map_err(invalid)?.into()));
    }
    if let Some(id) = token.strip_prefix("_:") {
        return Ok(PatternTerm::Fixed(BlankNode::with_id(id).map_err(invalid)?.into()));
    }
    if token.starts_with('"') {
        let end = token[1..]
            .rfind('"')
            .map(|idx| idx + 1)
            .ok_or_else(|| BackendError::InvalidQuery(format!("bad literal: {}", token)))?;
        let value = token[1..end].replace("\\\"", "\"").replace("\\\\", "\\");
        let suffix = &token[end + 1..];
        let literal = if let Some(lang) = suffix.strip_prefix('@') {
            Literal::new_language_tagged_literal(value, lang).map_err(invalid)?
        } else if let Some(datatype) = suffix
            .strip_prefix("^^<")
            .and_then(|t| t.strip_suffix('>'))
        {
            Literal::new_typed_literal(value, NamedNode::new(datatype).map_err(invalid)?)
        } else if suffix.is_empty() {
            Literal::new_simple_literal(value)
        } else {
            return Err(BackendError::InvalidQuery(format!("bad literal suffix: {}", suffix)));
        };
        return Ok(PatternTerm::Fixed(literal.into()));
    }
    Err(BackendError::InvalidQuery(format!("unrecognised term: {}", token)))
}
