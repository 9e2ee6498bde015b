//! Concurrent writer facade
//!
//! [`ConcurrentWriter`] combines one dedicated write session, an
//! [`UpdateBuffer`], an [`AliasManager`] and a [`SessionPool`] for reads.
//! Writes are buffered and reach the backend through the write session,
//! either on request, when the buffer crosses `auto_flush_buffer_size`, or
//! after `auto_flush_dormant_seconds` without new updates.
//!
//! Lifecycle: `Open -> Closing -> Closed`. Only an open writer accepts
//! writes. `close()` stops the scheduler, flushes what is left, then closes
//! the write session and the pool, in that order.

mod scheduler;

use crate::alias::{rewrite_query, AliasManager, AliasMap};
use crate::buffer::{BufferError, FlushError, FlushErrorHandler, PendingUpdate, UpdateBuffer, UpdateOp};
use crate::config::{ConfigError, OverflowPolicy, ReadConsistency, WriterConfig};
use crate::pool::{PoolError, PoolStats, PooledSession, SessionPool};
use crate::rdf::{Triple, TriplePattern};
use crate::session::{BackendError, QueryLanguage, QueryResults, Session, SessionFactory};
use chrono::{DateTime, Utc};
use crossbeam_channel::bounded;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashSet;
use scheduler::FlushScheduler;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Writer errors
#[derive(Error, Debug)]
pub enum WriterError {
    /// Writer is closing or closed
    #[error("Writer closed")]
    Closed,

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Buffer error: {0}")]
    Buffer(#[from] BufferError),

    #[error("Flush error: {0}")]
    Flush(#[from] FlushError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// The auto-flush thread could not be started
    #[error("Failed to start flush scheduler: {0}")]
    Scheduler(#[source] std::io::Error),
}

pub type WriterResult<T> = Result<T, WriterError>;

/// Writer lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WriterState {
    Open = 0,
    Closing = 1,
    Closed = 2,
}

impl WriterState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => WriterState::Open,
            1 => WriterState::Closing,
            _ => WriterState::Closed,
        }
    }
}

impl fmt::Display for WriterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriterState::Open => write!(f, "open"),
            WriterState::Closing => write!(f, "closing"),
            WriterState::Closed => write!(f, "closed"),
        }
    }
}

/// Per-read options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadOptions {
    /// Maximum number of triples returned
    pub limit: Option<usize>,
    /// Drop duplicate triples, keeping the first occurrence
    pub distinct: bool,
    /// Overrides the writer's configured consistency
    pub consistency: Option<ReadConsistency>,
}

impl ReadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    pub fn with_consistency(mut self, consistency: ReadConsistency) -> Self {
        self.consistency = Some(consistency);
        self
    }

    fn apply(&self, mut triples: Vec<Triple>) -> Vec<Triple> {
        if self.distinct {
            let mut seen = FxHashSet::default();
            triples.retain(|triple| seen.insert(triple.clone()));
        }
        if let Some(limit) = self.limit {
            triples.truncate(limit);
        }
        triples
    }
}

/// Writer counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriterStats {
    pub state: WriterState,
    /// Updates waiting in the buffer
    pub buffered: usize,
    /// Flushes that committed at least one update
    pub flushes: u64,
    /// Updates committed to the backend
    pub flushed_updates: u64,
    /// Flushes stopped by a backend error
    pub failed_flushes: u64,
    /// Completion time of the last successful flush
    pub last_flush_at: Option<DateTime<Utc>>,
    pub pool: PoolStats,
}

/// State shared with the scheduler thread
pub(crate) struct Inner<F: SessionFactory> {
    buffer: UpdateBuffer,
    /// Dedicated write session; the lock doubles as the single-flight flush guard
    write_session: Mutex<Option<F::Session>>,
    state: AtomicU8,
    flushes: AtomicU64,
    flushed_updates: AtomicU64,
    failed_flushes: AtomicU64,
    last_flush_at: Mutex<Option<DateTime<Utc>>>,
}

impl<F: SessionFactory> Inner<F> {
    fn state(&self) -> WriterState {
        WriterState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: WriterState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn flush(&self) -> WriterResult<usize> {
        let mut slot = self.write_session.lock();
        self.flush_with(&mut slot)
    }

    fn flush_with(&self, slot: &mut Option<F::Session>) -> WriterResult<usize> {
        let Some(session) = slot.as_mut() else {
            return if self.buffer.is_empty() {
                Ok(0)
            } else {
                Err(WriterError::Closed)
            };
        };

        match self.buffer.flush(session) {
            Ok(count) => {
                if count > 0 {
                    self.flushes.fetch_add(1, Ordering::SeqCst);
                    self.flushed_updates.fetch_add(count as u64, Ordering::SeqCst);
                    *self.last_flush_at.lock() = Some(Utc::now());
                }
                Ok(count)
            }
            Err(e) => {
                self.failed_flushes.fetch_add(1, Ordering::SeqCst);
                self.flushed_updates.fetch_add(e.flushed as u64, Ordering::SeqCst);
                Err(e.into())
            }
        }
    }

    /// Flush unless one is already running; failures are logged only
    fn background_flush(&self, reason: &str) {
        let Some(mut slot) = self.write_session.try_lock() else {
            debug!("Flush already running, {} trigger coalesced", reason);
            return;
        };
        if self.buffer.is_empty() {
            return;
        }
        match self.flush_with(&mut slot) {
            Ok(count) => debug!("Background flush ({}) committed {} updates", reason, count),
            Err(e) => warn!(
                "Background flush ({}) failed, {} updates remain buffered: {}",
                reason,
                self.buffer.size(),
                e
            ),
        }
    }
}

/// Buffered, pooled access to one backend
pub struct ConcurrentWriter<F: SessionFactory> {
    inner: Arc<Inner<F>>,
    pool: SessionPool<F>,
    aliases: AliasManager,
    config: WriterConfig,
    scheduler: Mutex<FlushScheduler>,
    /// Writers hold it shared while enqueueing; `close` takes it exclusively
    write_gate: RwLock<()>,
    lifecycle: Mutex<()>,
}

impl<F: SessionFactory> ConcurrentWriter<F> {
    /// Validate `config`, open the pool and the write session, and start auto-flush
    pub fn new(config: WriterConfig, factory: F) -> WriterResult<Self> {
        config.validate()?;

        let pool = SessionPool::new(factory, config.pool.clone())?;
        let write_session = match pool.factory().create_session() {
            Ok(session) => session,
            Err(e) => {
                pool.close();
                return Err(e.into());
            }
        };

        let buffer = UpdateBuffer::from_config(&config.buffer);
        let (trigger_tx, trigger_rx) = bounded::<()>(1);
        buffer.set_threshold_listener(
            config.auto_flush_buffer_size,
            Arc::new(move |_| {
                // full channel: a flush is already pending
                let _ = trigger_tx.try_send(());
            }),
        );

        let inner = Arc::new(Inner::<F> {
            buffer,
            write_session: Mutex::new(Some(write_session)),
            state: AtomicU8::new(WriterState::Open as u8),
            flushes: AtomicU64::new(0),
            flushed_updates: AtomicU64::new(0),
            failed_flushes: AtomicU64::new(0),
            last_flush_at: Mutex::new(None),
        });

        let scheduler =
            match FlushScheduler::start(Arc::clone(&inner), trigger_rx, config.dormant_interval()) {
                Ok(scheduler) => scheduler,
                Err(e) => {
                    if let Some(mut session) = inner.write_session.lock().take() {
                        let _ = session.close();
                    }
                    pool.close();
                    return Err(WriterError::Scheduler(e));
                }
            };

        info!(
            "Concurrent writer open (auto flush at {} updates or {}s dormant, safe capacity {})",
            config.auto_flush_buffer_size,
            config.auto_flush_dormant_seconds,
            config.buffer.safe_capacity
        );

        Ok(Self {
            inner,
            pool,
            aliases: AliasManager::with_defaults(),
            config,
            scheduler: Mutex::new(scheduler),
            write_gate: RwLock::new(()),
            lifecycle: Mutex::new(()),
        })
    }

    /// Same as [`new`](Self::new) with the given aliases registered
    pub fn with_aliases(config: WriterConfig, factory: F, aliases: AliasMap) -> WriterResult<Self> {
        let writer = Self::new(config, factory)?;
        writer.aliases.set_aliases(aliases);
        Ok(writer)
    }

    pub fn config(&self) -> &WriterConfig {
        &self.config
    }

    pub fn state(&self) -> WriterState {
        self.inner.state()
    }

    pub fn is_open(&self) -> bool {
        self.state() == WriterState::Open
    }

    /// Pool used for reads
    pub fn pool(&self) -> &SessionPool<F> {
        &self.pool
    }

    // ---- Writes ----

    /// Buffer an ADD; with `flush`, also flush synchronously
    pub fn add(&self, triple: Triple, flush: bool) -> WriterResult<()> {
        self.write(UpdateOp::Add, vec![triple], flush)
    }

    /// Buffer ADDs from a list or stream
    ///
    /// Not atomic: a batch larger than the free space is buffered piecewise.
    /// If this returns an error (an inline flush under
    /// [`OverflowPolicy::FlushInline`] failed, or the writer started closing
    /// while waiting for space), the updates buffered before the error stay
    /// buffered and are flushed later; the rest were not buffered.
    pub fn add_all<I>(&self, triples: I, flush: bool) -> WriterResult<()>
    where
        I: IntoIterator<Item = Triple>,
    {
        self.write(UpdateOp::Add, triples.into_iter().collect(), flush)
    }

    /// Buffer a DELETE; with `flush`, also flush synchronously
    pub fn delete(&self, triple: Triple, flush: bool) -> WriterResult<()> {
        self.write(UpdateOp::Delete, vec![triple], flush)
    }

    /// Buffer DELETEs; partial failure behaves as in [`add_all`](Self::add_all)
    pub fn delete_all<I>(&self, triples: I, flush: bool) -> WriterResult<()>
    where
        I: IntoIterator<Item = Triple>,
    {
        self.write(UpdateOp::Delete, triples.into_iter().collect(), flush)
    }

    fn write(&self, op: UpdateOp, triples: Vec<Triple>, flush: bool) -> WriterResult<()> {
        {
            let _gate = self.write_gate.read();
            if self.state() != WriterState::Open {
                return Err(WriterError::Closed);
            }

            if self.config.buffer.overflow == OverflowPolicy::FlushInline {
                let capacity = self.inner.buffer.safe_capacity();
                for chunk in triples.chunks(capacity) {
                    if self.inner.buffer.size() + chunk.len() > capacity {
                        self.inner.flush()?;
                    }
                    self.enqueue(op, chunk.to_vec())?;
                }
            } else {
                self.enqueue(op, triples)?;
            }
        }

        if flush {
            self.inner.flush()?;
        }
        Ok(())
    }

    fn enqueue(&self, op: UpdateOp, triples: Vec<Triple>) -> WriterResult<usize> {
        let size = match op {
            UpdateOp::Add => self.inner.buffer.add_all(triples)?,
            UpdateOp::Delete => self.inner.buffer.delete_all(triples)?,
        };
        Ok(size)
    }

    /// Flush everything buffered now through the write session
    ///
    /// Idempotent: an empty buffer flushes nothing. The registered
    /// [`FlushErrorHandler`] sees a failure before it is returned here.
    pub fn flush_buffer(&self) -> WriterResult<usize> {
        self.inner.flush()
    }

    /// Updates not yet committed to the backend
    pub fn buffer_size(&self) -> usize {
        self.inner.buffer.size()
    }

    /// Buffered updates of one kind matching `pattern`, in insertion order
    pub fn find_buffered_updates(&self, pattern: &TriplePattern, op: UpdateOp) -> Vec<PendingUpdate> {
        self.inner.buffer.find_buffered_updates(pattern, op)
    }

    pub fn set_flush_error_handler<H>(&self, handler: H)
    where
        H: FlushErrorHandler + 'static,
    {
        self.inner.buffer.set_flush_error_handler(Some(Arc::new(handler)));
    }

    pub fn clear_flush_error_handler(&self) {
        self.inner.buffer.set_flush_error_handler(None);
    }

    // ---- Reads ----

    fn read_session(&self) -> WriterResult<PooledSession<'_, F>> {
        if self.state() == WriterState::Closed {
            return Err(WriterError::Closed);
        }
        Ok(self.pool.borrow()?)
    }

    fn consistency(&self, options: &ReadOptions) -> ReadConsistency {
        options.consistency.unwrap_or(self.config.read_consistency)
    }

    /// Triples matching `pattern`
    ///
    /// Under read-your-writes, buffered updates are replayed over the backend
    /// result in order: an ADD includes a triple, a DELETE masks it.
    pub fn find_triples(&self, pattern: &TriplePattern, options: &ReadOptions) -> WriterResult<Vec<Triple>> {
        // Snapshot before the backend read so a concurrent flush cannot hide an update from both.
        let pending = match self.consistency(options) {
            ReadConsistency::ReadYourWrites => self.inner.buffer.pending_matching(pattern),
            ReadConsistency::Eventual => Vec::new(),
        };

        let mut triples = self.read_session()?.find_triples(pattern)?;
        overlay(&mut triples, pending);
        Ok(options.apply(triples))
    }

    /// Number of triples [`find_triples`](Self::find_triples) would return
    pub fn count_triples(&self, pattern: &TriplePattern, options: &ReadOptions) -> WriterResult<usize> {
        Ok(self.find_triples(pattern, options)?.len())
    }

    /// Triples selected by a language query, after alias rewriting
    ///
    /// Buffered updates are not applied to query results.
    pub fn find_triples_by_query(
        &self,
        language: &QueryLanguage,
        query: &str,
        options: &ReadOptions,
    ) -> WriterResult<Vec<Triple>> {
        let aliases = self.aliases.aliases();
        let query = rewrite_query(query, &aliases);
        let triples = self.read_session()?.find_triples_by_query(language, &query)?;
        Ok(options.apply(triples))
    }

    /// Execute a language query, after alias rewriting
    pub fn query(&self, query: &str, language: &QueryLanguage) -> WriterResult<QueryResults> {
        let aliases = self.aliases.aliases();
        let query = rewrite_query(query, &aliases);
        Ok(self.read_session()?.query(&query, language)?)
    }

    // ---- Aliases ----

    pub fn aliases(&self) -> &AliasManager {
        &self.aliases
    }

    /// Consistent snapshot of the alias map
    pub fn alias_map(&self) -> Arc<AliasMap> {
        self.aliases.aliases()
    }

    /// Replace the whole alias map
    pub fn set_alias_map(&self, map: AliasMap) {
        self.aliases.set_aliases(map);
    }

    pub fn add_alias(&self, prefix: impl Into<String>, uri: impl Into<String>) {
        self.aliases.add_alias(prefix, uri);
    }

    // ---- Lifecycle ----

    pub fn stats(&self) -> WriterStats {
        WriterStats {
            state: self.state(),
            buffered: self.inner.buffer.size(),
            flushes: self.inner.flushes.load(Ordering::SeqCst),
            flushed_updates: self.inner.flushed_updates.load(Ordering::SeqCst),
            failed_flushes: self.inner.failed_flushes.load(Ordering::SeqCst),
            last_flush_at: *self.inner.last_flush_at.lock(),
            pool: self.pool.stats(),
        }
    }

    /// Flush what is buffered, then close the write session and the pool
    ///
    /// If the final flush fails the writer stays `Closing` with the unflushed
    /// updates still buffered, and `close` may be called again.
    pub fn close(&self) -> WriterResult<()> {
        let _lifecycle = self.lifecycle.lock();
        match self.state() {
            WriterState::Closed => return Ok(()),
            WriterState::Open => {
                // Producers waiting for space fail instead of holding the gate.
                self.inner.set_state(WriterState::Closing);
                self.inner.buffer.reject_waiters();
                drop(self.write_gate.write());
                info!("Closing concurrent writer ({} updates buffered)", self.buffer_size());
            }
            WriterState::Closing => {}
        }

        self.scheduler.lock().stop();

        let mut slot = self.inner.write_session.lock();
        match self.inner.flush_with(&mut slot) {
            Ok(count) => info!("Final flush committed {} updates", count),
            Err(e) => {
                error!(
                    "Final flush failed, {} updates remain buffered: {}",
                    self.inner.buffer.size(),
                    e
                );
                return Err(e);
            }
        }

        if let Some(mut session) = slot.take() {
            if let Err(e) = session.close() {
                warn!("Failed to close write session: {}", e);
            }
        }
        drop(slot);

        self.pool.close();
        self.inner.buffer.close();
        self.inner.set_state(WriterState::Closed);
        info!("Concurrent writer closed");
        Ok(())
    }

    /// Release every resource, discarding what is still buffered
    fn abort(&self) {
        self.scheduler.lock().stop();
        if let Some(mut session) = self.inner.write_session.lock().take() {
            let _ = session.close();
        }
        self.pool.close();
        self.inner.buffer.close();
        self.inner.set_state(WriterState::Closed);
    }
}

impl<F: SessionFactory> Drop for ConcurrentWriter<F> {
    fn drop(&mut self) {
        if self.state() == WriterState::Closed {
            return;
        }
        if let Err(e) = self.close() {
            error!(
                "Writer dropped with {} unflushed updates: {}",
                self.inner.buffer.size(),
                e
            );
            self.abort();
        }
    }
}

impl<F: SessionFactory> fmt::Debug for ConcurrentWriter<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrentWriter")
            .field("state", &self.state())
            .field("buffered", &self.buffer_size())
            .field("scheduler_running", &self.scheduler.lock().is_running())
            .field("pool", &self.pool)
            .finish()
    }
}

/// Replay buffered updates over a backend result
fn overlay(triples: &mut Vec<Triple>, pending: Vec<PendingUpdate>) {
    if pending.is_empty() {
        return;
    }

    // Set semantics make the last update of each triple decide its presence.
    let mut last_op: IndexMap<Triple, UpdateOp> = IndexMap::new();
    for update in pending {
        last_op.insert(update.triple, update.op);
    }

    triples.retain(|triple| last_op.get(triple) != Some(&UpdateOp::Delete));
    let present: FxHashSet<Triple> = triples.iter().cloned().collect();
    for (triple, op) in last_op {
        if op == UpdateOp::Add && !present.contains(&triple) {
            triples.push(triple);
        }
    }
}
