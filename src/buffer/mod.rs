//! Update buffer
//!
//! Staging area for pending ADD/DELETE operations. Producers append to the
//! tail under a short critical section; a flush copies a batch from the head,
//! releases the lock for the backend I/O, and only removes entries once the
//! backend has accepted them. A failed backend call therefore leaves the
//! unflushed tail intact.
//!
//! ```text
//!   producers ──append──▶ [ u1 u2 u3 u4 u5 u6 ... ] ◀── size() / find
//!                           └─ batch ─┘
//!                              │ copy (lock held briefly)
//!                              ▼
//!                  add(run) / delete(run)   (no lock held)
//!                              │ ok
//!                              ▼
//!                     pop committed run from head
//! ```

use crate::config::{BufferConfig, OverflowPolicy};
use crate::rdf::{Triple, TriplePattern};
use crate::session::{BackendError, Session};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, warn};

/// Buffer errors raised to producers
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    /// Buffer is at its safe capacity and the overflow policy rejects
    #[error("Buffer at safe capacity ({capacity} updates)")]
    CapacityExceeded { capacity: usize },

    /// Buffer was closed
    #[error("Buffer closed")]
    Closed,
}

pub type BufferResult<T> = Result<T, BufferError>;

/// A backend call failed during flush
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Flush failed after {flushed} committed updates: {source}")]
pub struct FlushError {
    /// Updates committed by earlier backend calls of the same flush
    pub flushed: usize,
    /// Backend failure
    #[source]
    pub source: BackendError,
}

impl FlushError {
    /// The backend failure that stopped the flush
    pub fn cause(&self) -> &BackendError {
        &self.source
    }
}

pub type FlushResult<T> = Result<T, FlushError>;

/// Kind of buffered mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateOp {
    Add,
    Delete,
}

impl fmt::Display for UpdateOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateOp::Add => write!(f, "add"),
            UpdateOp::Delete => write!(f, "delete"),
        }
    }
}

/// One buffered mutation. Immutable once enqueued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingUpdate {
    pub op: UpdateOp,
    pub triple: Triple,
}

impl PendingUpdate {
    pub fn new(op: UpdateOp, triple: Triple) -> Self {
        Self { op, triple }
    }

    pub fn add(triple: Triple) -> Self {
        Self::new(UpdateOp::Add, triple)
    }

    pub fn delete(triple: Triple) -> Self {
        Self::new(UpdateOp::Delete, triple)
    }
}

/// Receives every backend failure during flush, with the updates of the failed call
pub trait FlushErrorHandler: Send + Sync {
    fn on_flush_error(&self, batch: &[PendingUpdate], error: &BackendError);
}

impl<F> FlushErrorHandler for F
where
    F: Fn(&[PendingUpdate], &BackendError) + Send + Sync,
{
    fn on_flush_error(&self, batch: &[PendingUpdate], error: &BackendError) {
        self(batch, error)
    }
}

/// Called with the buffer size when it reaches the threshold or a producer must wait
pub type ThresholdListener = Arc<dyn Fn(usize) + Send + Sync>;

struct BufferState {
    entries: VecDeque<PendingUpdate>,
    closed: bool,
    /// Set by `reject_waiters`; producers that would wait fail instead
    rejecting: bool,
    /// Bumped by `close`; a flush never pops entries from another epoch
    epoch: u64,
    last_append: Instant,
}

/// Thread-safe FIFO of pending updates
pub struct UpdateBuffer {
    state: Mutex<BufferState>,
    /// Signalled whenever committed entries leave the buffer
    space: Condvar,
    /// Serializes flushes; never taken by producers
    flush_lock: Mutex<()>,
    safe_capacity: usize,
    flush_batch_size: usize,
    overflow: OverflowPolicy,
    handler: RwLock<Option<Arc<dyn FlushErrorHandler>>>,
    listener: RwLock<Option<(usize, ThresholdListener)>>,
}

impl UpdateBuffer {
    /// Create a blocking buffer with the given ceiling and batch size
    pub fn new(safe_capacity: usize, flush_batch_size: usize) -> Self {
        Self::with_policy(safe_capacity, flush_batch_size, OverflowPolicy::Block)
    }

    pub fn with_policy(safe_capacity: usize, flush_batch_size: usize, overflow: OverflowPolicy) -> Self {
        Self {
            state: Mutex::new(BufferState {
                entries: VecDeque::new(),
                closed: false,
                rejecting: false,
                epoch: 0,
                last_append: Instant::now(),
            }),
            space: Condvar::new(),
            flush_lock: Mutex::new(()),
            safe_capacity: safe_capacity.max(1),
            flush_batch_size: flush_batch_size.max(1),
            overflow,
            handler: RwLock::new(None),
            listener: RwLock::new(None),
        }
    }

    pub fn from_config(config: &BufferConfig) -> Self {
        Self::with_policy(config.safe_capacity, config.flush_batch_size, config.overflow)
    }

    /// Configured ceiling; immutable after construction
    pub fn safe_capacity(&self) -> usize {
        self.safe_capacity
    }

    pub fn flush_batch_size(&self) -> usize {
        self.flush_batch_size
    }

    /// Number of updates not yet committed to the backend
    pub fn size(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// True when a producer would have to wait or be rejected
    pub fn is_full(&self) -> bool {
        self.size() >= self.safe_capacity
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Time since the last append
    pub fn idle_for(&self) -> Duration {
        self.state.lock().last_append.elapsed()
    }

    /// Replace the flush error handler
    pub fn set_flush_error_handler(&self, handler: Option<Arc<dyn FlushErrorHandler>>) {
        *self.handler.write() = handler;
    }

    /// Register a listener fired when the size reaches `threshold`
    pub fn set_threshold_listener(&self, threshold: usize, listener: ThresholdListener) {
        *self.listener.write() = Some((threshold, listener));
    }

    /// Buffer one ADD; returns the buffer size afterwards
    pub fn add(&self, triple: Triple) -> BufferResult<usize> {
        self.enqueue(UpdateOp::Add, std::iter::once(triple))
    }

    /// Buffer one DELETE; returns the buffer size afterwards
    pub fn delete(&self, triple: Triple) -> BufferResult<usize> {
        self.enqueue(UpdateOp::Delete, std::iter::once(triple))
    }

    pub fn add_all<I>(&self, triples: I) -> BufferResult<usize>
    where
        I: IntoIterator<Item = Triple>,
    {
        self.enqueue(UpdateOp::Add, triples)
    }

    pub fn delete_all<I>(&self, triples: I) -> BufferResult<usize>
    where
        I: IntoIterator<Item = Triple>,
    {
        self.enqueue(UpdateOp::Delete, triples)
    }

    fn enqueue<I>(&self, op: UpdateOp, triples: I) -> BufferResult<usize>
    where
        I: IntoIterator<Item = Triple>,
    {
        let triples: Vec<Triple> = triples.into_iter().collect();
        let mut state = self.state.lock();
        if state.closed {
            return Err(BufferError::Closed);
        }
        if triples.is_empty() {
            return Ok(state.entries.len());
        }

        if self.overflow == OverflowPolicy::Reject
            && state.entries.len() + triples.len() > self.safe_capacity
        {
            return Err(BufferError::CapacityExceeded {
                capacity: self.safe_capacity,
            });
        }

        let mut pending = triples.into_iter().peekable();
        loop {
            while state.entries.len() < self.safe_capacity {
                match pending.next() {
                    Some(triple) => state.entries.push_back(PendingUpdate::new(op, triple)),
                    None => break,
                }
            }
            state.last_append = Instant::now();

            if pending.peek().is_none() {
                let size = state.entries.len();
                drop(state);
                self.notify_listener(size, false);
                return Ok(size);
            }

            // At capacity with updates left: make sure someone flushes, then wait.
            // Updates already appended stay buffered when waiting is refused.
            if state.rejecting {
                return Err(BufferError::Closed);
            }
            self.notify_listener(state.entries.len(), true);
            self.space.wait(&mut state);
            if state.closed || state.rejecting {
                return Err(BufferError::Closed);
            }
        }
    }

    fn notify_listener(&self, size: usize, force: bool) {
        if let Some((threshold, listener)) = self.listener.read().as_ref() {
            if force || size >= *threshold {
                listener(size);
            }
        }
    }

    /// Buffered updates of kind `op` matching `pattern`, in insertion order
    pub fn find_buffered_updates(&self, pattern: &TriplePattern, op: UpdateOp) -> Vec<PendingUpdate> {
        self.state
            .lock()
            .entries
            .iter()
            .filter(|update| update.op == op && pattern.matches(&update.triple))
            .cloned()
            .collect()
    }

    /// All buffered updates matching `pattern`, in insertion order
    pub fn pending_matching(&self, pattern: &TriplePattern) -> Vec<PendingUpdate> {
        self.state
            .lock()
            .entries
            .iter()
            .filter(|update| pattern.matches(&update.triple))
            .cloned()
            .collect()
    }

    /// Send everything buffered at call time to `session`
    ///
    /// Batches of up to `flush_batch_size` are split into runs of the same
    /// operation, one backend call per run, in buffer order. Each successful
    /// call is committed immediately; on failure the handler receives the
    /// failed run and the error is returned, with the rest left buffered.
    pub fn flush<S>(&self, session: &mut S) -> FlushResult<usize>
    where
        S: Session + ?Sized,
    {
        let _flushing = self.flush_lock.lock();
        let (mut remaining, epoch) = {
            let state = self.state.lock();
            (state.entries.len(), state.epoch)
        };
        let mut flushed = 0;

        while remaining > 0 {
            let batch: Vec<PendingUpdate> = {
                let state = self.state.lock();
                if state.epoch != epoch {
                    break;
                }
                state
                    .entries
                    .iter()
                    .take(remaining.min(self.flush_batch_size))
                    .cloned()
                    .collect()
            };
            if batch.is_empty() {
                break;
            }
            debug!("flushing batch of {} updates", batch.len());

            for run in split_runs(&batch) {
                let triples: Vec<Triple> = run.iter().map(|update| update.triple.clone()).collect();
                let result = match run[0].op {
                    UpdateOp::Add => session.add(&triples),
                    UpdateOp::Delete => session.delete(&triples),
                };
                match result {
                    Ok(()) => {
                        self.commit(run.len(), epoch);
                        flushed += run.len();
                        remaining = remaining.saturating_sub(run.len());
                    }
                    Err(error) => {
                        warn!(
                            "flush of {} {} updates failed after {} committed: {}",
                            run.len(),
                            run[0].op,
                            flushed,
                            error
                        );
                        self.report(run, &error);
                        return Err(FlushError {
                            flushed,
                            source: error,
                        });
                    }
                }
            }
        }

        if flushed > 0 {
            debug!("flushed {} updates", flushed);
        }
        Ok(flushed)
    }

    fn commit(&self, count: usize, epoch: u64) {
        let mut state = self.state.lock();
        if state.epoch == epoch {
            let count = count.min(state.entries.len());
            state.entries.drain(..count);
        }
        drop(state);
        self.space.notify_all();
    }

    fn report(&self, batch: &[PendingUpdate], error: &BackendError) {
        let handler = self.handler.read().clone();
        if let Some(handler) = handler {
            // a panicking handler must not take the flushing thread down with it
            let outcome =
                panic::catch_unwind(AssertUnwindSafe(|| handler.on_flush_error(batch, error)));
            if outcome.is_err() {
                error!("flush error handler panicked on {} updates", batch.len());
            }
        }
    }

    /// Wake producers waiting for space and fail them with [`BufferError::Closed`]
    ///
    /// Buffered entries are kept for a final flush; appends that fit still
    /// succeed, but no producer waits for space from now on.
    pub fn reject_waiters(&self) {
        self.state.lock().rejecting = true;
        self.space.notify_all();
    }

    /// Discard buffered state without flushing and reject further appends
    pub fn close(&self) {
        let mut state = self.state.lock();
        if !state.closed && !state.entries.is_empty() {
            warn!("discarding {} unflushed updates", state.entries.len());
        }
        state.closed = true;
        state.entries.clear();
        state.epoch += 1;
        drop(state);
        self.space.notify_all();
    }
}

impl fmt::Debug for UpdateBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateBuffer")
            .field("size", &self.size())
            .field("safe_capacity", &self.safe_capacity)
            .field("flush_batch_size", &self.flush_batch_size)
            .field("overflow", &self.overflow)
            .finish()
    }
}

/// Split a batch into maximal runs of the same operation, keeping order
fn split_runs(batch: &[PendingUpdate]) -> Vec<&[PendingUpdate]> {
    let mut runs = Vec::new();
    let mut start = 0;
    for idx in 1..=batch.len() {
        if idx == batch.len() || batch[idx].op != batch[start].op {
            runs.push(&batch[start..idx]);
            start = idx;
        }
    }
    runs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdf::{NamedNode, RdfPredicate};
    use crate::session::MemoryBackend;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn triple(i: usize) -> Triple {
        Triple::new(
            NamedNode::new(&format!("http://example.org/s{}", i)).unwrap(),
            RdfPredicate::new("http://example.org/p").unwrap(),
            NamedNode::new(&format!("http://example.org/o{}", i)).unwrap(),
        )
    }

    #[test]
    fn test_size_counts_adds_and_deletes() {
        let buffer = UpdateBuffer::new(100, 10);
        for i in 0..7 {
            buffer.add(triple(i)).unwrap();
        }
        for i in 0..4 {
            buffer.delete(triple(i)).unwrap();
        }
        assert_eq!(buffer.size(), 11);
    }

    #[test]
    fn test_safe_capacity_is_fixed() {
        let buffer = UpdateBuffer::new(10, 5);
        assert_eq!(buffer.safe_capacity(), 10);
        buffer.add_all((0..8).map(triple)).unwrap();
        buffer.flush(&mut MemoryBackend::new().session()).unwrap();
        assert_eq!(buffer.safe_capacity(), 10);
    }

    #[test]
    fn test_add_then_delete_is_not_cancelled() {
        let backend = MemoryBackend::new();
        let buffer = UpdateBuffer::new(10, 5);

        buffer.add(triple(1)).unwrap();
        buffer.delete(triple(1)).unwrap();
        assert_eq!(buffer.size(), 2);

        buffer.flush(&mut backend.session()).unwrap();
        assert!(!backend.contains(&triple(1)));
        assert_eq!(backend.write_log().len(), 2);
    }

    #[test]
    fn test_flush_groups_contiguous_runs() {
        let backend = MemoryBackend::new();
        let buffer = UpdateBuffer::new(100, 50);

        buffer.add_all((0..3).map(triple)).unwrap();
        buffer.delete(triple(0)).unwrap();
        buffer.add_all((3..5).map(triple)).unwrap();

        let flushed = buffer.flush(&mut backend.session()).unwrap();
        assert_eq!(flushed, 6);
        assert!(buffer.is_empty());

        let calls: Vec<(UpdateOp, usize)> = backend
            .write_log()
            .into_iter()
            .map(|(op, triples)| (op, triples.len()))
            .collect();
        assert_eq!(
            calls,
            vec![(UpdateOp::Add, 3), (UpdateOp::Delete, 1), (UpdateOp::Add, 2)]
        );
        assert_eq!(backend.len(), 4);
    }

    #[test]
    fn test_flush_respects_batch_size() {
        let backend = MemoryBackend::new();
        let buffer = UpdateBuffer::new(100, 4);
        buffer.add_all((0..10).map(triple)).unwrap();

        buffer.flush(&mut backend.session()).unwrap();
        let sizes: Vec<usize> = backend.write_log().iter().map(|(_, t)| t.len()).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
    }

    #[test]
    fn test_failed_flush_keeps_unflushed_updates() {
        let backend = MemoryBackend::new();
        let buffer = UpdateBuffer::new(100, 2);
        let reports = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&reports);
        buffer.set_flush_error_handler(Some(Arc::new(
            move |batch: &[PendingUpdate], _: &BackendError| {
                assert_eq!(batch.len(), 2);
                seen.fetch_add(1, Ordering::SeqCst);
            },
        )));
        buffer.add_all((0..6).map(triple)).unwrap();

        let mut session = backend.session();
        // first batch succeeds, second fails
        buffer.flush(&mut SkipThenFail { inner: &mut session, successes: 1 }).unwrap_err();
        assert_eq!(reports.load(Ordering::SeqCst), 1);
        assert_eq!(buffer.size(), 4);
        assert_eq!(backend.len(), 2);

        assert_eq!(buffer.flush(&mut session).unwrap(), 4);
        assert_eq!(backend.len(), 6);
        assert_eq!(reports.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_flush_error_carries_cause() {
        let backend = MemoryBackend::new();
        let buffer = UpdateBuffer::new(10, 5);
        buffer.add(triple(1)).unwrap();
        backend.fail_next_writes(1);

        let err = buffer.flush(&mut backend.session()).unwrap_err();
        assert_eq!(err.flushed, 0);
        assert!(matches!(err.cause(), BackendError::Rejected(_)));
        assert_eq!(buffer.size(), 1);
    }

    #[test]
    fn test_find_buffered_updates() {
        let buffer = UpdateBuffer::new(100, 10);
        buffer.add(triple(1)).unwrap();
        buffer.delete(triple(2)).unwrap();
        buffer.add(triple(3)).unwrap();

        let adds: Vec<Triple> = buffer
            .find_buffered_updates(&TriplePattern::any(), UpdateOp::Add)
            .into_iter()
            .map(|update| update.triple)
            .collect();
        assert_eq!(adds, vec![triple(1), triple(3)]);

        let pattern = TriplePattern::new(Some(triple(2).subject), None, None);
        let deletes = buffer.find_buffered_updates(&pattern, UpdateOp::Delete);
        assert_eq!(deletes, vec![PendingUpdate::delete(triple(2))]);
        assert_eq!(buffer.size(), 3);
    }

    #[test]
    fn test_reject_policy() {
        let buffer = UpdateBuffer::with_policy(3, 1, OverflowPolicy::Reject);
        buffer.add_all((0..2).map(triple)).unwrap();
        assert_eq!(
            buffer.add_all((2..4).map(triple)),
            Err(BufferError::CapacityExceeded { capacity: 3 })
        );
        assert_eq!(buffer.size(), 2);
        assert_eq!(buffer.add(triple(2)).unwrap(), 3);
        assert!(buffer.is_full());
    }

    #[test]
    fn test_close_discards_and_rejects() {
        let buffer = UpdateBuffer::new(10, 5);
        buffer.add(triple(1)).unwrap();
        buffer.close();
        assert_eq!(buffer.size(), 0);
        assert_eq!(buffer.add(triple(2)), Err(BufferError::Closed));
        assert_eq!(buffer.flush(&mut MemoryBackend::new().session()).unwrap(), 0);
    }

    #[test]
    fn test_reject_waiters_fails_blocked_producer() {
        let buffer = Arc::new(UpdateBuffer::new(4, 4));
        let producer = {
            let buffer = Arc::clone(&buffer);
            std::thread::spawn(move || buffer.add_all((0..6).map(triple)))
        };
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(buffer.size(), 4);

        buffer.reject_waiters();
        assert_eq!(producer.join().unwrap(), Err(BufferError::Closed));

        // what fitted stays buffered for a final flush
        let backend = MemoryBackend::new();
        assert_eq!(buffer.flush(&mut backend.session()).unwrap(), 4);
        assert_eq!(backend.len(), 4);
        assert_eq!(buffer.add(triple(9)).unwrap(), 1);
        assert_eq!(buffer.add_all((10..14).map(triple)), Err(BufferError::Closed));
    }

    #[test]
    fn test_panicking_handler_still_returns_error() {
        let backend = MemoryBackend::new();
        let buffer = UpdateBuffer::new(10, 5);
        buffer.set_flush_error_handler(Some(Arc::new(
            |_: &[PendingUpdate], _: &BackendError| panic!("handler bug"),
        )));
        buffer.add_all((0..3).map(triple)).unwrap();

        backend.set_fail_writes(true);
        assert!(buffer.flush(&mut backend.session()).is_err());
        assert_eq!(buffer.size(), 3);

        backend.set_fail_writes(false);
        assert_eq!(buffer.flush(&mut backend.session()).unwrap(), 3);
    }

    #[test]
    fn test_threshold_listener() {
        let buffer = UpdateBuffer::new(10, 5);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        buffer.set_threshold_listener(
            3,
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        buffer.add_all((0..2).map(triple)).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        buffer.add(triple(2)).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_split_runs() {
        let batch = vec![
            PendingUpdate::add(triple(0)),
            PendingUpdate::add(triple(1)),
            PendingUpdate::delete(triple(1)),
            PendingUpdate::add(triple(1)),
        ];
        let lens: Vec<usize> = split_runs(&batch).iter().map(|run| run.len()).collect();
        assert_eq!(lens, vec![2, 1, 1]);
        assert!(split_runs(&[]).is_empty());
    }

    /// Lets `successes` write calls through, then fails every call
    struct SkipThenFail<'a, S: Session> {
        inner: &'a mut S,
        successes: usize,
    }

    impl<S: Session> Session for SkipThenFail<'_, S> {
        fn find_triples(&mut self, pattern: &TriplePattern) -> crate::session::BackendResult<Vec<Triple>> {
            self.inner.find_triples(pattern)
        }

        fn find_triples_by_query(
            &mut self,
            language: &crate::session::QueryLanguage,
            query: &str,
        ) -> crate::session::BackendResult<Vec<Triple>> {
            self.inner.find_triples_by_query(language, query)
        }

        fn query(
            &mut self,
            query: &str,
            language: &crate::session::QueryLanguage,
        ) -> crate::session::BackendResult<crate::session::QueryResults> {
            self.inner.query(query, language)
        }

        fn add(&mut self, triples: &[Triple]) -> crate::session::BackendResult<()> {
            if self.successes == 0 {
                return Err(BackendError::Unavailable("injected".to_string()));
            }
            self.successes -= 1;
            self.inner.add(triples)
        }

        fn delete(&mut self, triples: &[Triple]) -> crate::session::BackendResult<()> {
            self.inner.delete(triples)
        }

        fn close(&mut self) -> crate::session::BackendResult<()> {
            self.inner.close()
        }
    }
}
