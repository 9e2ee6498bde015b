use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use triplegate::{
    BackendError, MemoryBackend, NamedNode, PendingUpdate, RdfPredicate, Triple, TriplePattern,
    UpdateBuffer, UpdateOp,
};

fn triple(owner: usize, i: usize) -> Triple {
    Triple::new(
        NamedNode::new(&format!("http://example.org/t{}/s{}", owner, i)).unwrap(),
        RdfPredicate::new("http://example.org/value").unwrap(),
        NamedNode::new(&format!("http://example.org/o{}", i)).unwrap(),
    )
}

#[test]
fn test_producer_not_blocked_by_slow_flush() {
    let backend = MemoryBackend::new();
    backend.set_write_delay(Duration::from_millis(1000));
    let buffer = Arc::new(UpdateBuffer::new(100, 10));
    buffer.add_all((0..5).map(|i| triple(0, i))).unwrap();

    let flusher = {
        let buffer = Arc::clone(&buffer);
        let mut session = backend.session();
        thread::spawn(move || buffer.flush(&mut session))
    };
    // let the flush enter the backend call
    thread::sleep(Duration::from_millis(100));

    let start = Instant::now();
    buffer.add(triple(1, 0)).unwrap();
    let elapsed = start.elapsed();
    assert!(elapsed < Duration::from_millis(250), "add took {:?}", elapsed);
    assert_eq!(buffer.size(), 6);

    assert_eq!(flusher.join().unwrap().unwrap(), 5);
    assert_eq!(buffer.size(), 1);
    assert_eq!(backend.len(), 5);
}

#[test]
fn test_failing_add_reported_once_and_raised() {
    let backend = MemoryBackend::new();
    let buffer = UpdateBuffer::new(100, 10);
    let reports = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&reports);
    buffer.set_flush_error_handler(Some(Arc::new(
        move |_: &[PendingUpdate], error: &BackendError| {
            assert!(matches!(error, BackendError::Rejected(_)));
            seen.fetch_add(1, Ordering::SeqCst);
        },
    )));

    buffer.add_all((0..25).map(|i| triple(0, i))).unwrap();
    backend.set_fail_writes(true);

    let err = buffer.flush(&mut backend.session()).unwrap_err();
    assert!(matches!(err.cause(), BackendError::Rejected(_)));
    assert_eq!(reports.load(Ordering::SeqCst), 1);
    assert_eq!(buffer.size(), 25);
}

#[test]
fn test_partial_flush_keeps_tail() {
    let backend = MemoryBackend::new();
    let buffer = UpdateBuffer::new(100, 10);
    buffer.add_all((0..25).map(|i| triple(0, i))).unwrap();

    let mut session = backend.session();
    // first batch of 10 succeeds, then a failure
    buffer.flush(&mut FailAfter { inner: &mut session, calls: 1 }).unwrap_err();
    assert_eq!(backend.len(), 10);
    assert_eq!(buffer.size(), 15);

    let adds = buffer.find_buffered_updates(&TriplePattern::any(), UpdateOp::Add);
    assert_eq!(adds.first().map(|u| &u.triple), Some(&triple(0, 10)));
}

#[test]
fn test_buffered_adds_in_insertion_order() {
    let buffer = UpdateBuffer::new(100, 10);
    buffer.add(triple(0, 3)).unwrap();
    buffer.delete(triple(0, 9)).unwrap();
    buffer.add(triple(0, 1)).unwrap();
    buffer.add(triple(0, 2)).unwrap();

    let adds: Vec<Triple> = buffer
        .find_buffered_updates(&TriplePattern::any(), UpdateOp::Add)
        .into_iter()
        .map(|u| u.triple)
        .collect();
    assert_eq!(adds, vec![triple(0, 3), triple(0, 1), triple(0, 2)]);
    assert_eq!(buffer.size(), 4);
}

#[test]
fn test_producer_waits_at_safe_capacity() {
    let backend = MemoryBackend::new();
    let buffer = Arc::new(UpdateBuffer::new(5, 5));
    buffer.add_all((0..5).map(|i| triple(0, i))).unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let producer = {
        let buffer = Arc::clone(&buffer);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            buffer.add(triple(1, 0)).unwrap();
            done.store(true, Ordering::SeqCst);
        })
    };

    thread::sleep(Duration::from_millis(100));
    assert!(!done.load(Ordering::SeqCst));
    assert_eq!(buffer.size(), 5);

    buffer.flush(&mut backend.session()).unwrap();
    producer.join().unwrap();
    assert!(done.load(Ordering::SeqCst));
    assert_eq!(buffer.size(), 1);
}

#[test]
fn test_concurrent_writes_and_flushes_lose_nothing() {
    const THREADS: usize = 4;
    const PER_THREAD: usize = 300;

    let backend = MemoryBackend::new();
    let buffer = Arc::new(UpdateBuffer::new(64, 16));
    let producing = Arc::new(AtomicUsize::new(THREADS));

    let flusher = {
        let buffer = Arc::clone(&buffer);
        let producing = Arc::clone(&producing);
        let mut session = backend.session();
        thread::spawn(move || {
            while producing.load(Ordering::SeqCst) > 0 {
                buffer.flush(&mut session).unwrap();
                thread::yield_now();
            }
            buffer.flush(&mut session).unwrap();
        })
    };

    let producers: Vec<_> = (0..THREADS)
        .map(|owner| {
            let buffer = Arc::clone(&buffer);
            let producing = Arc::clone(&producing);
            thread::spawn(move || {
                for i in 0..PER_THREAD {
                    buffer.add(triple(owner, i)).unwrap();
                    if i % 3 == 0 {
                        buffer.delete(triple(owner, i)).unwrap();
                    }
                }
                producing.fetch_sub(1, Ordering::SeqCst);
            })
        })
        .collect();

    for producer in producers {
        producer.join().unwrap();
    }
    flusher.join().unwrap();

    assert_eq!(buffer.size(), 0);
    for owner in 0..THREADS {
        for i in 0..PER_THREAD {
            assert_eq!(backend.contains(&triple(owner, i)), i % 3 != 0, "owner {} item {}", owner, i);
        }
    }
}

/// Lets `calls` write calls through, then fails
struct FailAfter<'a, S: triplegate::Session> {
    inner: &'a mut S,
    calls: usize,
}

impl<S: triplegate::Session> triplegate::Session for FailAfter<'_, S> {
    fn find_triples(&mut self, pattern: &TriplePattern) -> triplegate::BackendResult<Vec<Triple>> {
        self.inner.find_triples(pattern)
    }

    fn find_triples_by_query(
        &mut self,
        language: &triplegate::QueryLanguage,
        query: &str,
    ) -> triplegate::BackendResult<Vec<Triple>> {
        self.inner.find_triples_by_query(language, query)
    }

    fn query(
        &mut self,
        query: &str,
        language: &triplegate::QueryLanguage,
    ) -> triplegate::BackendResult<triplegate::QueryResults> {
        self.inner.query(query, language)
    }

    fn add(&mut self, triples: &[Triple]) -> triplegate::BackendResult<()> {
        if self.calls == 0 {
            return Err(BackendError::Unavailable("connection reset".to_string()));
        }
        self.calls -= 1;
        self.inner.add(triples)
    }

    fn delete(&mut self, triples: &[Triple]) -> triplegate::BackendResult<()> {
        self.inner.delete(triples)
    }

    fn close(&mut self) -> triplegate::BackendResult<()> {
        self.inner.close()
    }
}
