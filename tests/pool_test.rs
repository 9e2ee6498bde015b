use crossbeam_channel::unbounded;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use triplegate::{MemoryBackend, PoolConfig, PoolError, SessionPool};

fn pool_config(wait_timeout_ms: Option<u64>) -> PoolConfig {
    PoolConfig {
        initial_size: 2,
        max_growth: Some(3),
        spare_sessions: 2,
        wait_timeout_ms,
    }
}

#[test]
fn test_sixth_borrower_blocks_until_release() {
    let backend = MemoryBackend::new();
    let pool = Arc::new(SessionPool::new(backend.clone(), pool_config(None)).unwrap());

    let held: Vec<_> = (0..5).map(|_| pool.acquire().unwrap()).collect();
    assert_eq!(pool.stats().active, 5);
    assert_eq!(backend.sessions_opened(), 5);

    let (tx, rx) = unbounded();
    let sixth = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || {
            let session = pool.acquire().unwrap();
            tx.send(()).unwrap();
            pool.release(session);
        })
    };

    assert!(rx.recv_timeout(Duration::from_millis(150)).is_err());
    assert_eq!(pool.stats().waiting, 1);

    let mut held = held.into_iter();
    pool.release(held.next().unwrap());
    assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
    sixth.join().unwrap();

    // the pool never grew past its ceiling
    assert_eq!(backend.sessions_opened(), 5);

    for session in held {
        pool.release(session);
    }
    let stats = pool.stats();
    assert_eq!(stats.idle, 2);
    assert_eq!(stats.active, 0);
    assert_eq!(backend.sessions_closed(), 3);
}

#[test]
fn test_borrow_times_out_when_exhausted() {
    let backend = MemoryBackend::new();
    let pool = SessionPool::new(backend, pool_config(Some(100))).unwrap();

    let _held: Vec<_> = (0..5).map(|_| pool.borrow().unwrap()).collect();
    let err = pool.borrow().unwrap_err();
    assert!(matches!(err, PoolError::Exhausted { max_size: 5 }));
    assert_eq!(pool.stats().waiting, 0);
}

#[test]
fn test_close_wakes_waiters() {
    let backend = MemoryBackend::new();
    let pool = Arc::new(SessionPool::new(backend.clone(), pool_config(None)).unwrap());
    let held: Vec<_> = (0..5).map(|_| pool.acquire().unwrap()).collect();

    let waiter = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || pool.acquire().map(|_| ()))
    };
    thread::sleep(Duration::from_millis(50));
    pool.close();

    assert!(matches!(waiter.join().unwrap(), Err(PoolError::Closed)));
    for session in held {
        pool.release(session);
    }
    assert_eq!(backend.sessions_closed(), backend.sessions_opened());
}

#[test]
fn test_concurrent_borrowers_share_sessions() {
    let backend = MemoryBackend::new();
    let pool = Arc::new(SessionPool::new(backend.clone(), pool_config(None)).unwrap());

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                for _ in 0..50 {
                    let session = pool.borrow().unwrap();
                    thread::sleep(Duration::from_micros(200));
                    drop(session);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let stats = pool.stats();
    assert!(stats.created <= 5);
    assert_eq!(stats.active, 0);
    assert!(stats.idle >= 2);
}
