//! Session pool
//!
//! Bounded, elastic pool of backend sessions. The pool opens `initial_size`
//! sessions up front, grows on demand by at most `max_growth`, and once load
//! subsides closes returned sessions beyond `spare_sessions` idle ones while
//! never dropping below `initial_size`.

use crate::config::{ConfigError, PoolConfig};
use crate::session::{BackendError, Session, SessionFactory};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Pool errors
#[derive(Error, Debug)]
pub enum PoolError {
    /// Every session is in use and the pool may not grow further
    #[error("Session pool exhausted ({max_size} sessions in use)")]
    Exhausted { max_size: usize },

    #[error("Session pool closed")]
    Closed,

    /// Opening a session failed
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

pub type PoolResult<T> = Result<T, PoolError>;

/// Point-in-time pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Sessions waiting in the pool
    pub idle: usize,
    /// Sessions currently borrowed
    pub active: usize,
    /// Callers blocked in `borrow`
    pub waiting: usize,
    /// Sessions opened over the pool's lifetime
    pub created: usize,
    /// Sessions closed over the pool's lifetime
    pub closed: usize,
}

impl PoolStats {
    /// Open sessions, idle or borrowed
    pub fn open(&self) -> usize {
        self.idle + self.active
    }
}

struct PoolState<S> {
    idle: VecDeque<S>,
    /// Open sessions plus sessions being opened
    total: usize,
    waiting: usize,
    closed: bool,
}

/// Where a borrow gets its session from
enum Slot<S> {
    Idle(S),
    Open,
}

/// Elastic pool of sessions opened from a [`SessionFactory`]
pub struct SessionPool<F: SessionFactory> {
    factory: F,
    config: PoolConfig,
    state: Mutex<PoolState<F::Session>>,
    available: Condvar,
    created: AtomicUsize,
    closed: AtomicUsize,
}

impl<F: SessionFactory> SessionPool<F> {
    /// Create a pool and open `initial_size` sessions
    pub fn new(factory: F, config: PoolConfig) -> PoolResult<Self> {
        config.validate()?;

        let mut idle = VecDeque::with_capacity(config.initial_size);
        for _ in 0..config.initial_size {
            match factory.create_session() {
                Ok(session) => idle.push_back(session),
                Err(e) => {
                    for mut session in idle {
                        let _ = session.close();
                    }
                    return Err(e.into());
                }
            }
        }

        info!(
            "Session pool ready: {} sessions, max {}",
            config.initial_size,
            config
                .max_size()
                .map_or_else(|| "unlimited".to_string(), |max| max.to_string())
        );

        let total = idle.len();
        Ok(Self {
            factory,
            state: Mutex::new(PoolState {
                idle,
                total,
                waiting: 0,
                closed: false,
            }),
            available: Condvar::new(),
            created: AtomicUsize::new(total),
            closed: AtomicUsize::new(0),
            config,
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Borrow a session; it returns to the pool when the guard drops
    pub fn borrow(&self) -> PoolResult<PooledSession<'_, F>> {
        let session = self.acquire()?;
        Ok(PooledSession {
            pool: self,
            session: Some(session),
        })
    }

    /// Take a session out of the pool. Hand it back with [`release`](Self::release).
    ///
    /// Blocks while the pool is at its maximum size, up to the configured wait
    /// timeout.
    pub fn acquire(&self) -> PoolResult<F::Session> {
        let deadline = self.config.wait_timeout().map(|timeout| Instant::now() + timeout);
        let mut state = self.state.lock();

        let slot = loop {
            if let Some(slot) = self.take_slot(&mut state)? {
                break slot;
            }

            state.waiting += 1;
            let timed_out = match deadline {
                Some(deadline) => self.available.wait_until(&mut state, deadline).timed_out(),
                None => {
                    self.available.wait(&mut state);
                    false
                }
            };
            state.waiting -= 1;

            if timed_out {
                match self.take_slot(&mut state)? {
                    Some(slot) => break slot,
                    None => {
                        return Err(PoolError::Exhausted {
                            max_size: state.total,
                        })
                    }
                }
            }
        };
        drop(state);

        match slot {
            Slot::Idle(session) => Ok(session),
            Slot::Open => match self.factory.create_session() {
                Ok(session) => {
                    let created = self.created.fetch_add(1, Ordering::SeqCst) + 1;
                    debug!("Session pool grew (sessions opened so far: {})", created);
                    Ok(session)
                }
                Err(e) => {
                    self.state.lock().total -= 1;
                    self.available.notify_one();
                    Err(e.into())
                }
            },
        }
    }

    fn take_slot(&self, state: &mut PoolState<F::Session>) -> PoolResult<Option<Slot<F::Session>>> {
        if state.closed {
            return Err(PoolError::Closed);
        }
        if let Some(session) = state.idle.pop_front() {
            return Ok(Some(Slot::Idle(session)));
        }
        let can_grow = self
            .config
            .max_size()
            .map_or(true, |max| state.total < max);
        if can_grow {
            state.total += 1;
            return Ok(Some(Slot::Open));
        }
        Ok(None)
    }

    /// Return a session to the pool
    ///
    /// The session is closed instead when the pool is closed, or when nobody
    /// waits, `spare_sessions` are already idle and the pool is above its
    /// initial size.
    pub fn release(&self, session: F::Session) {
        let mut state = self.state.lock();
        let surplus = state.waiting == 0
            && state.idle.len() >= self.config.spare_sessions
            && state.total > self.config.initial_size;

        if state.closed || surplus {
            state.total -= 1;
            let remaining = state.total;
            drop(state);
            if surplus {
                debug!("Session pool shrinking to {} sessions", remaining);
            }
            self.close_session(session);
            self.available.notify_one();
            return;
        }

        state.idle.push_back(session);
        drop(state);
        self.available.notify_one();
    }

    fn close_session(&self, mut session: F::Session) {
        if let Err(e) = session.close() {
            warn!("Failed to close session: {}", e);
        }
        self.closed.fetch_add(1, Ordering::SeqCst);
    }

    /// Close idle sessions and refuse further borrows
    ///
    /// Borrowed sessions are closed as they come back.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        let idle: Vec<F::Session> = state.idle.drain(..).collect();
        state.total -= idle.len();
        let in_use = state.total;
        drop(state);
        self.available.notify_all();

        for session in idle {
            self.close_session(session);
        }
        info!("Session pool closed ({} sessions still borrowed)", in_use);
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            idle: state.idle.len(),
            active: state.total - state.idle.len(),
            waiting: state.waiting,
            created: self.created.load(Ordering::SeqCst),
            closed: self.closed.load(Ordering::SeqCst),
        }
    }
}

impl<F: SessionFactory> fmt::Debug for SessionPool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionPool")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Borrowed session; derefs to the backend session
pub struct PooledSession<'a, F: SessionFactory> {
    pool: &'a SessionPool<F>,
    session: Option<F::Session>,
}

impl<'a, F: SessionFactory> fmt::Debug for PooledSession<'a, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledSession")
            .field("held", &self.session.is_some())
            .finish_non_exhaustive()
    }
}

impl<'a, F: SessionFactory> PooledSession<'a, F> {
    /// Detach the session from the pool's bookkeeping of this guard
    ///
    /// The caller becomes responsible for handing it back via
    /// [`SessionPool::release`].
    pub fn detach(mut self) -> Option<F::Session> {
        self.session.take()
    }
}

impl<F: SessionFactory> Deref for PooledSession<'_, F> {
    type Target = F::Session;

    fn deref(&self) -> &Self::Target {
        self.session.as_ref().expect("pooled session present until drop")
    }
}

impl<F: SessionFactory> DerefMut for PooledSession<'_, F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.session.as_mut().expect("pooled session present until drop")
    }
}

impl<F: SessionFactory> Drop for PooledSession<'_, F> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.pool.release(session);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdf::TriplePattern;
    use crate::session::MemoryBackend;
    use std::time::Duration;

    fn config(initial: usize, growth: Option<usize>, spare: usize) -> PoolConfig {
        PoolConfig {
            initial_size: initial,
            max_growth: growth,
            spare_sessions: spare,
            wait_timeout_ms: Some(50),
        }
    }

    #[test]
    fn test_prewarms_initial_sessions() {
        let backend = MemoryBackend::new();
        let pool = SessionPool::new(backend.clone(), config(3, Some(2), 1)).unwrap();

        assert_eq!(backend.sessions_opened(), 3);
        let stats = pool.stats();
        assert_eq!(stats.idle, 3);
        assert_eq!(stats.active, 0);
    }

    #[test]
    fn test_borrow_reuses_idle_sessions() {
        let backend = MemoryBackend::new();
        let pool = SessionPool::new(backend.clone(), config(1, Some(1), 1)).unwrap();

        for _ in 0..5 {
            let mut session = pool.borrow().unwrap();
            session.find_triples(&TriplePattern::any()).unwrap();
        }
        assert_eq!(backend.sessions_opened(), 1);
        assert_eq!(pool.stats().idle, 1);
    }

    #[test]
    fn test_growth_is_bounded() {
        let backend = MemoryBackend::new();
        let pool = SessionPool::new(backend.clone(), config(1, Some(1), 1)).unwrap();

        let first = pool.borrow().unwrap();
        let second = pool.borrow().unwrap();
        assert_eq!(pool.stats().active, 2);

        let err = pool.borrow().unwrap_err();
        assert!(matches!(err, PoolError::Exhausted { max_size: 2 }));

        drop(first);
        assert!(pool.borrow().is_ok());
        drop(second);
        assert_eq!(backend.sessions_opened(), 2);
    }

    #[test]
    fn test_shrinks_to_spare_sessions() {
        let backend = MemoryBackend::new();
        let pool = SessionPool::new(backend.clone(), config(1, Some(4), 2)).unwrap();

        let sessions: Vec<_> = (0..5).map(|_| pool.acquire().unwrap()).collect();
        assert_eq!(pool.stats().active, 5);

        for session in sessions {
            pool.release(session);
        }
        let stats = pool.stats();
        assert_eq!(stats.idle, 2);
        assert_eq!(stats.active, 0);
        assert_eq!(backend.sessions_closed(), 3);
    }

    #[test]
    fn test_never_shrinks_below_initial_size() {
        let backend = MemoryBackend::new();
        let pool = SessionPool::new(backend.clone(), config(3, Some(2), 0)).unwrap();

        let sessions: Vec<_> = (0..5).map(|_| pool.acquire().unwrap()).collect();
        for session in sessions {
            pool.release(session);
        }
        assert_eq!(pool.stats().idle, 3);
        assert_eq!(backend.sessions_closed(), 2);
    }

    #[test]
    fn test_unlimited_growth() {
        let backend = MemoryBackend::new();
        let pool = SessionPool::new(backend.clone(), config(1, None, 1)).unwrap();

        let sessions: Vec<_> = (0..20).map(|_| pool.acquire().unwrap()).collect();
        assert_eq!(pool.stats().active, 20);
        drop(sessions);
    }

    #[test]
    fn test_close_pool() {
        let backend = MemoryBackend::new();
        let pool = SessionPool::new(backend.clone(), config(2, Some(2), 2)).unwrap();

        let borrowed = pool.acquire().unwrap();
        pool.close();
        assert_eq!(backend.sessions_closed(), 1);
        assert!(matches!(pool.borrow(), Err(PoolError::Closed)));

        pool.release(borrowed);
        assert_eq!(backend.sessions_closed(), 2);
        assert_eq!(pool.stats().open(), 0);
    }

    #[test]
    fn test_factory_failure() {
        let backend = MemoryBackend::new();
        backend.set_refuse_sessions(true);
        assert!(matches!(
            SessionPool::new(backend.clone(), config(2, Some(1), 1)),
            Err(PoolError::Backend(BackendError::Unavailable(_)))
        ));

        backend.set_refuse_sessions(false);
        let pool = SessionPool::new(backend.clone(), config(1, Some(1), 1)).unwrap();
        let _held = pool.acquire().unwrap();
        backend.set_refuse_sessions(true);
        assert!(matches!(pool.acquire(), Err(PoolError::Backend(_))));

        // the failed open released its slot
        backend.set_refuse_sessions(false);
        assert!(pool.acquire().is_ok());
    }

    #[test]
    fn test_invalid_config() {
        let backend = MemoryBackend::new();
        assert!(matches!(
            SessionPool::new(backend, config(0, Some(1), 0)),
            Err(PoolError::Config(_))
        ));
    }

    #[test]
    fn test_waiter_receives_released_session() {
        let backend = MemoryBackend::new();
        let pool = std::sync::Arc::new(
            SessionPool::new(
                backend.clone(),
                PoolConfig {
                    wait_timeout_ms: Some(2_000),
                    ..config(1, Some(0), 0)
                },
            )
            .unwrap(),
        );

        let held = pool.acquire().unwrap();
        let waiter = {
            let pool = std::sync::Arc::clone(&pool);
            std::thread::spawn(move || pool.acquire().map(|s| pool.release(s)).is_ok())
        };
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(pool.stats().waiting, 1);

        pool.release(held);
        assert!(waiter.join().unwrap());
        assert_eq!(backend.sessions_opened(), 1);
    }
}
