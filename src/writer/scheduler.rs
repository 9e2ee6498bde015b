//! Background auto-flush
//!
//! One thread per writer. It wakes on a size trigger sent by the buffer's
//! threshold listener, or when the buffer has been dormant for the configured
//! interval. Triggers arriving while a flush runs are coalesced: the trigger
//! channel holds at most one pending signal and the flush itself is guarded by
//! the write session lock.

use super::Inner;
use crate::session::SessionFactory;
use crossbeam_channel::{bounded, select, Receiver, Sender};
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error};

enum Event {
    Threshold,
    Tick,
    Stop,
}

pub(super) struct FlushScheduler {
    shutdown: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl FlushScheduler {
    pub(super) fn start<F: SessionFactory>(
        inner: Arc<Inner<F>>,
        triggers: Receiver<()>,
        dormant: Duration,
    ) -> io::Result<Self> {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let handle = thread::Builder::new()
            .name("triplegate-flush".to_string())
            .spawn(move || run(inner, triggers, shutdown_rx, dormant))?;

        Ok(Self {
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    /// Stop future triggers and wait for a running flush to finish
    pub(super) fn stop(&mut self) {
        drop(self.shutdown.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Flush scheduler thread panicked");
            }
        }
    }

    pub(super) fn is_running(&self) -> bool {
        self.handle.is_some()
    }
}

fn run<F: SessionFactory>(
    inner: Arc<Inner<F>>,
    triggers: Receiver<()>,
    shutdown: Receiver<()>,
    dormant: Duration,
) {
    debug!("Flush scheduler started (dormant interval {:?})", dormant);

    loop {
        let idle = inner.buffer.idle_for();
        let wait = if idle >= dormant { dormant } else { dormant - idle };

        let event = select! {
            recv(shutdown) -> _ => Event::Stop,
            recv(triggers) -> msg => if msg.is_ok() { Event::Threshold } else { Event::Stop },
            default(wait) => Event::Tick,
        };

        match event {
            Event::Stop => break,
            Event::Threshold => inner.background_flush("size threshold"),
            Event::Tick => {
                if !inner.buffer.is_empty() && inner.buffer.idle_for() >= dormant {
                    inner.background_flush("dormant buffer");
                }
            }
        }
    }

    debug!("Flush scheduler stopped");
}
