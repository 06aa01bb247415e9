//! Event delivery from a connection to its owner
//!
//! Lifecycle events (`Connected`, `LostConnection`, `Disconnected`) are always
//! queued. Messages, heartbeats and errors are dropped once
//! [`EVENT_QUEUE_LIMIT`] events are waiting to be read.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

use super::ConnectionEvent;

/// Unread events beyond which network events are dropped
pub const EVENT_QUEUE_LIMIT: usize = 256;

#[derive(Debug, Default)]
struct QueueState {
    pending: AtomicUsize,
    taken: AtomicBool,
    overflowing: AtomicBool,
}

/// Producer half, shared by the connection handle and its worker
#[derive(Debug, Clone)]
pub(crate) struct EventSender {
    tx: mpsc::UnboundedSender<ConnectionEvent>,
    state: Arc<QueueState>,
}

/// Events from a [`Connection`](super::Connection), in the order they happened
#[derive(Debug)]
pub struct EventReceiver {
    rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    state: Arc<QueueState>,
}

pub(crate) fn event_queue() -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let state = Arc::new(QueueState::default());
    (
        EventSender {
            tx,
            state: state.clone(),
        },
        EventReceiver { rx, state },
    )
}

impl EventSender {
    pub(crate) fn emit(&self, event: ConnectionEvent) {
        let state = &self.state;
        if !event.is_lifecycle() && state.pending.load(Ordering::Acquire) >= EVENT_QUEUE_LIMIT {
            // Nobody reading yet is not worth a warning.
            if state.taken.load(Ordering::Acquire) && !state.overflowing.swap(true, Ordering::AcqRel) {
                tracing::warn!("Event queue full, dropping network events until the reader catches up");
            }
            tracing::trace!("Dropped {:?}", event);
            return;
        }

        state.pending.fetch_add(1, Ordering::AcqRel);
        if self.tx.send(event).is_err() {
            state.pending.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl EventReceiver {
    /// Wait for the next event
    pub async fn recv(&mut self) -> Option<ConnectionEvent> {
        let event = self.rx.recv().await;
        if event.is_some() {
            self.consumed();
        }
        event
    }

    /// Next event if one is already queued
    pub fn try_recv(&mut self) -> Result<ConnectionEvent, TryRecvError> {
        let event = self.rx.try_recv()?;
        self.consumed();
        Ok(event)
    }

    /// Number of queued events
    pub fn len(&self) -> usize {
        self.state.pending.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn mark_taken(&self) {
        self.state.taken.store(true, Ordering::Release);
    }

    fn consumed(&self) {
        let before = self.state.pending.fetch_sub(1, Ordering::AcqRel);
        if before <= EVENT_QUEUE_LIMIT / 2 {
            self.state.overflowing.store(false, Ordering::Release);
        }
    }
}
