//! Repeating tick sources
//!
//! The connection asks a [`Scheduler`] for a [`Ticker`] and cancels it on
//! disconnect. [`TokioScheduler`] ticks on the runtime clock;
//! [`ManualScheduler`] ticks only when told to, for tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Source of repeating ticks
pub trait Scheduler: Send + Sync {
    fn schedule_repeating(&self, period: Duration) -> Ticker;
}

/// A cancelable stream of ticks
pub struct Ticker {
    rx: mpsc::UnboundedReceiver<()>,
    task: Option<JoinHandle<()>>,
}

impl Ticker {
    fn new(rx: mpsc::UnboundedReceiver<()>, task: Option<JoinHandle<()>>) -> Self {
        Self { rx, task }
    }

    /// Wait for the next tick; `None` once cancelled
    pub async fn tick(&mut self) -> Option<()> {
        self.rx.recv().await
    }

    /// Stop ticking; ticks already queued are discarded
    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Ticks driven by `tokio::time`, the first one period after scheduling
#[derive(Debug, Default, Clone)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn schedule_repeating(&self, period: Duration) -> Ticker {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            loop {
                interval.tick().await;
                if tx.send(()).is_err() {
                    break;
                }
            }
        });
        Ticker::new(rx, Some(task))
    }
}

/// Ticks delivered by calling [`ManualScheduler::fire`]
#[derive(Debug, Default, Clone)]
pub struct ManualScheduler {
    tickers: Arc<Mutex<Vec<mpsc::UnboundedSender<()>>>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver one tick to every live ticker
    pub fn fire(&self) {
        self.fire_n(1);
    }

    pub fn fire_n(&self, n: usize) {
        let mut tickers = self.tickers.lock().unwrap_or_else(|e| e.into_inner());
        tickers.retain(|tx| (0..n).all(|_| tx.send(()).is_ok()));
    }

    /// Number of tickers not yet cancelled
    pub fn active(&self) -> usize {
        let mut tickers = self.tickers.lock().unwrap_or_else(|e| e.into_inner());
        tickers.retain(|tx| !tx.is_closed());
        tickers.len()
    }
}

impl Scheduler for ManualScheduler {
    fn schedule_repeating(&self, _period: Duration) -> Ticker {
        let (tx, rx) = mpsc::unbounded_channel();
        self.tickers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        Ticker::new(rx, None)
    }
}
