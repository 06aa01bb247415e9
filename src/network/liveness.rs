//! Heartbeat liveness tracking
//!
//! A connection is alive when it has heard its own latest heartbeat come back
//! from the network. Until then heartbeats go out fast and slow down by a
//! backoff factor; once alive they go out at the configured interval. A
//! heartbeat that is not echoed before the next one is sent means the
//! connection has been lost, and the fast rate resumes.

use std::time::Duration;

/// Granularity of the heartbeat timer
pub const TICK: Duration = Duration::from_secs(1);

const TICK_MS: u64 = 1000;

/// Transitions reported by [`Liveness`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessChange {
    /// Our heartbeat was heard; we were not alive before
    Connected,
    /// The previous heartbeat was not heard back
    Lost,
}

/// Heartbeat period and echo bookkeeping
#[derive(Debug, Clone)]
pub struct Liveness {
    steady_ms: u64,
    backoff: f64,
    period_ms: u64,
    elapsed_ms: u64,
    sent_uid: Option<String>,
    echo_received: bool,
    alive: bool,
}

impl Liveness {
    pub fn new(steady: Duration, backoff: f64) -> Self {
        let steady_ms = (steady.as_millis() as u64).max(TICK_MS);
        Self {
            steady_ms,
            backoff: backoff.max(1.0),
            period_ms: TICK_MS,
            elapsed_ms: 0,
            sent_uid: None,
            echo_received: false,
            alive: false,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    /// Time between heartbeats at the current rate
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    /// Count one timer tick; returns true when a heartbeat is due
    pub fn tick(&mut self) -> bool {
        self.elapsed_ms += TICK_MS;
        if self.elapsed_ms < self.period_ms {
            return false;
        }

        self.elapsed_ms = 0;
        if !self.alive {
            let next = (self.period_ms as f64 * self.backoff).floor() as u64;
            self.period_ms = next.min(self.steady_ms);
        }
        true
    }

    /// Record that a heartbeat carrying `uid` is about to be sent.
    ///
    /// Reports [`LivenessChange::Lost`] when we were alive but the previous
    /// heartbeat never came back.
    pub fn heartbeat_sent(&mut self, uid: &str) -> Option<LivenessChange> {
        let mut change = None;
        if self.alive && !self.echo_received {
            self.period_ms = TICK_MS;
            change = Some(LivenessChange::Lost);
        }

        self.alive = self.echo_received;
        self.sent_uid = Some(uid.to_uppercase());
        self.echo_received = false;
        change
    }

    /// Record a heartbeat heard from the network with canonical (uppercase) `uid`
    pub fn heartbeat_heard(&mut self, uid: &str) -> Option<LivenessChange> {
        if self.sent_uid.as_deref() != Some(uid) {
            return None;
        }

        self.echo_received = true;
        if self.alive {
            return None;
        }

        self.alive = true;
        self.period_ms = self.steady_ms;
        Some(LivenessChange::Connected)
    }
}
