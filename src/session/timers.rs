//! Cancellable, epoch-tagged timers
//!
//! Each timer is a spawned task that posts a [`TimerFired`] back to the
//! session channel. Arming a kind replaces (aborts) the previous timer of that
//! kind. The session still checks the epoch on every firing, since a timer can
//! fire between the abort and the channel being drained.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Backoff delay elapsed, start the next attempt
    Reconnect,
    /// CONNECTED did not arrive in time
    ConnectTimeout,
    /// Time to send a heart-beat
    HeartbeatOut,
    /// Time to check for inbound silence
    HeartbeatCheck,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub epoch: u64,
    pub kind: TimerKind,
}

pub struct Timers<E> {
    tx: mpsc::UnboundedSender<E>,
    handles: HashMap<TimerKind, JoinHandle<()>>,
}

impl<E> Timers<E>
where
    E: From<TimerFired> + Send + 'static,
{
    pub fn new(tx: mpsc::UnboundedSender<E>) -> Self {
        Self {
            tx,
            handles: HashMap::new(),
        }
    }

    /// Fire once after `after`
    pub fn arm_once(&mut self, kind: TimerKind, epoch: u64, after: Duration) {
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            time::sleep(after).await;
            let _ = tx.send(E::from(TimerFired { epoch, kind }));
        });
        self.replace(kind, handle);
    }

    /// Fire every `every`, first firing one period from now
    pub fn arm_repeating(&mut self, kind: TimerKind, epoch: u64, every: Duration) {
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if tx.send(E::from(TimerFired { epoch, kind })).is_err() {
                    break;
                }
            }
        });
        self.replace(kind, handle);
    }

    pub fn cancel(&mut self, kind: TimerKind) {
        if let Some(handle) = self.handles.remove(&kind) {
            handle.abort();
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, handle) in self.handles.drain() {
            handle.abort();
        }
    }

    fn replace(&mut self, kind: TimerKind, handle: JoinHandle<()>) {
        if let Some(previous) = self.handles.insert(kind, handle) {
            previous.abort();
        }
    }
}

impl<E> Drop for Timers<E> {
    fn drop(&mut self) {
        for (_, handle) in self.handles.drain() {
            handle.abort();
        }
    }
}
