//! Cancellable coordinator timers
//!
//! Each timer is a spawned sleep that posts `TimerFired` back onto the
//! coordinator's command channel. A key holds at most one live timer, and a
//! generation counter lets the coordinator discard firings that raced a
//! cancel.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::command::CoordinatorCommand;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKey {
    /// Stubborn-mode confirmation reply
    AutoReply,
    /// First peer status summary after a manual reconnect
    StatusConfirm,
    /// Second, final peer status summary
    StatusFinal,
}

struct Timer {
    generation: u64,
    handle: JoinHandle<()>,
}

pub struct Scheduler {
    command_tx: mpsc::Sender<CoordinatorCommand>,
    timers: HashMap<TimerKey, Timer>,
    next_generation: u64,
}

impl Scheduler {
    pub fn new(command_tx: mpsc::Sender<CoordinatorCommand>) -> Self {
        Self {
            command_tx,
            timers: HashMap::new(),
            next_generation: 0,
        }
    }

    /// Start (or restart) the timer for `key`.
    pub fn schedule(&mut self, key: TimerKey, delay: Duration) {
        self.cancel(key);
        self.next_generation += 1;
        let generation = self.next_generation;

        let tx = self.command_tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx
                .send(CoordinatorCommand::TimerFired { key, generation })
                .await;
        });
        self.timers.insert(key, Timer { generation, handle });
    }

    pub fn cancel(&mut self, key: TimerKey) -> bool {
        match self.timers.remove(&key) {
            Some(timer) => {
                timer.handle.abort();
                debug!(
                    component = "scheduler",
                    event = "timer.cancelled",
                    key = ?key,
                    "Timer cancelled"
                );
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub fn is_scheduled(&self, key: TimerKey) -> bool {
        self.timers.contains_key(&key)
    }

    /// Accept a firing. False when the timer was cancelled or replaced since.
    pub fn complete(&mut self, key: TimerKey, generation: u64) -> bool {
        match self.timers.get(&key) {
            Some(timer) if timer.generation == generation => {
                self.timers.remove(&key);
                true
            }
            _ => false,
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, timer) in self.timers.drain() {
            timer.handle.abort();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
