//! Keyed one-shot timers for deferred moderation actions.
//!
//! A fired timer does not act on its own: it enqueues a typed event on the
//! moderation event channel, so timeout-driven transitions run through the
//! same handlers as user-driven ones.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use teloxide::types::{ChatId, UserId};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

/// Address of a pending timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKey {
    Unmute { chat: ChatId, user: UserId },
    Kick { chat: ChatId, user: UserId },
}

/// What a fired timer asks the moderation loop to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    /// Restore send permission after a spam mute.
    Unmute { chat: ChatId, user: UserId },
    /// Remove a member whose verification deadline lapsed.
    KickUnverified { chat: ChatId, user: UserId },
}

struct SchedulerInner {
    timers: DashMap<TimerKey, AbortHandle>,
    tx: mpsc::Sender<TimerEvent>,
}

/// Schedules an event to fire once after a delay, addressable by key so it
/// can be cancelled first. Fire and cancel race by claiming the registry
/// entry: whichever removes it wins, so an event is delivered at most once
/// and a won cancel means it is never delivered.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(tx: mpsc::Sender<TimerEvent>) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                timers: DashMap::new(),
                tx,
            }),
        }
    }

    /// Arm `key` to deliver `event` after `delay`. An already-armed key is
    /// replaced and its previous timer cancelled.
    pub fn schedule_once(&self, key: TimerKey, delay: Duration, event: TimerEvent) {
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Deliver only if the entry is still ours to claim.
            if inner.timers.remove(&key).is_some() {
                if inner.tx.send(event).await.is_err() {
                    warn!(?key, "timer fired but the event consumer is gone");
                }
            }
        });
        if let Some(previous) = self.inner.timers.insert(key, handle.abort_handle()) {
            debug!(?key, "replacing armed timer");
            previous.abort();
        }
    }

    /// Disarm `key`. Cancelling an unknown or already-fired key is a no-op.
    pub fn cancel(&self, key: TimerKey) {
        if let Some((_, handle)) = self.inner.timers.remove(&key) {
            handle.abort();
        }
    }

    #[cfg(test)]
    pub fn armed(&self, key: TimerKey) -> bool {
        self.inner.timers.contains_key(&key)
    }
}
