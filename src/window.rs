//! Per-key sliding event window with an optional block deadline.
//!
//! Shared by the spam and raid guards: both answer "has this key seen too
//! many events recently?" and both turn an over-limit answer into a timed
//! block during which further events are flagged but not accounted.

use std::hash::Hash;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

/// Tuning for one window check. Passed per call so a caller may retune
/// thresholds live without touching recorded state.
#[derive(Debug, Clone, Copy)]
pub struct WindowPolicy {
    /// How far back events count.
    pub window: Duration,
    /// Highest event count inside the window that is still allowed.
    pub limit: u32,
    /// Block duration applied once the limit is exceeded.
    pub block_for: Duration,
}

/// Outcome of recording one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    /// This event pushed the key over the limit; a block starts now.
    Blocked,
    /// The key was already blocked; the event was not recorded.
    StillBlocked,
}

impl Verdict {
    pub fn is_flagged(self) -> bool {
        !matches!(self, Verdict::Allowed)
    }
}

#[derive(Debug, Default)]
struct WindowState {
    /// Event timestamps inside the window, oldest first. Pruned lazily on
    /// each access.
    events: Vec<DateTime<Utc>>,
    blocked_until: Option<DateTime<Utc>>,
}

/// Concurrent map of window states. Same-key operations are linearized by
/// the entry guard; no lock is held across an await point.
pub struct RateWindow<K: Eq + Hash> {
    entries: DashMap<K, WindowState>,
}

impl<K: Eq + Hash> RateWindow<K> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Record one event for `key` and evaluate it against `policy`, all
    /// under a single entry guard.
    ///
    /// An active block short-circuits: the event is flagged without being
    /// recorded, so a blocked key neither extends nor shortens its own
    /// block. When this event exceeds the limit, the block is set and the
    /// event list cleared, so the key starts from a fresh window once the
    /// block expires.
    pub fn record_and_check(&self, key: K, policy: &WindowPolicy, now: DateTime<Utc>) -> Verdict {
        let mut state = self.entries.entry(key).or_default();

        if let Some(until) = state.blocked_until {
            if now < until {
                return Verdict::StillBlocked;
            }
            state.blocked_until = None;
        }

        state
            .events
            .retain(|t| now.signed_duration_since(*t) < policy.window);
        state.events.push(now);

        if state.events.len() > policy.limit as usize {
            state.blocked_until = Some(now + policy.block_for);
            state.events.clear();
            return Verdict::Blocked;
        }

        Verdict::Allowed
    }

    /// Remaining block time in whole seconds; zero when not blocked.
    pub fn time_to_wait(&self, key: &K, now: DateTime<Utc>) -> i64 {
        match self.entries.get(key).and_then(|s| s.blocked_until) {
            Some(until) if until > now => (until - now).num_seconds().max(0),
            _ => 0,
        }
    }

    /// Lift an active block immediately. Recorded events are untouched.
    pub fn unblock(&self, key: &K) {
        if let Some(mut state) = self.entries.get_mut(key) {
            state.blocked_until = None;
        }
    }
}

impl<K: Eq + Hash> Default for RateWindow<K> {
    fn default() -> Self {
        Self::new()
    }
}
