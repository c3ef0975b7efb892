//! Chat-wide join-burst detection with a cooldown lockdown.

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use teloxide::types::ChatId;

use crate::window::{RateWindow, Verdict, WindowPolicy};

pub const DEFAULT_USER_AMOUNT: u32 = 4;
pub const DEFAULT_TIME_OUT_SECS: i64 = 20;
pub const DEFAULT_LOCKDOWN_SECS: i64 = 30;

#[derive(Debug, Clone, Copy)]
pub struct RaidPolicy {
    /// Join count inside the window that trips the lockdown.
    pub user_amount: u32,
    /// Window the joins are counted over.
    pub time_out: Duration,
    /// How long the chat stays locked down once tripped.
    pub lockdown_for: Duration,
}

impl Default for RaidPolicy {
    fn default() -> Self {
        Self {
            user_amount: DEFAULT_USER_AMOUNT,
            time_out: Duration::seconds(DEFAULT_TIME_OUT_SECS),
            lockdown_for: Duration::seconds(DEFAULT_LOCKDOWN_SECS),
        }
    }
}

/// Detects abnormal clustering of joins per chat. During a lockdown every
/// join is flagged for rejection; joins landing in that period are not
/// counted toward the next window. The policy is tunable at runtime.
pub struct RaidGuard {
    joins: RateWindow<ChatId>,
    policy: RwLock<RaidPolicy>,
}

impl RaidGuard {
    pub fn new(policy: RaidPolicy) -> Self {
        Self {
            joins: RateWindow::new(),
            policy: RwLock::new(policy),
        }
    }

    /// Record one join for `chat` and decide whether it must be rejected.
    /// The lockdown begins on the `user_amount`-th join inside the window;
    /// the counted joins are cleared with it.
    pub fn record_join_and_check(&self, chat: ChatId, now: DateTime<Utc>) -> Verdict {
        let policy = *self.policy.read();
        let window_policy = WindowPolicy {
            window: policy.time_out,
            // The N-th join trips the guard, so N - 1 are still allowed.
            limit: policy.user_amount.saturating_sub(1),
            block_for: policy.lockdown_for,
        };
        self.joins.record_and_check(chat, &window_policy, now)
    }

    pub fn is_raid(&self, chat: ChatId, now: DateTime<Utc>) -> bool {
        self.record_join_and_check(chat, now).is_flagged()
    }

    /// Remaining lockdown time in whole seconds.
    pub fn time_to_wait(&self, chat: ChatId, now: DateTime<Utc>) -> i64 {
        self.joins.time_to_wait(&chat, now)
    }

    /// Administrative override: end an active lockdown immediately.
    pub fn force_end(&self, chat: ChatId) {
        self.joins.unblock(&chat);
    }

    pub fn set_policy(&self, policy: RaidPolicy) {
        *self.policy.write() = policy;
    }

    pub fn policy(&self) -> RaidPolicy {
        *self.policy.read()
    }
}
