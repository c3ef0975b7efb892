//! Per-user message-rate limiter with an escalating timed mute.

use chrono::{DateTime, Duration, Utc};
use teloxide::types::UserId;

use crate::window::{RateWindow, Verdict, WindowPolicy};

pub const DEFAULT_RATE_LIMIT: u32 = 5;
pub const DEFAULT_TIME_WINDOW_SECS: i64 = 10;
pub const DEFAULT_MUTE_SECS: i64 = 60;

#[derive(Debug, Clone, Copy)]
pub struct SpamPolicy {
    /// Messages allowed per user inside the window.
    pub rate_limit: u32,
    pub time_window: Duration,
    pub mute_for: Duration,
}

impl Default for SpamPolicy {
    fn default() -> Self {
        Self {
            rate_limit: DEFAULT_RATE_LIMIT,
            time_window: Duration::seconds(DEFAULT_TIME_WINDOW_SECS),
            mute_for: Duration::seconds(DEFAULT_MUTE_SECS),
        }
    }
}

/// Tracks message rates per user across all protected chats. A user over
/// the limit is blocked for `mute_for`; messages sent while muted are
/// flagged without extending the mute.
pub struct SpamGuard {
    messages: RateWindow<UserId>,
    policy: SpamPolicy,
}

impl SpamGuard {
    pub fn new(policy: SpamPolicy) -> Self {
        Self {
            messages: RateWindow::new(),
            policy,
        }
    }

    /// Record one message and classify it. `Verdict::Blocked` means this
    /// message started the mute and the caller should restrict the user and
    /// schedule the unmute; `StillBlocked` needs no further action.
    pub fn check(&self, user: UserId, now: DateTime<Utc>) -> Verdict {
        let window_policy = WindowPolicy {
            window: self.policy.time_window,
            limit: self.policy.rate_limit,
            block_for: self.policy.mute_for,
        };
        self.messages.record_and_check(user, &window_policy, now)
    }

    pub fn is_spam(&self, user: UserId, now: DateTime<Utc>) -> bool {
        self.check(user, now).is_flagged()
    }

    /// Remaining mute time in whole seconds.
    pub fn time_to_wait(&self, user: UserId, now: DateTime<Utc>) -> i64 {
        self.messages.time_to_wait(&user, now)
    }

    pub fn mute_for(&self) -> Duration {
        self.policy.mute_for
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    const USER: UserId = UserId(1001);

    #[test]
    fn five_messages_in_ten_seconds_are_fine() {
        let guard = SpamGuard::new(SpamPolicy::default());
        for i in 0..5 {
            assert!(!guard.is_spam(USER, t0() + Duration::seconds(i * 2)));
        }
    }

    #[test]
    fn sixth_message_mutes_for_sixty_seconds() {
        let guard = SpamGuard::new(SpamPolicy::default());
        for _ in 0..5 {
            assert!(!guard.is_spam(USER, t0()));
        }
        assert_eq!(guard.check(USER, t0()), Verdict::Blocked);
        assert_eq!(guard.time_to_wait(USER, t0()), 60);
    }

    #[test]
    fn messages_while_muted_do_not_extend_the_mute() {
        let guard = SpamGuard::new(SpamPolicy::default());
        for _ in 0..6 {
            guard.is_spam(USER, t0());
        }
        // Keep hammering; the wait still runs out at the first deadline.
        for i in 1..60 {
            assert_eq!(
                guard.check(USER, t0() + Duration::seconds(i)),
                Verdict::StillBlocked
            );
        }
        assert!(!guard.is_spam(USER, t0() + Duration::seconds(60)));
    }

    #[test]
    fn burst_of_six_within_three_seconds() {
        let guard = SpamGuard::new(SpamPolicy::default());
        let times = [0, 0, 1, 1, 2, 3];
        let mut verdicts = Vec::new();
        for secs in times {
            verdicts.push(guard.check(USER, t0() + Duration::seconds(secs)));
        }
        assert_eq!(verdicts[5], Verdict::Blocked);
        assert_eq!(guard.time_to_wait(USER, t0() + Duration::seconds(3)), 60);
    }

    #[test]
    fn users_do_not_interfere() {
        let guard = SpamGuard::new(SpamPolicy::default());
        for _ in 0..6 {
            guard.is_spam(USER, t0());
        }
        assert!(!guard.is_spam(UserId(2002), t0()));
    }

    #[test]
    fn concurrent_checks_for_one_user_are_linearized() {
        let guard = SpamGuard::new(SpamPolicy::default());
        let now = t0();
        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..16)
                .map(|_| scope.spawn(|| guard.is_spam(USER, now)))
                .collect();
            let passed = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|spam| !spam)
                .count();
            // Exactly the allowed count may pass, no matter the interleaving.
            assert_eq!(passed, 5);
        });
    }
}
