//! The moderation subsystem instance: routes classified inbound events
//! (message, join, button press, timer) through the guards and executes the
//! decided side effects against the transport.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use teloxide::types::{ChatId, InlineKeyboardButton, InlineKeyboardMarkup, MessageId, UserId};
use tracing::{debug, info};

use crate::config::{format_template, Messages, ModerationConfig};
use crate::raid::RaidGuard;
use crate::scheduler::{Scheduler, TimerEvent, TimerKey};
use crate::spam::SpamGuard;
use crate::transport::ChatApi;
use crate::verify::{PressOutcome, VerificationFlow};
use crate::window::Verdict;

const CB_VERIFY: &str = "v";
const CB_START: &str = "v:s";
const CB_LETTER_PREFIX: &str = "v:l:";

/// A recognized button press.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Callback {
    Verify,
    Start,
    Letter(char),
}

pub fn parse_callback(data: &str) -> Option<Callback> {
    match data {
        CB_VERIFY => Some(Callback::Verify),
        CB_START => Some(Callback::Start),
        _ => {
            let rest = data.strip_prefix(CB_LETTER_PREFIX)?;
            let mut chars = rest.chars();
            let letter = chars.next()?;
            if chars.next().is_some() || !letter.is_ascii_uppercase() {
                return None;
            }
            Some(Callback::Letter(letter))
        }
    }
}

fn letter_callback(letter: char) -> String {
    format!("{CB_LETTER_PREFIX}{letter}")
}

/// One instance per process, shared by every update handler.
pub struct Moderation {
    api: Arc<dyn ChatApi>,
    pub spam: SpamGuard,
    pub raid: RaidGuard,
    pub verify: VerificationFlow,
    pub scheduler: Scheduler,
    messages: Messages,
}

impl Moderation {
    pub fn new(api: Arc<dyn ChatApi>, cfg: &ModerationConfig, scheduler: Scheduler) -> Self {
        Self {
            api,
            spam: SpamGuard::new(cfg.spam.resolve()),
            raid: RaidGuard::new(cfg.raid.resolve()),
            verify: VerificationFlow::new(cfg.verification.resolve()),
            scheduler,
            messages: cfg.messages.resolve(),
        }
    }

    fn dm_chat(user: UserId) -> ChatId {
        ChatId(user.0 as i64)
    }

    /// A group message from a non-admin member.
    pub async fn on_message(&self, chat: ChatId, user: UserId, name: &str, now: DateTime<Utc>) {
        match self.spam.check(user, now) {
            Verdict::Allowed => {}
            Verdict::Blocked => {
                let mute_for = self.spam.mute_for();
                info!(%user, chat = chat.0, secs = mute_for.num_seconds(), "rate limit exceeded, muting");
                self.api.restrict(chat, user, false, Some(now + mute_for)).await;
                self.scheduler.schedule_once(
                    TimerKey::Unmute { chat, user },
                    mute_for.to_std().unwrap_or_default(),
                    TimerEvent::Unmute { chat, user },
                );
                let mut vars = HashMap::new();
                vars.insert("user", name.to_string());
                vars.insert("seconds", mute_for.num_seconds().to_string());
                self.api
                    .send_text(chat, format_template(&self.messages.muted, &vars))
                    .await;
            }
            Verdict::StillBlocked => {
                debug!(%user, "message from a muted user, ignoring");
            }
        }
    }

    /// A member joined a protected chat.
    pub async fn on_member_joined(
        &self,
        chat: ChatId,
        user: UserId,
        name: &str,
        group_name: &str,
        now: DateTime<Utc>,
    ) {
        match self.raid.record_join_and_check(chat, now) {
            Verdict::Blocked => {
                info!(chat = chat.0, "join burst detected, locking the chat down");
                let mut vars = HashMap::new();
                vars.insert("seconds", self.raid.time_to_wait(chat, now).to_string());
                self.api
                    .send_text(chat, format_template(&self.messages.raid_lockdown, &vars))
                    .await;
                self.api.kick(chat, user).await;
            }
            Verdict::StillBlocked => {
                self.api.kick(chat, user).await;
            }
            Verdict::Allowed => {
                let deadline = self.verify.policy().deadline;
                self.verify.begin(user, chat, name.to_string());
                self.api.restrict(chat, user, false, None).await;

                let mut vars = HashMap::new();
                vars.insert("user", name.to_string());
                vars.insert("group", group_name.to_string());
                vars.insert("seconds", deadline.num_seconds().to_string());
                let keyboard = InlineKeyboardMarkup::new(vec![vec![
                    InlineKeyboardButton::callback(
                        self.messages.verify_button.clone(),
                        CB_VERIFY.to_string(),
                    ),
                ]]);
                if let Some(welcome_msg) = self
                    .api
                    .send_keyboard(chat, format_template(&self.messages.welcome, &vars), keyboard)
                    .await
                {
                    self.verify.welcome_posted(user, welcome_msg);
                }

                self.scheduler.schedule_once(
                    TimerKey::Kick { chat, user },
                    deadline.to_std().unwrap_or_default(),
                    TimerEvent::KickUnverified { chat, user },
                );
            }
        }
    }

    /// Any button press routed to the moderation layer.
    pub async fn on_callback(
        &self,
        user: UserId,
        name: &str,
        callback_id: String,
        data: Option<&str>,
    ) {
        let Some(callback) = data.and_then(parse_callback) else {
            self.api.answer_callback(callback_id, None).await;
            return;
        };

        match callback {
            Callback::Verify => self.handle_verify_press(user, name, callback_id).await,
            Callback::Start => self.handle_start_press(user, callback_id).await,
            Callback::Letter(letter) => self.handle_letter_press(user, letter, callback_id).await,
        }
    }

    async fn handle_verify_press(&self, user: UserId, name: &str, callback_id: String) {
        let Some(origin_chat) = self.verify.accept_verify_press(user) else {
            self.api
                .answer_callback(callback_id, Some("No pending verification.".into()))
                .await;
            return;
        };

        let keyboard = InlineKeyboardMarkup::new(vec![vec![InlineKeyboardButton::callback(
            self.messages.start_button.clone(),
            CB_START.to_string(),
        )]]);
        match self
            .api
            .send_keyboard(Self::dm_chat(user), self.messages.dm_intro.clone(), keyboard)
            .await
        {
            Some(dm_msg) => {
                self.verify.dm_prompted(user, dm_msg);
                self.api
                    .answer_callback(callback_id, Some("Check your private messages.".into()))
                    .await;
            }
            None => {
                // The member never opened a private chat with the bot.
                let mut vars = HashMap::new();
                vars.insert("user", name.to_string());
                self.api
                    .send_text(
                        origin_chat,
                        format_template(&self.messages.dm_unreachable, &vars),
                    )
                    .await;
                self.api.answer_callback(callback_id, None).await;
            }
        }
    }

    async fn handle_start_press(&self, user: UserId, callback_id: String) {
        let Some((dm_msg, board)) = self.verify.start_challenge(user) else {
            self.api
                .answer_callback(callback_id, Some("No pending verification.".into()))
                .await;
            return;
        };
        self.api.answer_callback(callback_id, None).await;

        let rows: Vec<Vec<InlineKeyboardButton>> = board
            .chunks(4)
            .map(|row| {
                row.iter()
                    .map(|&c| InlineKeyboardButton::callback(c.to_string(), letter_callback(c)))
                    .collect()
            })
            .collect();
        self.show_dm(
            user,
            dm_msg,
            self.messages.question.clone(),
            Some(InlineKeyboardMarkup::new(rows)),
        )
        .await;
    }

    async fn handle_letter_press(&self, user: UserId, letter: char, callback_id: String) {
        match self.verify.press_letter(user, letter) {
            PressOutcome::Ignored => {
                self.api
                    .answer_callback(callback_id, Some("No active challenge.".into()))
                    .await;
            }
            PressOutcome::InProgress { .. } => {
                self.api.answer_callback(callback_id, None).await;
            }
            PressOutcome::Verified { chat, dm_msg, welcome_msg } => {
                info!(%user, chat = chat.0, "verification passed");
                self.api
                    .answer_callback(callback_id, Some("Verified!".into()))
                    .await;
                self.show_dm(user, dm_msg, self.messages.verified.clone(), None).await;
                self.api.restrict(chat, user, true, None).await;
                self.scheduler.cancel(TimerKey::Kick { chat, user });
                if let Some(welcome_msg) = welcome_msg {
                    self.api.delete_message(chat, welcome_msg).await;
                }
            }
            PressOutcome::Failed { dm_msg } => {
                self.api
                    .answer_callback(callback_id, Some("Wrong sequence.".into()))
                    .await;
                let retry = InlineKeyboardMarkup::new(vec![vec![InlineKeyboardButton::callback(
                    self.messages.start_button.clone(),
                    CB_START.to_string(),
                )]]);
                self.show_dm(user, dm_msg, self.messages.failed.clone(), Some(retry)).await;
            }
        }
    }

    /// A timer fired. Timeout transitions run through here, on the same
    /// instance the user-driven ones do.
    pub async fn on_timer(&self, event: TimerEvent) {
        match event {
            TimerEvent::Unmute { chat, user } => {
                // Unconditional restore; harmless if the mute never landed.
                self.api.restrict(chat, user, true, None).await;
            }
            TimerEvent::KickUnverified { chat, user } => {
                let Some(session) = self.verify.remove(user) else {
                    // Verified in the same instant the deadline lapsed.
                    debug!(%user, "kick deadline fired with no session");
                    return;
                };
                info!(%user, chat = chat.0, "verification deadline lapsed, kicking");
                self.api.kick(chat, user).await;
                if let Some(welcome_msg) = session.welcome_msg {
                    self.api.delete_message(chat, welcome_msg).await;
                }
                let mut vars = HashMap::new();
                vars.insert("user", session.name.clone());
                self.api
                    .send_text(chat, format_template(&self.messages.kicked, &vars))
                    .await;
            }
        }
    }

    /// Edit the tracked private prompt in place; if the edit does not land,
    /// degrade to a fresh message and re-point the session at it.
    async fn show_dm(
        &self,
        user: UserId,
        dm_msg: MessageId,
        text: String,
        keyboard: Option<InlineKeyboardMarkup>,
    ) {
        let dm = Self::dm_chat(user);
        if self
            .api
            .edit_text(dm, dm_msg, text.clone(), keyboard.clone())
            .await
        {
            return;
        }
        let sent = match keyboard {
            Some(kb) => self.api.send_keyboard(dm, text, kb).await,
            None => self.api.send_text(dm, text).await,
        };
        if let Some(fresh) = sent {
            self.verify.replace_dm_msg(user, fresh);
        }
    }

    // Manual actions for the administrative surface. They bypass the guards
    // but share the timer discipline with the automated paths.

    pub async fn admin_mute(&self, chat: ChatId, user: UserId, secs: i64, now: DateTime<Utc>) {
        self.api
            .restrict(chat, user, false, Some(now + Duration::seconds(secs)))
            .await;
        self.scheduler.schedule_once(
            TimerKey::Unmute { chat, user },
            std::time::Duration::from_secs(secs.max(0) as u64),
            TimerEvent::Unmute { chat, user },
        );
    }

    pub async fn admin_unmute(&self, chat: ChatId, user: UserId) {
        self.scheduler.cancel(TimerKey::Unmute { chat, user });
        self.api.restrict(chat, user, true, None).await;
    }

    pub async fn admin_kick(&self, chat: ChatId, user: UserId) {
        self.scheduler.cancel(TimerKey::Kick { chat, user });
        self.verify.remove(user);
        self.api.kick(chat, user).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModerationConfig;
    use crate::transport::mock::{ApiCall, MockApi};
    use tokio::sync::mpsc;

    const CHAT: ChatId = ChatId(-1001);
    const USER: UserId = UserId(42);

    fn setup() -> (Arc<MockApi>, Moderation, mpsc::Receiver<TimerEvent>) {
        let (tx, rx) = mpsc::channel(16);
        let mock = Arc::new(MockApi::new());
        let moderation = Moderation::new(
            mock.clone(),
            &ModerationConfig::default(),
            Scheduler::new(tx),
        );
        (mock, moderation, rx)
    }

    async fn join(m: &Moderation, now: DateTime<Utc>) {
        m.on_member_joined(CHAT, USER, "Ada", "testers", now).await;
    }

    async fn press(m: &Moderation, letter: char) {
        m.on_callback(USER, "Ada", "cb".into(), Some(letter_callback(letter).as_str()))
            .await;
    }

    async fn solve(m: &Moderation) {
        m.on_callback(USER, "Ada", "cb".into(), Some(CB_VERIFY)).await;
        m.on_callback(USER, "Ada", "cb".into(), Some(CB_START)).await;
        for c in ['T', 'U', 'K', 'Y', 'O'] {
            press(m, c).await;
        }
    }

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[tokio::test]
    async fn join_mutes_and_greets_and_arms_the_kick() {
        let (mock, m, _rx) = setup();
        join(&m, t0()).await;

        assert!(mock.restricted(CHAT, USER, false));
        let texts = mock.sent_texts(CHAT);
        assert_eq!(texts.len(), 1);
        assert!(texts[0].contains("Ada") && texts[0].contains("testers"), "{}", texts[0]);
        assert!(m.scheduler.armed(TimerKey::Kick { chat: CHAT, user: USER }));
    }

    #[tokio::test]
    async fn solving_the_challenge_unmutes_and_disarms_the_kick() {
        let (mock, m, _rx) = setup();
        join(&m, t0()).await;
        solve(&m).await;

        assert!(mock.restricted(CHAT, USER, true));
        assert!(!m.scheduler.armed(TimerKey::Kick { chat: CHAT, user: USER }));
        // The group welcome prompt was cleaned up.
        assert!(mock
            .calls()
            .iter()
            .any(|c| matches!(c, ApiCall::Delete { chat, .. } if *chat == CHAT)));
        // The private prompt ended on the success text.
        let edits: Vec<_> = mock
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                ApiCall::Edit { chat, text, .. } if chat == ChatId(USER.0 as i64) => Some(text),
                _ => None,
            })
            .collect();
        assert!(edits.last().unwrap().contains("successful"));
    }

    #[tokio::test]
    async fn wrong_sequence_keeps_the_kick_armed_and_offers_retry() {
        let (mock, m, _rx) = setup();
        join(&m, t0()).await;
        m.on_callback(USER, "Ada", "cb".into(), Some(CB_VERIFY)).await;
        m.on_callback(USER, "Ada", "cb".into(), Some(CB_START)).await;
        for c in ['T', 'U', 'K', 'O', 'Y'] {
            press(&m, c).await;
        }

        assert!(!mock.restricted(CHAT, USER, true));
        assert!(m.scheduler.armed(TimerKey::Kick { chat: CHAT, user: USER }));

        // The retry path starts from a fresh board and still works.
        m.on_callback(USER, "Ada", "cb".into(), Some(CB_START)).await;
        for c in ['T', 'U', 'K', 'Y', 'O'] {
            press(&m, c).await;
        }
        assert!(mock.restricted(CHAT, USER, true));
        assert!(!m.scheduler.armed(TimerKey::Kick { chat: CHAT, user: USER }));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_kicks_and_announces() {
        let (mock, m, mut rx) = setup();
        join(&m, t0()).await;

        tokio::time::advance(std::time::Duration::from_secs(61)).await;
        let event = rx.recv().await.unwrap();
        m.on_timer(event).await;

        assert!(mock.kicked(CHAT, USER));
        assert!(mock.sent_texts(CHAT).iter().any(|t| t.contains("removed")));
        // The session died with the kick; stray presses go nowhere.
        press(&m, 'T').await;
        assert!(!mock.restricted(CHAT, USER, true));
    }

    #[tokio::test(start_paused = true)]
    async fn verifying_after_the_deadline_race_is_benign() {
        let (mock, m, mut rx) = setup();
        join(&m, t0()).await;
        solve(&m).await;

        // A fired-but-cancelled timer never surfaces; force the handler
        // anyway to prove the no-session path is quiet.
        tokio::time::advance(std::time::Duration::from_secs(120)).await;
        assert!(rx.try_recv().is_err());
        m.on_timer(TimerEvent::KickUnverified { chat: CHAT, user: USER }).await;
        assert!(!mock.kicked(CHAT, USER));
    }

    #[tokio::test]
    async fn join_burst_locks_down_and_kicks() {
        let (mock, m, _rx) = setup();
        for (i, secs) in [0, 5, 10].into_iter().enumerate() {
            let user = UserId(100 + i as u64);
            m.on_member_joined(CHAT, user, "x", "testers", t0() + Duration::seconds(secs))
                .await;
            assert!(!mock.kicked(CHAT, user));
        }

        let raider = UserId(200);
        m.on_member_joined(CHAT, raider, "x", "testers", t0() + Duration::seconds(15))
            .await;
        assert!(mock.kicked(CHAT, raider));
        assert!(mock
            .sent_texts(CHAT)
            .iter()
            .any(|t| t.contains("Join burst")));

        // Stragglers during the lockdown are kicked without a new notice.
        let straggler = UserId(201);
        m.on_member_joined(CHAT, straggler, "x", "testers", t0() + Duration::seconds(20))
            .await;
        assert!(mock.kicked(CHAT, straggler));
    }

    #[tokio::test]
    async fn flood_mutes_once_and_schedules_the_unmute() {
        let (mock, m, mut rx) = setup();
        for i in 0..6 {
            m.on_message(CHAT, USER, "Ada", t0() + Duration::milliseconds(i * 100))
                .await;
        }

        assert!(mock.restricted(CHAT, USER, false));
        assert!(m.scheduler.armed(TimerKey::Unmute { chat: CHAT, user: USER }));
        assert_eq!(
            mock.sent_texts(CHAT)
                .iter()
                .filter(|t| t.contains("muted"))
                .count(),
            1
        );

        // More messages while muted change nothing.
        m.on_message(CHAT, USER, "Ada", t0() + Duration::seconds(2)).await;
        assert_eq!(
            mock.calls()
                .iter()
                .filter(|c| matches!(c, ApiCall::Restrict { .. }))
                .count(),
            1
        );

        m.on_timer(TimerEvent::Unmute { chat: CHAT, user: USER }).await;
        assert!(mock.restricted(CHAT, USER, true));
        drop(rx);
    }

    #[tokio::test]
    async fn broken_edits_degrade_to_fresh_messages() {
        let (mock, m, _rx) = setup();
        join(&m, t0()).await;
        m.on_callback(USER, "Ada", "cb".into(), Some(CB_VERIFY)).await;

        mock.fail_edits.store(true, std::sync::atomic::Ordering::SeqCst);
        m.on_callback(USER, "Ada", "cb".into(), Some(CB_START)).await;

        // The board went out as a new message instead of an edit, and the
        // challenge is still solvable.
        let dm = ChatId(USER.0 as i64);
        let dm_sends = mock
            .calls()
            .into_iter()
            .filter(|c| matches!(c, ApiCall::Send { chat, with_keyboard: true, .. } if *chat == dm))
            .count();
        assert_eq!(dm_sends, 2);

        mock.fail_edits.store(false, std::sync::atomic::Ordering::SeqCst);
        for c in ['T', 'U', 'K', 'Y', 'O'] {
            press(&m, c).await;
        }
        assert!(mock.restricted(CHAT, USER, true));
    }

    #[tokio::test]
    async fn stray_and_malformed_presses_are_answered_quietly() {
        let (mock, m, _rx) = setup();
        m.on_callback(USER, "Ada", "cb".into(), Some(CB_VERIFY)).await;
        m.on_callback(USER, "Ada", "cb".into(), Some("v:l:??")).await;
        m.on_callback(USER, "Ada", "cb".into(), None).await;
        press(&m, 'T').await;

        assert!(mock
            .calls()
            .iter()
            .all(|c| matches!(c, ApiCall::Answer { .. })));
    }

    #[test]
    fn callback_data_round_trips() {
        assert_eq!(parse_callback(CB_VERIFY), Some(Callback::Verify));
        assert_eq!(parse_callback(CB_START), Some(Callback::Start));
        assert_eq!(parse_callback(&letter_callback('Q')), Some(Callback::Letter('Q')));
        assert_eq!(parse_callback("v:l:q"), None);
        assert_eq!(parse_callback("v:l:QQ"), None);
        assert_eq!(parse_callback("w"), None);
        assert_eq!(parse_callback(""), None);
    }
}
