//! Join-verification sessions: the letter-sequence challenge state machine.
//!
//! Pure state, no transport. The moderation layer drives the transitions
//! and turns the returned outcomes into messages, unmutes and kicks.

use chrono::Duration;
use dashmap::DashMap;
use rand::seq::SliceRandom;
use teloxide::types::{ChatId, MessageId, UserId};

pub const DEFAULT_REQUIRED_LETTERS: &str = "TUKYO";
pub const DEFAULT_BOARD_SIZE: usize = 16;
pub const DEFAULT_DEADLINE_SECS: i64 = 60;

#[derive(Debug, Clone)]
pub struct VerifyPolicy {
    /// The exact ordered letter sequence a member must press.
    pub required: Vec<char>,
    /// Total letters shown on the challenge keyboard.
    pub board_size: usize,
    /// How long a new member has before the pending kick fires.
    pub deadline: Duration,
}

impl Default for VerifyPolicy {
    fn default() -> Self {
        Self {
            required: DEFAULT_REQUIRED_LETTERS.chars().collect(),
            board_size: DEFAULT_BOARD_SIZE,
            deadline: Duration::seconds(DEFAULT_DEADLINE_SECS),
        }
    }
}

/// Where a member is in the flow. `Challenged` with an empty press list
/// means the board was just dealt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyStage {
    /// Muted on join; waiting for the member to press the group button.
    Joined,
    /// The private prompt with the start button is up.
    DmPrompted { dm_msg: MessageId },
    /// The board is up and presses are being collected.
    Challenged { dm_msg: MessageId, pressed: Vec<char> },
}

#[derive(Debug, Clone)]
pub struct VerifySession {
    /// Chat the member must be unmuted in on success.
    pub chat: ChatId,
    /// Display name, kept for the kick notice.
    pub name: String,
    /// The group welcome prompt, deleted once the flow resolves.
    pub welcome_msg: Option<MessageId>,
    pub stage: VerifyStage,
}

/// Result of one letter press.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PressOutcome {
    /// No session, or the board is not up; nothing to do.
    Ignored,
    InProgress { pressed: usize, required: usize },
    /// Full sequence matched. The session is already gone.
    Verified {
        chat: ChatId,
        dm_msg: MessageId,
        welcome_msg: Option<MessageId>,
    },
    /// Full-length mismatch. The attempt was discarded; the session is back
    /// at the start-button stage.
    Failed { dm_msg: MessageId },
}

/// One session per user currently mid-verification. Absence from the map is
/// the normal "nothing pending" state, never an error.
pub struct VerificationFlow {
    sessions: DashMap<UserId, VerifySession>,
    policy: VerifyPolicy,
}

impl VerificationFlow {
    pub fn new(policy: VerifyPolicy) -> Self {
        Self {
            sessions: DashMap::new(),
            policy,
        }
    }

    pub fn policy(&self) -> &VerifyPolicy {
        &self.policy
    }

    /// Open (or supersede) a session for a member who just joined `chat`.
    pub fn begin(&self, user: UserId, chat: ChatId, name: String) {
        self.sessions.insert(
            user,
            VerifySession {
                chat,
                name,
                welcome_msg: None,
                stage: VerifyStage::Joined,
            },
        );
    }

    /// Remember the group welcome prompt so it can be cleaned up later.
    pub fn welcome_posted(&self, user: UserId, msg: MessageId) {
        if let Some(mut session) = self.sessions.get_mut(&user) {
            session.welcome_msg = Some(msg);
        }
    }

    /// The member pressed the group verify button. Returns the originating
    /// chat while the session is still waiting for private contact.
    pub fn accept_verify_press(&self, user: UserId) -> Option<ChatId> {
        let session = self.sessions.get(&user)?;
        match session.stage {
            VerifyStage::Joined => Some(session.chat),
            _ => None,
        }
    }

    /// Record the private prompt message so later edits can replace it.
    pub fn dm_prompted(&self, user: UserId, dm_msg: MessageId) {
        if let Some(mut session) = self.sessions.get_mut(&user) {
            if session.stage == VerifyStage::Joined {
                session.stage = VerifyStage::DmPrompted { dm_msg };
            }
        }
    }

    /// Replace whichever prompt message the session points at. Used when an
    /// edit fails and a fresh message was sent instead.
    pub fn replace_dm_msg(&self, user: UserId, dm_msg: MessageId) {
        if let Some(mut session) = self.sessions.get_mut(&user) {
            match &mut session.stage {
                VerifyStage::Joined => {}
                VerifyStage::DmPrompted { dm_msg: m }
                | VerifyStage::Challenged { dm_msg: m, .. } => *m = dm_msg,
            }
        }
    }

    /// Deal (or re-deal) the challenge board, resetting any progress.
    /// Returns the prompt message to edit plus the shuffled board. `None`
    /// when the user has no session past the group-button stage.
    pub fn start_challenge(&self, user: UserId) -> Option<(MessageId, Vec<char>)> {
        let mut session = self.sessions.get_mut(&user)?;
        let dm_msg = match session.stage {
            VerifyStage::Joined => return None,
            VerifyStage::DmPrompted { dm_msg } => dm_msg,
            VerifyStage::Challenged { dm_msg, .. } => dm_msg,
        };
        session.stage = VerifyStage::Challenged {
            dm_msg,
            pressed: Vec::new(),
        };
        Some((dm_msg, self.deal_board()))
    }

    /// Record one letter press. The sequence is evaluated only once its
    /// length matches the required sequence; order matters.
    pub fn press_letter(&self, user: UserId, letter: char) -> PressOutcome {
        let Some(mut session) = self.sessions.get_mut(&user) else {
            return PressOutcome::Ignored;
        };
        let VerifyStage::Challenged { dm_msg, pressed } = &mut session.stage else {
            return PressOutcome::Ignored;
        };
        pressed.push(letter);
        if pressed.len() < self.policy.required.len() {
            return PressOutcome::InProgress {
                pressed: pressed.len(),
                required: self.policy.required.len(),
            };
        }

        let dm_msg = *dm_msg;
        if *pressed == self.policy.required {
            let chat = session.chat;
            let welcome_msg = session.welcome_msg;
            drop(session);
            self.sessions.remove(&user);
            PressOutcome::Verified { chat, dm_msg, welcome_msg }
        } else {
            session.stage = VerifyStage::DmPrompted { dm_msg };
            PressOutcome::Failed { dm_msg }
        }
    }

    /// Tear down a session (kick deadline, manual cleanup). Returns it so
    /// the caller can act on the originating chat.
    pub fn remove(&self, user: UserId) -> Option<VerifySession> {
        self.sessions.remove(&user).map(|(_, session)| session)
    }

    /// The required letters placed among random distinct fillers, fully
    /// shuffled. Board size is clamped so every required letter always fits.
    pub fn deal_board(&self) -> Vec<char> {
        let mut rng = rand::thread_rng();
        let required = &self.policy.required;
        let mut fillers: Vec<char> = ('A'..='Z').filter(|c| !required.contains(c)).collect();
        fillers.shuffle(&mut rng);
        let fill_count = self.policy.board_size.saturating_sub(required.len());
        let mut board: Vec<char> = required
            .iter()
            .copied()
            .chain(fillers.into_iter().take(fill_count))
            .collect();
        board.shuffle(&mut rng);
        board
    }
}
