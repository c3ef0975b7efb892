//! YAML configuration: bot identity, protected groups, moderation policy
//! knobs and user-facing message templates.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use chrono::Duration;
use serde::Deserialize;

use crate::raid::{RaidPolicy, DEFAULT_LOCKDOWN_SECS, DEFAULT_TIME_OUT_SECS, DEFAULT_USER_AMOUNT};
use crate::spam::{SpamPolicy, DEFAULT_MUTE_SECS, DEFAULT_RATE_LIMIT, DEFAULT_TIME_WINDOW_SECS};
use crate::verify::{VerifyPolicy, DEFAULT_BOARD_SIZE, DEFAULT_DEADLINE_SECS, DEFAULT_REQUIRED_LETTERS};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub bot: BotConfig,
    #[serde(default)]
    pub moderation: ModerationConfig,
    pub groups: Vec<GroupConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BotConfig {
    pub token: String,
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GroupConfig {
    pub name: String,
    pub chat_id: i64,
    pub ignore_admins: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModerationConfig {
    #[serde(default)]
    pub spam: SpamCfg,
    #[serde(default)]
    pub raid: RaidCfg,
    #[serde(default)]
    pub verification: VerifyCfg,
    #[serde(default)]
    pub messages: MessagesCfg,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SpamCfg {
    pub rate_limit: Option<u32>,
    pub time_window_secs: Option<i64>,
    pub mute_secs: Option<i64>,
}

impl SpamCfg {
    pub fn resolve(&self) -> SpamPolicy {
        SpamPolicy {
            rate_limit: self.rate_limit.unwrap_or(DEFAULT_RATE_LIMIT),
            time_window: Duration::seconds(self.time_window_secs.unwrap_or(DEFAULT_TIME_WINDOW_SECS)),
            mute_for: Duration::seconds(self.mute_secs.unwrap_or(DEFAULT_MUTE_SECS)),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RaidCfg {
    pub user_amount: Option<u32>,
    pub time_out_secs: Option<i64>,
    pub lockdown_secs: Option<i64>,
}

impl RaidCfg {
    pub fn resolve(&self) -> RaidPolicy {
        RaidPolicy {
            user_amount: self.user_amount.unwrap_or(DEFAULT_USER_AMOUNT),
            time_out: Duration::seconds(self.time_out_secs.unwrap_or(DEFAULT_TIME_OUT_SECS)),
            lockdown_for: Duration::seconds(self.lockdown_secs.unwrap_or(DEFAULT_LOCKDOWN_SECS)),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VerifyCfg {
    pub required_letters: Option<String>,
    pub board_size: Option<usize>,
    pub deadline_secs: Option<i64>,
}

impl VerifyCfg {
    fn required_letters(&self) -> &str {
        self.required_letters.as_deref().unwrap_or(DEFAULT_REQUIRED_LETTERS)
    }

    pub fn resolve(&self) -> VerifyPolicy {
        VerifyPolicy {
            required: self.required_letters().chars().collect(),
            board_size: self.board_size.unwrap_or(DEFAULT_BOARD_SIZE),
            deadline: Duration::seconds(self.deadline_secs.unwrap_or(DEFAULT_DEADLINE_SECS)),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessagesCfg {
    pub welcome: Option<String>,
    pub verify_button: Option<String>,
    pub dm_intro: Option<String>,
    pub start_button: Option<String>,
    pub question: Option<String>,
    pub verified: Option<String>,
    pub failed: Option<String>,
    pub kicked: Option<String>,
    pub muted: Option<String>,
    pub raid_lockdown: Option<String>,
    pub dm_unreachable: Option<String>,
}

/// Resolved user-facing texts. Placeholders (`{user}`, `{group}`,
/// `{seconds}`) are expanded with [`format_template`].
#[derive(Debug, Clone)]
pub struct Messages {
    pub welcome: String,
    pub verify_button: String,
    pub dm_intro: String,
    pub start_button: String,
    pub question: String,
    pub verified: String,
    pub failed: String,
    pub kicked: String,
    pub muted: String,
    pub raid_lockdown: String,
    pub dm_unreachable: String,
}

impl MessagesCfg {
    pub fn resolve(&self) -> Messages {
        fn pick(value: &Option<String>, default: &str) -> String {
            value.clone().unwrap_or_else(|| default.to_string())
        }
        Messages {
            welcome: pick(
                &self.welcome,
                "Welcome to {group}, {user}!\n\nPress the button below to verify you are human. You have {seconds} seconds.",
            ),
            verify_button: pick(&self.verify_button, "Click here to verify"),
            dm_intro: pick(
                &self.dm_intro,
                "Welcome! Press the button below to begin verification.",
            ),
            start_button: pick(&self.start_button, "Start verification"),
            question: pick(&self.question, "Press the letters in the correct order."),
            verified: pick(
                &self.verified,
                "Verification successful, you may now return to the chat!",
            ),
            failed: pick(&self.failed, "Verification failed. Please try again."),
            kicked: pick(&self.kicked, "{user} was removed for not verifying in time."),
            muted: pick(
                &self.muted,
                "{user} has been muted for {seconds}s for sending messages too quickly.",
            ),
            raid_lockdown: pick(
                &self.raid_lockdown,
                "Join burst detected! New members are blocked for the next {seconds} seconds.",
            ),
            dm_unreachable: pick(
                &self.dm_unreachable,
                "{user}: I could not message you privately. Open a private chat with me first, then press the button again.",
            ),
        }
    }
}

pub fn format_template(template: &str, vars: &HashMap<&str, String>) -> String {
    let mut out = template.to_string();
    for (k, v) in vars {
        out = out.replace(&format!("{{{}}}", k), v);
    }
    out
}

pub fn load_config(path: &PathBuf) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read config: {}", path.display()))?;
    let cfg: Config = serde_yaml::from_str(&text).context("parse yaml")?;
    Ok(cfg)
}

pub fn validate_config(cfg: &Config) -> Result<()> {
    if cfg.bot.token.trim().is_empty() {
        return Err(anyhow!("bot.token is empty"));
    }

    let mut seen_chat = HashMap::<i64, String>::new();
    for g in &cfg.groups {
        if let Some(prev) = seen_chat.insert(g.chat_id, g.name.clone()) {
            return Err(anyhow!(
                "duplicate chat_id {} found in groups: '{}' and '{}'",
                g.chat_id,
                prev,
                g.name
            ));
        }
    }

    let spam = &cfg.moderation.spam;
    if spam.time_window_secs.unwrap_or(DEFAULT_TIME_WINDOW_SECS) <= 0 {
        return Err(anyhow!("spam.time_window_secs must be > 0"));
    }
    if spam.mute_secs.unwrap_or(DEFAULT_MUTE_SECS) <= 0 {
        return Err(anyhow!("spam.mute_secs must be > 0"));
    }

    let raid = &cfg.moderation.raid;
    if raid.user_amount.unwrap_or(DEFAULT_USER_AMOUNT) == 0 {
        return Err(anyhow!("raid.user_amount must be >= 1"));
    }
    if raid.time_out_secs.unwrap_or(DEFAULT_TIME_OUT_SECS) <= 0 {
        return Err(anyhow!("raid.time_out_secs must be > 0"));
    }
    if raid.lockdown_secs.unwrap_or(DEFAULT_LOCKDOWN_SECS) <= 0 {
        return Err(anyhow!("raid.lockdown_secs must be > 0"));
    }

    let verify = &cfg.moderation.verification;
    let letters = verify.required_letters();
    if letters.is_empty() {
        return Err(anyhow!("verification.required_letters is empty"));
    }
    if !letters.chars().all(|c| c.is_ascii_uppercase()) {
        return Err(anyhow!(
            "verification.required_letters must be uppercase A-Z, got '{letters}'"
        ));
    }
    let mut unique: Vec<char> = letters.chars().collect();
    unique.sort_unstable();
    unique.dedup();
    if unique.len() != letters.len() {
        return Err(anyhow!(
            "verification.required_letters must not repeat letters, got '{letters}'"
        ));
    }
    let board_size = verify.board_size.unwrap_or(DEFAULT_BOARD_SIZE);
    if board_size < letters.len() || board_size > 26 {
        return Err(anyhow!(
            "verification.board_size={} out of range ({}..=26)",
            board_size,
            letters.len()
        ));
    }
    let deadline = verify.deadline_secs.unwrap_or(DEFAULT_DEADLINE_SECS);
    if !(5..=86400).contains(&deadline) {
        return Err(anyhow!(
            "verification.deadline_secs={deadline} out of range (5..=86400)"
        ));
    }

    Ok(())
}
