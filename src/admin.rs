//! Admin-only group commands: live raid tuning, lockdown override, wait
//! queries and manual mute/unmute/kick. Authorization is the host layer's
//! job; this module only parses and executes.

use chrono::{DateTime, Duration, Utc};
use teloxide::types::{ChatId, UserId};

use crate::moderation::Moderation;
use crate::raid::RaidPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminCommand {
    SetRaidPolicy {
        user_amount: u32,
        time_out_secs: i64,
        lockdown_secs: i64,
    },
    EndRaid,
    /// Remaining mute for a user, or remaining lockdown with no argument.
    Wait { user: Option<UserId> },
    Mute { user: UserId, secs: Option<i64> },
    Unmute { user: UserId },
    Kick { user: UserId },
}

/// A recognized command line, valid or not. `Usage` carries the reply for a
/// malformed invocation; existing policy is left untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parsed {
    Command(AdminCommand),
    Usage(&'static str),
}

const USAGE_RAIDPOLICY: &str = "usage: /raidpolicy <user_amount> <window_secs> <lockdown_secs>";
const USAGE_WAIT: &str = "usage: /wait [user_id]";
const USAGE_MUTE: &str = "usage: /mute <user_id> [secs]";
const USAGE_UNMUTE: &str = "usage: /unmute <user_id>";
const USAGE_KICK: &str = "usage: /kick <user_id>";

fn parse_user_id(arg: &str) -> Option<UserId> {
    arg.parse::<u64>().ok().map(UserId)
}

/// `None` when the text is not one of our commands.
pub fn parse_command(text: &str) -> Option<Parsed> {
    let mut parts = text.split_whitespace();
    let head = parts.next()?;
    // Commands may arrive as `/cmd@botname` in groups.
    let head = head.split('@').next().unwrap_or(head);
    let args: Vec<&str> = parts.collect();

    let parsed = match head {
        "/raidpolicy" => {
            let (Some(a), Some(b), Some(c)) = (args.first(), args.get(1), args.get(2)) else {
                return Some(Parsed::Usage(USAGE_RAIDPOLICY));
            };
            match (a.parse::<u32>(), b.parse::<i64>(), c.parse::<i64>()) {
                (Ok(user_amount), Ok(time_out_secs), Ok(lockdown_secs))
                    if user_amount >= 1 && time_out_secs > 0 && lockdown_secs > 0 =>
                {
                    Parsed::Command(AdminCommand::SetRaidPolicy {
                        user_amount,
                        time_out_secs,
                        lockdown_secs,
                    })
                }
                _ => Parsed::Usage(USAGE_RAIDPOLICY),
            }
        }
        "/raidend" => Parsed::Command(AdminCommand::EndRaid),
        "/wait" => match args.first() {
            None => Parsed::Command(AdminCommand::Wait { user: None }),
            Some(arg) => match parse_user_id(arg) {
                Some(user) => Parsed::Command(AdminCommand::Wait { user: Some(user) }),
                None => Parsed::Usage(USAGE_WAIT),
            },
        },
        "/mute" => {
            let Some(user) = args.first().and_then(|a| parse_user_id(a)) else {
                return Some(Parsed::Usage(USAGE_MUTE));
            };
            match args.get(1) {
                None => Parsed::Command(AdminCommand::Mute { user, secs: None }),
                Some(arg) => match arg.parse::<i64>() {
                    Ok(secs) if secs > 0 => {
                        Parsed::Command(AdminCommand::Mute { user, secs: Some(secs) })
                    }
                    _ => Parsed::Usage(USAGE_MUTE),
                },
            }
        }
        "/unmute" => match args.first().and_then(|a| parse_user_id(a)) {
            Some(user) => Parsed::Command(AdminCommand::Unmute { user }),
            None => Parsed::Usage(USAGE_UNMUTE),
        },
        "/kick" => match args.first().and_then(|a| parse_user_id(a)) {
            Some(user) => Parsed::Command(AdminCommand::Kick { user }),
            None => Parsed::Usage(USAGE_KICK),
        },
        _ => return None,
    };
    Some(parsed)
}

/// Run a parsed command against the moderation instance and return the
/// reply text for the invoking chat.
pub async fn execute(
    moderation: &Moderation,
    chat: ChatId,
    command: AdminCommand,
    now: DateTime<Utc>,
) -> String {
    match command {
        AdminCommand::SetRaidPolicy {
            user_amount,
            time_out_secs,
            lockdown_secs,
        } => {
            moderation.raid.set_policy(RaidPolicy {
                user_amount,
                time_out: Duration::seconds(time_out_secs),
                lockdown_for: Duration::seconds(lockdown_secs),
            });
            format!(
                "Raid policy updated: {user_amount} joins within {time_out_secs}s now trigger a {lockdown_secs}s lockdown."
            )
        }
        AdminCommand::EndRaid => {
            moderation.raid.force_end(chat);
            "Raid lockdown lifted.".to_string()
        }
        AdminCommand::Wait { user: Some(user) } => {
            let secs = moderation.spam.time_to_wait(user, now);
            if secs > 0 {
                format!("User {} is muted for another {secs}s.", user.0)
            } else {
                format!("User {} is not muted.", user.0)
            }
        }
        AdminCommand::Wait { user: None } => {
            let secs = moderation.raid.time_to_wait(chat, now);
            if secs > 0 {
                format!("Raid lockdown ends in {secs}s.")
            } else {
                "No raid lockdown is active.".to_string()
            }
        }
        AdminCommand::Mute { user, secs } => {
            let secs = secs.unwrap_or_else(|| moderation.spam.mute_for().num_seconds());
            moderation.admin_mute(chat, user, secs, now).await;
            format!("User {} muted for {secs}s.", user.0)
        }
        AdminCommand::Unmute { user } => {
            moderation.admin_unmute(chat, user).await;
            format!("User {} unmuted.", user.0)
        }
        AdminCommand::Kick { user } => {
            moderation.admin_kick(chat, user).await;
            format!("User {} kicked.", user.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModerationConfig;
    use crate::scheduler::Scheduler;
    use crate::transport::mock::MockApi;
    use crate::window::Verdict;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    #[test]
    fn parses_well_formed_commands() {
        assert_eq!(
            parse_command("/raidpolicy 20 30 180"),
            Some(Parsed::Command(AdminCommand::SetRaidPolicy {
                user_amount: 20,
                time_out_secs: 30,
                lockdown_secs: 180,
            }))
        );
        assert_eq!(
            parse_command("/raidend@warden_bot"),
            Some(Parsed::Command(AdminCommand::EndRaid))
        );
        assert_eq!(
            parse_command("/wait 42"),
            Some(Parsed::Command(AdminCommand::Wait { user: Some(UserId(42)) }))
        );
        assert_eq!(
            parse_command("/mute 42 300"),
            Some(Parsed::Command(AdminCommand::Mute {
                user: UserId(42),
                secs: Some(300),
            }))
        );
        assert_eq!(
            parse_command("/kick 42"),
            Some(Parsed::Command(AdminCommand::Kick { user: UserId(42) }))
        );
    }

    #[test]
    fn malformed_arguments_get_a_usage_reply() {
        assert_eq!(
            parse_command("/raidpolicy 20 30"),
            Some(Parsed::Usage(USAGE_RAIDPOLICY))
        );
        assert_eq!(
            parse_command("/raidpolicy 0 30 180"),
            Some(Parsed::Usage(USAGE_RAIDPOLICY))
        );
        assert_eq!(
            parse_command("/raidpolicy many fast long"),
            Some(Parsed::Usage(USAGE_RAIDPOLICY))
        );
        assert_eq!(parse_command("/mute bob"), Some(Parsed::Usage(USAGE_MUTE)));
        assert_eq!(parse_command("/mute 42 -5"), Some(Parsed::Usage(USAGE_MUTE)));
        assert_eq!(parse_command("/kick"), Some(Parsed::Usage(USAGE_KICK)));
    }

    #[test]
    fn unrelated_text_is_not_a_command() {
        assert_eq!(parse_command("hello there"), None);
        assert_eq!(parse_command("/unknown 1 2"), None);
        assert_eq!(parse_command(""), None);
    }

    fn moderation() -> Moderation {
        // Receiver dropped: these tests never let a timer fire.
        let (tx, _rx) = mpsc::channel(8);
        Moderation::new(
            Arc::new(MockApi::new()),
            &ModerationConfig::default(),
            Scheduler::new(tx),
        )
    }

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[tokio::test]
    async fn raid_policy_applies_live() {
        let m = moderation();
        let chat = ChatId(-1001);
        let reply = execute(
            &m,
            chat,
            AdminCommand::SetRaidPolicy {
                user_amount: 2,
                time_out_secs: 30,
                lockdown_secs: 180,
            },
            t0(),
        )
        .await;
        assert!(reply.contains("updated"));

        m.raid.record_join_and_check(chat, t0());
        assert_eq!(
            m.raid.record_join_and_check(chat, t0() + Duration::seconds(1)),
            Verdict::Blocked
        );

        let reply = execute(&m, chat, AdminCommand::EndRaid, t0()).await;
        assert!(reply.contains("lifted"));
        assert_eq!(m.raid.time_to_wait(chat, t0() + Duration::seconds(2)), 0);
    }

    #[tokio::test]
    async fn wait_reports_remaining_mute() {
        let m = moderation();
        let chat = ChatId(-1001);
        let user = UserId(42);
        for _ in 0..6 {
            m.spam.is_spam(user, t0());
        }
        let reply = execute(&m, chat, AdminCommand::Wait { user: Some(user) }, t0()).await;
        assert!(reply.contains("60s"), "{reply}");

        let reply = execute(
            &m,
            chat,
            AdminCommand::Wait { user: Some(UserId(7)) },
            t0(),
        )
        .await;
        assert!(reply.contains("not muted"), "{reply}");
    }
}
