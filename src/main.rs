mod admin;
mod config;
mod moderation;
mod raid;
mod scheduler;
mod spam;
mod transport;
mod verify;
mod window;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use dashmap::DashMap;
use teloxide::{
    dispatching::UpdateHandler,
    dptree,
    prelude::*,
    requests::Request,
    types::{CallbackQuery, ChatId, Message, UserId},
};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use crate::config::{load_config, validate_config, GroupConfig};
use crate::moderation::Moderation;
use crate::scheduler::{Scheduler, TimerEvent};
use crate::transport::{ChatApi, TelegramApi};

struct GroupState {
    cfg: GroupConfig,
    admins: DashMap<UserId, bool>,
}

#[derive(Clone)]
struct AppState {
    groups: HashMap<ChatId, Arc<GroupState>>,
    moderation: Arc<Moderation>,
    api: Arc<dyn ChatApi>,
}

fn parse_config_arg(args: &[String]) -> Option<PathBuf> {
    let mut i = 0;
    while i < args.len() {
        if args[i] == "--config" && i + 1 < args.len() {
            return Some(PathBuf::from(&args[i + 1]));
        }
        i += 1;
    }
    None
}

async fn refresh_admins(bot: &Bot, gs: &GroupState) -> Result<()> {
    let chat_id = ChatId(gs.cfg.chat_id);
    let admins = bot
        .get_chat_administrators(chat_id)
        .send()
        .await
        .with_context(|| "get_chat_administrators")?;
    gs.admins.clear();
    for m in admins {
        gs.admins.insert(m.user.id, true);
    }
    Ok(())
}

fn is_admin(gs: &GroupState, uid: UserId) -> bool {
    gs.admins.get(&uid).is_some()
}

async fn handle_new_members(bot: &Bot, state: &AppState, msg: &Message) -> Result<()> {
    let chat_id = msg.chat.id;
    let Some(gs) = state.groups.get(&chat_id) else { return Ok(()); };

    if gs.admins.is_empty() {
        let _ = refresh_admins(bot, gs).await;
    }

    let new_members = msg.new_chat_members().unwrap_or(&[]);
    for u in new_members {
        if gs.cfg.ignore_admins.unwrap_or(true) && is_admin(gs, u.id) {
            continue;
        }
        state
            .moderation
            .on_member_joined(chat_id, u.id, &u.full_name(), &gs.cfg.name, Utc::now())
            .await;
    }
    Ok(())
}

async fn handle_group_message(bot: &Bot, state: &AppState, msg: &Message) -> Result<()> {
    let chat_id = msg.chat.id;
    let Some(gs) = state.groups.get(&chat_id) else { return Ok(()); };
    let Some(from) = msg.from.as_ref() else { return Ok(()); };

    if gs.admins.is_empty() {
        let _ = refresh_admins(bot, gs).await;
    }
    let admin = is_admin(gs, from.id);

    if let Some(text) = msg.text() {
        if let Some(parsed) = admin::parse_command(text) {
            if admin {
                let reply = match parsed {
                    admin::Parsed::Usage(usage) => usage.to_string(),
                    admin::Parsed::Command(cmd) => {
                        admin::execute(&state.moderation, chat_id, cmd, Utc::now()).await
                    }
                };
                state.api.send_text(chat_id, reply).await;
                return Ok(());
            }
            // Command attempts from non-admins get no reply, but still
            // count toward the rate limiter below.
        }
    }

    if admin && gs.cfg.ignore_admins.unwrap_or(true) {
        return Ok(());
    }

    state
        .moderation
        .on_message(chat_id, from.id, &from.full_name(), Utc::now())
        .await;
    Ok(())
}

async fn handle_callback(state: &AppState, q: CallbackQuery) -> Result<()> {
    state
        .moderation
        .on_callback(q.from.id, &q.from.full_name(), q.id, q.data.as_deref())
        .await;
    Ok(())
}

fn schema() -> UpdateHandler<anyhow::Error> {
    dptree::entry()
        .branch(
            Update::filter_message().endpoint(
                |bot: Bot, state: Arc<AppState>, msg: Message| async move {
                    if msg.new_chat_members().is_some() {
                        let _ = handle_new_members(&bot, &state, &msg).await;
                    } else if !msg.chat.is_private() {
                        let _ = handle_group_message(&bot, &state, &msg).await;
                    }
                    Ok(())
                },
            ),
        )
        .branch(
            Update::filter_callback_query().endpoint(
                |state: Arc<AppState>, q: CallbackQuery| async move {
                    let _ = handle_callback(&state, q).await;
                    Ok(())
                },
            ),
        )
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let config_path = parse_config_arg(&args).unwrap_or_else(|| PathBuf::from("config.yaml"));

    let cfg = load_config(&config_path)?;
    validate_config(&cfg)?;

    let filter = cfg.bot.log_level.clone().unwrap_or_else(|| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let (shutdown_tx, _shutdown_rx0) = broadcast::channel::<()>(8);

    let shutdown_ctrl = shutdown_tx.clone();
    let ctrl_handle = tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = shutdown_ctrl.send(());
    });

    let bot = Bot::new(cfg.bot.token.clone());
    let me = bot.get_me().send().await?;
    let bot_username = me.user.username.clone().unwrap_or_else(|| "bot".into());

    let api: Arc<dyn ChatApi> = Arc::new(TelegramApi::new(bot.clone()));
    let (timer_tx, mut timer_rx) = mpsc::channel::<TimerEvent>(64);
    let moderation = Arc::new(Moderation::new(
        api.clone(),
        &cfg.moderation,
        Scheduler::new(timer_tx),
    ));

    let mut groups_map = HashMap::new();
    for g in &cfg.groups {
        let gs = GroupState {
            cfg: g.clone(),
            admins: DashMap::new(),
        };
        groups_map.insert(ChatId(g.chat_id), Arc::new(gs));
    }

    let state = AppState {
        groups: groups_map,
        moderation: moderation.clone(),
        api,
    };

    for (gid, gs) in &state.groups {
        if let Err(e) = refresh_admins(&bot, gs).await {
            warn!("refresh_admins failed (startup): {:?}", e);
        }
        info!("Guarding group {} ({:?})", gs.cfg.name, gid);
    }

    let bot_admin = bot.clone();
    let state_admin = state.clone();
    let mut shutdown_rx_admin = shutdown_tx.subscribe();
    let h_admin = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(180));
        loop {
            tokio::select! {
                _ = shutdown_rx_admin.recv() => { break; }
                _ = ticker.tick() => {
                    for (_gid, gs) in &state_admin.groups {
                        if let Err(e) = refresh_admins(&bot_admin, gs).await {
                            warn!("refresh_admins failed: {:?}", e);
                        }
                    }
                }
            }
        }
    });

    let moderation_timers = moderation.clone();
    let mut shutdown_rx_timers = shutdown_tx.subscribe();
    let h_timers = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown_rx_timers.recv() => { break; }
                event = timer_rx.recv() => match event {
                    Some(event) => moderation_timers.on_timer(event).await,
                    None => break,
                },
            }
        }
    });

    info!("Start polling as @{}", bot_username);

    let shared_state = Arc::new(state);

    Dispatcher::builder(bot, schema())
        .dependencies(dptree::deps![shared_state])
        .default_handler(|upd| async move {
            let _ = upd;
        })
        .error_handler(LoggingErrorHandler::with_custom_text("Dispatcher error"))
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    let _ = shutdown_tx.send(());
    let _ = ctrl_handle.await;
    let _ = h_admin.await;
    let _ = h_timers.await;

    Ok(())
}
