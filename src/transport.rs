//! The narrow messaging-transport seam.
//!
//! Every Telegram call is best-effort: failures are logged with a
//! permission hint and swallowed, so a broken side effect never stops
//! event processing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use teloxide::prelude::*;
use teloxide::requests::{HasPayload, Payload, Request};
use teloxide::types::{ChatId, ChatPermissions, InlineKeyboardMarkup, MessageId, UserId};
use tracing::warn;

/// What the moderation core needs from the messaging layer.
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Grant or revoke send permission, optionally until a deadline.
    async fn restrict(&self, chat: ChatId, user: UserId, can_send: bool, until: Option<DateTime<Utc>>);
    async fn kick(&self, chat: ChatId, user: UserId);
    async fn send_text(&self, chat: ChatId, text: String) -> Option<MessageId>;
    async fn send_keyboard(
        &self,
        chat: ChatId,
        text: String,
        keyboard: InlineKeyboardMarkup,
    ) -> Option<MessageId>;
    /// Edit a message in place. Returns false when the edit did not land so
    /// the caller can fall back to sending a fresh message.
    async fn edit_text(
        &self,
        chat: ChatId,
        message: MessageId,
        text: String,
        keyboard: Option<InlineKeyboardMarkup>,
    ) -> bool;
    async fn delete_message(&self, chat: ChatId, message: MessageId);
    async fn answer_callback(&self, callback_id: String, text: Option<String>);
}

fn ctx_perm_hint(ctx: &str) -> &'static str {
    match ctx {
        "restrict_chat_member" => "the bot needs admin rights with the Restrict permission",
        "ban_chat_member" => "the bot needs admin rights with the Ban users permission",
        "delete_message" => "the bot needs admin rights with the Delete messages permission",
        "get_chat_administrators" => "the bot must be able to read the admin list",
        "send_message" => "in private chats the user may not have started the bot, or blocked it",
        "edit_message_text" => "the bot can only edit messages it sent itself",
        "answer_callback_query" => "usually a network error or an expired query",
        _ => "check the bot's admin status and granted permissions",
    }
}

async fn api_log<R>(ctx: &str, req: R) -> Option<<R::Payload as Payload>::Output>
where
    R: Request + HasPayload,
{
    match req.send().await {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(
                "API call failed ({ctx}): {:?}; hint: {}",
                e,
                ctx_perm_hint(ctx)
            );
            None
        }
    }
}

/// Production transport over the Telegram Bot API.
pub struct TelegramApi {
    bot: Bot,
}

impl TelegramApi {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl ChatApi for TelegramApi {
    async fn restrict(&self, chat: ChatId, user: UserId, can_send: bool, until: Option<DateTime<Utc>>) {
        let perms = if can_send {
            ChatPermissions::all()
        } else {
            ChatPermissions::empty()
        };
        let mut req = self.bot.restrict_chat_member(chat, user, perms);
        if let Some(until) = until {
            req = req.until_date(until);
        }
        let _ = api_log("restrict_chat_member", req).await;
    }

    async fn kick(&self, chat: ChatId, user: UserId) {
        let _ = api_log("ban_chat_member", self.bot.ban_chat_member(chat, user)).await;
    }

    async fn send_text(&self, chat: ChatId, text: String) -> Option<MessageId> {
        api_log("send_message", self.bot.send_message(chat, text))
            .await
            .map(|m| m.id)
    }

    async fn send_keyboard(
        &self,
        chat: ChatId,
        text: String,
        keyboard: InlineKeyboardMarkup,
    ) -> Option<MessageId> {
        api_log(
            "send_message",
            self.bot.send_message(chat, text).reply_markup(keyboard),
        )
        .await
        .map(|m| m.id)
    }

    async fn edit_text(
        &self,
        chat: ChatId,
        message: MessageId,
        text: String,
        keyboard: Option<InlineKeyboardMarkup>,
    ) -> bool {
        match keyboard {
            Some(kb) => api_log(
                "edit_message_text",
                self.bot.edit_message_text(chat, message, text).reply_markup(kb),
            )
            .await
            .is_some(),
            None => api_log(
                "edit_message_text",
                self.bot.edit_message_text(chat, message, text),
            )
            .await
            .is_some(),
        }
    }

    async fn delete_message(&self, chat: ChatId, message: MessageId) {
        let _ = api_log("delete_message", self.bot.delete_message(chat, message)).await;
    }

    async fn answer_callback(&self, callback_id: String, text: Option<String>) {
        let req = self.bot.answer_callback_query(callback_id);
        let req = match text {
            Some(t) => req.text(t),
            None => req,
        };
        let _ = api_log("answer_callback_query", req).await;
    }
}
