//! Telegram adapter (teloxide), implementing the cross-channel `ChannelPort`.
//!
//! JIDs for this adapter are the string `"telegram:<chat_id>"`; only that
//! prefix is ever interpreted here, so a WhatsApp JID routed to this adapter
//! is simply rejected by `owns_jid` rather than mishandled.

use async_trait::async_trait;
use teloxide::{prelude::*, types::ChatAction};
use tracing::warn;

use ctb_core::{domain::Jid, Error, Result};
use ctb_core::messaging::port::ChannelPort;

const JID_PREFIX: &str = "telegram:";

#[derive(Clone)]
pub struct TelegramChannel {
    bot: Bot,
}

impl TelegramChannel {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    pub fn bot(&self) -> Bot {
        self.bot.clone()
    }

    fn chat_id(jid: &Jid) -> Result<teloxide::types::ChatId> {
        let raw = jid
            .as_str()
            .strip_prefix(JID_PREFIX)
            .ok_or_else(|| Error::Channel(format!("not a telegram jid: {jid}")))?;
        let id: i64 = raw
            .parse()
            .map_err(|_| Error::Channel(format!("invalid telegram chat id in jid: {jid}")))?;
        Ok(teloxide::types::ChatId(id))
    }

    fn map_err(e: teloxide::RequestError) -> Error {
        Error::Channel(format!("telegram request failed: {e}"))
    }
}

#[async_trait]
impl ChannelPort for TelegramChannel {
    fn name(&self) -> &str {
        "telegram"
    }

    fn owns_jid(&self, jid: &Jid) -> bool {
        jid.as_str().starts_with(JID_PREFIX)
    }

    async fn send_message(&self, jid: &Jid, text: &str) -> Result<()> {
        let chat_id = Self::chat_id(jid)?;
        self.bot
            .send_message(chat_id, text.to_string())
            .await
            .map_err(Self::map_err)?;
        Ok(())
    }

    async fn set_typing(&self, jid: &Jid, on: bool) -> Result<()> {
        if !on {
            // Telegram's typing indicator has no explicit "off"; it expires
            // on its own a few seconds after the last chat action.
            return Ok(());
        }
        let chat_id = Self::chat_id(jid)?;
        if let Err(e) = self.bot.send_chat_action(chat_id, ChatAction::Typing).await {
            warn!(%jid, error = %e, "failed to send typing indicator");
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }
}
