//! Discord messaging calls used by the responder.

use std::sync::Arc;

use async_trait::async_trait;
use poise::serenity_prelude::{
    ChannelId, CreateAllowedMentions, CreateMessage, EditMessage, Http, MessageId, ReactionType,
};

use crate::error::Result;

/// The subset of the Discord API the responder talks to.
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn add_reaction(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        emoji: &str,
    ) -> Result<()>;

    /// Reply to a message, returning the id of the new message.
    async fn reply(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        content: &str,
    ) -> Result<MessageId>;

    /// Replace a message's content without pinging anyone.
    async fn edit(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        content: &str,
    ) -> Result<()>;
}

pub struct DiscordMessenger {
    http: Arc<Http>,
}

impl DiscordMessenger {
    pub fn new(http: Arc<Http>) -> Self {
        Self { http }
    }
}

/// Suppresses every mention ping, including the reply ping.
fn silent_mentions() -> CreateAllowedMentions {
    CreateAllowedMentions::new()
        .everyone(false)
        .all_roles(false)
        .all_users(false)
        .replied_user(false)
}

#[async_trait]
impl Messenger for DiscordMessenger {
    async fn add_reaction(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        emoji: &str,
    ) -> Result<()> {
        self.http
            .create_reaction(
                channel_id,
                message_id,
                &ReactionType::Unicode(emoji.to_string()),
            )
            .await?;
        Ok(())
    }

    async fn reply(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        content: &str,
    ) -> Result<MessageId> {
        let message = CreateMessage::new()
            .content(content)
            .reference_message((channel_id, message_id));
        let sent = channel_id.send_message(&*self.http, message).await?;
        Ok(sent.id)
    }

    async fn edit(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        content: &str,
    ) -> Result<()> {
        let edit = EditMessage::new()
            .content(content)
            .allowed_mentions(silent_mentions());
        channel_id.edit_message(&*self.http, message_id, edit).await?;
        Ok(())
    }
}
