//! Relays messages that mention the bot to ChatGPT and edits the answer in.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info, warn};
use poise::serenity_prelude::{ChannelId, MessageId, UserId};
use tokio::sync::Semaphore;
use tokio::time::Instant;

use crate::chatgpt::ChatBackend;
use crate::discord::Messenger;
use crate::error::{BotError, Result};
use crate::moderation::ContentFilter;
use crate::storage::KeyValueStore;

/// Requests that may be waiting on ChatGPT at the same time.
pub const MAX_CONCURRENT: usize = 3;

pub const BUSY_REACTION: &str = "💬";
pub const PLACEHOLDER_TEXT: &str = "📨 Waiting for ChatGPT response...";
pub const ERROR_PREFIX: &str = "⚠️ ChatGPT encountered an error: ";

pub const ANSWERED_KEY: &str = "gpt_answered";
pub const TOKEN_KEY: &str = "gpt_token";

/// The parts of a Discord message the responder looks at.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub content: String,
    pub channel_id: ChannelId,
    pub id: MessageId,
}

#[derive(Debug, Clone)]
pub struct ResponderSettings {
    pub initial_token: String,
    pub timeout: Duration,
    pub cooldown: Duration,
    pub filter: ContentFilter,
}

/// How a single message was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Not addressed to the bot, or nothing after the mention.
    Ignored,
    /// All slots were taken; the message got a reaction instead.
    Busy,
    /// The placeholder reply could not be posted.
    PlaceholderFailed,
    /// The placeholder now holds ChatGPT's (validated) answer.
    Answered,
    /// ChatGPT failed and the placeholder holds the error.
    UpstreamFailed,
    /// The final edit of the placeholder failed.
    EditFailed,
}

pub struct MentionResponder {
    mention: String,
    messenger: Arc<dyn Messenger>,
    store: Arc<dyn KeyValueStore>,
    backend: Arc<dyn ChatBackend>,
    filter: ContentFilter,
    slots: Semaphore,
    last_dispatch: Mutex<Option<Instant>>,
    session_token: tokio::sync::Mutex<String>,
    answered: AtomicU64,
    timeout: Duration,
    cooldown: Duration,
}

impl MentionResponder {
    /// Prepare the responder for the bot with id `bot_id`.
    ///
    /// Seeds the answered counter and session token in `store` when absent,
    /// then hands the stored token to `connect` to build the ChatGPT backend.
    ///
    /// # Errors
    ///
    /// Fails if the store cannot be written, holds a malformed counter, or
    /// `connect` fails.
    pub async fn load<F>(
        bot_id: UserId,
        settings: ResponderSettings,
        messenger: Arc<dyn Messenger>,
        store: Arc<dyn KeyValueStore>,
        connect: F,
    ) -> Result<Self>
    where
        F: FnOnce(&str) -> Result<Arc<dyn ChatBackend>>,
    {
        let mention = format!("<@{bot_id}>");

        store.set_if_not_exists(ANSWERED_KEY, "0").await?;
        let answered = store
            .get(ANSWERED_KEY)
            .ok_or_else(|| BotError::Config(format!("{ANSWERED_KEY} missing from storage")))?;
        let answered = answered.trim().parse::<u64>().map_err(|e| {
            BotError::Config(format!("stored {ANSWERED_KEY} '{answered}' is not a count: {e}"))
        })?;

        store
            .set_if_not_exists(TOKEN_KEY, &settings.initial_token)
            .await?;
        let session_token = store
            .get(TOKEN_KEY)
            .ok_or_else(|| BotError::Config(format!("{TOKEN_KEY} missing from storage")))?;

        let backend = connect(&session_token)?;
        info!("ChatGPT responder ready for {mention}, {answered} answered so far");

        Ok(Self {
            mention,
            messenger,
            store,
            backend,
            filter: settings.filter,
            slots: Semaphore::new(MAX_CONCURRENT),
            last_dispatch: Mutex::new(None),
            session_token: tokio::sync::Mutex::new(session_token),
            answered: AtomicU64::new(answered),
            timeout: settings.timeout,
            cooldown: settings.cooldown,
        })
    }

    #[must_use]
    pub fn mention(&self) -> &str {
        &self.mention
    }

    /// Requests currently holding a slot.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        MAX_CONCURRENT - self.slots.available_permits()
    }

    #[must_use]
    pub fn answered(&self) -> u64 {
        self.answered.load(Ordering::SeqCst)
    }

    /// Returns the prompt if `content` is addressed to the bot.
    fn prompt<'a>(&self, content: &'a str) -> Option<&'a str> {
        let prompt = content.strip_prefix(self.mention.as_str())?.trim();
        (!prompt.is_empty()).then_some(prompt)
    }

    pub async fn handle(&self, message: IncomingMessage) -> Outcome {
        let Some(prompt) = self.prompt(&message.content) else {
            return Outcome::Ignored;
        };

        // Released on every return below.
        let Ok(_slot) = self.slots.try_acquire() else {
            info!(
                "Rejecting message {} in channel {}: {MAX_CONCURRENT} requests in flight",
                message.id, message.channel_id
            );
            if let Err(e) = self
                .messenger
                .add_reaction(message.channel_id, message.id, BUSY_REACTION)
                .await
            {
                warn!("Failed to react to message {}: {e}", message.id);
            }
            return Outcome::Busy;
        };

        self.wait_for_cooldown().await;

        let placeholder = match self
            .messenger
            .reply(message.channel_id, message.id, PLACEHOLDER_TEXT)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                warn!(
                    "Failed to post placeholder in channel {}: {e}",
                    message.channel_id
                );
                return Outcome::PlaceholderFailed;
            }
        };

        let (content, upstream_ok) = match self.ask(prompt).await {
            Ok(answer) => (self.filter.validate(&answer), true),
            Err(e) => {
                error!("ChatGPT request for message {} failed: {e}", message.id);
                (format!("{ERROR_PREFIX}{e}"), false)
            }
        };

        match (self.edit(message.channel_id, placeholder, &content).await, upstream_ok) {
            (false, _) => Outcome::EditFailed,
            (true, true) => Outcome::Answered,
            (true, false) => Outcome::UpstreamFailed,
        }
    }

    /// Sleeps until this request's dispatch slot in the cooldown schedule.
    async fn wait_for_cooldown(&self) {
        let start = {
            let mut last = self.last_dispatch.lock().unwrap_or_else(|e| e.into_inner());
            let now = Instant::now();
            let start = last.map_or(now, |prev| now.max(prev + self.cooldown));
            *last = Some(start);
            start
        };
        if start > Instant::now() {
            debug!("Cooling down for {:?}", start - Instant::now());
            tokio::time::sleep_until(start).await;
        }
    }

    async fn ask(&self, prompt: &str) -> Result<String> {
        self.refresh_token().await?;
        self.backend.send_message(prompt, self.timeout).await
    }

    async fn refresh_token(&self) -> Result<()> {
        let token = tokio::time::timeout(self.timeout, self.backend.ensure_auth())
            .await
            .map_err(|_| {
                BotError::Timeout(u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX))
            })??;

        let mut current = self.session_token.lock().await;
        if *current != token {
            info!("Session token changed, persisting");
            *current = token.clone();
            if let Err(e) = self.store.set(TOKEN_KEY, &token).await {
                error!("Failed to persist session token: {e}");
            }
        }
        Ok(())
    }

    /// Edits the placeholder and records the outcome in the answered counter.
    async fn edit(&self, channel_id: ChannelId, message_id: MessageId, content: &str) -> bool {
        let edited = match self.messenger.edit(channel_id, message_id, content).await {
            Ok(()) => {
                self.answered.fetch_add(1, Ordering::SeqCst);
                true
            }
            Err(e) => {
                warn!("Failed to edit message {message_id} in channel {channel_id}: {e}");
                false
            }
        };

        let answered = self.answered.load(Ordering::SeqCst).to_string();
        if let Err(e) = self.store.set(ANSWERED_KEY, &answered).await {
            error!("Failed to persist answered count: {e}");
        }
        edited
    }
}
