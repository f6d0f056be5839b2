//! Discord bot setup and event dispatch.

use std::sync::Arc;

use log::{debug, info};
use poise::{
    Framework, FrameworkOptions, builtins,
    serenity_prelude::{ClientBuilder, Context, FullEvent, GatewayIntents},
};

use crate::chatgpt::{ChatBackend, ChatGptClient};
use crate::commands::chatgpt_commands;
use crate::config::Config;
use crate::discord::DiscordMessenger;
use crate::error::Result;
use crate::moderation::{ContentFilter, DEFAULT_BLOCKED_WORDS};
use crate::responder::{IncomingMessage, MentionResponder, ResponderSettings};
use crate::storage::{JsonFileStore, KeyValueStore};

pub struct Data {
    responder: Arc<MentionResponder>,
}

impl Data {
    pub fn responder(&self) -> &MentionResponder {
        &self.responder
    }
}

/// Run the Discord bot.
pub async fn run() -> Result<()> {
    info!("Initializing bot");
    let config = Config::from_env()?;

    let filter = match &config.chatgpt.blocked_words {
        Some(words) => ContentFilter::new(words)?,
        None => ContentFilter::new(DEFAULT_BLOCKED_WORDS)?,
    };

    debug!("Opening storage at {}", config.storage_path.display());
    let store: Arc<dyn KeyValueStore> = Arc::new(JsonFileStore::open(&config.storage_path).await?);

    let settings = ResponderSettings {
        initial_token: config.chatgpt.initial_token.clone(),
        timeout: config.chatgpt.timeout,
        cooldown: config.chatgpt.cooldown,
        filter,
    };
    let base_url = config.chatgpt.base_url.clone();

    debug!("Setting up gateway intents");
    let intents = GatewayIntents::non_privileged() | GatewayIntents::MESSAGE_CONTENT;

    debug!("Building framework");
    let framework = Framework::builder()
        .options(FrameworkOptions {
            commands: chatgpt_commands(),
            event_handler: |ctx, event, _framework, data| Box::pin(event_handler(ctx, event, data)),
            ..Default::default()
        })
        .setup(move |ctx, ready, framework| {
            Box::pin(async move {
                info!("Bot is ready and connected to Discord as {}", ready.user.name);
                debug!("Registering commands globally");
                builtins::register_globally(ctx, &framework.options().commands).await?;
                info!("Commands registered successfully");

                let messenger = Arc::new(DiscordMessenger::new(Arc::clone(&ctx.http)));
                let responder = MentionResponder::load(
                    ready.user.id,
                    settings,
                    messenger,
                    store,
                    |token| {
                        let client = ChatGptClient::new(token.to_string(), base_url)?;
                        Ok(Arc::new(client) as Arc<dyn ChatBackend>)
                    },
                )
                .await?;

                Ok(Data {
                    responder: Arc::new(responder),
                })
            })
        })
        .build();

    debug!("Creating Discord client");
    let mut client = ClientBuilder::new(config.discord_token, intents)
        .framework(framework)
        .await?;

    info!("Starting Discord client");

    tokio::select! {
        result = client.start() => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received, shutting down...");
        }
    }

    Ok(())
}

async fn event_handler(ctx: &Context, event: &FullEvent, data: &Data) -> Result<()> {
    if let FullEvent::Message { new_message } = event
        && new_message.author.id != ctx.cache.current_user().id
    {
        let incoming = IncomingMessage {
            content: new_message.content.clone(),
            channel_id: new_message.channel_id,
            id: new_message.id,
        };
        let responder = Arc::clone(&data.responder);

        // Each message is handled on its own task so slow answers never
        // hold up the gateway.
        tokio::spawn(async move {
            let id = incoming.id;
            let outcome = responder.handle(incoming).await;
            debug!("Message {id} handled: {outcome:?}");
        });
    }
    Ok(())
}
