//! Slash commands.

use crate::{
    bot::Data,
    error::{BotError, Result},
    responder::MAX_CONCURRENT,
};

type Context<'a> = poise::Context<'a, Data, BotError>;

fn stats_message(answered: u64, in_flight: usize) -> String {
    format!(
        "📊 ChatGPT has answered {answered} messages so far. \
         {in_flight}/{MAX_CONCURRENT} requests in progress."
    )
}

/// Show how many messages ChatGPT has answered.
#[poise::command(slash_command)]
pub async fn chatgpt(ctx: Context<'_>) -> Result<()> {
    let responder = ctx.data().responder();
    ctx.say(stats_message(responder.answered(), responder.in_flight()))
        .await?;
    Ok(())
}

/// Get the ChatGPT slash commands.
#[must_use]
pub fn chatgpt_commands() -> Vec<poise::Command<Data, BotError>> {
    vec![chatgpt()]
}
