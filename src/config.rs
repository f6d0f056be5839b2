use std::env;
use std::path::PathBuf;
use std::time::Duration;

use log::{debug, error, info};
use url::Url;

use crate::error::{BotError, Result};

pub const DEFAULT_CHATGPT_BASE_URL: &str = "https://chat.openai.com";
pub const DEFAULT_STORAGE_PATH: &str = "storage.json";

#[derive(Debug, Clone)]
pub struct Config {
    pub discord_token: String,
    pub chatgpt: ChatGptConfig,
    pub storage_path: PathBuf,
}

/// Settings for the ChatGPT relay.
#[derive(Debug, Clone)]
pub struct ChatGptConfig {
    /// Session token used when none has been persisted yet.
    pub initial_token: String,
    pub timeout: Duration,
    pub cooldown: Duration,
    pub base_url: Url,
    /// Denylist fragments overriding the built-in list, if set.
    pub blocked_words: Option<Vec<String>>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        debug!("Loading configuration from environment");
        dotenvy::dotenv().ok();

        let discord_token = required("DISCORD_TOKEN")?;
        let initial_token = required("chatgpt_token")?;
        let timeout = required_millis("chatgpt_timeout")?;
        let cooldown = required_millis("chatgpt_cooldown")?;

        let base_url = env::var("chatgpt_base_url")
            .unwrap_or_else(|_| DEFAULT_CHATGPT_BASE_URL.to_string());
        let base_url = Url::parse(&base_url).map_err(|e| {
            error!("Invalid chatgpt_base_url '{base_url}': {e}");
            BotError::Config(format!("chatgpt_base_url is not a valid URL: {e}"))
        })?;

        let blocked_words = env::var("chatgpt_blocked_words")
            .ok()
            .map(|raw| parse_word_list(&raw))
            .filter(|words| !words.is_empty());

        let storage_path = env::var("STORAGE_PATH")
            .map_or_else(|_| PathBuf::from(DEFAULT_STORAGE_PATH), PathBuf::from);

        info!("Configuration loaded successfully");
        debug!("Discord token length: {} characters", discord_token.len());
        debug!("ChatGPT token length: {} characters", initial_token.len());
        debug!("ChatGPT timeout: {timeout:?}, cooldown: {cooldown:?}");
        debug!("ChatGPT base URL: {base_url}");
        debug!(
            "Blocked words: {}",
            blocked_words
                .as_ref()
                .map_or_else(|| "built-in".to_string(), |w| format!("{} custom", w.len()))
        );
        debug!("Storage path: {}", storage_path.display());

        Ok(Self {
            discord_token,
            chatgpt: ChatGptConfig {
                initial_token,
                timeout,
                cooldown,
                base_url,
                blocked_words,
            },
            storage_path,
        })
    }
}

fn required(name: &str) -> Result<String> {
    env::var(name).map_err(|e| {
        error!("Failed to load {name} from environment: {e}");
        e.into()
    })
}

fn required_millis(name: &str) -> Result<Duration> {
    let raw = required(name)?;
    parse_millis(name, &raw).inspect_err(|e| error!("{e}"))
}

fn parse_millis(name: &str, raw: &str) -> Result<Duration> {
    match raw.trim().parse::<u64>() {
        Ok(0) => Err(BotError::Config(format!("{name} must be greater than zero"))),
        Ok(ms) => Ok(Duration::from_millis(ms)),
        Err(e) => Err(BotError::Config(format!(
            "{name} must be a number of milliseconds, got '{raw}': {e}"
        ))),
    }
}

/// Splits a comma separated list, dropping blank entries.
pub fn parse_word_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|word| !word.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_millis() {
        let d = parse_millis("chatgpt_timeout", " 1500 ").expect("valid value");
        assert_eq!(d, Duration::from_millis(1500));
    }

    #[test]
    fn rejects_non_numeric_millis() {
        let err = parse_millis("chatgpt_cooldown", "soon").unwrap_err();
        assert!(matches!(err, BotError::Config(msg) if msg.contains("chatgpt_cooldown")));
    }

    #[test]
    fn rejects_zero_millis() {
        assert!(matches!(
            parse_millis("chatgpt_timeout", "0"),
            Err(BotError::Config(_))
        ));
    }

    #[test]
    fn word_list_skips_blanks() {
        assert_eq!(
            parse_word_list(" darn, ,heck ,,"),
            vec!["darn".to_string(), "heck".to_string()]
        );
    }
}
