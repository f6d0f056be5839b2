//! Screening of ChatGPT output before it is posted.

use log::warn;
use regex::Regex;

use crate::error::{BotError, Result};

/// Discord rejects message content above this many characters.
pub const MAX_MESSAGE_CHARS: usize = 2000;

pub const BLOCKED_CONTENT_NOTICE: &str =
    "⚠️ ChatGPT response contains bad words that are not allowed.";
pub const TOO_LONG_NOTICE: &str = "⚠️ ChatGPT response is too long. (placeholder message)";

/// Denylist used when none is configured. Entries are regex fragments.
pub const DEFAULT_BLOCKED_WORDS: &[&str] = &["cum", "semen", "cock", "pussy", "cunt", "nigg.r"];

/// Case-insensitive whole-word denylist.
#[derive(Debug, Clone)]
pub struct ContentFilter {
    pattern: Regex,
}

impl ContentFilter {
    /// Compile a filter from regex fragments.
    ///
    /// A fragment only matches when it is not directly preceded or followed
    /// by a letter, so `cock` does not fire on `cocktail`.
    ///
    /// # Errors
    ///
    /// Returns [`BotError::Config`] if the list is empty or a fragment is not
    /// a valid regex.
    pub fn new<S: AsRef<str>>(words: &[S]) -> Result<Self> {
        if words.is_empty() {
            return Err(BotError::Config("blocked word list is empty".to_string()));
        }
        let alternation = words
            .iter()
            .map(AsRef::as_ref)
            .collect::<Vec<_>>()
            .join("|");
        let pattern = Regex::new(&format!(
            "(?:^|[^a-zA-Z])(?i:{alternation})(?:[^a-zA-Z]|$)"
        ))
            .map_err(|e| BotError::Config(format!("invalid blocked word pattern: {e}")))?;
        Ok(Self { pattern })
    }

    #[must_use]
    pub fn is_blocked(&self, text: &str) -> bool {
        self.pattern.is_match(text)
    }

    /// Returns the text to post for a ChatGPT answer.
    ///
    /// Blocked content wins over length, so an oversized answer that also
    /// contains a blocked word yields [`BLOCKED_CONTENT_NOTICE`].
    #[must_use]
    pub fn validate(&self, input: &str) -> String {
        if self.is_blocked(input) {
            warn!("ChatGPT response rejected by content filter");
            return BLOCKED_CONTENT_NOTICE.to_string();
        }
        let len = input.chars().count();
        if len > MAX_MESSAGE_CHARS {
            warn!("ChatGPT response rejected: {len} characters");
            return TOO_LONG_NOTICE.to_string();
        }
        input.to_string()
    }
}
