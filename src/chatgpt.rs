//! Client for the ChatGPT web backend, authenticated with a session token.

use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt};
use log::{debug, info};
use reqwest::header::{ACCEPT, COOKIE, HeaderMap, SET_COOKIE};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use url::Url;
use uuid::Uuid;

use crate::error::{BotError, Result};

const SESSION_COOKIE: &str = "__Secure-next-auth.session-token";
const SESSION_PATH: &str = "api/auth/session";
const CONVERSATION_PATH: &str = "backend-api/conversation";
const MODEL: &str = "text-davinci-002-render";
const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
/// Error bodies are cut to this many characters so they fit in a Discord message.
const MAX_ERROR_BODY_CHARS: usize = 300;

/// Conversational AI service used by the responder.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Make sure the client holds a usable credential and return the
    /// current session token, which the service may have rotated.
    async fn ensure_auth(&self) -> Result<String>;

    /// Send one user message and wait at most `timeout` for the answer.
    async fn send_message(&self, text: &str, timeout: Duration) -> Result<String>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionResponse {
    access_token: Option<String>,
}

#[derive(Debug, Serialize)]
struct ConversationRequest<'a> {
    action: &'static str,
    messages: Vec<PromptMessage<'a>>,
    model: &'static str,
    parent_message_id: Uuid,
}

#[derive(Debug, Serialize)]
struct PromptMessage<'a> {
    id: Uuid,
    role: &'static str,
    content: PromptContent<'a>,
}

#[derive(Debug, Serialize)]
struct PromptContent<'a> {
    content_type: &'static str,
    parts: [&'a str; 1],
}

#[derive(Debug, Deserialize)]
struct ConversationEvent {
    message: Option<EventMessage>,
    detail: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct EventMessage {
    content: EventContent,
}

#[derive(Debug, Deserialize)]
struct EventContent {
    #[serde(default)]
    parts: Vec<String>,
}

pub struct ChatGptClient {
    client: reqwest::Client,
    base_url: Url,
    session_token: RwLock<String>,
    access_token: RwLock<Option<String>>,
}

impl ChatGptClient {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(session_token: String, base_url: Url) -> Result<Self> {
        let client = reqwest::Client::builder().user_agent(USER_AGENT).build()?;
        Ok(Self {
            client,
            base_url,
            session_token: RwLock::new(session_token),
            access_token: RwLock::new(None),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| BotError::Config(format!("invalid ChatGPT endpoint {path}: {e}")))
    }

    async fn access_token(&self) -> Result<String> {
        if let Some(token) = self.access_token.read().await.clone() {
            return Ok(token);
        }
        self.ensure_auth().await?;
        self.access_token
            .read()
            .await
            .clone()
            .ok_or_else(|| BotError::ChatGptResponse("no access token after refresh".to_string()))
    }

    async fn converse(&self, text: &str) -> Result<String> {
        let access_token = self.access_token().await?;
        let request = ConversationRequest {
            action: "next",
            messages: vec![PromptMessage {
                id: Uuid::new_v4(),
                role: "user",
                content: PromptContent {
                    content_type: "text",
                    parts: [text],
                },
            }],
            model: MODEL,
            parent_message_id: Uuid::new_v4(),
        };

        debug!("Sending {} characters to ChatGPT", text.len());
        let response = self
            .client
            .post(self.endpoint(CONVERSATION_PATH)?)
            .bearer_auth(&access_token)
            .header(ACCEPT, "text/event-stream")
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            if status == reqwest::StatusCode::UNAUTHORIZED {
                // Force a refresh on the next call.
                self.access_token.write().await.take();
            }
            let message = response.text().await.map_or_else(
                |e| format!("Failed to read error response: {e}"),
                |body| truncate_body(&body),
            );
            return Err(BotError::ChatGptApi { status, message });
        }

        let answer = read_answer(response.bytes_stream()).await?;
        debug!("Received {} characters from ChatGPT", answer.len());
        Ok(answer)
    }
}

#[async_trait]
impl ChatBackend for ChatGptClient {
    async fn ensure_auth(&self) -> Result<String> {
        let mut session_token = self.session_token.write().await;

        let response = self
            .client
            .get(self.endpoint(SESSION_PATH)?)
            .header(COOKIE, format!("{SESSION_COOKIE}={session_token}"))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let message = response.text().await.map_or_else(
                |e| format!("Failed to read error response: {e}"),
                |body| truncate_body(&body),
            );
            return Err(BotError::ChatGptApi { status, message });
        }

        if let Some(rotated) = rotated_session_token(response.headers())
            && rotated != *session_token
        {
            info!("ChatGPT rotated the session token");
            *session_token = rotated;
        }

        let session: SessionResponse = response.json().await?;
        let access_token = session.access_token.ok_or_else(|| {
            BotError::ChatGptResponse("session token was rejected".to_string())
        })?;
        *self.access_token.write().await = Some(access_token);

        Ok(session_token.clone())
    }

    async fn send_message(&self, text: &str, timeout: Duration) -> Result<String> {
        tokio::time::timeout(timeout, self.converse(text))
            .await
            .map_err(|_| {
                BotError::Timeout(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX))
            })?
    }
}

fn truncate_body(body: &str) -> String {
    let body = body.trim();
    match body.char_indices().nth(MAX_ERROR_BODY_CHARS) {
        Some((cut, _)) => format!("{}…", &body[..cut]),
        None => body.to_string(),
    }
}

/// Extracts a refreshed session token from `Set-Cookie` headers, if any.
fn rotated_session_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .filter_map(|cookie| cookie.split(';').next())
        .find_map(|pair| pair.trim().strip_prefix(SESSION_COOKIE)?.strip_prefix('='))
        .filter(|token| !token.is_empty())
        .map(str::to_string)
}

/// Reads a conversation event stream and returns the final answer text.
///
/// Every event carries the full answer so far, so the last one wins.
async fn read_answer<S, B, E>(stream: S) -> Result<String>
where
    S: Stream<Item = std::result::Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let mut events = std::pin::pin!(stream.eventsource());
    let mut answer = None;

    while let Some(event) = events.next().await {
        let event = event.map_err(|e| BotError::ChatGptResponse(e.to_string()))?;
        let data = event.data.trim();
        if data == "[DONE]" {
            break;
        }
        let parsed: ConversationEvent = match serde_json::from_str(data) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!("Skipping unparseable ChatGPT event: {e}");
                continue;
            }
        };
        if let Some(detail) = parsed.detail {
            let detail = match detail {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            return Err(BotError::ChatGptResponse(detail));
        }
        if let Some(message) = parsed.message {
            answer = Some(message.content.parts.concat());
        }
    }

    answer
        .filter(|text| !text.is_empty())
        .ok_or_else(|| BotError::ChatGptResponse("empty response".to_string()))
}

#[cfg(test)]
mod tests {
    use reqwest::header::HeaderValue;
    use tokio::net::TcpListener;

    use super::*;

    fn chunks(parts: &[&'static str]) -> impl Stream<Item = std::io::Result<&'static [u8]>> {
        futures::stream::iter(
            parts
                .iter()
                .copied()
                .map(|p| Ok(p.as_bytes()))
                .collect::<Vec<_>>(),
        )
    }

    #[tokio::test]
    async fn last_event_wins() {
        let stream = chunks(&[
            "data: {\"message\":{\"content\":{\"parts\":[\"Hel\"]}}}\n\n",
            "data: {\"message\":{\"content\":{\"parts\":[\"Hello!\"]}}}\n\n",
            "data: [DONE]\n\n",
        ]);
        assert_eq!(read_answer(stream).await.expect("answer"), "Hello!");
    }

    #[tokio::test]
    async fn events_split_across_chunks_are_joined() {
        let stream = chunks(&[
            "data: {\"message\":{\"content\":",
            "{\"parts\":[\"split\"]}}}\n\ndata: [DONE]\n\n",
        ]);
        assert_eq!(read_answer(stream).await.expect("answer"), "split");
    }

    #[tokio::test]
    async fn noise_events_are_skipped() {
        let stream = chunks(&[
            "data: ping\n\n",
            "data: {\"message\":{\"content\":{\"parts\":[\"ok\"]}}}\n\n",
        ]);
        assert_eq!(read_answer(stream).await.expect("answer"), "ok");
    }

    #[tokio::test]
    async fn detail_event_is_an_error() {
        let stream = chunks(&["data: {\"detail\":\"Too many requests\"}\n\n"]);
        let err = read_answer(stream).await.unwrap_err();
        assert!(matches!(err, BotError::ChatGptResponse(msg) if msg == "Too many requests"));
    }

    #[tokio::test]
    async fn empty_stream_is_an_error() {
        let stream = chunks(&["data: [DONE]\n\n"]);
        assert!(matches!(
            read_answer(stream).await,
            Err(BotError::ChatGptResponse(_))
        ));
    }

    #[test]
    fn finds_rotated_session_cookie() {
        let mut headers = HeaderMap::new();
        headers.append(SET_COOKIE, HeaderValue::from_static("other=1; Path=/"));
        headers.append(
            SET_COOKIE,
            HeaderValue::from_static(
                "__Secure-next-auth.session-token=fresh; Path=/; Secure; HttpOnly",
            ),
        );
        assert_eq!(rotated_session_token(&headers).as_deref(), Some("fresh"));
    }

    #[test]
    fn no_session_cookie_means_no_rotation() {
        let mut headers = HeaderMap::new();
        headers.append(SET_COOKIE, HeaderValue::from_static("other=1"));
        assert_eq!(rotated_session_token(&headers), None);
    }

    #[test]
    fn endpoints_resolve_against_base_url() {
        let base = Url::parse("https://chat.example.com").expect("url");
        let client = ChatGptClient::new("token".to_string(), base).expect("client");
        assert_eq!(
            client.endpoint(SESSION_PATH).expect("endpoint").as_str(),
            "https://chat.example.com/api/auth/session"
        );
    }

    #[test]
    fn short_error_bodies_are_kept() {
        assert_eq!(truncate_body("  Bad gateway \n"), "Bad gateway");
    }

    #[test]
    fn long_error_bodies_are_cut() {
        let page = format!("<html>{}</html>", "é".repeat(5000));
        let cut = truncate_body(&page);
        assert_eq!(cut.chars().count(), MAX_ERROR_BODY_CHARS + 1);
        assert!(cut.starts_with("<html>"));
        assert!(cut.ends_with('…'));
    }

    #[tokio::test]
    async fn stalled_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        // Accept connections and never answer.
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let base = Url::parse(&format!("http://{addr}")).expect("url");
        let client = ChatGptClient::new("token".to_string(), base).expect("client");
        let err = client
            .send_message("hello", Duration::from_millis(50))
            .await
            .unwrap_err();

        assert!(matches!(err, BotError::Timeout(50)));
        server.abort();
    }
}
