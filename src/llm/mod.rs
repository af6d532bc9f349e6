use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use thiserror::Error;

use crate::database::Role;

const SYSTEM_PROMPT: &str = "You are a helpful assistant. \
Keep responses professional, grounded in facts, and concise. \
If real-time data is provided (weather, stock prices, search results), use it to answer accurately. \
If no real-time data is given, do not invent numbers; say you don't have live data for that.";

const CONTEXT_CHAR_BUDGET: usize = 6_000;

#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("Generation transport error: {0}")]
    Transport(String),
    #[error("Generation service returned {0}")]
    BadStatus(String),
}

impl From<reqwest::Error> for GenerationError {
    fn from(e: reqwest::Error) -> Self {
        GenerationError::Transport(e.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

pub type TokenStream = BoxStream<'static, Result<String, GenerationError>>;

/// Streaming text generation. `context` is the combined tool/document
/// context string and lands in the system prompt, not the message list.
#[async_trait]
pub trait GenerationService: Send + Sync {
    async fn stream_chat(
        &self,
        turns: Vec<ChatTurn>,
        context: Option<String>,
    ) -> Result<TokenStream, GenerationError>;

    /// One-shot completion used by non-streaming callers.
    async fn complete(&self, prompt: &str) -> Result<String, GenerationError> {
        let mut stream = self.stream_chat(vec![ChatTurn::user(prompt)], None).await?;
        let mut out = String::new();
        while let Some(fragment) = stream.next().await {
            out.push_str(&fragment?);
        }
        Ok(out)
    }
}

/// Client for an Ollama-compatible `/api/chat` endpoint. The response is
/// newline-delimited JSON; malformed lines are skipped, a `done: true`
/// object ends the stream.
pub struct OllamaClient {
    client: Client,
    base_url: String,
    model: String,
}

impl OllamaClient {
    pub fn new(base_url: String, model: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            base_url,
            model,
        }
    }

    fn system_prompt(context: Option<&str>) -> String {
        let mut prompt = SYSTEM_PROMPT.to_string();
        if let Some(context) = context.filter(|c| !c.trim().is_empty()) {
            let mut end = CONTEXT_CHAR_BUDGET.min(context.len());
            while !context.is_char_boundary(end) {
                end -= 1;
            }
            prompt.push_str(&format!(
                "\n\nUse the following CONTEXT to answer questions when relevant. \
If the answer isn't in the context, rely on the conversation history or say you don't know.\n\n\
=== CONTEXT ===\n{}\n=== END CONTEXT ===",
                &context[..end]
            ));
        }
        prompt
    }
}

/// What one NDJSON line means for the consumer.
enum LineEvent {
    Content(String),
    Done,
    Skip,
}

fn parse_stream_line(line: &str) -> LineEvent {
    let line = line.trim();
    if line.is_empty() {
        return LineEvent::Skip;
    }
    let Ok(data) = serde_json::from_str::<Value>(line) else {
        return LineEvent::Skip;
    };
    if data.get("done").and_then(|d| d.as_bool()) == Some(true) {
        return LineEvent::Done;
    }
    match data
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
    {
        Some(content) if !content.is_empty() => LineEvent::Content(content.to_string()),
        _ => LineEvent::Skip,
    }
}

#[async_trait]
impl GenerationService for OllamaClient {
    async fn stream_chat(
        &self,
        turns: Vec<ChatTurn>,
        context: Option<String>,
    ) -> Result<TokenStream, GenerationError> {
        let mut messages = vec![json!({
            "role": "system",
            "content": Self::system_prompt(context.as_deref()),
        })];
        for turn in &turns {
            messages.push(json!({
                "role": turn.role.as_str(),
                "content": turn.content,
            }));
        }

        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&json!({
                "model": self.model,
                "messages": messages,
                "stream": true,
                "keep_alive": "10m",
                "options": {
                    "temperature": 0.1,
                    "top_p": 0.95,
                    "num_predict": 400,
                },
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(GenerationError::BadStatus(status.to_string()));
        }

        let bytes = response.bytes_stream().boxed();
        let stream = futures::stream::unfold(
            (bytes, String::new(), false),
            |(mut bytes, mut buffer, finished)| async move {
                if finished {
                    return None;
                }
                loop {
                    if let Some(pos) = buffer.find('\n') {
                        let line: String = buffer.drain(..=pos).collect();
                        match parse_stream_line(&line) {
                            LineEvent::Content(content) => {
                                return Some((Ok(content), (bytes, buffer, false)));
                            }
                            LineEvent::Done => return None,
                            LineEvent::Skip => continue,
                        }
                    }
                    match bytes.next().await {
                        Some(Ok(chunk)) => {
                            buffer.push_str(&String::from_utf8_lossy(&chunk));
                        }
                        Some(Err(e)) => {
                            return Some((
                                Err(GenerationError::Transport(e.to_string())),
                                (bytes, buffer, true),
                            ));
                        }
                        None => {
                            // Tail without a trailing newline.
                            let line = std::mem::take(&mut buffer);
                            return match parse_stream_line(&line) {
                                LineEvent::Content(content) => {
                                    Some((Ok(content), (bytes, buffer, true)))
                                }
                                _ => None,
                            };
                        }
                    }
                }
            },
        );
        Ok(stream.boxed())
    }
}
