use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::models::{HistoryItem, Persona};

/// Collaborator failure taxonomy. Every variant maps to the FAILED branch of
/// the job state machine and is retried with backoff until attempts run out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationError {
    Timeout,
    RateLimited,
    MalformedOutput(String),
    ContentPolicy,
    Upstream(String),
}

impl GenerationError {
    /// Reason tag recorded on the job when retries are exhausted.
    pub fn as_reason(&self) -> &'static str {
        match self {
            GenerationError::Timeout => "collaborator_timeout",
            GenerationError::RateLimited => "collaborator_rate_limited",
            GenerationError::MalformedOutput(_) => "collaborator_malformed_output",
            GenerationError::ContentPolicy => "collaborator_content_policy",
            GenerationError::Upstream(_) => "collaborator_upstream_error",
        }
    }
}

impl fmt::Display for GenerationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GenerationError::Timeout => write!(f, "generation timed out"),
            GenerationError::RateLimited => write!(f, "generation rate limited"),
            GenerationError::MalformedOutput(detail) => {
                write!(f, "malformed generation output: {}", detail)
            }
            GenerationError::ContentPolicy => write!(f, "generation rejected by content policy"),
            GenerationError::Upstream(detail) => write!(f, "generation upstream error: {}", detail),
        }
    }
}

impl std::error::Error for GenerationError {}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneratedResponse {
    pub text: String,
    pub confidence: f64,
}

/// Turns "entry + persona + short history" into "text + confidence". The
/// orchestrator treats implementations as opaque; tests substitute fakes.
#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    async fn generate(
        &self,
        entry_text: &str,
        persona: Persona,
        history: &[HistoryItem],
    ) -> Result<GeneratedResponse, GenerationError>;
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

/// OpenAI-format chat-completions client with a bounded per-call timeout.
pub struct LlmResponseGenerator {
    api_url: String,
    api_key: Option<String>,
    model: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl LlmResponseGenerator {
    pub fn new(
        api_url: String,
        api_key: Option<String>,
        model: String,
        timeout: Duration,
    ) -> Self {
        Self {
            api_url,
            api_key,
            model,
            timeout,
            client: reqwest::Client::new(),
        }
    }

    fn persona_system_prompt(persona: Persona) -> &'static str {
        match persona {
            Persona::Pulse => {
                "You are Pulse, a warm, grounded companion replying to a friend's \
                 journal entry. You notice energy, sleep and stress patterns and \
                 respond with short, caring observations. Never mention being an AI."
            }
            Persona::Sage => {
                "You are Sage, a thoughtful companion replying to a friend's journal \
                 entry. You offer calm perspective on work and relationships without \
                 giving unsolicited advice. Never mention being an AI."
            }
            Persona::Spark => {
                "You are Spark, an upbeat companion replying to a friend's journal \
                 entry. You celebrate creative wins and small joys. Never mention \
                 being an AI."
            }
            Persona::Haven => {
                "You are Haven, a gentle companion replying to a friend's journal \
                 entry. You make space for hard feelings without trying to fix them. \
                 Never mention being an AI."
            }
        }
    }

    fn build_messages(
        entry_text: &str,
        persona: Persona,
        history: &[HistoryItem],
    ) -> Vec<Message> {
        let mut messages = vec![Message {
            role: "system".to_string(),
            content: format!(
                "{}\n\nReply in 2-4 sentences. Respond with JSON:\n\
                 {{\"text\": \"your reply\", \"confidence\": 0.0-1.0}}",
                Self::persona_system_prompt(persona)
            ),
        }];

        let mut context = String::new();
        for item in history {
            match item {
                HistoryItem::PlainText { text } => {
                    context.push_str(&format!("[journal] {}\n", text));
                }
                HistoryItem::PersonaTagged { persona, text, .. } => {
                    context.push_str(&format!("[{}] {}\n", persona.as_db_str(), text));
                }
            }
        }

        messages.push(Message {
            role: "user".to_string(),
            content: format!(
                "## Thread so far\n{}\n## Entry to respond to\n{}",
                if context.is_empty() { "None" } else { &context },
                entry_text
            ),
        });
        messages
    }

    async fn complete(&self, messages: Vec<Message>) -> Result<String, GenerationError> {
        let url = format!("{}/chat/completions", self.api_url);
        let request = ChatCompletionRequest {
            model: self.model.clone(),
            messages,
            temperature: Some(0.8),
            max_tokens: Some(400),
        };

        let mut req = self.client.post(&url).json(&request);
        if let Some(key) = &self.api_key {
            if !key.is_empty() {
                req = req.header("Authorization", format!("Bearer {}", key));
            }
        }

        let send = tokio::time::timeout(self.timeout, req.send())
            .await
            .map_err(|_| GenerationError::Timeout)?;
        let response = send.map_err(|e| {
            if e.is_timeout() {
                GenerationError::Timeout
            } else {
                GenerationError::Upstream(e.to_string())
            }
        })?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(GenerationError::RateLimited);
        }
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unable to read body".to_string());
            return Err(GenerationError::Upstream(format!("{}: {}", status, body)));
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::MalformedOutput(e.to_string()))?;
        completion
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .ok_or_else(|| GenerationError::MalformedOutput("no choices".to_string()))
    }

    fn parse_generated(raw: &str) -> Result<GeneratedResponse, GenerationError> {
        if let Ok(parsed) = serde_json::from_str::<GeneratedResponse>(raw) {
            return validate(parsed);
        }
        // Extract from a markdown code fence or the outermost braces.
        let candidate = if let Some(start) = raw.find("```json") {
            let after = &raw[start + 7..];
            after.find("```").map(|end| after[..end].trim()).unwrap_or(raw)
        } else if let (Some(start), Some(end)) = (raw.find('{'), raw.rfind('}')) {
            &raw[start..=end]
        } else {
            raw
        };
        let parsed = serde_json::from_str::<GeneratedResponse>(candidate.trim())
            .map_err(|e| GenerationError::MalformedOutput(e.to_string()))?;
        validate(parsed)
    }
}

fn validate(parsed: GeneratedResponse) -> Result<GeneratedResponse, GenerationError> {
    let text = parsed.text.trim();
    if text.is_empty() {
        return Err(GenerationError::MalformedOutput("empty text".to_string()));
    }
    Ok(GeneratedResponse {
        text: text.to_string(),
        confidence: parsed.confidence.clamp(0.0, 1.0),
    })
}

#[async_trait]
impl ResponseGenerator for LlmResponseGenerator {
    async fn generate(
        &self,
        entry_text: &str,
        persona: Persona,
        history: &[HistoryItem],
    ) -> Result<GeneratedResponse, GenerationError> {
        let messages = Self::build_messages(entry_text, persona, history);
        let raw = self.complete(messages).await?;
        Self::parse_generated(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn parses_plain_and_fenced_json() {
        let parsed = LlmResponseGenerator::parse_generated(
            r#"{"text": "That sounds heavy.", "confidence": 0.85}"#,
        )
        .expect("plain json");
        assert_eq!(parsed.text, "That sounds heavy.");

        let fenced = "Here you go:\n```json\n{\"text\": \"Nice win!\", \"confidence\": 1.4}\n```";
        let parsed = LlmResponseGenerator::parse_generated(fenced).expect("fenced json");
        assert_eq!(parsed.text, "Nice win!");
        assert_eq!(parsed.confidence, 1.0);
    }

    #[test]
    fn empty_or_unparseable_output_is_malformed() {
        assert!(matches!(
            LlmResponseGenerator::parse_generated("no json here at all"),
            Err(GenerationError::MalformedOutput(_))
        ));
        assert!(matches!(
            LlmResponseGenerator::parse_generated(r#"{"text": "  ", "confidence": 0.5}"#),
            Err(GenerationError::MalformedOutput(_))
        ));
    }

    #[test]
    fn messages_carry_persona_tags_and_entry() {
        let history = vec![
            HistoryItem::PlainText {
                text: "Rough week.".to_string(),
            },
            HistoryItem::PersonaTagged {
                persona: Persona::Sage,
                text: "Weeks like that pass.".to_string(),
                timestamp: Utc::now(),
            },
        ];
        let messages =
            LlmResponseGenerator::build_messages("Feeling a bit better.", Persona::Sage, &history);
        assert_eq!(messages.len(), 2);
        assert!(messages[0].content.contains("Sage"));
        assert!(messages[1].content.contains("[sage] Weeks like that pass."));
        assert!(messages[1].content.contains("Feeling a bit better."));
    }

    #[test]
    fn error_reasons_are_stable_tags() {
        assert_eq!(GenerationError::Timeout.as_reason(), "collaborator_timeout");
        assert_eq!(
            GenerationError::RateLimited.as_reason(),
            "collaborator_rate_limited"
        );
    }
}
