//! Reasoning service wire types (OpenAI-compatible chat completions).

use serde::{Deserialize, Serialize};

use crate::error::PrismError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f64,
    pub max_tokens: u32,
}

impl ChatRequest {
    /// Concatenated message text, used for keyword matching and token estimates
    pub fn prompt_text(&self) -> String {
        self.messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChoiceMessage {
    #[serde(default)]
    pub role: Option<String>,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    pub message: ChoiceMessage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub usage: Usage,
}

impl ChatResponse {
    /// Single-choice response with the given content
    pub fn from_content(content: impl Into<String>, usage: Usage) -> Self {
        Self {
            choices: vec![Choice {
                message: ChoiceMessage {
                    role: Some("assistant".to_string()),
                    content: content.into(),
                },
            }],
            usage,
        }
    }

    /// Text of the first choice
    pub fn content(&self) -> Result<&str, PrismError> {
        self.choices
            .first()
            .map(|c| c.message.content.as_str())
            .ok_or_else(|| PrismError::Parse("response has no choices".to_string()))
    }

    /// Parse the first choice's text as JSON
    pub fn content_json(&self) -> Result<serde_json::Value, PrismError> {
        let text = self.content()?;
        serde_json::from_str(extract_json(text))
            .map_err(|e| PrismError::Parse(format!("content is not valid JSON: {}", e)))
    }
}

/// Strip markdown code fences models like to wrap JSON in
fn extract_json(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        let rest = rest.strip_prefix("json").unwrap_or(rest);
        if let Some(end) = rest.rfind("```") {
            return rest[..end].trim();
        }
    }
    trimmed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_openai_shape() {
        let body = r#"{
            "choices": [{"message": {"role": "assistant", "content": "{\"attention_state\": \"calm\"}"}}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
        }"#;
        let response: ChatResponse = serde_json::from_str(body).unwrap();
        assert_eq!(response.usage.total_tokens, 15);
        assert_eq!(response.content_json().unwrap()["attention_state"], "calm");
    }

    #[test]
    fn test_content_json_fenced() {
        let response = ChatResponse::from_content("```json\n{\"a\": 1}\n```", Usage::default());
        assert_eq!(response.content_json().unwrap()["a"], 1);
    }

    #[test]
    fn test_content_json_invalid() {
        let response = ChatResponse::from_content("not json at all", Usage::default());
        assert!(matches!(response.content_json(), Err(PrismError::Parse(_))));
    }

    #[test]
    fn test_no_choices_is_parse_error() {
        let response = ChatResponse {
            choices: vec![],
            usage: Usage::default(),
        };
        assert!(response.content().is_err());
    }
}
