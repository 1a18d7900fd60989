use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};

use crate::app::AppState;

const MAX_TOKENS: u32 = 500;
const TEMPERATURE: f32 = 0.7;

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("OPENAI_API_KEY not configured")]
    NotConfigured,
    #[error("openai request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("openai returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("openai response had empty content")]
    EmptyContent,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

impl ChatTurn {
    pub fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }
}

#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub usage: Option<Value>,
}

fn request_body(model: &str, turns: &[ChatTurn]) -> Value {
    json!({
        "model": model,
        "messages": turns,
        "max_tokens": MAX_TOKENS,
        "temperature": TEMPERATURE,
    })
}

fn completion_text(payload: &Value) -> Option<String> {
    payload
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("message"))
        .and_then(|msg| msg.get("content"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}

pub async fn chat_completion(state: &Arc<AppState>, turns: &[ChatTurn]) -> Result<Completion, LlmError> {
    let config = &state.config;
    if !config.ai_enabled() {
        return Err(LlmError::NotConfigured);
    }
    let response = state
        .http
        .post(&config.openai_api_url)
        .bearer_auth(&config.openai_api_key)
        .json(&request_body(&config.openai_model, turns))
        .send()
        .await?;
    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        return Err(LlmError::Status { status, body });
    }
    let payload = response.json::<Value>().await?;
    let text = completion_text(&payload).ok_or(LlmError::EmptyContent)?;
    Ok(Completion {
        text,
        usage: payload.get("usage").cloned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_carries_sampling_settings() {
        let body = request_body(
            "gpt-3.5-turbo",
            &[ChatTurn::system("be nice"), ChatTurn::user("hola")],
        );
        assert_eq!(body["model"], "gpt-3.5-turbo");
        assert_eq!(body["max_tokens"], 500);
        assert_eq!(body["messages"][0], json!({ "role": "system", "content": "be nice" }));
        assert_eq!(body["messages"][1]["role"], "user");
        assert!((body["temperature"].as_f64().unwrap() - 0.7).abs() < 1e-6);
    }

    #[test]
    fn extracts_first_choice() {
        let payload = json!({
            "choices": [{ "message": { "role": "assistant", "content": "  Hola!  " } }],
            "usage": { "total_tokens": 12 }
        });
        assert_eq!(completion_text(&payload).as_deref(), Some("Hola!"));
    }

    #[test]
    fn blank_or_missing_content_is_none() {
        assert_eq!(completion_text(&json!({ "choices": [] })), None);
        assert_eq!(
            completion_text(&json!({ "choices": [{ "message": { "content": "  " } }] })),
            None
        );
    }

    #[tokio::test]
    async fn refuses_without_api_key() {
        let state = crate::app::test_state();
        let err = chat_completion(&state, &[ChatTurn::user("hola")]).await.unwrap_err();
        assert!(matches!(err, LlmError::NotConfigured));
    }
}
