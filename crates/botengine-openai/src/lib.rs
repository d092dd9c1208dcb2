//! OpenAI adapter (conversational agent).
//!
//! Uses the `chat/completions` endpoint; history is supplied by the caller on
//! every call.

use async_trait::async_trait;
use serde::Serialize;

use botengine_core::{
    config::AgentSettings,
    errors::Error,
    ports::{AgentPort, ChatTurn, Role},
    Result,
};

pub const DEFAULT_SYSTEM_PROMPT: &str = "\
You are a friendly person chatting from your own messaging account. \
Answer naturally and briefly, in the language the other person writes in. \
Never reveal that you are an automated assistant.";

const TEMPERATURE: f32 = 0.7;

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    messages: Vec<WireMessage<'a>>,
}

#[derive(Clone, Debug)]
pub struct OpenAiAgent {
    api_key: String,
    model: String,
    base_url: String,
    system_prompt: String,
    http: reqwest::Client,
}

impl OpenAiAgent {
    pub fn new(settings: &AgentSettings) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .map_err(|e| Error::External(format!("openai client build error: {e}")))?;
        Ok(Self {
            api_key: settings.api_key.clone(),
            model: settings.model.clone(),
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            http,
        })
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    fn request<'a>(&'a self, input: &'a str, history: &'a [ChatTurn]) -> ChatRequest<'a> {
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(WireMessage {
            role: "system",
            content: &self.system_prompt,
        });
        for turn in history {
            messages.push(WireMessage {
                role: match turn.role {
                    Role::User => "user",
                    Role::Assistant => "assistant",
                },
                content: &turn.content,
            });
        }
        messages.push(WireMessage {
            role: "user",
            content: input,
        });
        ChatRequest {
            model: &self.model,
            temperature: TEMPERATURE,
            messages,
        }
    }
}

#[async_trait]
impl AgentPort for OpenAiAgent {
    async fn invoke(&self, input: &str, history: &[ChatTurn]) -> Result<String> {
        let resp = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&self.request(input, history))
            .send()
            .await
            .map_err(|e| Error::External(format!("openai request error: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::External(format!(
                "openai chat completion failed: {status} {}",
                body.chars().take(200).collect::<String>()
            )));
        }

        let v: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| Error::External(format!("openai json error: {e}")))?;

        let text = v
            .pointer("/choices/0/message/content")
            .and_then(|t| t.as_str())
            .unwrap_or("")
            .trim()
            .to_string();

        if text.is_empty() {
            return Err(Error::External(
                "openai chat completion returned empty text".to_string(),
            ));
        }
        tracing::debug!(chars = text.len(), "agent replied");
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::{
        matchers::{bearer_token, body_partial_json, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    fn agent(server: &MockServer) -> OpenAiAgent {
        OpenAiAgent::new(&AgentSettings {
            api_key: "sk-test".to_string(),
            model: "gpt-4o".to_string(),
            base_url: format!("{}/v1/", server.uri()),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn sends_history_after_the_system_prompt() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(bearer_token("sk-test"))
            .and(body_partial_json(json!({
                "model": "gpt-4o",
                "messages": [
                    {"role": "system", "content": "be brief"},
                    {"role": "user", "content": "hi"},
                    {"role": "assistant", "content": "hello!"},
                    {"role": "user", "content": "how are you?"}
                ]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": " fine, thanks "}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let history = vec![ChatTurn::user("hi"), ChatTurn::assistant("hello!")];
        let out = agent(&server)
            .with_system_prompt("be brief")
            .invoke("how are you?", &history)
            .await
            .unwrap();
        assert_eq!(out, "fine, thanks");
    }

    #[tokio::test]
    async fn http_errors_and_empty_answers_are_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
            .mount(&server)
            .await;

        let a = agent(&server);
        let err = a.invoke("x", &[]).await.unwrap_err();
        assert!(err.to_string().contains("429"));
        let err = a.invoke("x", &[]).await.unwrap_err();
        assert!(err.to_string().contains("empty"));
    }
}
