//! Discord REST calls: who we are, where the gateway is, sending messages.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use botengine_core::{
    config::DiscordSettings, errors::Error, ports::ReplyPort, relay::InboundMessage, Result,
};

/// Longest message content Discord accepts.
pub const MAX_MESSAGE_CHARS: usize = 2000;

const DEFAULT_GATEWAY_URL: &str = "wss://gateway.discord.gg";

/// The account the bot token belongs to.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct BotUser {
    pub id: String,
    pub username: String,
}

#[derive(Clone, Debug)]
pub struct DiscordRest {
    token: String,
    api_base: String,
    http: reqwest::Client,
}

impl DiscordRest {
    pub fn new(settings: &DiscordSettings) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| Error::External(format!("discord client build error: {e}")))?;
        Ok(Self {
            token: settings.token.clone(),
            api_base: settings.api_base.trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    fn authorization(&self) -> String {
        format!("Bot {}", self.token)
    }

    async fn get_json(&self, route: &str) -> Result<serde_json::Value> {
        let resp = self
            .http
            .get(format!("{}{route}", self.api_base))
            .header("Authorization", self.authorization())
            .send()
            .await
            .map_err(|e| Error::External(format!("discord request error: {e}")))?;
        check(resp, route)
            .await?
            .json()
            .await
            .map_err(|e| Error::External(format!("discord json error: {e}")))
    }

    pub async fn current_user(&self) -> Result<BotUser> {
        let v = self.get_json("/users/@me").await?;
        serde_json::from_value(v).map_err(Error::from)
    }

    /// Gateway websocket URL with version and encoding set.
    pub async fn gateway_url(&self) -> Result<String> {
        let v = self.get_json("/gateway/bot").await?;
        let base = v
            .get("url")
            .and_then(|u| u.as_str())
            .unwrap_or(DEFAULT_GATEWAY_URL);
        Ok(format!("{base}/?v=10&encoding=json"))
    }

    /// Post `content` to a channel, split into as many messages as needed.
    /// The first one quotes `reply_to` when given.
    pub async fn send_message(
        &self,
        channel_id: &str,
        content: &str,
        reply_to: Option<&str>,
    ) -> Result<()> {
        let route = format!("/channels/{channel_id}/messages");
        for (i, chunk) in split_message(content).iter().enumerate() {
            let mut body = json!({
                "content": chunk,
                "allowed_mentions": { "replied_user": false },
            });
            if let (0, Some(id)) = (i, reply_to) {
                body["message_reference"] = json!({ "message_id": id, "fail_if_not_exists": false });
            }

            let resp = self
                .http
                .post(format!("{}{route}", self.api_base))
                .header("Authorization", self.authorization())
                .json(&body)
                .send()
                .await
                .map_err(|e| Error::External(format!("discord request error: {e}")))?;
            check(resp, &route).await?;
        }
        Ok(())
    }
}

async fn check(resp: reqwest::Response, route: &str) -> Result<reqwest::Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    Err(Error::External(format!(
        "discord {route} failed: {status} {}",
        body.chars().take(200).collect::<String>()
    )))
}

/// Split at the last newline (or space) that keeps each part within
/// [`MAX_MESSAGE_CHARS`]; hard split when there is none.
pub fn split_message(content: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut rest = content;

    while rest.chars().count() > MAX_MESSAGE_CHARS {
        let limit = rest
            .char_indices()
            .nth(MAX_MESSAGE_CHARS)
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        let window = &rest[..limit];
        let cut = window
            .rfind('\n')
            .or_else(|| window.rfind(' '))
            .filter(|pos| *pos > 0)
            .map(|pos| pos + 1)
            .unwrap_or(limit);
        parts.push(rest[..cut].to_string());
        rest = &rest[cut..];
    }
    if !rest.is_empty() || parts.is_empty() {
        parts.push(rest.to_string());
    }
    parts
}

/// Replies into the channel the message came from, quoting it.
pub struct DiscordReplies {
    rest: DiscordRest,
}

impl DiscordReplies {
    pub fn new(rest: DiscordRest) -> Self {
        Self { rest }
    }
}

#[async_trait]
impl ReplyPort for DiscordReplies {
    async fn reply(&self, to: &InboundMessage, text: &str) -> Result<()> {
        self.rest
            .send_message(&to.chat_id, text, Some(&to.message_id))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::{
        matchers::{body_partial_json, header, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    fn rest(server: &MockServer) -> DiscordRest {
        DiscordRest::new(&DiscordSettings {
            token: "tok".to_string(),
            api_base: format!("{}/", server.uri()),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn reads_the_bot_user_and_gateway() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/users/@me"))
            .and(header("Authorization", "Bot tok"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"id": "42", "username": "relay", "bot": true})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/gateway/bot"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"url": "wss://gw.example"})),
            )
            .mount(&server)
            .await;

        let rest = rest(&server);
        assert_eq!(
            rest.current_user().await.unwrap(),
            BotUser {
                id: "42".to_string(),
                username: "relay".to_string()
            }
        );
        assert_eq!(
            rest.gateway_url().await.unwrap(),
            "wss://gw.example/?v=10&encoding=json"
        );
    }

    #[tokio::test]
    async fn replies_quote_the_original_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/channels/7/messages"))
            .and(body_partial_json(json!({
                "content": "hello",
                "message_reference": {"message_id": "99"},
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "100"})))
            .expect(1)
            .mount(&server)
            .await;

        rest(&server)
            .send_message("7", "hello", Some("99"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn http_errors_are_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/channels/7/messages"))
            .respond_with(ResponseTemplate::new(403).set_body_string("Missing Access"))
            .mount(&server)
            .await;

        let err = rest(&server)
            .send_message("7", "hello", None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("403"));
        assert!(err.to_string().contains("Missing Access"));
    }

    #[test]
    fn long_messages_are_split_on_line_breaks() {
        let text = format!("{}\n{}", "a".repeat(1500), "b".repeat(1000));
        let parts = split_message(&text);
        assert_eq!(parts.len(), 2);
        assert!(parts[0].ends_with('\n'));
        assert_eq!(parts.concat(), text);

        let solid = "c".repeat(MAX_MESSAGE_CHARS + 1);
        let parts = split_message(&solid);
        assert_eq!(parts[0].chars().count(), MAX_MESSAGE_CHARS);
        assert_eq!(parts[1], "c");

        assert_eq!(split_message("short"), vec!["short".to_string()]);
        assert_eq!(split_message(""), vec![String::new()]);
    }
}
