//! Phishing-detection API client.
//!
//! Authenticates with a username/password JWT exchange and submits samples as
//! JSON, or as multipart when attachments are staged on disk. The token lives
//! in the client instance; an expired token is refreshed at most once per
//! submission.

use async_trait::async_trait;
use reqwest::{multipart, StatusCode};
use tokio::sync::Mutex;

use botengine_core::{
    config::PhishingSettings,
    errors::Error,
    ports::PhishingPort,
    relay::{Sample, Verdict},
    Result,
};

enum Sent {
    Ok(serde_json::Value),
    Unauthorized,
}

pub struct PhishingClient {
    settings: PhishingSettings,
    http: reqwest::Client,
    token: Mutex<Option<String>>,
}

impl PhishingClient {
    pub fn new(settings: PhishingSettings) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| Error::External(format!("phishing client build error: {e}")))?;
        Ok(Self {
            settings,
            http,
            token: Mutex::new(None),
        })
    }

    async fn fetch_token(&self) -> Result<String> {
        tracing::info!(url = %self.settings.token_url, "requesting phishing API token");
        let resp = self
            .http
            .post(&self.settings.token_url)
            .json(&serde_json::json!({
                "username": self.settings.user,
                "password": self.settings.password,
            }))
            .send()
            .await
            .map_err(|e| Error::External(format!("token request error: {e}")))?;

        if !resp.status().is_success() {
            return Err(Error::External(format!(
                "token request failed: {}",
                resp.status()
            )));
        }

        let v: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| Error::External(format!("token json error: {e}")))?;
        v.get("access")
            .and_then(|t| t.as_str())
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .ok_or_else(|| Error::External("token response has no `access` field".to_string()))
    }

    async fn token(&self, refresh: bool) -> Result<String> {
        let mut guard = self.token.lock().await;
        if !refresh {
            if let Some(t) = guard.as_ref() {
                return Ok(t.clone());
            }
        }
        *guard = None;
        let fresh = self.fetch_token().await?;
        *guard = Some(fresh.clone());
        Ok(fresh)
    }

    async fn send_once(&self, token: &str, sample: &Sample) -> Result<Sent> {
        let req = self.http.post(&self.settings.api_url).bearer_auth(token);

        let staged: Vec<_> = sample
            .attachments()
            .iter()
            .enumerate()
            .filter(|(_, a)| a.file_path.is_file())
            .collect();

        let req = if staged.is_empty() {
            req.json(sample)
        } else {
            let mut form = multipart::Form::new().text("sample", serde_json::to_string(sample)?);
            for (idx, a) in staged {
                let bytes = tokio::fs::read(&a.file_path).await?;
                let part = multipart::Part::bytes(bytes)
                    .file_name(a.filename.clone())
                    .mime_str("application/octet-stream")
                    .map_err(|e| Error::External(format!("multipart error: {e}")))?;
                form = form.part(format!("file_{idx}"), part);
            }
            req.multipart(form)
        };

        let resp = req
            .send()
            .await
            .map_err(|e| Error::External(format!("phishing API request error: {e}")))?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED {
            return Ok(Sent::Unauthorized);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::External(format!(
                "phishing API returned {status}: {}",
                body.chars().take(200).collect::<String>()
            )));
        }

        let v = resp
            .json()
            .await
            .map_err(|e| Error::External(format!("phishing API json error: {e}")))?;
        Ok(Sent::Ok(v))
    }

    /// Submit one sample, refreshing the token once on a 401.
    pub async fn submit_sample(&self, sample: &Sample) -> Result<Verdict> {
        let mut token = self.token(false).await?;
        let mut refreshed = false;
        loop {
            match self.send_once(&token, sample).await? {
                Sent::Ok(v) => return Ok(Verdict(v)),
                Sent::Unauthorized if !refreshed => {
                    tracing::info!("phishing API token expired; refreshing");
                    refreshed = true;
                    token = self.token(true).await?;
                }
                Sent::Unauthorized => {
                    return Err(Error::Rejected(
                        "phishing API rejected a freshly issued token".to_string(),
                    ));
                }
            }
        }
    }
}

#[async_trait]
impl PhishingPort for PhishingClient {
    async fn submit(&self, sample: &Sample) -> Option<Verdict> {
        match self.submit_sample(sample).await {
            Ok(v) => {
                tracing::info!(message_id = %sample.sample.message_id, "sample submitted");
                Some(v)
            }
            Err(e) => {
                tracing::error!(message_id = %sample.sample.message_id, "sample not submitted: {e}");
                None
            }
        }
    }
}
