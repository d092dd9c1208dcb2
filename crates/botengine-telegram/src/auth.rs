use std::path::PathBuf;

use async_trait::async_trait;
use grammers_client::{types::LoginToken, Client, Config, SignInError};
use grammers_session::Session;

use botengine_core::{
    config::TelegramSettings,
    errors::Error,
    ports::{CodeAuthPort, CodeVerdict},
    Result,
};

/// Phone + code login over MTProto. The authorized session is persisted to
/// the session's credential blob so later starts skip the code.
pub struct TelegramAuth {
    settings: TelegramSettings,
    session_file: PathBuf,
    client: Option<Client>,
    login_token: Option<LoginToken>,
}

impl TelegramAuth {
    pub fn new(settings: TelegramSettings, session_file: PathBuf) -> Self {
        Self {
            settings,
            session_file,
            client: None,
            login_token: None,
        }
    }

    fn client(&self) -> Result<&Client> {
        self.client
            .as_ref()
            .ok_or_else(|| Error::External("telegram client is not connected".to_string()))
    }

    /// The connected client, once the handshake is done.
    pub fn into_client(self) -> Result<Client> {
        self.client
            .ok_or_else(|| Error::External("telegram client is not connected".to_string()))
    }

    fn save_session(&self) -> Result<()> {
        self.client()?.session().save_to_file(&self.session_file)?;
        Ok(())
    }
}

#[async_trait]
impl CodeAuthPort for TelegramAuth {
    async fn connect(&mut self) -> Result<bool> {
        let session = Session::load_file_or_create(&self.session_file)?;
        let client = Client::connect(Config {
            session,
            api_id: self.settings.api_id,
            api_hash: self.settings.api_hash.clone(),
            params: Default::default(),
        })
        .await
        .map_err(|e| Error::External(format!("telegram connect failed: {e}")))?;

        let authorized = client
            .is_authorized()
            .await
            .map_err(|e| Error::External(format!("telegram authorization check failed: {e}")))?;
        self.client = Some(client);

        if authorized {
            self.save_session()?;
        }
        Ok(authorized)
    }

    async fn request_code(&mut self) -> Result<()> {
        let token = self
            .client()?
            .request_login_code(&self.settings.phone)
            .await
            .map_err(|e| Error::External(format!("failed to request login code: {e}")))?;
        tracing::info!("login code requested");
        self.login_token = Some(token);
        Ok(())
    }

    async fn submit_code(&mut self, code: &str) -> Result<CodeVerdict> {
        let client = self.client()?;
        let token = self
            .login_token
            .as_ref()
            .ok_or_else(|| Error::External("no login code was requested".to_string()))?;

        match client.sign_in(token, code).await {
            Ok(user) => {
                tracing::info!(user_id = user.id(), "signed in");
                self.login_token = None;
                self.save_session()?;
                Ok(CodeVerdict::Accepted)
            }
            Err(SignInError::InvalidCode) => {
                Ok(CodeVerdict::Rejected("invalid verification code".to_string()))
            }
            // Expired codes, flood waits and the like: the operator may retry.
            Err(SignInError::Other(e)) => Ok(CodeVerdict::Rejected(format!("sign-in failed: {e}"))),
            Err(SignInError::PasswordRequired(_)) => Err(Error::External(
                "two-step verification is enabled on this account; cloud passwords are not supported"
                    .to_string(),
            )),
            Err(SignInError::SignUpRequired { .. }) => Err(Error::External(
                "this phone number has no Telegram account".to_string(),
            )),
            Err(e) => Err(Error::External(format!("sign-in failed: {e}"))),
        }
    }
}
