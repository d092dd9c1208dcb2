use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use grammers_client::{
    types::{Chat, PackedChat},
    Client, InputMessage, Update,
};
use tokio::sync::Mutex;

use botengine_core::{
    config::WorkerConfig,
    errors::Error,
    handshake::{mark_authenticated, CodeHandshake},
    ports::ReplyPort,
    relay::{InboundMessage, RelayParts},
    signals::SignalStore,
    Result,
};

use crate::{auth::TelegramAuth, ingest};

const DEFAULT_RECIPIENT: &str = "BotEngine";

/// Replies go back to the chat a message came from, quoting it.
pub struct TelegramReplies {
    client: Client,
    chats: Mutex<HashMap<String, PackedChat>>,
}

impl TelegramReplies {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            chats: Mutex::new(HashMap::new()),
        }
    }

    async fn remember(&self, chat: &Chat) {
        self.chats
            .lock()
            .await
            .insert(chat.id().to_string(), chat.pack());
    }
}

#[async_trait]
impl ReplyPort for TelegramReplies {
    async fn reply(&self, to: &InboundMessage, text: &str) -> Result<()> {
        let packed = self
            .chats
            .lock()
            .await
            .get(&to.chat_id)
            .copied()
            .ok_or_else(|| Error::External(format!("unknown telegram chat {}", to.chat_id)))?;
        let reply_to = to.message_id.parse::<i32>().ok();

        self.client
            .send_message(packed, InputMessage::text(text).reply_to(reply_to))
            .await
            .map_err(|e| Error::External(format!("telegram send failed: {e}")))?;
        Ok(())
    }
}

/// Log in, then relay messages until interrupted or disconnected.
pub async fn run_worker(cfg: WorkerConfig, parts: RelayParts) -> Result<()> {
    let settings = cfg
        .telegram
        .clone()
        .ok_or_else(|| Error::Config("telegram settings missing".to_string()))?;
    let store = SignalStore::new(&cfg.identity.data_dir);
    let signals = store.session(cfg.identity.key.clone());
    let session_file = store.telegram_session_file(&cfg.identity.key.id);

    let mut handshake = CodeHandshake::new(
        TelegramAuth::new(settings, session_file),
        signals.clone(),
        cfg.poll,
    );
    handshake.run().await?;
    let client = handshake.into_port().into_client()?;

    let me = client
        .get_me()
        .await
        .map_err(|e| Error::External(format!("failed to load own account: {e}")))?;
    let recipient = match me.first_name().trim() {
        "" => DEFAULT_RECIPIENT.to_string(),
        name => name.to_string(),
    };

    let replies = Arc::new(TelegramReplies::new(client.clone()));
    let relay = parts.into_relay(replies.clone());
    mark_authenticated(&signals)?;
    tracing::info!(account = %recipient, "relay running");

    loop {
        let update = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted; stopping relay");
                break;
            }
            update = client.next_update() => update,
        };

        let update =
            update.map_err(|e| Error::External(format!("telegram connection lost: {e}")))?;
        let Update::NewMessage(msg) = update else {
            continue;
        };
        if msg.outgoing() {
            continue;
        }

        replies.remember(&msg.chat()).await;
        let inbound = ingest::normalize(&client, &msg, &recipient, &cfg.media_dir).await;
        relay.handle(&inbound).await;
    }

    Ok(())
}
