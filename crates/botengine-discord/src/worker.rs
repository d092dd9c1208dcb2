use std::{sync::Arc, time::Duration};

use botengine_core::{config::DiscordConfig, relay::RelayParts, Result};

use crate::{
    gateway::{Gateway, GatewayEvent},
    ingest,
    rest::{DiscordReplies, DiscordRest},
};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

enum Session {
    Interrupted,
    Lost(String),
}

/// Relay Discord messages until interrupted, reconnecting whenever the
/// gateway drops the session.
///
/// An invalid token fails here, before any gateway traffic.
pub async fn run(cfg: DiscordConfig, parts: RelayParts) -> Result<()> {
    let rest = DiscordRest::new(&cfg.discord)?;
    let me = rest.current_user().await?;
    tracing::info!(bot = %me.username, id = %me.id, "discord bot logged in");

    let relay = parts.into_relay(Arc::new(DiscordReplies::new(rest.clone())));

    loop {
        let outcome = async {
            let url = rest.gateway_url().await?;
            let mut gateway = Gateway::connect(&url, rest.token()).await?;

            let session = loop {
                let event = tokio::select! {
                    _ = tokio::signal::ctrl_c() => break Session::Interrupted,
                    event = gateway.next_event() => event,
                };
                match event {
                    Ok(GatewayEvent::Message(msg)) => {
                        if msg.is_from(&me) {
                            continue;
                        }
                        relay.handle(&ingest::normalize(*msg, &me)).await;
                    }
                    Ok(GatewayEvent::Closed(reason)) => break Session::Lost(reason),
                    Err(e) => break Session::Lost(e.to_string()),
                }
            };
            gateway.close().await;
            Ok::<_, botengine_core::Error>(session)
        }
        .await;

        match outcome {
            Ok(Session::Interrupted) => {
                tracing::info!("interrupted; stopping discord relay");
                return Ok(());
            }
            Ok(Session::Lost(reason)) => tracing::warn!("discord session lost: {reason}"),
            Err(e) => tracing::warn!("discord gateway unavailable: {e}"),
        }

        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
    }
}
