use std::sync::Arc;

use botengine_core::{
    config::WorkerConfig,
    errors::Error,
    handshake::{mark_authenticated, QrHandshake},
    relay::RelayParts,
    signals::SignalStore,
    Result,
};

use crate::{
    bridge::{Bridge, BridgeEvent},
    ingest,
    notify::QrMailer,
    qr::PngQrPresenter,
};

const DEFAULT_RECIPIENT: &str = "BotEngine";

/// Pair through the bridge, then relay messages until interrupted or the
/// bridge goes away.
pub async fn run_worker(cfg: WorkerConfig, parts: RelayParts) -> Result<()> {
    let settings = cfg
        .whatsapp
        .clone()
        .ok_or_else(|| Error::Config("whatsapp settings missing".to_string()))?;
    let key = cfg.identity.key.clone();
    let signals = SignalStore::new(&cfg.identity.data_dir).session(key.clone());

    let mailer = match (settings.qr_email.clone(), cfg.smtp.clone()) {
        (Some(to), Some(smtp)) => Some(QrMailer::new(smtp, to)),
        (Some(_), None) => {
            tracing::warn!("QR e-mail address set but SMTP settings incomplete; not mailing QR codes");
            None
        }
        (None, _) => None,
    };

    let bridge = Bridge::spawn(&settings.bridge, &key.id, &cfg.identity.data_dir)?;
    let mut handshake =
        QrHandshake::new(bridge, PngQrPresenter::new(mailer), signals.clone(), cfg.poll);
    let account = handshake.run().await?;
    let mut bridge = handshake.into_port();

    let recipient = account
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_RECIPIENT.to_string());
    let relay = parts.into_relay(Arc::new(bridge.replies()));
    mark_authenticated(&signals)?;
    tracing::info!(account = %recipient, "relay running");

    let outcome = loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted; stopping relay");
                break Ok(());
            }
            event = bridge.next() => event,
        };

        match event {
            Err(e) => break Err(e),
            Ok(None) => break Err(Error::External("whatsapp bridge exited".to_string())),
            Ok(Some(BridgeEvent::Message(msg))) => {
                if msg.from_me {
                    continue;
                }
                let inbound = ingest::normalize(msg, &recipient, &cfg.media_dir).await;
                relay.handle(&inbound).await;
            }
            Ok(Some(BridgeEvent::AuthFailure { message })) => {
                break Err(Error::External(format!("whatsapp session lost: {message}")));
            }
            Ok(Some(other)) => tracing::debug!(?other, "bridge event ignored"),
        }
    };

    bridge.shutdown().await;
    outcome
}
