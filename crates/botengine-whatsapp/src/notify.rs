//! Mails each fresh QR challenge to the session's notification address.

use chrono::{DateTime, Local};
use lettre::{
    message::{header::ContentType, Attachment, Mailbox, MultiPart, SinglePart},
    transport::smtp::authentication::Credentials,
    Message, SmtpTransport, Transport,
};

use botengine_core::{config::SmtpSettings, errors::Error, Result};

use crate::qr::decode_png_data_url;

const QR_CONTENT_ID: &str = "whatsapp-qr";
/// Port that speaks TLS from the first byte; every other port upgrades with
/// STARTTLS.
const IMPLICIT_TLS_PORT: u16 = 465;

#[derive(Clone, Debug)]
pub struct QrMailer {
    smtp: SmtpSettings,
    recipient: String,
}

impl QrMailer {
    pub fn new(smtp: SmtpSettings, recipient: String) -> Self {
        Self { smtp, recipient }
    }

    pub fn build_message(&self, data_url: &str, now: DateTime<Local>) -> Result<Message> {
        let png = decode_png_data_url(data_url)?;
        let from: Mailbox = format!("BotEngine <{}>", self.smtp.user)
            .parse()
            .map_err(|e| Error::Config(format!("invalid EMAIL_USER address: {e}")))?;
        let to: Mailbox = self
            .recipient
            .parse()
            .map_err(|e| Error::Config(format!("invalid QR notification address: {e}")))?;
        let png_type = ContentType::parse("image/png")
            .map_err(|e| Error::External(format!("content type error: {e}")))?;

        let html = [
            "<p>Hello,</p>".to_string(),
            "<p>Scan the QR code below with WhatsApp to connect your account to BotEngine.</p>"
                .to_string(),
            "<p>The code is refreshed periodically; if it does not work, wait for the next one.</p>"
                .to_string(),
            format!("<img src=\"cid:{QR_CONTENT_ID}\" alt=\"WhatsApp QR code\"\n width=\"220\" height=\"220\" />"),
            "<p>Thanks,<br/>The BotEngine team</p>".to_string(),
        ]
        .join("\n");

        Message::builder()
            .from(from)
            .to(to)
            .subject(format!(
                "QR code to connect your WhatsApp to BotEngine {}",
                now.format("%d/%m/%Y %H:%M")
            ))
            .multipart(
                MultiPart::related()
                    .singlepart(SinglePart::html(html))
                    .singlepart(
                        Attachment::new_inline(QR_CONTENT_ID.to_string()).body(png, png_type),
                    ),
            )
            .map_err(|e| Error::External(format!("failed to build QR e-mail: {e}")))
    }

    fn transport(&self) -> Result<SmtpTransport> {
        let builder = if self.smtp.port == IMPLICIT_TLS_PORT {
            SmtpTransport::relay(&self.smtp.host)
        } else {
            SmtpTransport::starttls_relay(&self.smtp.host)
        }
        .map_err(|e| Error::External(format!("smtp setup failed: {e}")))?;

        Ok(builder
            .port(self.smtp.port)
            .credentials(Credentials::new(
                self.smtp.user.clone(),
                self.smtp.pass.clone(),
            ))
            .build())
    }

    pub fn send(&self, data_url: &str) -> Result<()> {
        let email = self.build_message(data_url, Local::now())?;
        self.transport()?
            .send(&email)
            .map_err(|e| Error::External(format!("smtp send failed: {e}")))?;
        Ok(())
    }

    /// Deliver on the blocking pool; failures are only logged.
    pub fn send_in_background(&self, data_url: &str) {
        let mailer = self.clone();
        let data_url = data_url.to_string();
        tokio::task::spawn_blocking(move || match mailer.send(&data_url) {
            Ok(()) => tracing::info!(to = %mailer.recipient, "QR code e-mailed"),
            Err(e) => tracing::error!(to = %mailer.recipient, "failed to e-mail QR code: {e}"),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qr::render_png_data_url;
    use chrono::TimeZone;

    fn mailer(recipient: &str) -> QrMailer {
        QrMailer::new(
            SmtpSettings {
                host: "smtp.example.com".to_string(),
                port: 587,
                user: "bot@example.com".to_string(),
                pass: "secret".to_string(),
            },
            recipient.to_string(),
        )
    }

    #[test]
    fn message_inlines_the_qr_png() {
        let url = render_png_data_url("2@abc").unwrap();
        let now = Local.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap();
        let email = mailer("owner@example.com").build_message(&url, now).unwrap();
        let raw = String::from_utf8_lossy(&email.formatted()).to_string();

        assert!(raw.contains("Subject: QR code to connect your WhatsApp"));
        assert!(raw.contains("01/05/2024 09:30"));
        assert!(raw.contains("To: owner@example.com"));
        assert!(raw.contains("multipart/related"));
        assert!(raw.contains("Content-ID: <whatsapp-qr>"));
    }

    #[test]
    fn bad_addresses_are_config_errors() {
        let url = render_png_data_url("2@abc").unwrap();
        let err = mailer("not an address")
            .build_message(&url, Local::now())
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
