use std::io::Cursor;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use image::{ImageFormat, Luma};
use qrcode::QrCode;

use botengine_core::{errors::Error, ports::QrPresenter, Result};

use crate::notify::QrMailer;

pub const PNG_DATA_URL_PREFIX: &str = "data:image/png;base64,";

const QR_MIN_PX: u32 = 264;

/// Encode a pairing payload as a PNG data URI.
pub fn render_png_data_url(payload: &str) -> Result<String> {
    let payload = payload.trim();
    if payload.is_empty() {
        return Err(Error::External("QR payload is empty".to_string()));
    }

    let code = QrCode::new(payload.as_bytes())
        .map_err(|e| Error::External(format!("failed to encode QR payload: {e}")))?;
    let img = code
        .render::<Luma<u8>>()
        .min_dimensions(QR_MIN_PX, QR_MIN_PX)
        .build();

    let mut png = Vec::new();
    img.write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .map_err(|e| Error::External(format!("failed to write QR image: {e}")))?;
    Ok(format!("{PNG_DATA_URL_PREFIX}{}", BASE64_STANDARD.encode(&png)))
}

/// PNG bytes of a data URI produced by [`render_png_data_url`].
pub fn decode_png_data_url(data_url: &str) -> Result<Vec<u8>> {
    let b64 = data_url
        .strip_prefix(PNG_DATA_URL_PREFIX)
        .ok_or_else(|| Error::External("not a PNG data URI".to_string()))?;
    BASE64_STANDARD
        .decode(b64)
        .map_err(|e| Error::External(format!("invalid data URI payload: {e}")))
}

/// Renders challenges as PNG and optionally mails each one.
pub struct PngQrPresenter {
    mailer: Option<QrMailer>,
}

impl PngQrPresenter {
    pub fn new(mailer: Option<QrMailer>) -> Self {
        Self { mailer }
    }
}

#[async_trait]
impl QrPresenter for PngQrPresenter {
    fn render(&self, payload: &str) -> Result<String> {
        render_png_data_url(payload)
    }

    async fn published(&self, data_url: &str) {
        if let Some(mailer) = &self.mailer {
            mailer.send_in_background(data_url);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_a_decodable_png() {
        let url = render_png_data_url("2@Q5m0bK,x9Lr+AbC=,eF1g==,1").unwrap();
        assert!(url.starts_with(PNG_DATA_URL_PREFIX));

        let png = decode_png_data_url(&url).unwrap();
        let img = image::load_from_memory_with_format(&png, ImageFormat::Png).unwrap();
        assert!(img.width() >= QR_MIN_PX);
        assert_eq!(img.width(), img.height());
    }

    #[test]
    fn empty_payloads_are_rejected() {
        assert!(render_png_data_url("  ").is_err());
        assert!(decode_png_data_url("data:image/jpeg;base64,AAAA").is_err());
    }
}
