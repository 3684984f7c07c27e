use {
    base64::{Engine, engine::general_purpose::STANDARD},
    qrcode::{QrCode, render::svg},
};

use crate::{Result, error::Context};

/// Render a pairing QR payload as an SVG data URL for direct use in `<img>`.
pub fn qr_data_url(payload: &str) -> Result<String> {
    let code = QrCode::new(payload.as_bytes()).context("failed to encode QR code")?;
    let image = code
        .render::<svg::Color<'_>>()
        .min_dimensions(256, 256)
        .quiet_zone(true)
        .build();
    Ok(format!("data:image/svg+xml;base64,{}", STANDARD.encode(image)))
}
