use crate::error::{ApiError, INVALID_IMAGE};
use base64::{Engine, engine::general_purpose::STANDARD};
use image::DynamicImage;

/// Decode a base64 image, raw or as a `data:` URL.
///
/// Blank input is treated as no image at all.
pub fn decode_base64_image(encoded: &str) -> Result<Option<DynamicImage>, ApiError> {
    let payload = strip_data_url(encoded.trim());
    if payload.is_empty() {
        return Ok(None);
    }

    let bytes = STANDARD.decode(payload).map_err(|e| {
        tracing::debug!(error = %e, "Image payload is not valid base64");
        ApiError::BadRequest(INVALID_IMAGE.to_string())
    })?;

    let image = image::load_from_memory(&bytes).map_err(|e| {
        tracing::debug!(error = %e, bytes = bytes.len(), "Image payload could not be decoded");
        ApiError::BadRequest(INVALID_IMAGE.to_string())
    })?;

    Ok(Some(image))
}

fn strip_data_url(value: &str) -> &str {
    match value.strip_prefix("data:") {
        Some(rest) => rest.split_once(',').map_or("", |(_, data)| data.trim()),
        None => value,
    }
}
