//! Blob decoding for the preprocessor and perceptual hash workers.
//!
//! The format is sniffed from content (object keys carry no extension) and
//! the header dimensions are checked against `limits.max_image_dimension`
//! before any pixels are decoded.

use image::{DynamicImage, ImageFormat, ImageReader};
use std::io::Cursor;
use std::time::Duration;
use uuid::Uuid;

use crate::config::LimitsConfig;
use crate::error::PipelineError;

#[derive(Debug, Clone)]
pub struct ImageDecoder {
    limits: LimitsConfig,
}

/// A decoded blob and the format it was stored in.
pub struct DecodedImage {
    pub image: DynamicImage,
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
}

impl ImageDecoder {
    pub fn new(limits: LimitsConfig) -> Self {
        Self { limits }
    }

    /// Decode `bytes` on the blocking pool, bounded by `limits.decode_timeout_ms`.
    pub async fn decode_from_bytes(
        &self,
        bytes: Vec<u8>,
        image_id: Uuid,
    ) -> Result<DecodedImage, PipelineError> {
        let max_dim = self.limits.max_image_dimension;
        let timeout_ms = self.limits.decode_timeout_ms;
        let task = tokio::task::spawn_blocking(move || decode_blob(&bytes, image_id, max_dim));

        match tokio::time::timeout(Duration::from_millis(timeout_ms), task).await {
            Ok(joined) => joined.map_err(|e| PipelineError::Decode {
                image_id,
                message: format!("Task join error: {}", e),
            })?,
            Err(_) => Err(PipelineError::Timeout {
                image_id,
                stage: "decode".to_string(),
                timeout_ms,
            }),
        }
    }
}

fn decode_blob(bytes: &[u8], image_id: Uuid, max_dim: u32) -> Result<DecodedImage, PipelineError> {
    let failed = |message: String| PipelineError::Decode { image_id, message };
    let sniff = || {
        ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|e| failed(format!("Cannot detect image format: {}", e)))
    };

    let format = sniff()?
        .format()
        .ok_or_else(|| failed("Unrecognized image format".to_string()))?;
    let (width, height) = sniff()?
        .into_dimensions()
        .map_err(|e| failed(e.to_string()))?;
    if width > max_dim || height > max_dim {
        return Err(PipelineError::ImageTooLarge {
            image_id,
            width,
            height,
            max_dim,
        });
    }

    let image = sniff()?.decode().map_err(|e| failed(e.to_string()))?;
    Ok(DecodedImage {
        image,
        format,
        width,
        height,
    })
}
