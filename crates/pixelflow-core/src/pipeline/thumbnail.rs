//! Thumbnail and analysis image generation.

use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat};
use std::io::Cursor;

/// Generates JPEG thumbnails from images.
#[derive(Debug, Clone, Copy)]
pub struct ThumbnailGenerator {
    quality: u8,
}

impl ThumbnailGenerator {
    /// Create a new thumbnail generator with the given JPEG quality.
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }

    /// Generate a thumbnail and return the encoded JPEG bytes.
    ///
    /// The size is passed per call because it can change at runtime.
    pub fn generate_bytes(&self, image: &DynamicImage, size: u32) -> Result<Vec<u8>, String> {
        // Resize maintaining aspect ratio (longest edge = size)
        let thumbnail = image.thumbnail(size, size);

        // JPEG has no alpha channel
        let rgb = DynamicImage::ImageRgb8(thumbnail.to_rgb8());
        let mut buffer = Cursor::new(Vec::new());
        let encoder = JpegEncoder::new_with_quality(&mut buffer, self.quality);
        rgb.write_with_encoder(encoder).map_err(|e| e.to_string())?;
        Ok(buffer.into_inner())
    }
}

/// Longest edge of an encoded image, read from its header.
pub fn longest_edge(bytes: &[u8]) -> Option<u32> {
    let (width, height) = image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .ok()?
        .into_dimensions()
        .ok()?;
    Some(width.max(height))
}

/// Grayscale PNG fitted inside `size`x`size`, input to the perceptual hashers.
pub fn analysis_png(image: &DynamicImage, size: u32) -> Result<Vec<u8>, String> {
    let gray = DynamicImage::ImageLuma8(image.thumbnail(size, size).to_luma8());
    let mut buffer = Cursor::new(Vec::new());
    gray.write_to(&mut buffer, ImageFormat::Png)
        .map_err(|e| e.to_string())?;
    Ok(buffer.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::GenericImageView;

    #[test]
    fn test_thumbnail_bytes() {
        let generator = ThumbnailGenerator::new(80);
        let img = DynamicImage::new_rgb8(1000, 500);
        let bytes = generator.generate_bytes(&img, 128).unwrap();

        // JPEG SOI marker
        assert_eq!(&bytes[0..2], &[0xFF, 0xD8]);
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!(decoded.dimensions(), (128, 64));
    }

    #[test]
    fn test_thumbnail_from_rgba_source() {
        let generator = ThumbnailGenerator::new(85);
        let img = DynamicImage::new_rgba8(300, 300);
        assert!(generator.generate_bytes(&img, 64).is_ok());
    }

    #[test]
    fn test_longest_edge() {
        let bytes = ThumbnailGenerator::new(80)
            .generate_bytes(&DynamicImage::new_rgb8(200, 400), 100)
            .unwrap();
        assert_eq!(longest_edge(&bytes), Some(100));
        assert_eq!(longest_edge(b"junk"), None);
    }

    #[test]
    fn test_analysis_png_is_grayscale() {
        let img = DynamicImage::new_rgb8(600, 300);
        let bytes = analysis_png(&img, 256).unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!(decoded.dimensions(), (256, 128));
        assert_eq!(decoded.color(), image::ColorType::L8);
    }
}
