//! Image token estimates from a fixed block grid
//!
//! Base64 data URLs are sniffed for their pixel dimensions. Remote URLs are
//! never fetched and cost a single block.

use std::io::Cursor;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use image::ImageReader;

/// Flat cost of any image
pub const BASE_TOKENS: u64 = 85;
/// Cost per block of the grid
pub const TOKENS_PER_BLOCK: u64 = 170;
/// Block edge in pixels
pub const BLOCK_SIZE: u32 = 512;

/// Estimated prompt tokens for one image part
pub fn image_tokens(url: &str, detail: Option<&str>) -> u64 {
    if detail == Some("low") {
        return BASE_TOKENS;
    }

    let blocks = data_url_dimensions(url).map_or(1, |(width, height)| {
        u64::from(width.div_ceil(BLOCK_SIZE)) * u64::from(height.div_ceil(BLOCK_SIZE))
    });

    BASE_TOKENS + blocks.max(1) * TOKENS_PER_BLOCK
}

/// Pixel size of a `data:image/...;base64,` URL
pub fn data_url_dimensions(url: &str) -> Option<(u32, u32)> {
    let rest = url.strip_prefix("data:")?;
    let (meta, payload) = rest.split_once(',')?;
    if !meta.ends_with(";base64") {
        return None;
    }
    let bytes = STANDARD.decode(payload.trim()).ok()?;
    dimensions(&bytes)
}

/// Pixel size read from the image header; the pixel data is never decoded
///
/// PNG, GIF, JPEG and WebP are recognised by their magic bytes.
pub fn dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    let reader = ImageReader::new(Cursor::new(bytes)).with_guessed_format().ok()?;
    match reader.into_dimensions() {
        Ok(size) => Some(size),
        Err(e) => {
            tracing::debug!(error = %e, "unreadable image header, charging one block");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use image::{DynamicImage, ImageFormat};

    use super::*;

    fn encoded(width: u32, height: u32, format: ImageFormat) -> Vec<u8> {
        let mut bytes = Vec::new();
        DynamicImage::new_rgb8(width, height)
            .write_to(&mut Cursor::new(&mut bytes), format)
            .unwrap();
        bytes
    }

    fn data_url(mime: &str, bytes: &[u8]) -> String {
        format!("data:{mime};base64,{}", STANDARD.encode(bytes))
    }

    #[test]
    fn png_blocks_round_up_on_both_axes() {
        // 1024x513 is a 2x2 grid
        let url = data_url("image/png", &encoded(1024, 513, ImageFormat::Png));
        assert_eq!(data_url_dimensions(&url), Some((1024, 513)));
        assert_eq!(image_tokens(&url, None), BASE_TOKENS + 4 * TOKENS_PER_BLOCK);
    }

    #[test]
    fn jpeg_size_comes_from_frame_header() {
        assert_eq!(dimensions(&encoded(800, 600, ImageFormat::Jpeg)), Some((800, 600)));
    }

    #[test]
    fn gif_and_webp_are_sized() {
        assert_eq!(dimensions(&encoded(300, 200, ImageFormat::Gif)), Some((300, 200)));
        assert_eq!(dimensions(&encoded(1024, 512, ImageFormat::WebP)), Some((1024, 512)));
    }

    #[test]
    fn truncated_header_is_unreadable() {
        let png = encoded(64, 64, ImageFormat::Png);
        assert_eq!(dimensions(&png[..12]), None);
        assert_eq!(dimensions(b"not an image"), None);
    }

    #[test]
    fn remote_and_unreadable_images_cost_one_block() {
        assert_eq!(image_tokens("https://example.com/cat.png", None), BASE_TOKENS + TOKENS_PER_BLOCK);
        assert_eq!(image_tokens("data:image/png;base64,!!!", None), BASE_TOKENS + TOKENS_PER_BLOCK);
    }

    #[test]
    fn low_detail_is_flat() {
        let url = data_url("image/png", &encoded(2048, 2048, ImageFormat::Png));
        assert_eq!(image_tokens(&url, Some("low")), BASE_TOKENS);
    }
}
