//! Thumbnail compression.
//!
//! Primary codec WebP with a JPEG fallback, both held to a hard size
//! ceiling. When neither codec fits, the smallest result is returned
//! flagged so the caller can discard it. An optional blur hook runs over
//! the image before any bytes are encoded.

use std::io::Cursor;
use std::sync::Arc;

use image::codecs::jpeg::JpegEncoder;
use image::codecs::webp::WebPEncoder;
use image::{ExtendedColorType, RgbImage};
use thiserror::Error;
use tracing::warn;

use crate::types::{FRAME_BYTES, FRAME_HEIGHT, FRAME_WIDTH};

pub const THUMBNAIL_WIDTH: u32 = 320;
pub const THUMBNAIL_HEIGHT: u32 = 240;

#[derive(Error, Debug)]
pub enum CompressError {
    #[error("image encode failed: {0}")]
    Encode(String),
}

/// Pre-encode transform, e.g. a face-region blur. What detects the
/// regions is up to the hook.
pub type BlurHook = Arc<dyn Fn(&mut RgbImage) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThumbnailCodec {
    WebP,
    Jpeg,
}

pub struct EncodedThumbnail {
    pub bytes: Vec<u8>,
    pub codec: ThumbnailCodec,
    /// True when even the smallest encoding exceeded the ceiling; such a
    /// thumbnail must not be persisted.
    pub over_ceiling: bool,
}

/// Converts a raw 640×480 BGR frame buffer into an RGB image.
pub fn frame_to_rgb(pixels: &[u8]) -> Option<RgbImage> {
    if pixels.len() != FRAME_BYTES {
        return None;
    }
    let mut rgb = Vec::with_capacity(FRAME_BYTES);
    for bgr in pixels.chunks_exact(3) {
        rgb.extend_from_slice(&[bgr[2], bgr[1], bgr[0]]);
    }
    RgbImage::from_raw(FRAME_WIDTH, FRAME_HEIGHT, rgb)
}

pub struct Compressor {
    max_bytes: usize,
    jpeg_quality: u8,
    blur: Option<BlurHook>,
}

impl Compressor {
    pub fn new(max_bytes: usize, jpeg_quality: u8) -> Self {
        Self {
            max_bytes,
            jpeg_quality,
            blur: None,
        }
    }

    pub fn with_blur_hook(mut self, hook: BlurHook) -> Self {
        self.blur = Some(hook);
        self
    }

    /// Resizes a frame image to thumbnail size and encodes it.
    pub fn encode_frame(&self, frame: &RgbImage) -> Result<EncodedThumbnail, CompressError> {
        let mut thumb = image::imageops::resize(
            frame,
            THUMBNAIL_WIDTH,
            THUMBNAIL_HEIGHT,
            image::imageops::FilterType::Triangle,
        );
        if let Some(hook) = &self.blur {
            hook(&mut thumb);
        }
        self.encode(&thumb)
    }

    /// Encodes an already-sized image: WebP first, JPEG on failure or
    /// size overrun, smallest-wins when both exceed the ceiling.
    pub fn encode(&self, img: &RgbImage) -> Result<EncodedThumbnail, CompressError> {
        let webp = match encode_webp(img) {
            Ok(bytes) if bytes.len() <= self.max_bytes => {
                return Ok(EncodedThumbnail {
                    bytes,
                    codec: ThumbnailCodec::WebP,
                    over_ceiling: false,
                });
            }
            other => other,
        };

        let jpeg = match encode_jpeg(img, self.jpeg_quality) {
            Ok(bytes) if bytes.len() <= self.max_bytes => {
                return Ok(EncodedThumbnail {
                    bytes,
                    codec: ThumbnailCodec::Jpeg,
                    over_ceiling: false,
                });
            }
            other => other,
        };

        // Neither codec fit. Hand back the smallest so the caller can log
        // and discard; both failing outright is a hard error.
        let best = match (webp, jpeg) {
            (Ok(w), Ok(j)) => {
                if w.len() <= j.len() {
                    (w, ThumbnailCodec::WebP)
                } else {
                    (j, ThumbnailCodec::Jpeg)
                }
            }
            (Ok(w), Err(_)) => (w, ThumbnailCodec::WebP),
            (Err(_), Ok(j)) => (j, ThumbnailCodec::Jpeg),
            (Err(we), Err(je)) => {
                return Err(CompressError::Encode(format!("webp: {we}; jpeg: {je}")))
            }
        };

        warn!(
            bytes = best.0.len(),
            ceiling = self.max_bytes,
            codec = ?best.1,
            "thumbnail exceeds size ceiling"
        );
        Ok(EncodedThumbnail {
            bytes: best.0,
            codec: best.1,
            over_ceiling: true,
        })
    }
}

fn encode_webp(img: &RgbImage) -> Result<Vec<u8>, String> {
    let mut out = Cursor::new(Vec::new());
    WebPEncoder::new_lossless(&mut out)
        .encode(
            img.as_raw(),
            img.width(),
            img.height(),
            ExtendedColorType::Rgb8,
        )
        .map_err(|e| e.to_string())?;
    Ok(out.into_inner())
}

fn encode_jpeg(img: &RgbImage, quality: u8) -> Result<Vec<u8>, String> {
    let mut out = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut out, quality)
        .encode(
            img.as_raw(),
            img.width(),
            img.height(),
            ExtendedColorType::Rgb8,
        )
        .map_err(|e| e.to_string())?;
    Ok(out.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(width: u32, height: u32, rgb: [u8; 3]) -> RgbImage {
        RgbImage::from_pixel(width, height, image::Rgb(rgb))
    }

    fn noise(width: u32, height: u32) -> RgbImage {
        // Deterministic pseudo-noise; incompressible for both codecs.
        let mut state = 0x2545F491u32;
        RgbImage::from_fn(width, height, |_, _| {
            state = state.wrapping_mul(1664525).wrapping_add(1013904223);
            let b = state.to_le_bytes();
            image::Rgb([b[0], b[1], b[2]])
        })
    }

    #[test]
    fn flat_image_fits_ceiling() {
        let compressor = Compressor::new(5120, 20);
        let out = compressor
            .encode(&solid(THUMBNAIL_WIDTH, THUMBNAIL_HEIGHT, [40, 90, 200]))
            .unwrap();
        assert!(!out.over_ceiling);
        assert!(out.bytes.len() <= 5120);
    }

    #[test]
    fn noise_image_returns_smallest_flagged() {
        let compressor = Compressor::new(5120, 20);
        let out = compressor
            .encode(&noise(THUMBNAIL_WIDTH, THUMBNAIL_HEIGHT))
            .unwrap();
        assert!(out.over_ceiling);
        assert!(!out.bytes.is_empty());
    }

    #[test]
    fn frame_to_rgb_swaps_channels() {
        let mut pixels = vec![0u8; FRAME_BYTES];
        // First pixel: pure blue in BGR.
        pixels[0] = 255;
        let rgb = frame_to_rgb(&pixels).unwrap();
        assert_eq!(rgb.get_pixel(0, 0).0, [0, 0, 255]);
    }

    #[test]
    fn frame_to_rgb_rejects_wrong_size() {
        assert!(frame_to_rgb(&[0u8; 100]).is_none());
    }

    #[test]
    fn blur_hook_runs_before_encoding() {
        let touched = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = Arc::clone(&touched);
        let compressor = Compressor::new(5120, 20).with_blur_hook(Arc::new(move |img| {
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
            *img = image::imageops::blur(img, 2.0);
        }));
        let frame = solid(FRAME_WIDTH, FRAME_HEIGHT, [10, 10, 10]);
        compressor.encode_frame(&frame).unwrap();
        assert!(touched.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn encode_frame_resizes_to_thumbnail() {
        let compressor = Compressor::new(1 << 20, 80);
        let frame = solid(FRAME_WIDTH, FRAME_HEIGHT, [128, 64, 32]);
        let out = compressor.encode_frame(&frame).unwrap();
        let decoded = image::load_from_memory(&out.bytes).unwrap();
        assert_eq!(decoded.width(), THUMBNAIL_WIDTH);
        assert_eq!(decoded.height(), THUMBNAIL_HEIGHT);
    }
}
