//! Frame filter: decodes camera JPEGs, drops frames that arrive too fast or
//! barely differ from the previous one, and re-encodes the survivors for the
//! encoder, optionally stamped with a camera/time label.

use ab_glyph::{FontArc, PxScale};
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, GenericImageView, ImageFormat, Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use std::io::Cursor;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::{ImageCodec, RecorderConfig};
use crate::errors::{Result, RecorderError};
use crate::utils::hex_prefix;

/// Width of the label band in the top-left corner.
pub const LABEL_BAND_WIDTH: u32 = 600;
/// Height of the label band in the top-left corner.
pub const LABEL_BAND_HEIGHT: u32 = 12;

const MAX_SCORE: f64 = 100.0;
const LABEL_TEXT_SCALE: f32 = 11.0;

static BUILTIN_FONT: &[u8] = include_bytes!("../assets/DejaVuSansMono.ttf");

/// Label band clipped to the image size.
fn label_band(width: u32, height: u32) -> (u32, u32) {
    (LABEL_BAND_WIDTH.min(width), LABEL_BAND_HEIGHT.min(height))
}

/// Perceptual distance between two frames on a 0-100 scale.
///
/// Sums the absolute red, green and blue differences of every pixel outside
/// the label band and normalizes by the largest possible sum over the whole
/// frame. Frames without a reference, or with a different color model or
/// size, are as different as it gets.
pub fn diff_score(current: &DynamicImage, reference: Option<&DynamicImage>) -> f64 {
    let Some(reference) = reference else {
        return MAX_SCORE;
    };

    if current.color() != reference.color() {
        debug!("Different color models: {:?} vs {:?}", current.color(), reference.color());
        return MAX_SCORE;
    }

    if current.dimensions() != reference.dimensions() {
        debug!("Different image sizes: {:?} vs {:?}", current.dimensions(), reference.dimensions());
        return MAX_SCORE;
    }

    let (width, height) = current.dimensions();
    let pixel_count = width as u64 * height as u64;
    if pixel_count == 0 {
        return 0.0;
    }

    let (band_width, band_height) = label_band(width, height);
    let mut sum: u64 = 0;

    for (x, y, a) in current.pixels() {
        if x < band_width && y < band_height {
            continue;
        }
        let b = reference.get_pixel(x, y);
        for channel in 0..3 {
            sum += a[channel].abs_diff(b[channel]) as u64;
        }
    }

    MAX_SCORE * sum as f64 / (pixel_count as f64 * u8::MAX as f64 * 3.0)
}

/// Draws `"<camera>: <timestamp>"` on a white band in the top-left corner.
#[derive(Clone)]
pub struct Labeler {
    font: FontArc,
    scale: PxScale,
}

impl Labeler {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path).map_err(|e| {
            RecorderError::config(format!("Failed to read label font {}: {}", path.display(), e))
        })?;
        let font = FontArc::try_from_vec(data).map_err(|e| {
            RecorderError::config(format!("Invalid label font {}: {}", path.display(), e))
        })?;
        info!("Loaded label font from {}", path.display());
        Ok(Self::new(font))
    }

    /// DejaVu Sans Mono, bundled with the binary.
    pub fn builtin() -> Result<Self> {
        let font = FontArc::try_from_slice(BUILTIN_FONT)
            .map_err(|e| RecorderError::config(format!("Invalid built-in label font: {}", e)))?;
        Ok(Self::new(font))
    }

    /// The labeler the recorder config asks for, if any.
    pub fn from_config(config: &RecorderConfig) -> Result<Option<Self>> {
        if !config.label {
            return Ok(None);
        }
        match &config.label_font {
            Some(path) => Self::load(path).map(Some),
            None => Self::builtin().map(Some),
        }
    }

    pub fn new(font: FontArc) -> Self {
        Self {
            font,
            scale: PxScale::from(LABEL_TEXT_SCALE),
        }
    }

    pub fn draw(&self, canvas: &mut RgbImage, text: &str) {
        let (width, height) = label_band(canvas.width(), canvas.height());
        if width == 0 || height == 0 {
            return;
        }
        // Glyphs are clipped to the band so descenders never reach the compared area
        let mut band = RgbImage::new(width, height);
        paint_label_band(&mut band);
        draw_text_mut(&mut band, Rgb([0, 0, 0]), 2, 1, self.scale, &self.font, text);
        image::imageops::replace(canvas, &band, 0, 0);
    }
}

fn paint_label_band(canvas: &mut RgbImage) {
    let (width, height) = label_band(canvas.width(), canvas.height());
    if width == 0 || height == 0 {
        return;
    }
    draw_filled_rect_mut(canvas, Rect::at(0, 0).of_size(width, height), Rgb([255, 255, 255]));
}

/// Result of running one camera frame through the filter.
#[derive(Debug)]
pub enum FilterOutcome {
    /// Re-encoded frame ready for the encoder
    Accepted(Bytes),
    DecodeFailed,
    /// Arrived before one frame interval elapsed since the last accepted frame
    TooSoon,
    /// Scored below the similarity threshold against the previous frame
    Similar(f64),
    EncodeFailed,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FilterStats {
    pub accepted: u64,
    pub decode_failed: u64,
    pub too_soon: u64,
    pub similar: u64,
    pub encode_failed: u64,
}

pub struct FrameFilter {
    camera_id: String,
    codec: ImageCodec,
    jpeg_quality: u8,
    threshold: f64,
    min_interval: Duration,
    labeler: Option<Labeler>,
    last_accepted_at: Option<Instant>,
    last_image: Option<DynamicImage>,
    stats: FilterStats,
}

impl FrameFilter {
    pub fn new(camera_id: impl Into<String>, config: &RecorderConfig, labeler: Option<Labeler>) -> Self {
        Self {
            camera_id: camera_id.into(),
            codec: config.image_codec,
            jpeg_quality: config.jpeg_quality,
            threshold: config.similarity_threshold,
            min_interval: config.frame_interval(),
            labeler: if config.label { labeler } else { None },
            last_accepted_at: None,
            last_image: None,
            stats: FilterStats::default(),
        }
    }

    pub fn stats(&self) -> FilterStats {
        self.stats
    }

    pub fn process(&mut self, payload: &[u8], date: &str) -> FilterOutcome {
        self.process_at(payload, date, Instant::now())
    }

    pub fn process_at(&mut self, payload: &[u8], date: &str, now: Instant) -> FilterOutcome {
        let outcome = self.run_gates(payload, date, now);
        match &outcome {
            FilterOutcome::Accepted(_) => self.stats.accepted += 1,
            FilterOutcome::DecodeFailed => self.stats.decode_failed += 1,
            FilterOutcome::TooSoon => self.stats.too_soon += 1,
            FilterOutcome::Similar(_) => self.stats.similar += 1,
            FilterOutcome::EncodeFailed => self.stats.encode_failed += 1,
        }
        outcome
    }

    fn run_gates(&mut self, payload: &[u8], date: &str, now: Instant) -> FilterOutcome {
        let decoded = match image::load_from_memory_with_format(payload, ImageFormat::Jpeg) {
            Ok(img) => img,
            Err(e) => {
                warn!(
                    "Camera '{}': JPEG decode failed ({} bytes, header {}): {}",
                    self.camera_id,
                    payload.len(),
                    hex_prefix(payload, 2),
                    e
                );
                return FilterOutcome::DecodeFailed;
            }
        };

        if let Some(last) = self.last_accepted_at {
            if now < last + self.min_interval {
                debug!("Camera '{}': frame arrived too soon, dropping", self.camera_id);
                return FilterOutcome::TooSoon;
            }
        }

        // The reference always moves to the newest decoded frame, kept or not
        let score = diff_score(&decoded, self.last_image.as_ref());
        if score < self.threshold {
            self.last_image = Some(decoded);
            return FilterOutcome::Similar(score);
        }

        let encoded = self.render(&decoded, date);
        self.last_image = Some(decoded);

        match encoded {
            Ok(bytes) => {
                self.last_accepted_at = Some(now);
                debug!("Camera '{}': accepted frame (diff {:.3}, {} bytes)", self.camera_id, score, bytes.len());
                FilterOutcome::Accepted(bytes)
            }
            Err(e) => {
                error!("Camera '{}': failed to encode frame as {}: {}", self.camera_id, self.codec, e);
                FilterOutcome::EncodeFailed
            }
        }
    }

    fn render(&self, decoded: &DynamicImage, date: &str) -> Result<Bytes> {
        let mut canvas = decoded.to_rgb8();

        if let Some(labeler) = &self.labeler {
            labeler.draw(&mut canvas, &format!("{}: {}", self.camera_id, date));
        }

        let mut out = Vec::with_capacity(canvas.as_raw().len() / 4);
        match self.codec {
            ImageCodec::Png => canvas.write_to(&mut Cursor::new(&mut out), ImageFormat::Png)?,
            ImageCodec::Jpeg => {
                canvas.write_with_encoder(JpegEncoder::new_with_quality(&mut out, self.jpeg_quality))?
            }
        }

        Ok(Bytes::from(out))
    }
}
