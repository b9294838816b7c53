//! Result delivery: turn a result image into a downloadable artifact.

use crate::types::{FetchError, Garment, ImageData, ResultImage};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Cursor;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("result image unavailable: {0}")]
    Fetch(#[from] FetchError),
    #[error("image codec error: {0}")]
    Codec(#[from] image::ImageError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PreferenceError {
    #[error("unknown output format: {0} (expected jpg or png)")]
    Format(String),
    #[error("unknown quality: {0} (expected balanced, high or ultra)")]
    Quality(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Jpg,
    Png,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Jpg => "jpg",
            OutputFormat::Png => "png",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            OutputFormat::Jpg => "image/jpeg",
            OutputFormat::Png => "image/png",
        }
    }

    fn image_format(self) -> ImageFormat {
        match self {
            OutputFormat::Jpg => ImageFormat::Jpeg,
            OutputFormat::Png => ImageFormat::Png,
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for OutputFormat {
    type Err = PreferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Ok(OutputFormat::Jpg),
            "png" => Ok(OutputFormat::Png),
            other => Err(PreferenceError::Format(other.to_string())),
        }
    }
}

/// Encoder quality tier. Only affects JPEG output: a JPEG result is
/// re-encoded at `Balanced` or `High` and kept as-is at `Ultra`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Balanced,
    #[default]
    High,
    Ultra,
}

impl Quality {
    pub fn as_str(self) -> &'static str {
        match self {
            Quality::Balanced => "balanced",
            Quality::High => "high",
            Quality::Ultra => "ultra",
        }
    }

    pub fn jpeg_quality(self) -> u8 {
        match self {
            Quality::Balanced => 80,
            Quality::High => 90,
            Quality::Ultra => 100,
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Quality {
    type Err = PreferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "balanced" => Ok(Quality::Balanced),
            "high" => Ok(Quality::High),
            "ultra" => Ok(Quality::Ultra),
            other => Err(PreferenceError::Quality(other.to_string())),
        }
    }
}

/// User download preferences. Defaults to high-quality JPEG.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputPreferences {
    #[serde(default)]
    pub format: OutputFormat,
    #[serde(default)]
    pub quality: Quality,
}

/// A file ready to hand to the user.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub filename: String,
    pub mime_type: &'static str,
    pub bytes: Bytes,
}

/// `{app_id}_{garment|restored}_{YYYY-MM-DDTHH-MM-SS}.{ext}`
pub fn export_filename(
    app_id: &str,
    garment: Option<Garment>,
    timestamp: DateTime<Utc>,
    format: OutputFormat,
) -> String {
    let label = garment.map_or("restored", Garment::as_str);
    format!(
        "{app_id}_{label}_{}.{}",
        timestamp.format("%Y-%m-%dT%H-%M-%S"),
        format.extension()
    )
}

/// Resolve `result` to bytes, fetching remote images once, and encode them
/// per `prefs`.
pub async fn export(
    client: &reqwest::Client,
    result: &ResultImage,
    garment: Option<Garment>,
    prefs: OutputPreferences,
    app_id: &str,
    timestamp: DateTime<Utc>,
) -> Result<Artifact, DeliveryError> {
    let image = match result {
        ResultImage::Inline(image) => image.clone(),
        ResultImage::Remote(url) => ImageData::fetch(client, url).await?,
    };
    let bytes = encode(&image, prefs)?;
    let filename = export_filename(app_id, garment, timestamp, prefs.format);
    tracing::info!(%filename, bytes = bytes.len(), quality = %prefs.quality, "result exported");

    Ok(Artifact {
        filename,
        mime_type: prefs.format.mime_type(),
        bytes,
    })
}

/// Encode `image` per `prefs`.
///
/// PNG sources pass through for PNG output. JPEG sources pass through for
/// `Ultra` JPEG output and are re-encoded at the lower tiers, so the
/// requested size/quality trade-off always applies.
pub fn encode(image: &ImageData, prefs: OutputPreferences) -> Result<Bytes, DeliveryError> {
    if passes_through(image.format(), prefs) {
        return Ok(image.bytes().clone());
    }

    let decoded = image::load_from_memory(image.bytes())?;
    let mut out = Vec::new();
    match prefs.format {
        OutputFormat::Jpg => {
            let rgb = flatten_alpha(&decoded);
            JpegEncoder::new_with_quality(&mut out, prefs.quality.jpeg_quality()).encode_image(&rgb)?;
        }
        OutputFormat::Png => {
            decoded.write_to(&mut Cursor::new(&mut out), ImageFormat::Png)?;
        }
    }
    Ok(Bytes::from(out))
}

fn passes_through(source: ImageFormat, prefs: OutputPreferences) -> bool {
    match (source, prefs.format) {
        (ImageFormat::Png, OutputFormat::Png) => true,
        (ImageFormat::Jpeg, OutputFormat::Jpg) => prefs.quality == Quality::Ultra,
        _ => false,
    }
}

/// Composite onto white; JPEG has no alpha channel.
fn flatten_alpha(image: &DynamicImage) -> RgbImage {
    if !image.color().has_alpha() {
        return image.to_rgb8();
    }
    let rgba = image.to_rgba8();
    RgbImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        let [r, g, b, a] = rgba.get_pixel(x, y).0;
        let blend = |c: u8| ((c as u16 * a as u16 + 255 * (255 - a as u16)) / 255) as u8;
        Rgb([blend(r), blend(g), blend(b)])
    })
}
