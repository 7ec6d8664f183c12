use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::{Result, RecorderError};
use crate::utils::{file_component, parse_rotation, OUTPUT_PLACEHOLDER};

/// Image codec used when handing frames to the encoder.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "String", into = "String")]
pub enum ImageCodec {
    Png,
    Jpeg,
}

impl Default for ImageCodec {
    fn default() -> Self {
        Self::Png
    }
}

impl TryFrom<String> for ImageCodec {
    type Error = RecorderError;

    fn try_from(value: String) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "" | "png" => Ok(Self::Png),
            "jpeg" | "jpg" => Ok(Self::Jpeg),
            other => Err(RecorderError::config(format!(
                "Invalid image codec '{}'. Use 'png' or 'jpeg'",
                other
            ))),
        }
    }
}

impl From<ImageCodec> for String {
    fn from(codec: ImageCodec) -> Self {
        codec.to_string()
    }
}

impl std::fmt::Display for ImageCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImageCodec::Png => write!(f, "png"),
            ImageCodec::Jpeg => write!(f, "jpeg"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub debug: bool,
    pub recorder: RecorderConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub sink: SinkConfig,
    #[serde(default, rename = "camera")]
    pub cameras: Vec<CameraConfig>,

    /// Parsed from `recorder.split_video_in` at load time.
    #[serde(skip)]
    rotation: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    pub name: String,
    pub url: String,
    #[serde(default = "default_true")]
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecorderConfig {
    pub encoder_command: String,        // e.g. "ffmpeg -f image2pipe -i - -y {output}"
    #[serde(default = "default_true")]
    pub nice: bool,                     // Run the encoder through `nice`
    #[serde(default)]
    pub image_codec: ImageCodec,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    #[serde(default)]
    pub label: bool,
    pub label_font: Option<PathBuf>,    // TTF/OTF font, the bundled DejaVu Sans Mono when unset
    #[serde(default = "default_split_video_in")]
    pub split_video_in: String,         // Segment length, e.g. "10m" (minimum 30s)
    #[serde(default = "default_frame_rate")]
    pub frame_rate: f64,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,      // 0-100, frames scoring below are dropped
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
    pub output_dir: PathBuf,
    #[serde(default = "default_segment_extension")]
    pub segment_extension: String,
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
            connect_timeout_secs: default_connect_timeout_secs(),
            read_timeout_secs: default_read_timeout_secs(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SinkConfig {
    /// Leave finished segments in the output directory.
    None,
    /// Move finished segments under `root/<YYYY>/<MM>/<DD>/<camera>/`.
    Local { root: PathBuf },
    /// Upload finished segments with `PUT {base_url}/<YYYY>/<MM>/<DD>/<camera>/<file>`.
    Http {
        base_url: String,
        token: Option<String>,
        #[serde(default = "default_true")]
        delete_after_upload: bool,
    },
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self::None
    }
}

fn default_true() -> bool { true }
fn default_jpeg_quality() -> u8 { 75 }
fn default_split_video_in() -> String { "10m".to_string() }
fn default_frame_rate() -> f64 { 15.0 }
fn default_similarity_threshold() -> f64 { 1.05 }
fn default_queue_capacity() -> usize { 200 }
fn default_temp_dir() -> PathBuf { std::env::temp_dir() }
fn default_segment_extension() -> String { "avi".to_string() }
fn default_stop_timeout_secs() -> u64 { 10 }
fn default_reconnect_backoff_ms() -> u64 { 1000 }
fn default_connect_timeout_secs() -> u64 { 10 }
fn default_read_timeout_secs() -> u64 { 30 }
fn default_max_frame_bytes() -> usize { 10 * 1024 * 1024 } // 10MB

impl RecorderConfig {
    /// Time between two accepted frames at the target frame rate.
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.frame_rate)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

impl StreamConfig {
    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            RecorderError::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let is_json = path.extension().and_then(|s| s.to_str()) == Some("json");
        Self::parse(&content, is_json)
    }

    pub fn parse(content: &str, is_json: bool) -> Result<Self> {
        let mut config: Config = if is_json {
            serde_json::from_str(content)?
        } else {
            toml::from_str(content)?
        };

        config.rotation = parse_rotation(&config.recorder.split_video_in)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let recorder = &self.recorder;

        if !recorder.encoder_command.contains(OUTPUT_PLACEHOLDER) {
            return Err(RecorderError::config(format!(
                "encoder_command must contain the {} placeholder",
                OUTPUT_PLACEHOLDER
            )));
        }

        if !(recorder.frame_rate.is_finite() && recorder.frame_rate > 0.0) {
            return Err(RecorderError::config("frame_rate must be a positive number"));
        }

        if !(0.0..=100.0).contains(&recorder.similarity_threshold) {
            return Err(RecorderError::config("similarity_threshold must be between 0 and 100"));
        }

        if recorder.queue_capacity == 0 {
            return Err(RecorderError::config("queue_capacity must be at least 1"));
        }

        let mut names = HashSet::new();
        for camera in &self.cameras {
            if camera.name.trim().is_empty() {
                return Err(RecorderError::config("Camera name must not be empty"));
            }
            // Names that map to the same file name would share one temp file
            if !names.insert(file_component(&camera.name)) {
                return Err(RecorderError::config(format!(
                    "Camera name '{}' clashes with another camera's file name",
                    camera.name
                )));
            }
            let url = url::Url::parse(&camera.url)?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(RecorderError::config(format!(
                    "Camera '{}' has unsupported URL scheme '{}'",
                    camera.name,
                    url.scheme()
                )));
            }
        }

        if let SinkConfig::Http { base_url, .. } = &self.sink {
            url::Url::parse(base_url)?;
        }

        Ok(())
    }

    /// Segment length after applying the 30 second floor.
    pub fn rotation_interval(&self) -> Duration {
        self.rotation
    }

    pub fn active_cameras(&self) -> impl Iterator<Item = &CameraConfig> {
        self.cameras.iter().filter(|c| c.active)
    }
}
