use async_trait::async_trait;
use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::SinkConfig;
use crate::errors::{Result, RecorderError};
use crate::utils::{file_component, move_file};

/// A closed, renamed segment ready to be archived.
#[derive(Debug, Clone)]
pub struct FinishedSegment {
    pub camera_id: String,
    pub path: PathBuf,
    pub started_at: DateTime<Local>,
    /// Relative archive location, `YYYY/MM/DD/<camera>`.
    pub destination: String,
}

impl FinishedSegment {
    pub fn new(camera_id: impl Into<String>, path: PathBuf, started_at: DateTime<Local>) -> Self {
        let camera_id = camera_id.into();
        let destination = format!("{}/{}", started_at.format("%Y/%m/%d"), file_component(&camera_id));
        Self {
            camera_id,
            path,
            started_at,
            destination,
        }
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Where finished segments end up after the encoder let go of them.
#[async_trait]
pub trait SegmentSink: Send + Sync {
    fn name(&self) -> &'static str;

    /// Verify the sink is usable before recording starts.
    async fn check(&self) -> Result<()> {
        Ok(())
    }

    async fn persist(&self, segment: &FinishedSegment) -> Result<()>;
}

/// Leaves segments in the output directory.
pub struct NullSink;

#[async_trait]
impl SegmentSink for NullSink {
    fn name(&self) -> &'static str {
        "none"
    }

    async fn persist(&self, segment: &FinishedSegment) -> Result<()> {
        debug!(
            "Camera '{}': keeping segment {} started at {}",
            segment.camera_id,
            segment.path.display(),
            segment.started_at.format("%Y-%m-%d %H:%M:%S")
        );
        Ok(())
    }
}

/// Moves segments into a dated directory tree under `root`.
pub struct LocalArchiveSink {
    root: PathBuf,
}

impl LocalArchiveSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn target_path(&self, segment: &FinishedSegment) -> PathBuf {
        self.root.join(&segment.destination).join(segment.file_name())
    }
}

#[async_trait]
impl SegmentSink for LocalArchiveSink {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn check(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await.map_err(|e| {
            RecorderError::sink(format!("cannot create archive root {}: {}", self.root.display(), e))
        })
    }

    async fn persist(&self, segment: &FinishedSegment) -> Result<()> {
        let target = self.target_path(segment);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        move_file(&segment.path, &target).await.map_err(|e| {
            RecorderError::sink(format!(
                "failed to archive {} to {}: {}",
                segment.path.display(),
                target.display(),
                e
            ))
        })?;

        info!("Camera '{}': archived segment to {}", segment.camera_id, target.display());
        Ok(())
    }
}

/// Uploads segments with `PUT {base_url}/YYYY/MM/DD/<camera>/<file>`.
pub struct HttpUploadSink {
    client: reqwest::Client,
    base_url: Url,
    token: Option<String>,
    delete_after_upload: bool,
}

impl HttpUploadSink {
    pub fn new(base_url: &str, token: Option<String>, delete_after_upload: bool) -> Result<Self> {
        let base_url = Url::parse(base_url)?;
        if base_url.cannot_be_a_base() {
            return Err(RecorderError::config(format!("sink base_url '{}' cannot take a path", base_url)));
        }

        let client = reqwest::Client::builder()
            .user_agent(concat!("mjpeg-recorder/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url,
            token,
            delete_after_upload,
        })
    }

    fn upload_url(&self, segment: &FinishedSegment) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| RecorderError::sink(format!("base_url '{}' cannot take a path", self.base_url)))?
            .pop_if_empty()
            .extend(segment.destination.split('/'))
            .push(&segment.file_name());
        Ok(url)
    }

    async fn upload(&self, url: Url, path: &Path) -> Result<()> {
        let file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));

        let mut request = self
            .client
            .put(url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .header(reqwest::header::CONTENT_LENGTH, size)
            .body(body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        request.send().await?.error_for_status()?;
        Ok(())
    }
}

#[async_trait]
impl SegmentSink for HttpUploadSink {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn check(&self) -> Result<()> {
        // Any HTTP answer means the server is reachable
        let response = self.client.head(self.base_url.clone()).send().await?;
        debug!("Upload target {} answered {}", self.base_url, response.status());
        Ok(())
    }

    async fn persist(&self, segment: &FinishedSegment) -> Result<()> {
        let url = self.upload_url(segment)?;
        info!("Camera '{}': uploading {} to {}", segment.camera_id, segment.path.display(), url);

        self.upload(url, &segment.path).await.map_err(|e| {
            RecorderError::sink(format!(
                "upload of {} failed, keeping local file: {}",
                segment.path.display(),
                e
            ))
        })?;

        if self.delete_after_upload {
            if let Err(e) = tokio::fs::remove_file(&segment.path).await {
                warn!("Camera '{}': uploaded but could not remove {}: {}", segment.camera_id, segment.path.display(), e);
            }
        }
        Ok(())
    }
}

pub fn build_sink(config: &SinkConfig) -> Result<Arc<dyn SegmentSink>> {
    let sink: Arc<dyn SegmentSink> = match config {
        SinkConfig::None => Arc::new(NullSink),
        SinkConfig::Local { root } => Arc::new(LocalArchiveSink::new(root.clone())),
        SinkConfig::Http {
            base_url,
            token,
            delete_after_upload,
        } => Arc::new(HttpUploadSink::new(base_url, token.clone(), *delete_after_upload)?),
    };
    Ok(sink)
}
