use futures_util::StreamExt;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
use tokio::time::{sleep, timeout};
use tokio_util::io::StreamReader as BodyReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::StreamConfig;
use crate::errors::{Result, RecorderError};
use crate::filter::{FilterOutcome, FilterStats, FrameFilter};
use crate::mjpeg::{MultipartParser, ParserState};
use crate::queue::FrameSender;

const STATS_EVERY_FRAMES: u64 = 500;

/// Pulls the camera's MJPEG stream, splits it into frames and pushes the
/// frames that survive the filter onto the encoder queue.
pub struct StreamReader {
    camera_id: String,
    url: String,
    client: reqwest::Client,
    backoff: Duration,
    read_timeout: Duration,
    max_attempts: Option<u32>,
    max_line_bytes: usize,
    parser: MultipartParser,
    filter: Option<FrameFilter>,
    queue: FrameSender,
    frames_seen: u64,
}

impl StreamReader {
    pub fn new(
        camera_id: String,
        url: String,
        config: &StreamConfig,
        filter: FrameFilter,
        queue: FrameSender,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .user_agent(concat!("mjpeg-recorder/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            parser: MultipartParser::new(camera_id.clone(), config.max_frame_bytes),
            camera_id,
            url,
            client,
            backoff: config.reconnect_backoff(),
            read_timeout: config.read_timeout(),
            max_attempts: None,
            // A body line never exceeds a whole frame plus its CRLF
            max_line_bytes: config.max_frame_bytes + 2,
            filter: Some(filter),
            queue,
            frames_seen: 0,
        })
    }

    /// Give up after `attempts` connections instead of retrying forever.
    #[cfg(test)]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let mut attempts = 0u32;

        loop {
            if let Some(max) = self.max_attempts {
                if attempts >= max {
                    warn!("Camera '{}': giving up after {} connection attempts", self.camera_id, attempts);
                    break;
                }
            }
            attempts += 1;

            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.connect_and_read() => result,
            };

            match result {
                Ok(()) => info!("Camera '{}': stream ended", self.camera_id),
                Err(e) => error!("Camera '{}': {}", self.camera_id, e),
            }

            // No partial frame survives a reconnect
            if self.parser.state() == ParserState::Body {
                debug!("Camera '{}': discarding partial frame", self.camera_id);
            }
            self.parser.reset();

            debug!("Camera '{}': reconnecting in {:?}", self.camera_id, self.backoff);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(self.backoff) => {}
            }
        }

        info!("Camera '{}': stream reader stopped", self.camera_id);
    }

    async fn connect_and_read(&mut self) -> Result<()> {
        info!("Camera '{}': connecting to {}", self.camera_id, self.url);

        let response = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?;

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown")
            .to_string();
        info!("Camera '{}': connected ({})", self.camera_id, content_type);

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)));
        let mut reader = BodyReader::new(body);

        self.read_frames(&mut reader).await
    }

    /// Feed every newline-terminated chunk of `reader` through the parser until EOF or an error.
    pub async fn read_frames<R: AsyncBufRead + Unpin>(&mut self, reader: &mut R) -> Result<()> {
        let mut line = Vec::with_capacity(64 * 1024);

        loop {
            line.clear();
            let read = timeout(
                self.read_timeout,
                (&mut *reader).take(self.max_line_bytes as u64).read_until(b'\n', &mut line),
            )
            .await
            .map_err(|_| RecorderError::stream(format!("no data received for {:?}", self.read_timeout)))??;

            if read == 0 {
                return Ok(());
            }
            if line.len() >= self.max_line_bytes && line.last() != Some(&b'\n') {
                return Err(RecorderError::stream(format!(
                    "line exceeds {} bytes without a newline",
                    self.max_line_bytes
                )));
            }

            let Some(frame) = self.parser.feed_line(&line) else {
                continue;
            };
            let payload = frame.payload.to_vec();
            let date = frame.date.to_string();

            match self.filter_frame(payload, date).await? {
                FilterOutcome::Accepted(encoded) => {
                    self.queue.offer(encoded);
                }
                FilterOutcome::Similar(score) => {
                    debug!("Camera '{}': frame too similar ({:.3}), dropping", self.camera_id, score);
                }
                _ => {}
            }

            self.frames_seen += 1;
            if self.frames_seen % STATS_EVERY_FRAMES == 0 {
                self.log_stats();
            }
        }
    }

    /// Decoding, diffing and re-encoding are CPU bound, so they run on the blocking pool.
    async fn filter_frame(&mut self, payload: Vec<u8>, date: String) -> Result<FilterOutcome> {
        let mut filter = self
            .filter
            .take()
            .ok_or_else(|| RecorderError::stream("frame filter was lost"))?;

        let (filter, outcome) = tokio::task::spawn_blocking(move || {
            let outcome = filter.process(&payload, &date);
            (filter, outcome)
        })
        .await
        .map_err(|e| RecorderError::stream(format!("frame filter task failed: {}", e)))?;

        self.filter = Some(filter);
        Ok(outcome)
    }

    fn filter_stats(&self) -> FilterStats {
        self.filter.as_ref().map(FrameFilter::stats).unwrap_or_default()
    }

    fn log_stats(&self) {
        let stats = self.filter_stats();
        info!(
            "Camera '{}': {} frames read, {} accepted, {} similar, {} too soon, {} undecodable, {} queue drops",
            self.camera_id,
            self.frames_seen,
            stats.accepted,
            stats.similar,
            stats.too_soon,
            stats.decode_failed,
            self.queue.dropped()
        );
    }
}
