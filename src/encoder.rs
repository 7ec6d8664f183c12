use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio::time::{interval, timeout, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RecorderConfig;
use crate::errors::{Result, RecorderError};
use crate::queue::FrameReceiver;
use crate::sink::{FinishedSegment, SegmentSink};
use crate::utils::{file_component, move_file, render_command};

/// Request to end the current segment, shared by the rotation timer and external callers.
///
/// Only one request can be pending. The encoder acknowledges it once the next
/// session is running, so requests that arrive while a segment is being
/// closed collapse into the one already in flight.
#[derive(Clone)]
pub struct StopSignal {
    inner: Arc<StopInner>,
}

struct StopInner {
    camera_id: String,
    pending: AtomicBool,
    notify: Notify,
}

impl StopSignal {
    pub fn new(camera_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(StopInner {
                camera_id: camera_id.into(),
                pending: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Returns false when a stop is already pending and this request was dropped.
    pub fn request(&self, reason: &str) -> bool {
        if self
            .inner
            .pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Camera '{}': stop already pending, ignoring {} request", self.inner.camera_id, reason);
            return false;
        }

        info!("Camera '{}': stop requested ({})", self.inner.camera_id, reason);
        self.inner.notify.notify_one();
        true
    }

    pub fn is_pending(&self) -> bool {
        self.inner.pending.load(Ordering::Acquire)
    }

    async fn requested(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_pending() {
                return;
            }
            notified.await;
        }
    }

    pub(crate) fn acknowledge(&self) {
        self.inner.pending.store(false, Ordering::Release);
    }
}

/// One running encoder subprocess and the file it writes.
pub struct EncoderSession {
    camera_id: String,
    child: Child,
    stdin: Option<ChildStdin>,
    started_at: DateTime<Local>,
    frames_written: u64,
}

/// What is left of a session once its process has exited.
#[derive(Debug)]
pub struct StoppedSession {
    pub started_at: DateTime<Local>,
    pub frames_written: u64,
    pub status: Option<ExitStatus>,
}

impl EncoderSession {
    pub fn start(camera_id: &str, config: &RecorderConfig, output: &Path) -> Result<Self> {
        let args = render_command(&config.encoder_command, output)?;

        let mut command = if config.nice {
            let mut command = Command::new("nice");
            command.args(&args);
            command
        } else {
            let mut command = Command::new(&args[0]);
            command.args(&args[1..]);
            command
        };
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        info!("Camera '{}': starting encoder: {}", camera_id, args.join(" "));
        let mut child = command.spawn().map_err(|e| {
            RecorderError::encoder(format!("failed to start '{}': {}", args[0], e))
        })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RecorderError::encoder("encoder stdin was not captured"))?;

        Ok(Self {
            camera_id: camera_id.to_string(),
            child,
            stdin: Some(stdin),
            started_at: Local::now(),
            frames_written: 0,
        })
    }

    pub async fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| RecorderError::encoder("encoder input already closed"))?;
        stdin.write_all(frame).await?;
        self.frames_written += 1;
        Ok(())
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    /// Interrupt the encoder, close its input and wait for it to exit.
    /// The process is killed if it is still running after `grace`.
    pub async fn stop(mut self, grace: Duration) -> StoppedSession {
        self.interrupt();
        drop(self.stdin.take());

        let status = match timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                error!("Camera '{}': failed to wait for encoder: {}", self.camera_id, e);
                None
            }
            Err(_) => {
                warn!("Camera '{}': encoder still running after {:?}, killing it", self.camera_id, grace);
                if let Err(e) = self.child.kill().await {
                    error!("Camera '{}': failed to kill encoder: {}", self.camera_id, e);
                }
                self.child.try_wait().ok().flatten()
            }
        };

        StoppedSession {
            started_at: self.started_at,
            frames_written: self.frames_written,
            status,
        }
    }

    #[cfg(unix)]
    fn interrupt(&self) {
        let Some(pid) = self.child.id() else {
            return;
        };
        // SAFETY: pid belongs to our own child which has not been reaped yet
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGINT) };
        if rc != 0 {
            debug!(
                "Camera '{}': SIGINT to encoder failed: {}",
                self.camera_id,
                std::io::Error::last_os_error()
            );
        }
    }

    #[cfg(not(unix))]
    fn interrupt(&self) {
        // Closing stdin is the only stop signal available here
    }
}

enum SessionEnd {
    StopRequested,
    EncoderFailed,
    Shutdown,
}

/// Owns the encoder subprocess of one camera and rotates it into segment files.
pub struct SessionManager {
    camera_id: String,
    config: RecorderConfig,
    frames: FrameReceiver,
    stop: StopSignal,
    sink: Arc<dyn SegmentSink>,
    temp_path: PathBuf,
    hand_offs: JoinSet<()>,
}

impl SessionManager {
    pub fn new(
        camera_id: impl Into<String>,
        config: &RecorderConfig,
        frames: FrameReceiver,
        stop: StopSignal,
        sink: Arc<dyn SegmentSink>,
    ) -> Self {
        let camera_id = camera_id.into();
        let temp_path = config.temp_dir.join(format!(
            "{}-recording.{}",
            file_component(&camera_id),
            config.segment_extension
        ));

        Self {
            camera_id,
            config: config.clone(),
            frames,
            stop,
            sink,
            temp_path,
            hand_offs: JoinSet::new(),
        }
    }

    #[cfg(test)]
    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        for dir in [&self.config.temp_dir, &self.config.output_dir] {
            if let Err(e) = tokio::fs::create_dir_all(dir).await {
                error!("Camera '{}': cannot create {}: {}", self.camera_id, dir.display(), e);
            }
        }
        self.recover_stale_segment().await;

        let mut tick = frame_ticker(self.config.frame_interval());
        let mut session = self.start_session();

        loop {
            let end = self.run_session(&mut session, &mut tick, &cancel).await;

            match end {
                SessionEnd::StopRequested => {}
                SessionEnd::EncoderFailed => warn!("Camera '{}': restarting encoder after failure", self.camera_id),
                SessionEnd::Shutdown => info!("Camera '{}': shutting down encoder", self.camera_id),
            }

            if let Some(running) = session.take() {
                self.finish_session(running).await;
            }
            self.discard_queued_frames();

            if matches!(end, SessionEnd::Shutdown) {
                break;
            }

            session = self.start_session();
            if matches!(end, SessionEnd::StopRequested) {
                self.stop.acknowledge();
            }
            while self.hand_offs.try_join_next().is_some() {}
        }

        while self.hand_offs.join_next().await.is_some() {}
        info!("Camera '{}': encoder stopped", self.camera_id);
    }

    fn start_session(&self) -> Option<EncoderSession> {
        match EncoderSession::start(&self.camera_id, &self.config, &self.temp_path) {
            Ok(session) => Some(session),
            Err(e) => {
                error!("Camera '{}': {}; frames are dropped until the next rotation", self.camera_id, e);
                None
            }
        }
    }

    async fn run_session(
        &mut self,
        session: &mut Option<EncoderSession>,
        tick: &mut Interval,
        cancel: &CancellationToken,
    ) -> SessionEnd {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return SessionEnd::Shutdown,
                _ = self.stop.requested() => return SessionEnd::StopRequested,
                _ = tick.tick() => {
                    let frame = match self.frames.try_recv() {
                        Ok(frame) => frame,
                        Err(TryRecvError::Empty) => continue,
                        Err(TryRecvError::Disconnected) => {
                            info!("Camera '{}': frame source closed", self.camera_id);
                            return SessionEnd::Shutdown;
                        }
                    };

                    let Some(running) = session.as_mut() else {
                        continue;
                    };
                    // An encoder that stops reading must not hold up stop or shutdown
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            warn!("Camera '{}': encoder not accepting input, abandoning frame", self.camera_id);
                            return SessionEnd::Shutdown;
                        }
                        _ = self.stop.requested() => {
                            warn!("Camera '{}': encoder not accepting input, abandoning frame", self.camera_id);
                            return SessionEnd::StopRequested;
                        }
                        result = running.write_frame(&frame) => {
                            if let Err(e) = result {
                                error!("Camera '{}': writing frame to encoder failed: {}", self.camera_id, e);
                                return SessionEnd::EncoderFailed;
                            }
                        }
                    }
                }
            }
        }
    }

    async fn finish_session(&mut self, session: EncoderSession) {
        info!(
            "Camera '{}': stopping encoder after {} frames",
            self.camera_id,
            session.frames_written()
        );
        let stopped = session.stop(self.config.stop_timeout()).await;
        match stopped.status {
            Some(status) => info!(
                "Camera '{}': segment closed, {} frames, encoder {}",
                self.camera_id, stopped.frames_written, status
            ),
            None => warn!(
                "Camera '{}': segment closed, {} frames, encoder exit status unknown",
                self.camera_id, stopped.frames_written
            ),
        }
        self.hand_off(stopped.started_at).await;
    }

    /// Rename the temp file to its final name and pass it to the sink in the background.
    async fn hand_off(&mut self, started_at: DateTime<Local>) {
        if tokio::fs::metadata(&self.temp_path).await.is_err() {
            warn!("Camera '{}': encoder produced no output at {}", self.camera_id, self.temp_path.display());
            return;
        }

        let final_path = self.final_path(started_at).await;
        if let Err(e) = move_file(&self.temp_path, &final_path).await {
            error!(
                "Camera '{}': failed to move {} to {}: {}",
                self.camera_id,
                self.temp_path.display(),
                final_path.display(),
                e
            );
            return;
        }
        info!("Camera '{}': segment saved as {}", self.camera_id, final_path.display());

        let segment = FinishedSegment::new(self.camera_id.clone(), final_path, started_at);
        let sink = self.sink.clone();
        self.hand_offs.spawn(async move {
            if let Err(e) = sink.persist(&segment).await {
                error!("Camera '{}': {} sink failed: {}", segment.camera_id, sink.name(), e);
            }
        });
    }

    async fn final_path(&self, started_at: DateTime<Local>) -> PathBuf {
        let stem = format!(
            "{}-{}",
            file_component(&self.camera_id),
            started_at.format("%Y-%m-%d_%H-%M-%S")
        );
        let ext = &self.config.segment_extension;

        let mut candidate = self.config.output_dir.join(format!("{}.{}", stem, ext));
        let mut n = 1;
        while tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
            candidate = self.config.output_dir.join(format!("{}-{}.{}", stem, n, ext));
            n += 1;
        }
        candidate
    }

    /// A temp file left by a previous run is a segment the sink never saw.
    async fn recover_stale_segment(&mut self) {
        let Ok(metadata) = tokio::fs::metadata(&self.temp_path).await else {
            return;
        };
        let started_at = metadata
            .modified()
            .map(DateTime::<Local>::from)
            .unwrap_or_else(|_| Local::now());

        warn!("Camera '{}': recovering leftover segment {}", self.camera_id, self.temp_path.display());
        self.hand_off(started_at).await;
    }

    fn discard_queued_frames(&mut self) {
        let mut discarded = 0;
        while self.frames.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            debug!("Camera '{}': discarded {} queued frames", self.camera_id, discarded);
        }
    }
}

/// Paces frame writes. Ticks missed during a slow write or stop are not replayed.
fn frame_ticker(period: Duration) -> Interval {
    let mut tick = interval(period.max(Duration::from_micros(100)));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tick
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::filter::tests::recorder_config;
    use crate::queue::{frame_queue, FrameSender};
    use async_trait::async_trait;
    use bytes::Bytes;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    struct ChannelSink {
        tx: mpsc::UnboundedSender<FinishedSegment>,
    }

    #[async_trait]
    impl SegmentSink for ChannelSink {
        fn name(&self) -> &'static str {
            "channel"
        }

        async fn persist(&self, segment: &FinishedSegment) -> Result<()> {
            let _ = self.tx.send(segment.clone());
            Ok(())
        }
    }

    /// An encoder that ignores SIGINT and copies stdin to the output until it closes.
    fn cat_encoder(dir: &TempDir) -> PathBuf {
        let script = dir.path().join("encoder.sh");
        std::fs::write(&script, "trap '' INT\nexec cat > \"$1\"\n").unwrap();
        script
    }

    fn config(dir: &TempDir, command: &str) -> RecorderConfig {
        let mut config = recorder_config("frame_rate = 1000.0\nnice = false");
        config.encoder_command = command.to_string();
        config.temp_dir = dir.path().join("tmp");
        config.output_dir = dir.path().join("out");
        config.stop_timeout_secs = 5;
        config
    }

    struct Harness {
        queue: FrameSender,
        stop: StopSignal,
        segments: mpsc::UnboundedReceiver<FinishedSegment>,
        cancel: CancellationToken,
        temp_path: PathBuf,
        handle: tokio::task::JoinHandle<()>,
    }

    fn spawn_manager(config: &RecorderConfig) -> Harness {
        let (queue, rx) = frame_queue("cam", 16);
        let stop = StopSignal::new("cam");
        let (tx, segments) = mpsc::unbounded_channel();
        let manager = SessionManager::new("cam", config, rx, stop.clone(), Arc::new(ChannelSink { tx }));
        let temp_path = manager.temp_path().to_path_buf();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(manager.run(cancel.clone()));

        Harness {
            queue,
            stop,
            segments,
            cancel,
            temp_path,
            handle,
        }
    }

    async fn wait_for_content(path: &Path, expected: &[u8]) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if let Ok(content) = tokio::fs::read(path).await {
                if content == expected {
                    return;
                }
            }
            assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", path.display());
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn next_segment(segments: &mut mpsc::UnboundedReceiver<FinishedSegment>) -> FinishedSegment {
        tokio::time::timeout(Duration::from_secs(10), segments.recv())
            .await
            .expect("segment was not handed off")
            .expect("sink channel closed")
    }

    #[tokio::test(start_paused = true)]
    async fn test_frame_ticker_does_not_burst_after_stall() {
        let period = Duration::from_millis(100);
        let mut tick = frame_ticker(period);
        tick.tick().await;

        // A write or stop that takes ten periods
        tokio::time::sleep(period * 10).await;
        tick.tick().await;

        let before = tokio::time::Instant::now();
        tick.tick().await;
        assert_eq!(before.elapsed(), period);
    }

    #[tokio::test]
    async fn test_stop_signal_collapses_duplicates() {
        let stop = StopSignal::new("cam");
        assert!(!stop.is_pending());
        assert!(stop.request("rotation"));
        assert!(!stop.request("external"));
        assert!(stop.is_pending());

        tokio::time::timeout(Duration::from_secs(1), stop.requested())
            .await
            .expect("pending request is observed");

        stop.acknowledge();
        assert!(!stop.is_pending());
        assert!(stop.request("rotation"));
    }

    #[tokio::test]
    async fn test_rotation_renames_segment_and_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let script = cat_encoder(&dir);
        let config = config(&dir, &format!("sh {} {{output}}", script.display()));
        let mut h = spawn_manager(&config);

        assert!(h.queue.offer(Bytes::from_static(b"first")));
        wait_for_content(&h.temp_path, b"first").await;

        assert!(h.stop.request("rotation"));
        assert!(!h.stop.request("rotation"));

        let first = next_segment(&mut h.segments).await;
        assert_eq!(std::fs::read(&first.path).unwrap(), b"first");
        assert!(first.path.starts_with(&config.output_dir));
        let name = first.file_name();
        assert!(name.starts_with("cam-") && name.ends_with(".avi"), "{}", name);

        // The next session writes a fresh temp file
        assert!(h.queue.offer(Bytes::from_static(b"second")));
        wait_for_content(&h.temp_path, b"second").await;
        assert!(!h.stop.is_pending());

        h.cancel.cancel();
        let second = next_segment(&mut h.segments).await;
        assert_eq!(std::fs::read(&second.path).unwrap(), b"second");
        assert_ne!(first.path, second.path);

        tokio::time::timeout(Duration::from_secs(10), h.handle).await.unwrap().unwrap();
        assert!(!h.temp_path.exists());
    }

    #[tokio::test]
    async fn test_encoder_killed_after_grace_period() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("stubborn.sh");
        std::fs::write(&script, "trap '' INT\n: > \"$1\"\nexec sleep 30\n").unwrap();

        let mut config = config(&dir, &format!("sh {} {{output}}", script.display()));
        config.stop_timeout_secs = 1;
        std::fs::create_dir_all(&config.temp_dir).unwrap();

        let output = config.temp_dir.join("out.avi");
        let session = EncoderSession::start("cam", &config, &output).unwrap();
        let started = std::time::Instant::now();
        let stopped = session.stop(config.stop_timeout()).await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(stopped.frames_written, 0);
        assert!(!stopped.status.map(|s| s.success()).unwrap_or(false));
    }

    #[tokio::test]
    async fn test_stalled_encoder_does_not_block_stop_or_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        // Alive but never reads stdin, so writes block once the pipe is full
        let script = dir.path().join("stalled.sh");
        std::fs::write(&script, "trap '' INT\n: > \"$1\"\nexec sleep 1000\n").unwrap();
        let mut config = config(&dir, &format!("sh {} {{output}}", script.display()));
        config.stop_timeout_secs = 1;
        let mut h = spawn_manager(&config);

        assert!(h.queue.offer(Bytes::from(vec![0u8; 1 << 20])));
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(h.stop.request("rotation"));
        let segment = next_segment(&mut h.segments).await;
        assert!(segment.path.starts_with(&config.output_dir));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while h.stop.is_pending() {
            assert!(tokio::time::Instant::now() < deadline, "next session never started");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // Same again, this time interrupted by shutdown
        assert!(h.queue.offer(Bytes::from(vec![0u8; 1 << 20])));
        tokio::time::sleep(Duration::from_millis(200)).await;
        h.cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), h.handle)
            .await
            .expect("manager should exit while a write is blocked")
            .unwrap();
    }

    #[tokio::test]
    async fn test_failed_spawn_keeps_manager_alive() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir, "/nonexistent/encoder-binary {output}");
        let mut h = spawn_manager(&config);

        // Frames are dropped while no encoder runs
        assert!(h.queue.offer(Bytes::from_static(b"lost")));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(h.stop.request("rotation"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!h.stop.is_pending());

        h.cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), h.handle).await.unwrap().unwrap();
        assert!(h.segments.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dead_encoder_is_restarted() {
        let dir = tempfile::tempdir().unwrap();
        // Exits right away without reading, so the first write hits a closed pipe
        let script = dir.path().join("quitter.sh");
        std::fs::write(&script, "echo partial > \"$1\"\nexit 1\n").unwrap();
        let config = config(&dir, &format!("sh {} {{output}}", script.display()));
        let mut h = spawn_manager(&config);

        tokio::time::sleep(Duration::from_millis(200)).await;
        // A frame large enough to overflow the pipe buffer cannot be swallowed
        let big = Bytes::from(vec![0u8; 1 << 20]);
        assert!(h.queue.offer(big));

        let segment = next_segment(&mut h.segments).await;
        assert_eq!(std::fs::read(&segment.path).unwrap(), b"partial\n");

        h.cancel.cancel();
        tokio::time::timeout(Duration::from_secs(10), h.handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_leftover_temp_file_is_recovered() {
        let dir = tempfile::tempdir().unwrap();
        let script = cat_encoder(&dir);
        let config = config(&dir, &format!("sh {} {{output}}", script.display()));
        std::fs::create_dir_all(&config.temp_dir).unwrap();
        std::fs::write(config.temp_dir.join("cam-recording.avi"), b"crashed").unwrap();

        let mut h = spawn_manager(&config);
        let recovered = next_segment(&mut h.segments).await;
        assert_eq!(std::fs::read(&recovered.path).unwrap(), b"crashed");

        h.cancel.cancel();
        tokio::time::timeout(Duration::from_secs(10), h.handle).await.unwrap().unwrap();
    }
}
