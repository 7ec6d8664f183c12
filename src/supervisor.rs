use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use url::Url;

use crate::config::{CameraConfig, Config};
use crate::encoder::{SessionManager, StopSignal};
use crate::errors::{Result, RecorderError};
use crate::filter::{FrameFilter, Labeler};
use crate::queue::frame_queue;
use crate::sink::SegmentSink;
use crate::stream::StreamReader;

/// The running tasks of one camera.
pub struct CameraHandle {
    pub camera_id: String,
    stop: StopSignal,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl CameraHandle {
    /// End the current segment early. Goes through the same path as rotation.
    pub fn request_stop(&self) -> bool {
        self.stop.request("external")
    }

    pub async fn join(self) {
        for (name, task) in self.tasks {
            if let Err(e) = task.await {
                error!("Camera '{}': {} task failed: {}", self.camera_id, name, e);
            }
        }
        info!("Camera '{}': stopped", self.camera_id);
    }
}

pub struct CameraSupervisor;

impl CameraSupervisor {
    /// Wire reader, filter, queue, rotation timer and encoder for one camera and start them.
    pub fn spawn(
        camera: &CameraConfig,
        config: &Config,
        labeler: Option<Labeler>,
        sink: Arc<dyn SegmentSink>,
        cancel: CancellationToken,
    ) -> Result<CameraHandle> {
        let camera_id = camera.name.clone();
        let recorder = &config.recorder;
        let url = Url::parse(&camera.url)?;

        let (queue, frames) = frame_queue(camera_id.clone(), recorder.queue_capacity);
        let filter = FrameFilter::new(camera_id.clone(), recorder, labeler);
        let reader = StreamReader::new(camera_id.clone(), url.to_string(), &config.stream, filter, queue)?;
        let stop = StopSignal::new(camera_id.clone());
        let manager = SessionManager::new(camera_id.clone(), recorder, frames, stop.clone(), sink);

        let tasks = vec![
            ("reader", tokio::spawn(reader.run(cancel.clone()))),
            (
                "rotation",
                tokio::spawn(rotation_timer(
                    camera_id.clone(),
                    config.rotation_interval(),
                    stop.clone(),
                    cancel.clone(),
                )),
            ),
            ("encoder", tokio::spawn(manager.run(cancel))),
        ];

        info!(
            "Camera '{}': recording {} into {}",
            camera_id,
            camera.url,
            recorder.output_dir.display()
        );

        Ok(CameraHandle { camera_id, stop, tasks })
    }
}

/// Ask for a new segment every `period` until cancelled.
pub async fn rotation_timer(camera_id: String, period: Duration, stop: StopSignal, cancel: CancellationToken) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                stop.request("rotation");
            }
        }
    }
    debug!("Camera '{}': rotation timer stopped", camera_id);
}

/// Start every active camera. Each camera gets its own child token of `cancel`.
pub fn spawn_cameras(
    config: Arc<Config>,
    sink: Arc<dyn SegmentSink>,
    cancel: CancellationToken,
) -> Result<Vec<CameraHandle>> {
    let labeler = Labeler::from_config(&config.recorder)?;

    for camera in config.cameras.iter().filter(|c| !c.active) {
        info!("Camera '{}' is inactive, skipping", camera.name);
    }

    let mut handles = Vec::new();
    for camera in config.active_cameras() {
        match CameraSupervisor::spawn(camera, &config, labeler.clone(), sink.clone(), cancel.child_token()) {
            Ok(handle) => handles.push(handle),
            Err(e) => {
                error!("Camera '{}': failed to start: {}", camera.name, e);
                // Cameras already running must not outlive the error
                cancel.cancel();
                return Err(e);
            }
        }
    }

    if handles.is_empty() {
        return Err(RecorderError::config("No active cameras configured"));
    }

    info!("Started {} camera(s)", handles.len());
    Ok(handles)
}
