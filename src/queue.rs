use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Producer half of the bounded hand-off between the frame filter and the encoder.
#[derive(Clone)]
pub struct FrameSender {
    camera_id: String,
    tx: mpsc::Sender<Bytes>,
    dropped: Arc<AtomicU64>,
}

pub type FrameReceiver = mpsc::Receiver<Bytes>;

pub fn frame_queue(camera_id: impl Into<String>, capacity: usize) -> (FrameSender, FrameReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    let sender = FrameSender {
        camera_id: camera_id.into(),
        tx,
        dropped: Arc::new(AtomicU64::new(0)),
    };
    (sender, rx)
}

impl FrameSender {
    /// Queue a frame without waiting. Returns false if the frame was dropped.
    pub fn offer(&self, frame: Bytes) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                debug!("Camera '{}': frame queue full, dropping frame ({} dropped so far)", self.camera_id, dropped);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Camera '{}': encoder is gone, dropping frame", self.camera_id);
                false
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
