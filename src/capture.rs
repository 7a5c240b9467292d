// Frame Sampler - grabs one still image of the primary display per call
use image::RgbaImage;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use xcap::Monitor;

use crate::error::CaptureError;

/// Anything that can hand the worker a fresh frame each tick.
pub trait FrameSource: Send + Sync {
    fn capture(&self) -> Result<RgbaImage, CaptureError>;
}

/// Primary-display capture through the platform backend.
///
/// The monitor list is re-queried on every call since the primary display
/// (and its geometry) can change between ticks.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScreenCapture;

impl FrameSource for ScreenCapture {
    fn capture(&self) -> Result<RgbaImage, CaptureError> {
        let monitors = Monitor::all().map_err(|e| CaptureError::Backend(e.to_string()))?;
        let primary = monitors
            .into_iter()
            .find(|m| m.is_primary())
            .ok_or(CaptureError::NoPrimaryDisplay)?;

        let shot = primary
            .capture_image()
            .map_err(|e| CaptureError::Backend(e.to_string()))?;

        // Rebuild from raw bytes so we don't depend on the backend's image version
        let (width, height) = (shot.width(), shot.height());
        if width == 0 || height == 0 {
            return Err(CaptureError::EmptyFrame);
        }
        RgbaImage::from_raw(width, height, shot.into_raw()).ok_or(CaptureError::EmptyFrame)
    }
}

/// Runs captures on a helper thread so a stalled backend costs at most
/// `timeout` per tick instead of blocking the session.
///
/// While a timed-out capture is still running, further calls fail fast with
/// [`CaptureError::TimedOut`]. Dropping this lets the helper exit once its
/// current capture returns.
pub struct BoundedCapture {
    requests: Sender<()>,
    frames: Receiver<Result<RgbaImage, CaptureError>>,
    timeout: Duration,
    in_flight: bool,
}

impl BoundedCapture {
    pub fn spawn(source: Arc<dyn FrameSource>, timeout: Duration) -> std::io::Result<Self> {
        let (requests, request_rx) = mpsc::channel::<()>();
        let (frame_tx, frames) = mpsc::channel();

        thread::Builder::new()
            .name("ambeelight-capture".to_string())
            .spawn(move || {
                for () in request_rx {
                    if frame_tx.send(source.capture()).is_err() {
                        break;
                    }
                }
            })?;

        Ok(BoundedCapture {
            requests,
            frames,
            timeout,
            in_flight: false,
        })
    }

    pub fn capture(&mut self) -> Result<RgbaImage, CaptureError> {
        if self.in_flight {
            // A late frame is stale by now; drop it and ask for a fresh one
            match self.frames.try_recv() {
                Ok(_) => self.in_flight = false,
                Err(TryRecvError::Empty) => return Err(CaptureError::TimedOut(self.timeout)),
                Err(TryRecvError::Disconnected) => return Err(worker_gone()),
            }
        }

        self.requests.send(()).map_err(|_| worker_gone())?;
        match self.frames.recv_timeout(self.timeout) {
            Ok(frame) => frame,
            Err(RecvTimeoutError::Timeout) => {
                self.in_flight = true;
                Err(CaptureError::TimedOut(self.timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Err(worker_gone()),
        }
    }
}

fn worker_gone() -> CaptureError {
    CaptureError::Backend("capture thread exited".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    // Blocks for `delay` on the first call only
    struct SlowOnce {
        calls: AtomicUsize,
        delay: Duration,
    }

    impl FrameSource for SlowOnce {
        fn capture(&self) -> Result<RgbaImage, CaptureError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                thread::sleep(self.delay);
            }
            Ok(RgbaImage::from_pixel(2, 2, Rgba([10, 20, 30, 255])))
        }
    }

    #[test]
    fn stalled_capture_times_out_then_recovers() {
        let source = Arc::new(SlowOnce {
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(300),
        });
        let mut capture = BoundedCapture::spawn(source, Duration::from_millis(50)).unwrap();

        let started = Instant::now();
        assert!(matches!(capture.capture(), Err(CaptureError::TimedOut(_))));
        assert!(started.elapsed() < Duration::from_millis(250));

        // Still busy with the first grab
        assert!(matches!(capture.capture(), Err(CaptureError::TimedOut(_))));

        thread::sleep(Duration::from_millis(400));
        let frame = capture.capture().unwrap();
        assert_eq!(frame.get_pixel(0, 0), &Rgba([10, 20, 30, 255]));
    }
}
