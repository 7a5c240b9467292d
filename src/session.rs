// Session Controller - owns the device session and the tick loop worker
//
// State machine: Idle -> Connecting -> Streaming -> Stopping -> Idle, with
// Connecting -> Idle on handshake failure and Streaming -> Idle on transmit failure.
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::capture::{BoundedCapture, FrameSource};
use crate::config::{DeviceEndpoint, LinkTimeouts, LiveSettings, SessionConfig};
use crate::device::{Connector, DeviceLink, DriftCheck, TcpConnector};
use crate::error::{StartError, TransmitError};
use crate::reduce::average_color;
use crate::scheduler::Ticker;
use crate::types::{Rgb, SessionState, StatusEvent};

// Brightness is re-verified at most this often
const DRIFT_CHECK_PERIOD: Duration = Duration::from_secs(1);
// Below this much tick budget the drift check waits for a later tick
const MIN_DRIFT_BUDGET: Duration = Duration::from_millis(20);

const NO_COLOR: u32 = u32::MAX;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Counters for the running (or last) session.
#[derive(Debug)]
pub struct SessionStats {
    ticks: AtomicU64,
    frames_sent: AtomicU64,
    captures_skipped: AtomicU64,
    drift_corrections: AtomicU64,
    last_color: AtomicU32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub ticks: u64,
    pub frames_sent: u64,
    pub captures_skipped: u64,
    pub drift_corrections: u64,
    pub last_color: Option<Rgb>,
}

impl SessionStats {
    fn new() -> Self {
        SessionStats {
            ticks: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            captures_skipped: AtomicU64::new(0),
            drift_corrections: AtomicU64::new(0),
            last_color: AtomicU32::new(NO_COLOR),
        }
    }

    fn reset(&self) {
        self.ticks.store(0, Ordering::Relaxed);
        self.frames_sent.store(0, Ordering::Relaxed);
        self.captures_skipped.store(0, Ordering::Relaxed);
        self.drift_corrections.store(0, Ordering::Relaxed);
        self.last_color.store(NO_COLOR, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let packed = self.last_color.load(Ordering::Relaxed);
        StatsSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            captures_skipped: self.captures_skipped.load(Ordering::Relaxed),
            drift_corrections: self.drift_corrections.load(Ordering::Relaxed),
            last_color: (packed != NO_COLOR).then(|| {
                let [_, r, g, b] = packed.to_be_bytes();
                Rgb::new(r, g, b)
            }),
        }
    }
}

struct Shared {
    state: Mutex<SessionState>,
    settings: Arc<LiveSettings>,
    stats: SessionStats,
}

impl Shared {
    // Guarded transition; staying in the current state is a no-op and an
    // undeclared transition is logged and ignored
    fn enter(&self, next: SessionState) {
        let mut state = lock(&self.state);
        if *state == next {
            return;
        }
        if !state.can_transition(next) {
            tracing::warn!(from = %*state, to = %next, "rejected session transition");
            return;
        }
        tracing::info!(from = %*state, to = %next, "session state");
        *state = next;
    }
}

/// Single owner of the device session. Exposes `start`/`stop` and reports
/// status changes on the channel returned by [`SessionController::new`].
pub struct SessionController {
    shared: Arc<Shared>,
    source: Arc<dyn FrameSource>,
    connector: Arc<dyn Connector>,
    timeouts: LinkTimeouts,
    events: Sender<StatusEvent>,
    stop_tx: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl SessionController {
    pub fn new(source: Arc<dyn FrameSource>, timeouts: LinkTimeouts) -> (Self, Receiver<StatusEvent>) {
        Self::with_connector(source, Arc::new(TcpConnector), timeouts)
    }

    /// Like [`SessionController::new`] with a custom way of opening the device link.
    pub fn with_connector(
        source: Arc<dyn FrameSource>,
        connector: Arc<dyn Connector>,
        timeouts: LinkTimeouts,
    ) -> (Self, Receiver<StatusEvent>) {
        let (events, events_rx) = mpsc::channel();
        let controller = SessionController {
            shared: Arc::new(Shared {
                state: Mutex::new(SessionState::Idle),
                settings: Arc::new(LiveSettings::new(&SessionConfig::default())),
                stats: SessionStats::new(),
            }),
            source,
            connector,
            timeouts,
            events,
            stop_tx: None,
            worker: None,
        };
        (controller, events_rx)
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.shared.state)
    }

    /// Brightness and interval the worker reads every tick.
    pub fn settings(&self) -> Arc<LiveSettings> {
        Arc::clone(&self.shared.settings)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn set_timeouts(&mut self, timeouts: LinkTimeouts) {
        self.timeouts = timeouts;
    }

    /// Begin connecting in the background. Rejected unless the session is Idle.
    pub fn start(&mut self, endpoint: DeviceEndpoint, config: SessionConfig) -> Result<(), StartError> {
        config.validate()?;
        {
            let mut state = lock(&self.shared.state);
            if *state != SessionState::Idle {
                return Err(StartError::Busy(*state));
            }
            *state = SessionState::Connecting;
        }
        tracing::info!(address = %endpoint.address(), "session state: idle -> connecting");

        // The previous worker marks Idle only after its socket is closed; let it finish reporting
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }

        self.shared.settings.store(&config);
        self.shared.stats.reset();

        let (stop_tx, stop_rx) = mpsc::channel();
        let worker = Worker {
            shared: Arc::clone(&self.shared),
            source: Arc::clone(&self.source),
            connector: Arc::clone(&self.connector),
            events: self.events.clone(),
            endpoint,
            timeouts: self.timeouts,
            stop_rx,
        };

        match thread::Builder::new()
            .name("ambeelight-session".to_string())
            .spawn(move || worker.run())
        {
            Ok(handle) => {
                self.worker = Some(handle);
                self.stop_tx = Some(stop_tx);
                Ok(())
            }
            Err(e) => {
                *lock(&self.shared.state) = SessionState::Idle;
                Err(StartError::Worker(e))
            }
        }
    }

    /// Request teardown. Observed at the next tick boundary, or once an
    /// in-flight handshake settles.
    pub fn stop(&self) {
        {
            let mut state = lock(&self.shared.state);
            match *state {
                SessionState::Streaming => {
                    tracing::info!("session state: streaming -> stopping");
                    *state = SessionState::Stopping;
                }
                // Stays Connecting until the handshake settles
                SessionState::Connecting => tracing::info!("stop requested during handshake"),
                SessionState::Idle | SessionState::Stopping => return,
            }
        }
        if let Some(stop_tx) = &self.stop_tx {
            let _ = stop_tx.send(());
        }
    }

    /// Stop and block until the worker has released the device.
    pub fn shutdown(&mut self) {
        self.stop();
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

enum StopReason {
    Requested,
    Failed(TransmitError),
}

struct Worker {
    shared: Arc<Shared>,
    source: Arc<dyn FrameSource>,
    connector: Arc<dyn Connector>,
    events: Sender<StatusEvent>,
    endpoint: DeviceEndpoint,
    timeouts: LinkTimeouts,
    stop_rx: Receiver<()>,
}

impl Worker {
    fn run(self) {
        let config = self.shared.settings.snapshot();

        let mut capture = match BoundedCapture::spawn(Arc::clone(&self.source), self.timeouts.capture) {
            Ok(capture) => capture,
            Err(e) => {
                tracing::warn!("could not start capture thread: {}", e);
                self.finish(StatusEvent::Error(format!("could not start capture thread: {}", e)));
                return;
            }
        };

        let mut link = match self.connector.connect(&self.endpoint, &config, self.timeouts) {
            Ok(link) => link,
            Err(e) => {
                if self.stop_requested() {
                    tracing::info!("handshake ended after stop request: {}", e);
                    self.finish(StatusEvent::Disconnected);
                } else {
                    tracing::warn!("handshake failed: {}", e);
                    self.finish(StatusEvent::Error(e.to_string()));
                }
                return;
            }
        };

        if self.stop_requested() {
            self.shared.enter(SessionState::Stopping);
            link.close();
            self.finish(StatusEvent::Disconnected);
            return;
        }

        self.shared.enter(SessionState::Streaming);
        let _ = self.events.send(StatusEvent::Connected);

        let reason = self.stream(&mut link, &mut capture);
        if matches!(reason, StopReason::Requested) {
            self.shared.enter(SessionState::Stopping);
        }
        link.close();

        match reason {
            StopReason::Requested => self.finish(StatusEvent::Disconnected),
            StopReason::Failed(e) => {
                tracing::warn!(address = %link.address(), "streaming failed: {}", e);
                self.finish(StatusEvent::Error(e.to_string()));
            }
        }
    }

    fn stop_requested(&self) -> bool {
        !matches!(self.stop_rx.try_recv(), Err(TryRecvError::Empty))
    }

    // Socket is already closed here; Idle becomes visible before the event
    fn finish(&self, event: StatusEvent) {
        self.shared.enter(SessionState::Idle);
        let _ = self.events.send(event);
    }

    fn stream(&self, link: &mut DeviceLink, capture: &mut BoundedCapture) -> StopReason {
        let mut ticker = Ticker::new(Instant::now());
        let mut last_drift_check = Instant::now();

        loop {
            let settings = self.shared.settings.snapshot();

            if let Err(e) = self.tick(link, capture, &settings) {
                return StopReason::Failed(e);
            }

            if last_drift_check.elapsed() >= DRIFT_CHECK_PERIOD {
                let budget = ticker.remaining(Instant::now(), settings.interval);
                if budget >= MIN_DRIFT_BUDGET {
                    last_drift_check = Instant::now();
                    match link.check_brightness(settings.brightness, budget) {
                        Ok(DriftCheck::Corrected { reported }) => {
                            tracing::info!(reported, target = settings.brightness, "corrected brightness drift");
                            self.shared.stats.drift_corrections.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(DriftCheck::Skipped) => tracing::debug!("brightness check timed out, retrying later"),
                        Ok(DriftCheck::InSync) => {}
                        Err(e) => return StopReason::Failed(e),
                    }
                }
            }

            let delay = ticker.advance(Instant::now(), settings.interval);
            match self.stop_rx.recv_timeout(delay) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return StopReason::Requested,
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
    }

    // capture -> reduce -> transmit, strictly in that order
    fn tick(
        &self,
        link: &mut DeviceLink,
        capture: &mut BoundedCapture,
        settings: &SessionConfig,
    ) -> Result<(), TransmitError> {
        let stats = &self.shared.stats;
        stats.ticks.fetch_add(1, Ordering::Relaxed);

        if settings.brightness != link.brightness() {
            link.set_brightness(settings.brightness)?;
        }

        match capture.capture() {
            Ok(frame) => {
                let color = average_color(&frame);
                link.send_color(color)?;
                stats.frames_sent.fetch_add(1, Ordering::Relaxed);
                stats.last_color.store(color.packed(), Ordering::Relaxed);
            }
            Err(e) => {
                tracing::debug!("capture failed, skipping tick: {}", e);
                stats.captures_skipped.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared(state: SessionState) -> Shared {
        Shared {
            state: Mutex::new(state),
            settings: Arc::new(LiveSettings::new(&SessionConfig::default())),
            stats: SessionStats::new(),
        }
    }

    #[test]
    fn undeclared_transition_leaves_state_unchanged() {
        let shared = shared(SessionState::Idle);
        shared.enter(SessionState::Streaming);
        assert_eq!(*lock(&shared.state), SessionState::Idle);

        shared.enter(SessionState::Connecting);
        assert_eq!(*lock(&shared.state), SessionState::Connecting);
    }

    #[test]
    fn stats_snapshot_unpacks_last_color() {
        let stats = SessionStats::new();
        assert_eq!(stats.snapshot().last_color, None);

        stats.last_color.store(Rgb::new(1, 2, 3).packed(), Ordering::Relaxed);
        assert_eq!(stats.snapshot().last_color, Some(Rgb::new(1, 2, 3)));

        stats.reset();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }
}
