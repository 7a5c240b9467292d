// Simulated bulb and frame sources shared by the integration tests
#![allow(dead_code)]

use image::{Rgba, RgbaImage};
use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use ambeelight::{
    CaptureError, ConnectError, Connector, DeviceEndpoint, DeviceLink, FrameSource, LinkTimeouts, Rgb,
    SessionConfig, StatusEvent, TcpConnector,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Answers every command and connects back for streaming mode.
    Normal,
    /// Accepts the connection but never answers.
    Silent,
    /// Acknowledges `set_music` but never opens the streaming connection.
    NoCallback,
    /// Hangs up the streaming connection after this many updates.
    DropStreamAfter(usize),
    /// Answers `get_prop` only after this delay; everything else right away.
    SlowQueries(Duration),
}

#[derive(Default)]
pub struct BulbState {
    pub commands: Mutex<Vec<Value>>,
    pub streamed: Mutex<Vec<Value>>,
    pub brightness: AtomicU8,
    pub connections: AtomicUsize,
    pub control_closed: AtomicBool,
    pub streaming_closed: AtomicBool,
}

pub struct FakeBulb {
    pub address: String,
    pub state: Arc<BulbState>,
}

impl FakeBulb {
    pub fn spawn(behavior: Behavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let state = Arc::new(BulbState::default());
        state.brightness.store(100, Ordering::SeqCst);

        let accept_state = Arc::clone(&state);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                accept_state.connections.fetch_add(1, Ordering::SeqCst);
                let conn_state = Arc::clone(&accept_state);
                thread::spawn(move || serve_control(stream, conn_state, behavior));
            }
        });

        FakeBulb { address, state }
    }

    /// Pretend another controller changed the brightness.
    pub fn set_brightness(&self, brightness: u8) {
        self.state.brightness.store(brightness, Ordering::SeqCst);
    }

    pub fn methods(&self) -> Vec<String> {
        self.state
            .commands
            .lock()
            .unwrap()
            .iter()
            .map(|c| c["method"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    pub fn streamed_with(&self, method: &str) -> Vec<Value> {
        self.state
            .streamed
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c["method"] == method)
            .cloned()
            .collect()
    }
}

fn serve_control(stream: TcpStream, state: Arc<BulbState>, behavior: Behavior) {
    let mut writer = stream.try_clone().unwrap();
    let reader = BufReader::new(stream);

    for line in reader.lines() {
        let Ok(line) = line else { break };
        let Ok(command) = serde_json::from_str::<Value>(line.trim()) else { continue };
        state.commands.lock().unwrap().push(command.clone());

        if behavior == Behavior::Silent {
            continue;
        }

        let id = command["id"].clone();
        let params = command["params"].clone();
        let reply = match command["method"].as_str().unwrap_or_default() {
            "set_bright" => {
                state.brightness.store(params[0].as_u64().unwrap_or(0) as u8, Ordering::SeqCst);
                json!({"id": id, "result": ["ok"]})
            }
            "get_prop" => {
                if let Behavior::SlowQueries(delay) = behavior {
                    thread::sleep(delay);
                }
                let bright = state.brightness.load(Ordering::SeqCst).to_string();
                json!({"id": id, "result": [bright]})
            }
            "set_music" if params[0] == 1 => {
                if behavior != Behavior::NoCallback {
                    let host = params[1].as_str().unwrap_or_default().to_string();
                    let port = params[2].as_u64().unwrap_or(0) as u16;
                    let music = TcpStream::connect((host.as_str(), port)).unwrap();
                    let music_state = Arc::clone(&state);
                    thread::spawn(move || serve_streaming(music, music_state, behavior));
                }
                json!({"id": id, "result": ["ok"]})
            }
            _ => json!({"id": id, "result": ["ok"]}),
        };

        // Unsolicited notification first, the client must skip it
        let note = json!({"method": "props", "params": {"power": "on"}});
        let out = format!("{}\r\n{}\r\n", note, reply);
        if writer.write_all(out.as_bytes()).is_err() {
            break;
        }
    }
    state.control_closed.store(true, Ordering::SeqCst);
}

fn serve_streaming(stream: TcpStream, state: Arc<BulbState>, behavior: Behavior) {
    let reader = BufReader::new(stream);
    let mut received = 0usize;

    for line in reader.lines() {
        let Ok(line) = line else { break };
        let Ok(command) = serde_json::from_str::<Value>(line.trim()) else { continue };
        if command["method"] == "set_bright" {
            let bright = command["params"][0].as_u64().unwrap_or(0) as u8;
            state.brightness.store(bright, Ordering::SeqCst);
        }
        state.streamed.lock().unwrap().push(command);

        received += 1;
        if let Behavior::DropStreamAfter(limit) = behavior {
            if received >= limit {
                break;
            }
        }
    }
    state.streaming_closed.store(true, Ordering::SeqCst);
}

/// Address nothing is listening on.
pub fn refused_address() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap().to_string();
    drop(listener);
    address
}

pub fn fast_timeouts() -> LinkTimeouts {
    LinkTimeouts {
        connect: Duration::from_millis(500),
        response: Duration::from_millis(500),
        write: Duration::from_millis(500),
        capture: Duration::from_millis(500),
    }
}

pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

pub fn next_event(events: &Receiver<StatusEvent>, timeout: Duration) -> Option<StatusEvent> {
    events.recv_timeout(timeout).ok()
}

pub struct SolidFrames(pub Rgb);

impl FrameSource for SolidFrames {
    fn capture(&self) -> Result<RgbaImage, CaptureError> {
        let Rgb { r, g, b } = self.0;
        Ok(RgbaImage::from_pixel(8, 8, Rgba([r, g, b, 255])))
    }
}

/// Fails every other capture.
#[derive(Default)]
pub struct FlakyFrames {
    calls: AtomicUsize,
}

impl FrameSource for FlakyFrames {
    fn capture(&self) -> Result<RgbaImage, CaptureError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
            Err(CaptureError::Backend("display asleep".to_string()))
        } else {
            Ok(RgbaImage::from_pixel(4, 4, Rgba([0, 0, 255, 255])))
        }
    }
}

/// Blocks forever, like a display backend that never returns.
pub struct HangingFrames;

impl FrameSource for HangingFrames {
    fn capture(&self) -> Result<RgbaImage, CaptureError> {
        loop {
            thread::park();
        }
    }
}

/// Treats `host` as a device whose TCP connect never completes: the attempt
/// runs out the connect timeout. Other hosts are dialed normally.
pub struct BlackholeConnector {
    pub host: String,
}

impl Connector for BlackholeConnector {
    fn connect(
        &self,
        endpoint: &DeviceEndpoint,
        config: &SessionConfig,
        timeouts: LinkTimeouts,
    ) -> Result<DeviceLink, ConnectError> {
        if endpoint.host != self.host {
            return TcpConnector.connect(endpoint, config, timeouts);
        }
        thread::sleep(timeouts.connect);
        Err(ConnectError::Connect {
            address: endpoint.address(),
            source: std::io::Error::from(std::io::ErrorKind::TimedOut),
        })
    }
}
