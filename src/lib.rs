// Ambeelight - mirrors the average color of the primary display onto a Yeelight bulb
//
// One worker thread runs capture -> reduce -> transmit per tick on a phase-locked
// schedule while the session controller owns the device connection.

pub mod capture;
pub mod config;
pub mod device;
pub mod error;
pub mod protocol;
pub mod reduce;
pub mod scheduler;
pub mod session;
pub mod types;
pub mod watcher;

pub use capture::{BoundedCapture, FrameSource, ScreenCapture};
pub use config::{AppConfig, Args, DeviceEndpoint, LinkTimeouts, LiveSettings, SessionConfig};
pub use device::{Connector, DeviceLink, DriftCheck, TcpConnector};
pub use error::{CaptureError, ConfigError, ConnectError, StartError, TransmitError};
pub use reduce::average_color;
pub use scheduler::Ticker;
pub use session::{SessionController, StatsSnapshot};
pub use types::{Rgb, SessionState, StatusEvent};
