// Config Module - Session settings, persisted preferences and command-line argument parsing
use anyhow::{bail, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::Duration;

use crate::error::ConfigError;
use crate::protocol::DEFAULT_PORT;

pub const MIN_BRIGHTNESS: u8 = 1;
pub const MAX_BRIGHTNESS: u8 = 100;
// Anything faster floods the device's command queue
pub const MIN_INTERVAL_MS: u64 = 100;
pub const MAX_INTERVAL_MS: u64 = 10_000;
pub const MAX_TRANSITION_MS: u64 = 1000;

pub const CONFIG_VERSION: u32 = 1;

#[derive(Parser, Debug, Default)]
#[command(
    author,
    version,
    about = "Mirror the average screen color onto a Yeelight bulb",
    long_about = "Continuously samples the primary display, averages it down to one color\n\
                  and streams that color to a Yeelight bulb over its LAN control protocol."
)]
pub struct Args {
    /// Bulb address (host or host:port)
    #[arg(short, long)]
    pub ip: Option<String>,

    /// Brightness in percent (1-100)
    #[arg(short, long)]
    pub brightness: Option<u8>,

    /// Refresh interval in milliseconds
    #[arg(short = 'n', long)]
    pub interval: Option<u64>,

    /// Transition duration in milliseconds
    #[arg(short, long)]
    pub transition: Option<u64>,

    /// Config file path or name (e.g., --cfg /full/path or --cfg desk for ~/.config/ambeelight/desk.toml)
    #[arg(long)]
    pub cfg: Option<String>,

    /// Stream immediately without the terminal UI, stop with Ctrl+C
    #[arg(long)]
    pub headless: bool,

    /// Log file (default: ambeelight.log next to the config file, stderr when headless)
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

/// Network address of the bulb plus the ramp used for power/brightness/color changes.
///
/// Fixed for the lifetime of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEndpoint {
    pub host: String,
    pub port: u16,
    pub transition: Duration,
}

impl DeviceEndpoint {
    pub fn parse(address: &str, transition: Duration) -> Result<Self, ConfigError> {
        let address = address.trim();
        if address.is_empty() {
            return Err(ConfigError::EmptyAddress);
        }
        if address.chars().any(char::is_whitespace) {
            return Err(ConfigError::InvalidAddress(address.to_string()));
        }
        if transition.as_millis() > u128::from(MAX_TRANSITION_MS) {
            return Err(ConfigError::Transition {
                got: transition.as_millis() as u64,
                max: MAX_TRANSITION_MS,
            });
        }

        let (host, port) = if let Ok(addr) = address.parse::<SocketAddr>() {
            (addr.ip().to_string(), addr.port())
        } else if let Ok(ip) = address.parse::<IpAddr>() {
            (ip.to_string(), DEFAULT_PORT)
        } else if let Some((host, port)) = address.rsplit_once(':') {
            let port = port
                .parse::<u16>()
                .map_err(|_| ConfigError::InvalidAddress(address.to_string()))?;
            (host.to_string(), port)
        } else {
            (address.to_string(), DEFAULT_PORT)
        };

        if host.is_empty() || port == 0 {
            return Err(ConfigError::InvalidAddress(address.to_string()));
        }

        Ok(DeviceEndpoint { host, port, transition })
    }

    /// `host:port` form, bracketing IPv6 literals.
    pub fn address(&self) -> String {
        match self.host.parse::<IpAddr>() {
            Ok(IpAddr::V6(ip)) => format!("[{}]:{}", ip, self.port),
            _ => format!("{}:{}", self.host, self.port),
        }
    }
}

/// Brightness and cadence requested for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub brightness: u8,
    pub interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            brightness: 40,
            interval: Duration::from_millis(200),
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_BRIGHTNESS..=MAX_BRIGHTNESS).contains(&self.brightness) {
            return Err(ConfigError::Brightness(self.brightness));
        }
        let interval_ms = self.interval.as_millis() as u64;
        if interval_ms < MIN_INTERVAL_MS {
            return Err(ConfigError::IntervalTooShort {
                got: interval_ms,
                min: MIN_INTERVAL_MS,
            });
        }
        if interval_ms > MAX_INTERVAL_MS {
            return Err(ConfigError::IntervalTooLong {
                got: interval_ms,
                max: MAX_INTERVAL_MS,
            });
        }
        Ok(())
    }
}

/// Upper bounds on every blocking call the worker makes, so stop requests are seen in bounded time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkTimeouts {
    pub connect: Duration,
    pub response: Duration,
    pub write: Duration,
    /// One screen grab; an expired capture skips the tick.
    pub capture: Duration,
}

impl Default for LinkTimeouts {
    fn default() -> Self {
        LinkTimeouts {
            connect: Duration::from_secs(3),
            response: Duration::from_secs(2),
            write: Duration::from_millis(500),
            capture: Duration::from_secs(1),
        }
    }
}

/// Values the UI may change while streaming. Each field is read atomically;
/// a reader may see a new brightness with an old interval for one tick.
#[derive(Debug)]
pub struct LiveSettings {
    brightness: AtomicU8,
    interval_ms: AtomicU64,
}

impl LiveSettings {
    pub fn new(config: &SessionConfig) -> Self {
        LiveSettings {
            brightness: AtomicU8::new(config.brightness),
            interval_ms: AtomicU64::new(config.interval.as_millis() as u64),
        }
    }

    pub fn brightness(&self) -> u8 {
        self.brightness.load(Ordering::Relaxed)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.load(Ordering::Relaxed))
    }

    pub fn set_brightness(&self, brightness: u8) {
        self.brightness
            .store(brightness.clamp(MIN_BRIGHTNESS, MAX_BRIGHTNESS), Ordering::Relaxed);
    }

    pub fn set_interval(&self, interval: Duration) {
        let ms = (interval.as_millis() as u64).clamp(MIN_INTERVAL_MS, MAX_INTERVAL_MS);
        self.interval_ms.store(ms, Ordering::Relaxed);
    }

    pub fn store(&self, config: &SessionConfig) {
        self.set_brightness(config.brightness);
        self.set_interval(config.interval);
    }

    pub fn snapshot(&self) -> SessionConfig {
        SessionConfig {
            brightness: self.brightness(),
            interval: self.interval(),
        }
    }
}

/// Preferences record persisted between runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(skip)]
    pub config_path: Option<PathBuf>,

    pub version: u32,
    pub device_ip: String,
    pub brightness: u8,
    pub interval_ms: u64,
    pub transition_ms: u64,
    pub connect_timeout_ms: u64,
    pub response_timeout_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            config_path: None,
            version: CONFIG_VERSION,
            device_ip: "".to_string(),
            brightness: 40,
            interval_ms: 200,
            transition_ms: 200,
            connect_timeout_ms: 3000,
            response_timeout_ms: 2000,
        }
    }
}

impl AppConfig {
    pub fn merge_with_args(&mut self, args: &Args) -> bool {
        let mut args_provided = false;

        if let Some(ref ip) = args.ip {
            self.device_ip = ip.clone();
            args_provided = true;
        }

        if let Some(brightness) = args.brightness {
            self.brightness = brightness;
            args_provided = true;
        }

        if let Some(interval) = args.interval {
            self.interval_ms = interval;
            args_provided = true;
        }

        if let Some(transition) = args.transition {
            self.transition_ms = transition;
            args_provided = true;
        }

        if args_provided {
            self.sanitize();
        }
        args_provided
    }

    pub fn config_path(cfg_arg: Option<&str>) -> Result<PathBuf> {
        if let Some(cfg) = cfg_arg {
            let path = PathBuf::from(cfg);
            if path.is_absolute() || cfg.contains('/') || cfg.contains('\\') {
                return Ok(path);
            }

            // Bare name: lives in the config directory
            let filename = if cfg.ends_with(".toml") {
                cfg.to_string()
            } else {
                format!("{}.toml", cfg)
            };
            Ok(Self::config_dir()?.join(filename))
        } else {
            Ok(Self::config_dir()?.join("config.toml"))
        }
    }

    fn config_dir() -> Result<PathBuf> {
        let home = std::env::var("HOME")?;
        let config_dir = PathBuf::from(home).join(".config").join("ambeelight");
        std::fs::create_dir_all(&config_dir)?;
        Ok(config_dir)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut parsed = Self::parse(&contents)?;
        parsed.config_path = Some(path.to_path_buf());
        Ok(parsed)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let mut parsed: Self = toml::from_str(contents)?;
        if parsed.version > CONFIG_VERSION {
            bail!(
                "config version {} is newer than supported version {}",
                parsed.version,
                CONFIG_VERSION
            );
        }
        parsed.version = CONFIG_VERSION;
        parsed.sanitize();
        Ok(parsed)
    }

    /// Load the record at `path`, falling back to defaults when the file doesn't exist yet.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load_from(path)
        } else {
            Ok(AppConfig {
                config_path: Some(path.to_path_buf()),
                ..AppConfig::default()
            })
        }
    }

    pub fn save(&self) -> Result<()> {
        let Some(path) = self.config_path.as_ref() else {
            bail!("config has no file path");
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn sanitize(&mut self) {
        self.device_ip = self.device_ip.trim().to_string();
        self.brightness = self.brightness.clamp(MIN_BRIGHTNESS, MAX_BRIGHTNESS);
        self.interval_ms = self.interval_ms.clamp(MIN_INTERVAL_MS, MAX_INTERVAL_MS);
        self.transition_ms = self.transition_ms.min(MAX_TRANSITION_MS);
        self.connect_timeout_ms = self.connect_timeout_ms.clamp(100, 60_000);
        self.response_timeout_ms = self.response_timeout_ms.clamp(100, 60_000);
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            brightness: self.brightness,
            interval: Duration::from_millis(self.interval_ms),
        }
    }

    pub fn endpoint(&self) -> Result<DeviceEndpoint, ConfigError> {
        DeviceEndpoint::parse(&self.device_ip, Duration::from_millis(self.transition_ms))
    }

    pub fn timeouts(&self) -> LinkTimeouts {
        LinkTimeouts {
            connect: Duration::from_millis(self.connect_timeout_ms),
            response: Duration::from_millis(self.response_timeout_ms),
            ..LinkTimeouts::default()
        }
    }
}
