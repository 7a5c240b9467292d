// Device Link - one persistent session with a bulb: handshake, streaming writes,
// brightness drift checks and teardown
use std::io::{self, BufRead, BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::{DeviceEndpoint, LinkTimeouts, SessionConfig};
use crate::error::{ConnectError, TransmitError};
use crate::protocol::{self, Command, Effect, Reply};
use crate::types::Rgb;

// Consecutive brightness queries left unanswered for a full response timeout
// before the device is considered gone
const MAX_MISSED_DRIFT_REPLIES: u32 = 5;
const ACCEPT_POLL: Duration = Duration::from_millis(10);

/// Outcome of one brightness drift check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriftCheck {
    InSync,
    Corrected { reported: u8 },
    /// No reply within the tick budget; the check is retried later.
    Skipped,
}

/// Opens links for the session controller.
pub trait Connector: Send + Sync {
    fn connect(
        &self,
        endpoint: &DeviceEndpoint,
        config: &SessionConfig,
        timeouts: LinkTimeouts,
    ) -> Result<DeviceLink, ConnectError>;
}

/// Plain TCP to the endpoint, followed by the handshake.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn connect(
        &self,
        endpoint: &DeviceEndpoint,
        config: &SessionConfig,
        timeouts: LinkTimeouts,
    ) -> Result<DeviceLink, ConnectError> {
        DeviceLink::connect(endpoint, config, timeouts)
    }
}

// Failure of a single request/reply round trip on the control connection
#[derive(Debug)]
enum CallError {
    Io(io::Error),
    Encode(serde_json::Error),
    TimedOut,
    Closed,
    Device(String),
    Malformed(String),
}

// Brightness query sent but not yet answered
#[derive(Debug, Clone, Copy)]
struct PendingQuery {
    id: u32,
    sent_at: Instant,
}

impl CallError {
    fn reason(&self) -> String {
        match self {
            CallError::Io(e) => e.to_string(),
            CallError::Encode(e) => format!("could not encode command: {}", e),
            CallError::TimedOut => "timed out waiting for reply".to_string(),
            CallError::Closed => "connection closed by device".to_string(),
            CallError::Device(msg) | CallError::Malformed(msg) => msg.clone(),
        }
    }

    fn from_io(e: io::Error) -> Self {
        if is_timeout(&e) {
            CallError::TimedOut
        } else {
            CallError::Io(e)
        }
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// Exclusive owner of the sockets to one bulb.
///
/// The control connection carries acknowledged commands (handshake, drift
/// queries). Once streaming, color updates go over the connection the bulb
/// opened back to us and are never acknowledged.
pub struct DeviceLink {
    address: String,
    timeouts: LinkTimeouts,
    effect: Effect,
    control: Option<BufReader<TcpStream>>,
    streaming: Option<TcpStream>,
    partial_line: String,
    next_id: u32,
    brightness: u8,
    pending_query: Option<PendingQuery>,
    missed_drift_replies: u32,
}

impl DeviceLink {
    /// Connect and run the handshake: power on, set brightness, enter streaming mode.
    ///
    /// Any failure drops the partially built link, which closes its sockets.
    pub fn connect(
        endpoint: &DeviceEndpoint,
        config: &SessionConfig,
        timeouts: LinkTimeouts,
    ) -> Result<Self, ConnectError> {
        let address = endpoint.address();
        let socket_addr = resolve(&endpoint.host, endpoint.port)?;

        let stream = TcpStream::connect_timeout(&socket_addr, timeouts.connect).map_err(|source| {
            ConnectError::Connect {
                address: address.clone(),
                source,
            }
        })?;
        configure(&stream, &timeouts).map_err(|source| ConnectError::Connect {
            address: address.clone(),
            source,
        })?;
        tracing::debug!(%address, "control connection open");

        let mut link = DeviceLink {
            address,
            timeouts,
            effect: Effect::from_transition(endpoint.transition),
            control: Some(BufReader::new(stream)),
            streaming: None,
            partial_line: String::new(),
            next_id: 1,
            brightness: config.brightness,
            pending_query: None,
            missed_drift_replies: 0,
        };

        let effect = link.effect;
        link.handshake_step("power on", Command::PowerOn(effect))?;
        link.handshake_step("set brightness", Command::SetBrightness(config.brightness, effect))?;
        link.enter_streaming_mode()?;

        tracing::info!(address = %link.address, "streaming mode active");
        Ok(link)
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.is_some()
    }

    /// Brightness last sent to the device.
    pub fn brightness(&self) -> u8 {
        self.brightness
    }

    /// Fire-and-forget color update.
    pub fn send_color(&mut self, color: Rgb) -> Result<(), TransmitError> {
        self.stream_command(&Command::SetRgb(color, self.effect))
    }

    /// Fire-and-forget brightness update.
    pub fn set_brightness(&mut self, brightness: u8) -> Result<(), TransmitError> {
        self.stream_command(&Command::SetBrightness(brightness, self.effect))?;
        self.brightness = brightness;
        Ok(())
    }

    /// Ask the device for its brightness and re-send `target` if it drifted.
    ///
    /// The reply is awaited for at most `budget` (capped by the response
    /// timeout). A query that outlives the budget stays outstanding and its
    /// reply is picked up by a later check; only a query unanswered for the
    /// whole response timeout counts as missed.
    pub fn check_brightness(&mut self, target: u8, budget: Duration) -> Result<DriftCheck, TransmitError> {
        let query = match self.pending_query {
            Some(query) => query,
            None => {
                let id = self
                    .send_request(&Command::GetBrightness)
                    .map_err(|e| TransmitError::DriftCheck(e.reason()))?;
                let query = PendingQuery {
                    id,
                    sent_at: Instant::now(),
                };
                self.pending_query = Some(query);
                query
            }
        };

        let timeout = budget.min(self.timeouts.response);
        let result = match self.await_reply(query.id, timeout) {
            Ok(result) => result,
            Err(CallError::TimedOut) if query.sent_at.elapsed() < self.timeouts.response => {
                return Ok(DriftCheck::Skipped);
            }
            Err(CallError::TimedOut) => {
                self.pending_query = None;
                self.missed_drift_replies += 1;
                if self.missed_drift_replies >= MAX_MISSED_DRIFT_REPLIES {
                    return Err(TransmitError::DriftCheck(format!(
                        "no reply to {} consecutive brightness queries",
                        self.missed_drift_replies
                    )));
                }
                return Ok(DriftCheck::Skipped);
            }
            Err(e) => {
                self.pending_query = None;
                return Err(TransmitError::DriftCheck(e.reason()));
            }
        };
        self.pending_query = None;
        self.missed_drift_replies = 0;

        let reported = protocol::parse_brightness(&result)
            .ok_or_else(|| TransmitError::DriftCheck(format!("unexpected brightness value {:?}", result)))?;

        if reported == target {
            return Ok(DriftCheck::InSync);
        }
        tracing::debug!(reported, target, "brightness drifted, correcting");
        self.set_brightness(target)?;
        Ok(DriftCheck::Corrected { reported })
    }

    /// Leave streaming mode (best effort) and release both sockets. Safe to call repeatedly.
    pub fn close(&mut self) {
        let streaming = self.streaming.take();
        let control = self.control.take();
        self.pending_query = None;

        if let Some(mut control) = control {
            if streaming.is_some() {
                let id = self.next_id;
                self.next_id = self.next_id.wrapping_add(1);
                let sent = protocol::encode(id, &Command::StopMusic)
                    .map_err(|e| e.to_string())
                    .and_then(|line| control.get_mut().write_all(line.as_bytes()).map_err(|e| e.to_string()));
                if let Err(e) = sent {
                    tracing::warn!(address = %self.address, "could not leave streaming mode: {}", e);
                }
            }
            let _ = control.get_ref().shutdown(Shutdown::Both);
        }
        if let Some(stream) = streaming {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    fn handshake_step(&mut self, step: &'static str, command: Command) -> Result<(), ConnectError> {
        let timeout = self.timeouts.response;
        self.call(&command, timeout)
            .map(|_| ())
            .map_err(|e| ConnectError::Handshake { step, reason: e.reason() })
    }

    // The bulb opens a second connection back to a port we listen on
    fn enter_streaming_mode(&mut self) -> Result<(), ConnectError> {
        const STEP: &str = "enter streaming mode";
        let fail = |e: io::Error| ConnectError::Handshake {
            step: STEP,
            reason: e.to_string(),
        };

        let local_ip = self
            .control
            .as_ref()
            .ok_or_else(|| fail(io::Error::from(io::ErrorKind::NotConnected)))?
            .get_ref()
            .local_addr()
            .map_err(fail)?
            .ip();
        let listener = TcpListener::bind((local_ip, 0)).map_err(fail)?;
        let port = listener.local_addr().map_err(fail)?.port();
        listener.set_nonblocking(true).map_err(fail)?;

        self.handshake_step(STEP, Command::StartMusic { host: local_ip, port })?;

        let deadline = Instant::now() + self.timeouts.response;
        let stream = loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    tracing::debug!(%peer, "device connected back for streaming");
                    break stream;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(ConnectError::Handshake {
                            step: STEP,
                            reason: "device did not open the streaming connection".to_string(),
                        });
                    }
                    thread::sleep(ACCEPT_POLL);
                }
                Err(e) => return Err(fail(e)),
            }
        };
        stream.set_nonblocking(false).map_err(fail)?;
        configure(&stream, &self.timeouts).map_err(fail)?;
        self.streaming = Some(stream);
        Ok(())
    }

    fn stream_command(&mut self, command: &Command) -> Result<(), TransmitError> {
        let line = protocol::encode(self.next_id, command)?;
        self.next_id = self.next_id.wrapping_add(1);
        let stream = self.streaming.as_mut().ok_or(TransmitError::Closed)?;
        stream.write_all(line.as_bytes()).map_err(TransmitError::Write)
    }

    // Send on the control connection and wait for the reply with the same id
    fn call(&mut self, command: &Command, timeout: Duration) -> Result<Vec<serde_json::Value>, CallError> {
        let id = self.send_request(command)?;
        self.await_reply(id, timeout)
    }

    fn send_request(&mut self, command: &Command) -> Result<u32, CallError> {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        let line = protocol::encode(id, command).map_err(CallError::Encode)?;

        let control = self.control.as_mut().ok_or(CallError::Closed)?;
        control.get_mut().write_all(line.as_bytes()).map_err(CallError::from_io)?;
        Ok(id)
    }

    fn await_reply(&mut self, id: u32, timeout: Duration) -> Result<Vec<serde_json::Value>, CallError> {
        let control = self.control.as_mut().ok_or(CallError::Closed)?;
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(CallError::TimedOut);
            }
            control.get_ref().set_read_timeout(Some(remaining)).map_err(CallError::Io)?;

            // Partial lines survive a timeout and are completed on the next read
            match control.read_line(&mut self.partial_line) {
                Ok(0) => return Err(CallError::Closed),
                Ok(_) if !self.partial_line.ends_with('\n') => continue,
                Ok(_) => {}
                Err(e) => return Err(CallError::from_io(e)),
            }

            let received = std::mem::take(&mut self.partial_line);
            if received.trim().is_empty() {
                continue;
            }
            let reply = Reply::parse(&received)
                .map_err(|e| CallError::Malformed(format!("malformed reply {:?}: {}", received.trim(), e)))?;
            match reply.id {
                Some(reply_id) if reply_id == id => return reply.into_result().map_err(CallError::Device),
                // Notifications and late replies to earlier queries
                _ => continue,
            }
        }
    }
}

impl Drop for DeviceLink {
    fn drop(&mut self) {
        self.close();
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, ConnectError> {
    let resolve_err = |reason: String| ConnectError::Resolve {
        address: format!("{}:{}", host, port),
        reason,
    };
    (host, port)
        .to_socket_addrs()
        .map_err(|e| resolve_err(e.to_string()))?
        .next()
        .ok_or_else(|| resolve_err("no addresses found".to_string()))
}

fn configure(stream: &TcpStream, timeouts: &LinkTimeouts) -> io::Result<()> {
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(timeouts.response))?;
    stream.set_write_timeout(Some(timeouts.write))?;
    Ok(())
}
