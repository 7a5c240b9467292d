// Shared types module - Colors, session states and status events used across modules

use std::fmt;

// RGB color representation, one averaged sample per tick
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Rgb { r, g, b }
    }

    /// Packed 24-bit value as the device expects it for `set_rgb`.
    pub fn packed(self) -> u32 {
        (u32::from(self.r) << 16) | (u32::from(self.g) << 8) | u32::from(self.b)
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02X}{:02X}{:02X}", self.r, self.g, self.b)
    }
}

// Session lifecycle - Idle and Streaming are the only steady states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Streaming,
    Stopping,
}

impl SessionState {
    /// Whether `self -> next` is one of the declared transitions.
    ///
    /// `Connecting -> Stopping` covers a stop request that arrives while the
    /// handshake is still in flight.
    pub fn can_transition(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Connecting, Streaming)
                | (Connecting, Idle)
                | (Connecting, Stopping)
                | (Streaming, Stopping)
                | (Streaming, Idle)
                | (Stopping, Idle)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Streaming => "streaming",
            SessionState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

// Feedback for the UI - emitted once per state transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    Connected,
    Disconnected,
    Error(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packs_channels_big_endian() {
        assert_eq!(Rgb::new(0x12, 0x34, 0x56).packed(), 0x123456);
        assert_eq!(Rgb::new(255, 255, 255).packed(), 16_777_215);
    }

    #[test]
    fn formats_as_hex() {
        assert_eq!(Rgb::new(0xDF, 0x28, 0x2F).to_string(), "#DF282F");
    }

    #[test]
    fn only_declared_transitions_are_allowed() {
        use SessionState::*;
        assert!(Idle.can_transition(Connecting));
        assert!(Streaming.can_transition(Stopping));
        assert!(!Idle.can_transition(Streaming));
        assert!(!Stopping.can_transition(Streaming));
        assert!(!Streaming.can_transition(Connecting));
        assert!(!Idle.can_transition(Idle));
    }
}
