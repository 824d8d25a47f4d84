//! Session ready states
//!
//! ```text
//! initialized ──► open ──► publish ──► publishing
//!                  ▲  └──► play ─────► playing
//!                  └───────────────────────┘ (stop, connection lost)
//! any (but initialized) ──► closed
//! ```

use std::fmt;

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReadyState {
    /// Created, never used
    #[default]
    Initialized,
    /// Usable; not publishing or playing
    Open,
    /// Publish requested, muxer being started
    Publish,
    /// Media flows out
    Publishing,
    /// Play requested
    Play,
    /// Media flows in
    Playing,
    /// Terminal
    Closed,
}

/// Direction of an active session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Publish,
    Play,
}

impl ReadyState {
    /// `publishing` or `playing`
    pub fn is_active(self) -> bool {
        matches!(self, ReadyState::Publishing | ReadyState::Playing)
    }

    /// Direction of a requested or active state
    pub fn direction(self) -> Option<Direction> {
        match self {
            ReadyState::Publish | ReadyState::Publishing => Some(Direction::Publish),
            ReadyState::Play | ReadyState::Playing => Some(Direction::Play),
            _ => None,
        }
    }

    pub fn is_closed(self) -> bool {
        self == ReadyState::Closed
    }
}

impl Direction {
    /// Transitional state entered first
    pub fn requested(self) -> ReadyState {
        match self {
            Direction::Publish => ReadyState::Publish,
            Direction::Play => ReadyState::Play,
        }
    }

    pub fn active(self) -> ReadyState {
        match self {
            Direction::Publish => ReadyState::Publishing,
            Direction::Play => ReadyState::Playing,
        }
    }
}

impl fmt::Display for ReadyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReadyState::Initialized => "initialized",
            ReadyState::Open => "open",
            ReadyState::Publish => "publish",
            ReadyState::Publishing => "publishing",
            ReadyState::Play => "play",
            ReadyState::Playing => "playing",
            ReadyState::Closed => "closed",
        };
        f.write_str(name)
    }
}
