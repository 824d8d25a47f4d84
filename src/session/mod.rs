//! Publish/play sessions
//!
//! A session binds to one connection, keeps a ready-state machine and
//! delegates framing to a muxer it creates on first activation. Producers
//! feed it through a [`MuxerHandle`]; consumers watch it through
//! [`SessionObserver`]s.

pub mod handle;
pub mod observer;
pub mod state;
pub mod stream;

pub use handle::{MediaSource, MuxerHandle};
pub use observer::{Format, Media, SessionObserver};
pub use state::{Direction, ReadyState};
pub use stream::{Session, SessionInfo};
