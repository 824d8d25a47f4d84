//! Live audio/video publishing engine
//!
//! castline takes encoded media from capture and codec units and streams it
//! to a server over RTMP or SRT (MPEG-TS), or plays a remote stream back.
//!
//! # Architecture
//!
//! ```text
//!   capture ──► Mixer ──► codec units ──► Mixer ──► MuxerHandle
//!                                                     │
//!                                                     ▼
//!                              Session task (RtmpMuxer | SrtMuxer)
//!                                                     │
//!                                                     ▼
//!                       Connection (writer task / reader task) ◄── Reconnector
//! ```
//!
//! - [`Connection`] dials, runs the RTMP handshake and `connect`, and fans
//!   connection changes and inbound media out to sessions
//! - [`Session`] is an actor with a ready-state machine that owns one muxer
//! - [`Mixer`] serializes audio/video producers into the session's muxer
//! - [`Reconnector`] keeps the connection up with exponential backoff
//!
//! # Example
//!
//! ```no_run
//! use castline::{ClientConfig, Connection, Reconnector, Session};
//!
//! # async fn run() -> castline::Result<()> {
//! let url = "rtmp://localhost/live/stream_key";
//! let connection = Connection::new(ClientConfig::new(url));
//! let session = Session::new(&connection).await;
//! session.publish(Some("stream_key"));
//!
//! let reconnect = Reconnector::new(connection.clone()).spawn(url);
//! let _media = session.muxer_handle();
//! // ... feed encoded samples ...
//! session.close();
//! reconnect.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod amf;
pub mod bitrate;
pub mod client;
pub mod error;
pub mod media;
pub mod mixer;
pub mod mux;
pub mod net;
pub mod protocol;
pub mod session;
pub mod stats;

pub use bitrate::{AdaptiveBitrateStrategy, BitrateStrategy, FixedBitrateStrategy};
pub use client::{ClientConfig, ReconnectPolicy, Reconnector};
pub use error::{Error, Result};
pub use mixer::{Mixer, MixerDelegate};
pub use mux::{Muxer, RtmpMuxer, SrtMuxer};
pub use net::{Connection, ConnectionEvent};
pub use session::{MuxerHandle, ReadyState, Session, SessionObserver};
