//! RTMP wire protocol
//!
//! - [`handshake`]: simple C0/C1/C2 handshake
//! - [`chunk`]: chunk stream encoder/decoder
//! - [`message`]: control messages and AMF0 commands
//! - [`timestamp`]: relative timestamps and composition times

pub mod chunk;
pub mod constants;
pub mod handshake;
pub mod message;
pub mod timestamp;

pub use chunk::{ChunkDecoder, ChunkEncoder, ChunkMessage, ChunkType};
pub use message::{Command, ControlMessage};
pub use timestamp::{TimeConvertible, Timestamp};
