//! RTMP protocol constants
//!
//! Reference: Adobe RTMP Specification 1.0, sections 5.3 (chunking) and
//! 5.4 (protocol control messages).

/// RTMP version byte sent in C0/S0
pub const RTMP_VERSION: u8 = 3;

/// Size of C1/C2/S1/S2 packets
pub const HANDSHAKE_SIZE: usize = 1536;

/// Default RTMP port
pub const DEFAULT_PORT: u16 = 1935;

/// Chunk size every peer starts with
pub const DEFAULT_CHUNK_SIZE: u32 = 128;

/// Chunk size we negotiate for outbound traffic
pub const RECOMMENDED_CHUNK_SIZE: u32 = 4096;

/// Largest chunk size we accept or send
pub const MAX_CHUNK_SIZE: u32 = 0xFF_FFFF;

/// Largest message body representable in a message header
pub const MAX_MESSAGE_SIZE: u32 = 0xFF_FFFF;

/// Timestamps at or above this value use the extended timestamp field
pub const EXTENDED_TIMESTAMP_THRESHOLD: u32 = 0xFF_FFFF;

/// Default acknowledgement window
pub const DEFAULT_WINDOW_ACK_SIZE: u32 = 2_500_000;

/// Default peer bandwidth
pub const DEFAULT_PEER_BANDWIDTH: u32 = 2_500_000;

// Message type ids
pub const MSG_SET_CHUNK_SIZE: u8 = 1;
pub const MSG_ABORT: u8 = 2;
pub const MSG_ACKNOWLEDGEMENT: u8 = 3;
pub const MSG_USER_CONTROL: u8 = 4;
pub const MSG_WINDOW_ACK_SIZE: u8 = 5;
pub const MSG_SET_PEER_BANDWIDTH: u8 = 6;
pub const MSG_AUDIO: u8 = 8;
pub const MSG_VIDEO: u8 = 9;
pub const MSG_DATA_AMF3: u8 = 15;
pub const MSG_SHARED_OBJECT_AMF3: u8 = 16;
pub const MSG_COMMAND_AMF3: u8 = 17;
pub const MSG_DATA_AMF0: u8 = 18;
pub const MSG_SHARED_OBJECT_AMF0: u8 = 19;
pub const MSG_COMMAND_AMF0: u8 = 20;
pub const MSG_AGGREGATE: u8 = 22;

// Chunk stream ids
pub const CSID_PROTOCOL_CONTROL: u32 = 2;
pub const CSID_COMMAND: u32 = 3;
pub const CSID_AUDIO: u32 = 4;
pub const CSID_DATA: u32 = 5;
pub const CSID_VIDEO: u32 = 6;

/// Message stream id used by NetConnection commands
pub const CONTROL_STREAM_ID: u32 = 0;

/// Whether a message type id is one this crate knows
pub fn is_known_message_type(type_id: u8) -> bool {
    matches!(type_id, 1..=6 | 8 | 9 | 15..=20 | 22)
}
