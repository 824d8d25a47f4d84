//! RTMP chunk stream encoder and decoder
//!
//! Every RTMP message travels as one or more chunks:
//!
//! ```text
//! +--------------+----------------+--------------------+--------------+
//! | Basic Header | Message Header | Extended Timestamp |  Chunk Data  |
//! |  1-3 bytes   | 0, 3, 7 or 11  |    0 or 4 bytes    | <= chunk size|
//! +--------------+----------------+--------------------+--------------+
//! ```
//!
//! The 2-bit `fmt` field of the basic header selects how much of the
//! previous header on the same chunk stream is reused (see [`ChunkType`]).
//! The extended timestamp is present whenever the 24-bit timestamp field is
//! saturated, and is repeated on type 3 continuation chunks of that message.
//!
//! Reference: RTMP Specification 1.0, section 5.3.1

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::protocol::constants::*;

/// Chunk header type (`fmt` field)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkType {
    /// Type 0: absolute timestamp, length, type id, stream id (11 bytes)
    Full = 0,
    /// Type 1: timestamp delta, length, type id (7 bytes)
    SameStream = 1,
    /// Type 2: timestamp delta only (3 bytes)
    TimestampOnly = 2,
    /// Type 3: nothing, everything is inherited
    Continuation = 3,
}

impl ChunkType {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => ChunkType::Full,
            1 => ChunkType::SameStream,
            2 => ChunkType::TimestampOnly,
            _ => ChunkType::Continuation,
        }
    }

    fn header_len(self) -> usize {
        match self {
            ChunkType::Full => 11,
            ChunkType::SameStream => 7,
            ChunkType::TimestampOnly => 3,
            ChunkType::Continuation => 0,
        }
    }
}

/// A complete RTMP message together with the header type it started with
///
/// `timestamp` is the value of the header's timestamp field: absolute for
/// [`ChunkType::Full`], a delta for every other type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkMessage {
    pub csid: u32,
    pub chunk_type: ChunkType,
    pub timestamp: u32,
    pub type_id: u8,
    pub stream_id: u32,
    pub payload: Bytes,
}

impl ChunkMessage {
    /// Message with a type 0 header
    pub fn full(csid: u32, timestamp: u32, type_id: u8, stream_id: u32, payload: Bytes) -> Self {
        Self {
            csid,
            chunk_type: ChunkType::Full,
            timestamp,
            type_id,
            stream_id,
            payload,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct OutboundHeader {
    timestamp: u32,
    length: u32,
    type_id: u8,
    stream_id: u32,
}

/// Splits messages into chunks
#[derive(Debug)]
pub struct ChunkEncoder {
    chunk_size: u32,
    previous: HashMap<u32, OutboundHeader>,
}

impl Default for ChunkEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkEncoder {
    pub fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            previous: HashMap::new(),
        }
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Use a new outbound chunk size (after sending Set Chunk Size)
    pub fn set_chunk_size(&mut self, size: u32) {
        self.chunk_size = size.clamp(1, MAX_CHUNK_SIZE);
    }

    /// Forget per-stream header state
    pub fn reset(&mut self) {
        self.previous.clear();
    }

    /// Append the chunks of `msg` to `buf`
    ///
    /// A compressed header type is downgraded to type 0 when the chunk stream
    /// has no previous header to inherit from.
    pub fn encode(&mut self, buf: &mut BytesMut, msg: &ChunkMessage) {
        let length = msg.payload.len() as u32;
        let chunk_type = match self.previous.get(&msg.csid) {
            None => ChunkType::Full,
            Some(prev) if prev.stream_id != msg.stream_id => ChunkType::Full,
            Some(prev) => match msg.chunk_type {
                ChunkType::TimestampOnly | ChunkType::Continuation
                    if prev.length != length || prev.type_id != msg.type_id =>
                {
                    ChunkType::SameStream
                }
                ChunkType::Continuation if prev.timestamp != msg.timestamp => {
                    ChunkType::TimestampOnly
                }
                other => other,
            },
        };

        let extended = msg.timestamp >= EXTENDED_TIMESTAMP_THRESHOLD;
        let field = msg.timestamp.min(EXTENDED_TIMESTAMP_THRESHOLD);

        write_basic_header(buf, chunk_type, msg.csid);
        match chunk_type {
            ChunkType::Full => {
                put_u24(buf, field);
                put_u24(buf, length);
                buf.put_u8(msg.type_id);
                buf.put_u32_le(msg.stream_id);
            }
            ChunkType::SameStream => {
                put_u24(buf, field);
                put_u24(buf, length);
                buf.put_u8(msg.type_id);
            }
            ChunkType::TimestampOnly => put_u24(buf, field),
            ChunkType::Continuation => {}
        }
        if extended {
            buf.put_u32(msg.timestamp);
        }

        let chunk_size = self.chunk_size as usize;
        let mut payload = msg.payload.clone();
        let first = payload.len().min(chunk_size);
        buf.put_slice(&payload.split_to(first));
        while payload.has_remaining() {
            write_basic_header(buf, ChunkType::Continuation, msg.csid);
            if extended {
                buf.put_u32(msg.timestamp);
            }
            let n = payload.len().min(chunk_size);
            buf.put_slice(&payload.split_to(n));
        }

        self.previous.insert(
            msg.csid,
            OutboundHeader {
                timestamp: msg.timestamp,
                length,
                type_id: msg.type_id,
                stream_id: msg.stream_id,
            },
        );
    }
}

fn write_basic_header(buf: &mut BytesMut, chunk_type: ChunkType, csid: u32) {
    let fmt = (chunk_type as u8) << 6;
    match csid {
        2..=63 => buf.put_u8(fmt | csid as u8),
        64..=319 => {
            buf.put_u8(fmt);
            buf.put_u8((csid - 64) as u8);
        }
        _ => {
            let id = csid.saturating_sub(64).min(0xFFFF);
            buf.put_u8(fmt | 1);
            buf.put_u16_le(id as u16);
        }
    }
}

fn put_u24(buf: &mut BytesMut, value: u32) {
    buf.put_uint(value as u64 & 0xFF_FFFF, 3);
}

fn get_u24(data: &[u8]) -> u32 {
    (data[0] as u32) << 16 | (data[1] as u32) << 8 | data[2] as u32
}

#[derive(Debug, Default)]
struct InboundStream {
    chunk_type: Option<ChunkType>,
    timestamp: u32,
    extended: bool,
    length: u32,
    type_id: u8,
    stream_id: u32,
    /// Header type of the first chunk of the message in progress
    message_chunk_type: Option<ChunkType>,
    partial: BytesMut,
}

/// Reassembles chunks into messages
///
/// Feed raw bytes into a [`BytesMut`] and call [`ChunkDecoder::decode`] until
/// it returns `Ok(None)`. Incomplete chunks are left in the buffer untouched.
#[derive(Debug)]
pub struct ChunkDecoder {
    chunk_size: u32,
    max_message_size: u32,
    streams: HashMap<u32, InboundStream>,
}

impl Default for ChunkDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkDecoder {
    pub fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_message_size: MAX_MESSAGE_SIZE,
            streams: HashMap::new(),
        }
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Apply a peer chunk size learned elsewhere
    pub fn set_chunk_size(&mut self, size: u32) -> Result<(), ProtocolError> {
        if size == 0 || size > MAX_CHUNK_SIZE {
            return Err(ProtocolError::InvalidChunkSize(size));
        }
        self.chunk_size = size;
        Ok(())
    }

    pub fn set_max_message_size(&mut self, size: u32) {
        self.max_message_size = size.min(MAX_MESSAGE_SIZE);
    }

    /// Forget all chunk stream state
    pub fn reset(&mut self) {
        self.streams.clear();
    }

    /// Decode the next complete message from `buf`
    ///
    /// Set Chunk Size messages are applied before being returned.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<ChunkMessage>, ProtocolError> {
        loop {
            match self.decode_chunk(buf)? {
                ChunkProgress::NeedMore => return Ok(None),
                ChunkProgress::Partial => continue,
                ChunkProgress::Message(msg) => {
                    if msg.type_id == MSG_SET_CHUNK_SIZE && msg.payload.len() >= 4 {
                        let size = u32::from_be_bytes([
                            msg.payload[0],
                            msg.payload[1],
                            msg.payload[2],
                            msg.payload[3],
                        ]) & 0x7FFF_FFFF;
                        self.set_chunk_size(size)?;
                    }
                    return Ok(Some(msg));
                }
            }
        }
    }

    fn decode_chunk(&mut self, buf: &mut BytesMut) -> Result<ChunkProgress, ProtocolError> {
        if buf.is_empty() {
            return Ok(ChunkProgress::NeedMore);
        }

        let chunk_type = ChunkType::from_bits(buf[0] >> 6);
        let (csid, basic_len) = match buf[0] & 0x3F {
            0 if buf.len() >= 2 => (64 + buf[1] as u32, 2),
            1 if buf.len() >= 3 => (64 + buf[1] as u32 + ((buf[2] as u32) << 8), 3),
            0 | 1 => return Ok(ChunkProgress::NeedMore),
            id => (id as u32, 1),
        };

        let header_len = chunk_type.header_len();
        if buf.len() < basic_len + header_len {
            return Ok(ChunkProgress::NeedMore);
        }

        let stream = self.streams.entry(csid).or_default();
        if chunk_type != ChunkType::Full && stream.chunk_type.is_none() {
            return Err(ProtocolError::UnknownChunkStream(csid));
        }

        let header = &buf[basic_len..basic_len + header_len];
        let (field, length, type_id, stream_id) = match chunk_type {
            ChunkType::Full => (
                get_u24(&header[0..3]),
                get_u24(&header[3..6]),
                header[6],
                u32::from_le_bytes([header[7], header[8], header[9], header[10]]),
            ),
            ChunkType::SameStream => (
                get_u24(&header[0..3]),
                get_u24(&header[3..6]),
                header[6],
                stream.stream_id,
            ),
            ChunkType::TimestampOnly => (
                get_u24(&header[0..3]),
                stream.length,
                stream.type_id,
                stream.stream_id,
            ),
            ChunkType::Continuation => (
                stream.timestamp.min(EXTENDED_TIMESTAMP_THRESHOLD),
                stream.length,
                stream.type_id,
                stream.stream_id,
            ),
        };

        if length > self.max_message_size {
            return Err(ProtocolError::MessageTooLarge(length));
        }

        let extended = match chunk_type {
            ChunkType::Continuation => stream.extended,
            _ => field >= EXTENDED_TIMESTAMP_THRESHOLD,
        };
        let mut offset = basic_len + header_len;
        let timestamp = if extended {
            if buf.len() < offset + 4 {
                return Ok(ChunkProgress::NeedMore);
            }
            let ts = u32::from_be_bytes([
                buf[offset],
                buf[offset + 1],
                buf[offset + 2],
                buf[offset + 3],
            ]);
            offset += 4;
            ts
        } else if chunk_type == ChunkType::Continuation {
            stream.timestamp
        } else {
            field
        };

        // A non-continuation header always starts a new message
        if chunk_type != ChunkType::Continuation {
            stream.partial.clear();
        }

        let remaining = length as usize - stream.partial.len();
        let take = remaining.min(self.chunk_size as usize);
        if buf.len() < offset + take {
            return Ok(ChunkProgress::NeedMore);
        }

        buf.advance(offset);
        let data = buf.split_to(take);

        if stream.partial.is_empty() {
            stream.message_chunk_type = Some(chunk_type);
        }
        stream.partial.extend_from_slice(&data);
        stream.chunk_type = Some(chunk_type);
        stream.timestamp = timestamp;
        stream.extended = extended;
        stream.length = length;
        stream.type_id = type_id;
        stream.stream_id = stream_id;

        if stream.partial.len() < length as usize {
            return Ok(ChunkProgress::Partial);
        }

        let payload = std::mem::take(&mut stream.partial).freeze();
        Ok(ChunkProgress::Message(ChunkMessage {
            csid,
            chunk_type: stream.message_chunk_type.take().unwrap_or(chunk_type),
            timestamp,
            type_id,
            stream_id,
            payload,
        }))
    }

    /// Drop bytes until something that looks like a type 0 header
    ///
    /// Used after a decode error. All chunk stream state is discarded since
    /// compressed headers after the resync point cannot be trusted.
    pub fn resync(&mut self, buf: &mut BytesMut) {
        self.streams.clear();
        if buf.is_empty() {
            return;
        }
        buf.advance(1);

        let found = (0..buf.len()).find(|&i| self.plausible_header(&buf[i..]));
        match found {
            Some(i) => buf.advance(i),
            None => {
                // Keep a tail that may hold the start of a header
                let keep = buf.len().min(11);
                let drop = buf.len() - keep;
                buf.advance(drop);
            }
        }
    }

    fn plausible_header(&self, data: &[u8]) -> bool {
        if data.len() < 12 {
            return false;
        }
        let fmt = data[0] >> 6;
        let csid = data[0] & 0x3F;
        fmt == 0
            && (2..=63).contains(&csid)
            && is_known_message_type(data[7])
            && get_u24(&data[4..7]) <= self.max_message_size
            && (data[7] != MSG_SET_CHUNK_SIZE || csid == CSID_PROTOCOL_CONTROL as u8)
    }
}

enum ChunkProgress {
    NeedMore,
    Partial,
    Message(ChunkMessage),
}

/// Build a type 0 message on the protocol control chunk stream
pub fn control_message(type_id: u8, payload: Bytes) -> ChunkMessage {
    ChunkMessage::full(CSID_PROTOCOL_CONTROL, 0, type_id, CONTROL_STREAM_ID, payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(decoder: &mut ChunkDecoder, buf: &mut BytesMut) -> Vec<ChunkMessage> {
        let mut out = Vec::new();
        while let Some(msg) = decoder.decode(buf).unwrap() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn test_single_chunk_message() {
        let mut encoder = ChunkEncoder::new();
        let mut buf = BytesMut::new();
        let msg = ChunkMessage::full(
            CSID_COMMAND,
            0,
            MSG_COMMAND_AMF0,
            0,
            Bytes::from_static(b"hello"),
        );
        encoder.encode(&mut buf, &msg);

        assert_eq!(buf[0], 0x03);
        assert_eq!(buf.len(), 1 + 11 + 5);

        let mut decoder = ChunkDecoder::new();
        let decoded = decode_all(&mut decoder, &mut buf);
        assert_eq!(decoded, vec![msg]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_message_split_across_chunks() {
        let payload = Bytes::from((0..300u32).map(|i| i as u8).collect::<Vec<_>>());
        let msg = ChunkMessage::full(CSID_VIDEO, 1000, MSG_VIDEO, 1, payload.clone());

        let mut encoder = ChunkEncoder::new();
        let mut buf = BytesMut::new();
        encoder.encode(&mut buf, &msg);

        // 128 + 128 + 44 bytes of payload, two continuation headers
        assert_eq!(buf.len(), 1 + 11 + 300 + 2);
        assert_eq!(buf[1 + 11 + 128], 0xC6);

        let mut decoder = ChunkDecoder::new();
        let decoded = decode_all(&mut decoder, &mut buf);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].payload, payload);
        assert_eq!(decoded[0].timestamp, 1000);
    }

    #[test]
    fn test_compressed_headers() {
        let mut encoder = ChunkEncoder::new();
        let mut buf = BytesMut::new();
        let first = ChunkMessage::full(CSID_AUDIO, 0, MSG_AUDIO, 1, Bytes::from_static(&[1, 2, 3]));
        let second = ChunkMessage {
            chunk_type: ChunkType::SameStream,
            timestamp: 23,
            payload: Bytes::from_static(&[4, 5, 6, 7]),
            ..first.clone()
        };
        encoder.encode(&mut buf, &first);
        let split = buf.len();
        encoder.encode(&mut buf, &second);

        assert_eq!(buf[split] >> 6, 1);
        assert_eq!(buf.len() - split, 1 + 7 + 4);

        let mut decoder = ChunkDecoder::new();
        let decoded = decode_all(&mut decoder, &mut buf);
        assert_eq!(decoded, vec![first, second]);
    }

    #[test]
    fn test_first_message_is_promoted_to_full_header() {
        let mut encoder = ChunkEncoder::new();
        let mut buf = BytesMut::new();
        let msg = ChunkMessage {
            csid: CSID_VIDEO,
            chunk_type: ChunkType::SameStream,
            timestamp: 40,
            type_id: MSG_VIDEO,
            stream_id: 1,
            payload: Bytes::from_static(&[0x17]),
        };
        encoder.encode(&mut buf, &msg);
        assert_eq!(buf[0] >> 6, 0);
    }

    #[test]
    fn test_extended_timestamp_repeated_on_continuation() {
        let mut encoder = ChunkEncoder::new();
        let payload = Bytes::from(vec![0xAB; 200]);
        let msg = ChunkMessage::full(CSID_VIDEO, 0x0100_0000, MSG_VIDEO, 1, payload.clone());
        let mut buf = BytesMut::new();
        encoder.encode(&mut buf, &msg);

        assert_eq!(&buf[1..4], &[0xFF, 0xFF, 0xFF]);
        assert_eq!(&buf[12..16], &0x0100_0000u32.to_be_bytes());
        let cont = 1 + 11 + 4 + 128;
        assert_eq!(buf[cont], 0xC6);
        assert_eq!(&buf[cont + 1..cont + 5], &0x0100_0000u32.to_be_bytes());

        let mut decoder = ChunkDecoder::new();
        let decoded = decode_all(&mut decoder, &mut buf);
        assert_eq!(decoded[0].timestamp, 0x0100_0000);
        assert_eq!(decoded[0].payload, payload);
    }

    #[test]
    fn test_byte_at_a_time_feed() {
        let mut encoder = ChunkEncoder::new();
        encoder.set_chunk_size(64);
        let mut wire = BytesMut::new();
        let msg = ChunkMessage::full(CSID_DATA, 5, MSG_DATA_AMF0, 1, Bytes::from(vec![7u8; 150]));
        encoder.encode(&mut wire, &msg);

        let mut decoder = ChunkDecoder::new();
        decoder.set_chunk_size(64).unwrap();
        let mut buf = BytesMut::new();
        let mut out = Vec::new();
        for byte in wire.iter() {
            buf.put_u8(*byte);
            if let Some(m) = decoder.decode(&mut buf).unwrap() {
                out.push(m);
            }
        }
        assert_eq!(out, vec![msg]);
    }

    #[test]
    fn test_set_chunk_size_is_applied() {
        let mut encoder = ChunkEncoder::new();
        let mut buf = BytesMut::new();
        encoder.encode(
            &mut buf,
            &control_message(MSG_SET_CHUNK_SIZE, Bytes::copy_from_slice(&4096u32.to_be_bytes())),
        );
        encoder.set_chunk_size(4096);
        encoder.encode(
            &mut buf,
            &ChunkMessage::full(CSID_VIDEO, 0, MSG_VIDEO, 1, Bytes::from(vec![1u8; 1000])),
        );

        let mut decoder = ChunkDecoder::new();
        let decoded = decode_all(&mut decoder, &mut buf);
        assert_eq!(decoder.chunk_size(), 4096);
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[1].payload.len(), 1000);
    }

    #[test]
    fn test_large_chunk_stream_ids() {
        let mut encoder = ChunkEncoder::new();
        let mut buf = BytesMut::new();
        let two = ChunkMessage::full(100, 0, MSG_AUDIO, 1, Bytes::from_static(&[1]));
        let three = ChunkMessage::full(1000, 0, MSG_AUDIO, 1, Bytes::from_static(&[2]));
        encoder.encode(&mut buf, &two);
        encoder.encode(&mut buf, &three);

        let mut decoder = ChunkDecoder::new();
        assert_eq!(decode_all(&mut decoder, &mut buf), vec![two, three]);
    }

    #[test]
    fn test_unknown_chunk_stream() {
        let mut decoder = ChunkDecoder::new();
        let mut buf = BytesMut::from(&[0x46u8, 0, 0, 1, 0, 0, 1, 9, 0xFF][..]);
        assert_eq!(
            decoder.decode(&mut buf),
            Err(ProtocolError::UnknownChunkStream(6))
        );
    }

    #[test]
    fn test_message_too_large() {
        let mut decoder = ChunkDecoder::new();
        decoder.set_max_message_size(1024);
        let mut buf = BytesMut::new();
        ChunkEncoder::new().encode(
            &mut buf,
            &ChunkMessage::full(CSID_VIDEO, 0, MSG_VIDEO, 1, Bytes::from(vec![0u8; 2048])),
        );
        assert_eq!(
            decoder.decode(&mut buf),
            Err(ProtocolError::MessageTooLarge(2048))
        );
    }

    #[test]
    fn test_resync_skips_garbage() {
        let mut encoder = ChunkEncoder::new();
        let mut buf = BytesMut::from(&[0x47u8, 0x13, 0x99, 0xC4, 0x00][..]);
        let msg = ChunkMessage::full(CSID_AUDIO, 10, MSG_AUDIO, 1, Bytes::from_static(&[0xAF, 1, 9]));
        encoder.encode(&mut buf, &msg);

        let mut decoder = ChunkDecoder::new();
        assert!(decoder.decode(&mut buf).is_err());
        decoder.resync(&mut buf);
        assert_eq!(decode_all(&mut decoder, &mut buf), vec![msg]);
    }

    #[test]
    fn test_invalid_chunk_size_rejected() {
        let mut decoder = ChunkDecoder::new();
        assert_eq!(
            decoder.set_chunk_size(0),
            Err(ProtocolError::InvalidChunkSize(0))
        );
        assert_eq!(decoder.chunk_size(), DEFAULT_CHUNK_SIZE);
    }
}
