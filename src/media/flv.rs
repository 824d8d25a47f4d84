//! FLV tag bodies
//!
//! RTMP audio and video messages carry FLV tag bodies (the tag header is
//! replaced by the RTMP message header). Only AAC audio and AVC video are
//! produced; parsing recognises the other codec ids so they can be reported
//! as unsupported instead of misparsed.
//!
//! Video body:
//! ```text
//! +-----------+---------+---------------+--------------------+---------
//! | FrameType | CodecID | AVCPacketType | CompositionTime SI24| Data...
//! |  4 bits   | 4 bits  |    1 byte     |      3 bytes       |
//! +-----------+---------+---------------+--------------------+---------
//! ```
//!
//! Audio body:
//! ```text
//! +-------------+-----------+-----------+-----------+---------------+--------
//! | SoundFormat | SoundRate | SoundSize | SoundType | AACPacketType | Data...
//! |   4 bits    |  2 bits   |   1 bit   |   1 bit   |    1 byte     |
//! +-------------+-----------+-----------+-----------+---------------+--------
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::MediaError;

/// FLV video codec id for AVC
pub const CODEC_AVC: u8 = 7;

/// FLV sound format id for AAC
pub const SOUND_FORMAT_AAC: u8 = 10;

/// AAC flag byte: format 10, 44 kHz, 16-bit, stereo
///
/// AAC streams always advertise these values; the real parameters live in
/// the AudioSpecificConfig.
pub const AAC_FLAGS: u8 = SOUND_FORMAT_AAC << 4 | 0x0F;

const AVC_SEQUENCE_HEADER: u8 = 0;
const AVC_NALU: u8 = 1;
const AVC_END_OF_SEQUENCE: u8 = 2;

const AAC_SEQUENCE_HEADER: u8 = 0;
const AAC_RAW: u8 = 1;

/// Video frame type (upper 4 bits of the first byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoFrameType {
    Keyframe = 1,
    InterFrame = 2,
    DisposableInterFrame = 3,
    GeneratedKeyframe = 4,
    VideoInfoFrame = 5,
}

impl VideoFrameType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b >> 4 {
            1 => Some(VideoFrameType::Keyframe),
            2 => Some(VideoFrameType::InterFrame),
            3 => Some(VideoFrameType::DisposableInterFrame),
            4 => Some(VideoFrameType::GeneratedKeyframe),
            5 => Some(VideoFrameType::VideoInfoFrame),
            _ => None,
        }
    }

    pub fn is_keyframe(&self) -> bool {
        matches!(
            self,
            VideoFrameType::Keyframe | VideoFrameType::GeneratedKeyframe
        )
    }
}

/// Parsed video tag body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VideoTag {
    /// AVCDecoderConfigurationRecord
    SequenceHeader(Bytes),
    /// AVCC (length-prefixed) access unit
    Frame {
        keyframe: bool,
        composition_time: i32,
        data: Bytes,
    },
    EndOfSequence,
    /// Video info / command frame, no payload of interest
    Info,
}

/// Parsed audio tag body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioTag {
    /// AudioSpecificConfig
    SequenceHeader(Bytes),
    /// Raw AAC access unit
    Frame(Bytes),
}

/// Append an AVC sequence header body
pub fn write_avc_sequence_header(buf: &mut BytesMut, config: &[u8]) {
    buf.reserve(5 + config.len());
    buf.put_u8((VideoFrameType::Keyframe as u8) << 4 | CODEC_AVC);
    buf.put_u8(AVC_SEQUENCE_HEADER);
    buf.put_uint(0, 3);
    buf.put_slice(config);
}

/// Append an AVC coded frame body
pub fn write_avc_frame(buf: &mut BytesMut, keyframe: bool, composition_time: i32, data: &[u8]) {
    let frame_type = if keyframe {
        VideoFrameType::Keyframe
    } else {
        VideoFrameType::InterFrame
    };
    buf.reserve(5 + data.len());
    buf.put_u8((frame_type as u8) << 4 | CODEC_AVC);
    buf.put_u8(AVC_NALU);
    buf.put_uint(composition_time as u32 as u64 & 0xFF_FFFF, 3);
    buf.put_slice(data);
}

/// Append an AVC end-of-sequence body
pub fn write_avc_end_of_sequence(buf: &mut BytesMut) {
    buf.put_u8((VideoFrameType::Keyframe as u8) << 4 | CODEC_AVC);
    buf.put_u8(AVC_END_OF_SEQUENCE);
    buf.put_uint(0, 3);
}

/// Append an AAC sequence header body
pub fn write_aac_sequence_header(buf: &mut BytesMut, config: &[u8]) {
    buf.reserve(2 + config.len());
    buf.put_u8(AAC_FLAGS);
    buf.put_u8(AAC_SEQUENCE_HEADER);
    buf.put_slice(config);
}

/// Append an AAC raw frame body
pub fn write_aac_frame(buf: &mut BytesMut, data: &[u8]) {
    buf.reserve(2 + data.len());
    buf.put_u8(AAC_FLAGS);
    buf.put_u8(AAC_RAW);
    buf.put_slice(data);
}

/// Parse a video message body
pub fn parse_video(body: &Bytes) -> Result<VideoTag, MediaError> {
    if body.is_empty() {
        return Err(MediaError::InvalidFlvTag);
    }
    let frame_type = VideoFrameType::from_byte(body[0]).ok_or(MediaError::InvalidFlvTag)?;
    if frame_type == VideoFrameType::VideoInfoFrame {
        return Ok(VideoTag::Info);
    }

    let codec = body[0] & 0x0F;
    if codec != CODEC_AVC {
        return Err(MediaError::UnsupportedCodec(codec));
    }
    if body.len() < 5 {
        return Err(MediaError::InvalidAvcPacket);
    }

    // SI24, sign-extended
    let raw = (body[2] as u32) << 16 | (body[3] as u32) << 8 | body[4] as u32;
    let composition_time = ((raw << 8) as i32) >> 8;
    let data = body.slice(5..);

    match body[1] {
        AVC_SEQUENCE_HEADER => Ok(VideoTag::SequenceHeader(data)),
        AVC_NALU => Ok(VideoTag::Frame {
            keyframe: frame_type.is_keyframe(),
            composition_time,
            data,
        }),
        AVC_END_OF_SEQUENCE => Ok(VideoTag::EndOfSequence),
        _ => Err(MediaError::InvalidAvcPacket),
    }
}

/// Parse an audio message body
pub fn parse_audio(body: &Bytes) -> Result<AudioTag, MediaError> {
    if body.is_empty() {
        return Err(MediaError::InvalidFlvTag);
    }
    let format = body[0] >> 4;
    if format != SOUND_FORMAT_AAC {
        return Err(MediaError::UnsupportedCodec(format));
    }
    if body.len() < 2 {
        return Err(MediaError::InvalidAacPacket);
    }
    match body[1] {
        AAC_SEQUENCE_HEADER => Ok(AudioTag::SequenceHeader(body.slice(2..))),
        AAC_RAW => Ok(AudioTag::Frame(body.slice(2..))),
        _ => Err(MediaError::InvalidAacPacket),
    }
}
