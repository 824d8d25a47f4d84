//! AAC configuration and ADTS framing
//!
//! RTMP carries raw AAC access units with the AudioSpecificConfig sent once
//! as a sequence header. MPEG-TS carries the same access units wrapped in
//! 7-byte ADTS headers, each repeating the profile, sampling index and
//! channel configuration.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::MediaError;

/// Sampling frequencies by index (ISO/IEC 14496-3, 1.6.3.4)
const SAMPLING_FREQUENCIES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

/// ADTS header length without CRC
pub const ADTS_HEADER_LEN: usize = 7;

/// Audio object type for AAC LC
pub const OBJECT_TYPE_AAC_LC: u8 = 2;

/// The two-byte AudioSpecificConfig used by AAC LC streams
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioSpecificConfig {
    pub object_type: u8,
    pub frequency_index: u8,
    pub channel_config: u8,
}

impl AudioSpecificConfig {
    /// Config for a sample rate in the standard table
    pub fn new(object_type: u8, sample_rate: u32, channels: u8) -> Result<Self, MediaError> {
        let frequency_index = SAMPLING_FREQUENCIES
            .iter()
            .position(|&f| f == sample_rate)
            .ok_or(MediaError::InvalidAacPacket)? as u8;
        if channels == 0 || channels > 7 {
            return Err(MediaError::InvalidAacPacket);
        }
        Ok(Self {
            object_type,
            frequency_index,
            channel_config: channels,
        })
    }

    /// Parse the leading fields of an AudioSpecificConfig
    ///
    /// Explicit (escape-coded) frequencies are rejected since ADTS cannot
    /// express them.
    pub fn parse(data: &[u8]) -> Result<Self, MediaError> {
        if data.len() < 2 {
            return Err(MediaError::InvalidAacPacket);
        }
        let object_type = data[0] >> 3;
        let frequency_index = (data[0] & 0x07) << 1 | data[1] >> 7;
        let channel_config = (data[1] >> 3) & 0x0F;

        if object_type == 0 || frequency_index as usize >= SAMPLING_FREQUENCIES.len() {
            return Err(MediaError::InvalidAacPacket);
        }
        Ok(Self {
            object_type,
            frequency_index,
            channel_config,
        })
    }

    pub fn to_bytes(&self) -> Bytes {
        let b0 = self.object_type << 3 | self.frequency_index >> 1;
        let b1 = (self.frequency_index & 0x01) << 7 | (self.channel_config & 0x0F) << 3;
        Bytes::copy_from_slice(&[b0, b1])
    }

    pub fn sample_rate(&self) -> u32 {
        SAMPLING_FREQUENCIES
            .get(self.frequency_index as usize)
            .copied()
            .unwrap_or(0)
    }

    /// Append an ADTS header for a payload of `payload_len` bytes
    pub fn write_adts_header(&self, buf: &mut BytesMut, payload_len: usize) {
        let frame_len = (payload_len + ADTS_HEADER_LEN) as u32;
        let profile = self.object_type.saturating_sub(1) & 0x03;

        buf.put_u8(0xFF);
        // MPEG-4, layer 0, no CRC
        buf.put_u8(0xF1);
        buf.put_u8(profile << 6 | (self.frequency_index & 0x0F) << 2 | (self.channel_config >> 2) & 0x01);
        buf.put_u8((self.channel_config & 0x03) << 6 | ((frame_len >> 11) & 0x03) as u8);
        buf.put_u8(((frame_len >> 3) & 0xFF) as u8);
        // Buffer fullness 0x7FF (VBR), one raw data block
        buf.put_u8(((frame_len & 0x07) as u8) << 5 | 0x1F);
        buf.put_u8(0xFC);
    }
}

/// One ADTS frame split off a byte stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdtsFrame {
    pub config: AudioSpecificConfig,
    pub payload: Bytes,
}

/// Split consecutive ADTS frames
///
/// Stops at the first malformed header; trailing partial data is an error.
pub fn split_adts(mut data: Bytes) -> Result<Vec<AdtsFrame>, MediaError> {
    let mut frames = Vec::new();
    while !data.is_empty() {
        if data.len() < ADTS_HEADER_LEN || data[0] != 0xFF || data[1] & 0xF0 != 0xF0 {
            return Err(MediaError::InvalidAacPacket);
        }
        let protection_absent = data[1] & 0x01 == 1;
        let header_len = if protection_absent { 7 } else { 9 };
        let frame_len = ((data[3] as usize & 0x03) << 11)
            | (data[4] as usize) << 3
            | (data[5] as usize) >> 5;
        if frame_len < header_len || frame_len > data.len() {
            return Err(MediaError::InvalidAacPacket);
        }

        let config = AudioSpecificConfig {
            object_type: (data[2] >> 6) + 1,
            frequency_index: (data[2] >> 2) & 0x0F,
            channel_config: (data[2] & 0x01) << 2 | data[3] >> 6,
        };
        let frame = data.split_to(frame_len);
        frames.push(AdtsFrame {
            config,
            payload: frame.slice(header_len..),
        });
    }
    Ok(frames)
}
