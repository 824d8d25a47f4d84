//! Codec boundary types
//!
//! Encoders and capture units hand the engine [`SampleBuffer`]s (video) and
//! [`AudioBuffer`]s (audio) together with [`VideoFormat`] / [`AudioFormat`]
//! descriptors. Payloads are opaque: the engine frames them, it never
//! decodes them.

use std::cmp::Ordering;
use std::fmt;

use bytes::Bytes;

/// Rational media time (`value / timescale` seconds)
///
/// A timescale of zero marks an invalid time, the equivalent of a missing
/// decode timestamp.
#[derive(Clone, Copy)]
pub struct MediaTime {
    pub value: i64,
    pub timescale: u32,
}

impl MediaTime {
    pub const INVALID: MediaTime = MediaTime {
        value: 0,
        timescale: 0,
    };

    pub const ZERO: MediaTime = MediaTime {
        value: 0,
        timescale: 1000,
    };

    pub const fn new(value: i64, timescale: u32) -> Self {
        Self { value, timescale }
    }

    pub const fn from_millis(ms: i64) -> Self {
        Self {
            value: ms,
            timescale: 1000,
        }
    }

    /// Nearest time at `timescale` to `seconds`
    pub fn from_seconds(seconds: f64, timescale: u32) -> Self {
        Self {
            value: (seconds * timescale as f64).round() as i64,
            timescale,
        }
    }

    pub const fn is_valid(&self) -> bool {
        self.timescale != 0
    }

    /// Time in seconds (0 when invalid)
    pub fn seconds(&self) -> f64 {
        if self.timescale == 0 {
            return 0.0;
        }
        self.value as f64 / self.timescale as f64
    }

    /// Time at the 90 kHz MPEG clock
    pub fn to_90khz(&self) -> i64 {
        if self.timescale == 0 {
            return 0;
        }
        (self.value as i128 * 90_000 / self.timescale as i128) as i64
    }

    /// Rescale to another timescale, rounding toward zero
    pub fn convert_scale(&self, timescale: u32) -> MediaTime {
        if !self.is_valid() || timescale == 0 {
            return MediaTime::INVALID;
        }
        MediaTime {
            value: (self.value as i128 * timescale as i128 / self.timescale as i128) as i64,
            timescale,
        }
    }

    fn cross(&self, other: &MediaTime) -> (i128, i128) {
        (
            self.value as i128 * other.timescale as i128,
            other.value as i128 * self.timescale as i128,
        )
    }
}

impl PartialEq for MediaTime {
    fn eq(&self, other: &Self) -> bool {
        match (self.is_valid(), other.is_valid()) {
            (false, false) => true,
            (true, true) => {
                let (a, b) = self.cross(other);
                a == b
            }
            _ => false,
        }
    }
}

impl PartialOrd for MediaTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if !self.is_valid() || !other.is_valid() {
            return None;
        }
        let (a, b) = self.cross(other);
        Some(a.cmp(&b))
    }
}

impl fmt::Debug for MediaTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "{}/{}", self.value, self.timescale)
        } else {
            f.write_str("invalid")
        }
    }
}

/// Host clock time in nanoseconds (audio capture clock)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct HostTime(pub u64);

impl HostTime {
    pub fn from_seconds(seconds: f64) -> Self {
        HostTime((seconds.max(0.0) * 1e9).round() as u64)
    }

    pub fn seconds(&self) -> f64 {
        self.0 as f64 / 1e9
    }
}

/// Kind of elementary stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaType {
    Audio,
    Video,
}

impl MediaType {
    const fn bit(self) -> u8 {
        match self {
            MediaType::Audio => 0x01,
            MediaType::Video => 0x02,
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaType::Audio => f.write_str("audio"),
            MediaType::Video => f.write_str("video"),
        }
    }
}

/// Set of media types
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MediaSet(u8);

impl MediaSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn all() -> Self {
        Self(MediaType::Audio.bit() | MediaType::Video.bit())
    }

    pub const fn contains(&self, media: MediaType) -> bool {
        self.0 & media.bit() != 0
    }

    pub fn insert(&mut self, media: MediaType) {
        self.0 |= media.bit();
    }

    pub fn remove(&mut self, media: MediaType) {
        self.0 &= !media.bit();
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Whether every member of `other` is in `self`
    pub const fn is_superset(&self, other: MediaSet) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn iter(&self) -> impl Iterator<Item = MediaType> + '_ {
        [MediaType::Audio, MediaType::Video]
            .into_iter()
            .filter(move |m| self.contains(*m))
    }
}

impl FromIterator<MediaType> for MediaSet {
    fn from_iter<I: IntoIterator<Item = MediaType>>(iter: I) -> Self {
        let mut set = MediaSet::empty();
        for media in iter {
            set.insert(media);
        }
        set
    }
}

impl fmt::Debug for MediaSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Video codec carried by a [`VideoFormat`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    /// H.264 in AVCC (length-prefixed) layout
    Avc,
}

/// Audio codec carried by an [`AudioFormat`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioCodec {
    /// Raw AAC access units (no ADTS header)
    Aac,
    /// Uncompressed PCM, accepted only as monitor input
    Pcm,
}

/// Video format descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFormat {
    pub codec: VideoCodec,
    pub width: u32,
    pub height: u32,
    /// AVCDecoderConfigurationRecord
    pub config: Bytes,
}

/// Audio format descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFormat {
    pub codec: AudioCodec,
    pub sample_rate: u32,
    pub channels: u8,
    /// AudioSpecificConfig
    pub config: Bytes,
}

/// An encoded (or raw, when `is_compressed` is false) video frame
#[derive(Debug, Clone)]
pub struct SampleBuffer {
    pub presentation_time: MediaTime,
    /// Invalid when the encoder does not reorder frames
    pub decode_time: MediaTime,
    pub data: Bytes,
    pub is_keyframe: bool,
    pub is_compressed: bool,
    pub track: u8,
}

impl SampleBuffer {
    /// Compressed frame without reordering
    pub fn video(presentation_time: MediaTime, data: Bytes, is_keyframe: bool) -> Self {
        Self {
            presentation_time,
            decode_time: MediaTime::INVALID,
            data,
            is_keyframe,
            is_compressed: true,
            track: 0,
        }
    }

    /// Time used for ordering on the wire
    pub fn decode_or_presentation_time(&self) -> MediaTime {
        if self.decode_time.is_valid() {
            self.decode_time
        } else {
            self.presentation_time
        }
    }
}

/// An encoded (or PCM) audio buffer
#[derive(Debug, Clone)]
pub struct AudioBuffer {
    pub data: Bytes,
    pub frame_length: u32,
    pub is_compressed: bool,
    pub track: u8,
}

impl AudioBuffer {
    /// One compressed AAC access unit (1024 frames)
    pub fn aac(data: Bytes) -> Self {
        Self {
            data,
            frame_length: 1024,
            is_compressed: true,
            track: 0,
        }
    }
}
