//! Protocol muxers
//!
//! A [`Muxer`] turns codec output into the bytes of one transport protocol
//! and turns inbound bytes back into media events. Each session owns one
//! muxer, created the first time it is needed and restarted on every publish
//! activation.
//!
//! - [`RtmpMuxer`]: FLV tag bodies in RTMP chunk streams
//! - [`SrtMuxer`]: MPEG-TS for SRT payloads

pub mod rtmp;
pub mod srt;

use bytes::Bytes;

use crate::amf::AmfValue;
use crate::error::{Error, Result};
use crate::media::sample::{
    AudioBuffer, AudioFormat, HostTime, MediaSet, MediaTime, MediaType, SampleBuffer, VideoFormat,
};

pub use rtmp::RtmpMuxer;
pub use srt::SrtMuxer;

/// Consecutive framing errors after which inbound data is considered lost
pub const MAX_CONSECUTIVE_ERRORS: u32 = 8;

/// Output of an append call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Muxed {
    /// Bytes to hand to the connection (may be empty)
    pub bytes: Bytes,
    /// Set on the append that completed the expected media set
    pub ready: bool,
}

/// Inbound media events
#[derive(Debug)]
pub enum MuxEvent {
    /// Every expected media type has been seen
    Ready,
    VideoFormat(VideoFormat),
    AudioFormat(AudioFormat),
    Video(SampleBuffer),
    /// Audio buffer and its presentation time
    Audio(AudioBuffer, MediaTime),
    /// `onMetaData` object
    Metadata(AmfValue),
    /// Malformed data was skipped; decoding continues
    Error(Error),
    /// Too many consecutive errors; the stream cannot be recovered
    Fatal(Error),
}

/// Protocol framing for one session
pub trait Muxer: Send {
    fn expected_medias(&self) -> MediaSet;

    fn set_expected_medias(&mut self, medias: MediaSet);

    /// Begin an activation: clear timestamps and readiness, expect `medias`
    fn start(&mut self, medias: MediaSet);

    /// End an activation and drop framing state
    fn stop(&mut self);

    /// Store the video format; the next frame carries the format change
    fn set_video_format(&mut self, format: Option<VideoFormat>);

    fn set_audio_format(&mut self, format: Option<AudioFormat>);

    fn append_video(&mut self, sample: &SampleBuffer) -> Result<Muxed>;

    fn append_audio(&mut self, buffer: &AudioBuffer, when: HostTime) -> Result<Muxed>;

    /// Feed inbound bytes; partial input is kept for the next call
    fn read(&mut self, data: &[u8]) -> Vec<MuxEvent>;
}

/// Tracks which expected media types have produced output
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Readiness {
    expected: MediaSet,
    produced: MediaSet,
    reported: bool,
}

impl Readiness {
    pub(crate) fn expected(&self) -> MediaSet {
        self.expected
    }

    pub(crate) fn set_expected(&mut self, medias: MediaSet) {
        self.expected = medias;
    }

    pub(crate) fn reset(&mut self, medias: MediaSet) {
        *self = Readiness {
            expected: medias,
            ..Default::default()
        };
    }

    /// Record output for `media`; true exactly once per activation
    pub(crate) fn mark(&mut self, media: MediaType) -> bool {
        self.produced.insert(media);
        if self.reported || !self.produced.is_superset(self.expected) {
            return false;
        }
        self.reported = true;
        true
    }
}
