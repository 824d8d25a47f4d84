//! Media descriptors and payload formats
//!
//! - [`sample`]: codec boundary types (times, buffers, format descriptors)
//! - [`flv`]: FLV tag bodies carried by RTMP audio/video messages
//! - [`avc`]: H.264 decoder configuration and NAL unit layouts
//! - [`aac`]: AudioSpecificConfig and ADTS framing
//! - [`ts`]: MPEG-TS packetizing for SRT

pub mod aac;
pub mod avc;
pub mod flv;
pub mod sample;
pub mod ts;

pub use aac::AudioSpecificConfig;
pub use avc::AvcConfig;
pub use sample::{
    AudioBuffer, AudioCodec, AudioFormat, HostTime, MediaSet, MediaTime, MediaType, SampleBuffer,
    VideoCodec, VideoFormat,
};
