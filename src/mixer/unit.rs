//! Audio and video unit boundaries
//!
//! Units wrap capture inputs and codecs outside this crate. They report
//! output back through the [`Mixer`](super::Mixer) callbacks.

use crate::error::{AudioUnitError, VideoUnitError};

pub trait AudioUnit: Send + Sync {
    fn start_running(&self);

    fn stop_running(&self);

    /// Whether any input format is registered
    fn has_input(&self) -> bool;

    fn set_muted(&self, _muted: bool) -> Result<(), AudioUnitError> {
        Ok(())
    }
}

pub trait VideoUnit: Send + Sync {
    fn start_running(&self);

    fn stop_running(&self);

    /// Whether any input format is registered
    fn has_input(&self) -> bool;

    fn frame_rate(&self) -> f64;

    fn set_frame_rate(&self, rate: f64) -> Result<(), VideoUnitError>;

    /// Target encoded size
    fn video_size(&self) -> (u32, u32);

    fn set_video_size(&self, width: u32, height: u32) -> Result<(), VideoUnitError>;

    fn bitrate(&self) -> u32;

    fn set_bitrate(&self, bitrate: u32) -> Result<(), VideoUnitError>;
}
