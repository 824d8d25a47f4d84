//! Audio/video mixer
//!
//! The [`Mixer`] owns the audio and video units, drives the capture session
//! and forwards everything the units produce: compressed media and formats
//! to the attached session's [`MuxerHandle`], and every callback to the
//! registered [`MixerDelegate`]s. Unit callbacks may arrive on any thread;
//! the mixer never blocks them.

mod capture;
mod unit;

pub use capture::{compatible_format, CaptureFormat, CaptureSession};
pub use unit::{AudioUnit, VideoUnit};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use crate::error::{AudioUnitError, CaptureError, ConfigError, Result, VideoUnitError};
use crate::media::sample::{AudioBuffer, AudioFormat, HostTime, MediaSet, MediaType, SampleBuffer, VideoFormat};
use crate::session::{MediaSource, MuxerHandle, Session};
use crate::session::observer::WeakRegistry;

/// Frame rate ceiling when the capture device reports no active format
pub const MAX_FRAME_RATE: f64 = 120.0;

/// Largest accepted encoded dimension
pub const MAX_VIDEO_DIMENSION: u32 = 8192;

/// Mixer callbacks; all methods default to no-ops
pub trait MixerDelegate: Send + Sync {
    /// Raw capture input before encoding
    fn audio_input(&self, _track: u8, _buffer: &AudioBuffer, _when: HostTime) {}

    /// Raw capture input before encoding
    fn video_input(&self, _track: u8, _sample: &SampleBuffer) {}

    fn audio_output(&self, _buffer: &AudioBuffer, _when: HostTime) {}

    fn video_output(&self, _sample: &SampleBuffer) {}

    fn audio_error(&self, _error: &AudioUnitError) {}

    fn video_error(&self, _error: &VideoUnitError) {}

    fn session_interrupted(&self, _reason: Option<&str>) {}

    fn session_interruption_ended(&self) {}

    fn media_services_reset(&self) {}

    /// Capture failure the mixer could not recover from
    fn capture_error(&self, _error: &CaptureError) {}
}

pub struct Mixer {
    is_running: AtomicBool,
    capture: Arc<dyn CaptureSession>,
    audio: Box<dyn AudioUnit>,
    video: Box<dyn VideoUnit>,
    muxer: Mutex<Option<MuxerHandle>>,
    delegates: WeakRegistry<dyn MixerDelegate>,
}

impl Mixer {
    pub fn new(
        capture: Arc<dyn CaptureSession>,
        audio: Box<dyn AudioUnit>,
        video: Box<dyn VideoUnit>,
    ) -> Self {
        Self {
            is_running: AtomicBool::new(false),
            capture,
            audio,
            video,
            muxer: Mutex::new(None),
            delegates: WeakRegistry::default(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    pub fn start_running(&self) {
        if self
            .is_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        tracing::debug!("Starting mixer");
        self.capture.start_running();
        self.audio.start_running();
        self.video.start_running();
    }

    pub fn stop_running(&self) {
        if self
            .is_running
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        tracing::debug!("Stopping mixer");
        self.video.stop_running();
        self.audio.stop_running();
        self.capture.stop_running();
    }

    /// Feed `session` and let it drive the video bitrate
    pub fn attach(self: &Arc<Self>, session: &Session) {
        session.attach_source(self.clone());
        self.set_muxer(Some(session.muxer_handle()));
    }

    pub fn set_muxer(&self, muxer: Option<MuxerHandle>) {
        *self.muxer.lock().unwrap_or_else(PoisonError::into_inner) = muxer;
    }

    pub fn add_delegate(&self, delegate: Weak<dyn MixerDelegate>) {
        self.delegates.add(delegate);
    }

    pub fn remove_delegate(&self, delegate: &Weak<dyn MixerDelegate>) {
        self.delegates.remove(delegate);
    }

    fn muxer(&self) -> Option<MuxerHandle> {
        self.muxer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    // Unit callbacks

    pub fn audio_input(&self, track: u8, buffer: &AudioBuffer, when: HostTime) {
        self.delegates.notify(|d| d.audio_input(track, buffer, when));
    }

    pub fn video_input(&self, track: u8, sample: &SampleBuffer) {
        self.delegates.notify(|d| d.video_input(track, sample));
    }

    pub fn video_format_changed(&self, format: Option<VideoFormat>) {
        if let Some(muxer) = self.muxer() {
            muxer.set_video_format(format);
        }
    }

    pub fn audio_format_changed(&self, format: Option<AudioFormat>) {
        if let Some(muxer) = self.muxer() {
            muxer.set_audio_format(format);
        }
    }

    /// Encoder output; raw frames only reach delegates
    pub fn video_output(&self, sample: SampleBuffer) {
        self.delegates.notify(|d| d.video_output(&sample));
        if !sample.is_compressed {
            return;
        }
        if let Some(muxer) = self.muxer() {
            muxer.append_video(sample);
        }
    }

    /// Encoder output; PCM buffers only reach delegates
    pub fn audio_output(&self, buffer: AudioBuffer, when: HostTime) {
        self.delegates.notify(|d| d.audio_output(&buffer, when));
        if !buffer.is_compressed {
            return;
        }
        if let Some(muxer) = self.muxer() {
            muxer.append_audio(buffer, when);
        }
    }

    pub fn video_error(&self, error: VideoUnitError) {
        tracing::warn!(%error, "Video unit error");
        self.delegates.notify(|d| d.video_error(&error));
    }

    pub fn audio_error(&self, error: AudioUnitError) {
        tracing::warn!(%error, "Audio unit error");
        self.delegates.notify(|d| d.audio_error(&error));
    }

    // Capture session callbacks

    pub fn session_interrupted(&self, reason: Option<&str>) {
        tracing::info!(?reason, "Capture session interrupted");
        self.delegates.notify(|d| d.session_interrupted(reason));
    }

    pub fn session_interruption_ended(&self) {
        tracing::info!("Capture session interruption ended");
        self.delegates.notify(|d| d.session_interruption_ended());
    }

    pub fn capture_runtime_error(&self, error: CaptureError) {
        match error {
            CaptureError::UnsupportedActiveFormat => {
                if let Err(error) = self.recover_active_format() {
                    tracing::warn!(%error, "Capture format recovery failed");
                    self.delegates.notify(|d| d.capture_error(&error));
                }
            }
            CaptureError::MediaServicesReset => {
                tracing::warn!("Media services were reset");
                self.delegates.notify(|d| d.media_services_reset());
            }
            error => {
                tracing::warn!(%error, "Capture runtime error");
                self.delegates.notify(|d| d.capture_error(&error));
            }
        }
    }

    fn recover_active_format(&self) -> std::result::Result<(), CaptureError> {
        let (width, height) = self.video.video_size();
        let frame_rate = self.video.frame_rate();
        let format = compatible_format(&self.capture.supported_formats(), width, height, frame_rate)
            .filter(|f| self.capture.active_format().as_ref() != Some(f))
            .ok_or(CaptureError::UnsupportedActiveFormat)?;

        let pinned = format.supports_frame_rate(frame_rate).then_some(frame_rate);
        self.capture.set_active_format(&format, pinned)?;
        tracing::info!(
            width = format.width,
            height = format.height,
            ?pinned,
            "Switched capture format"
        );
        if !self.capture.is_running() {
            self.capture.start_running();
        }
        Ok(())
    }

    // Configuration

    pub fn frame_rate(&self) -> f64 {
        self.video.frame_rate()
    }

    pub fn set_frame_rate(&self, rate: f64) -> Result<()> {
        let max = self
            .capture
            .active_format()
            .map_or(MAX_FRAME_RATE, |f| f.max_frame_rate);
        if !(rate > 0.0 && rate <= max) {
            return Err(ConfigError::FrameRateOutOfRange { requested: rate, max }.into());
        }
        self.video.set_frame_rate(rate)?;
        Ok(())
    }

    pub fn video_size(&self) -> (u32, u32) {
        self.video.video_size()
    }

    pub fn set_video_size(&self, width: u32, height: u32) -> Result<()> {
        let valid = |d: u32| d > 0 && d <= MAX_VIDEO_DIMENSION && d % 2 == 0;
        if !valid(width) || !valid(height) {
            return Err(ConfigError::InvalidVideoSize { width, height }.into());
        }
        self.video.set_video_size(width, height)?;
        Ok(())
    }

    pub fn set_zoom_factor(&self, factor: f64) -> Result<()> {
        let range = self.capture.zoom_range();
        let max = *range.end();
        if !(factor >= 1.0 && factor >= *range.start() && factor < max) {
            return Err(ConfigError::ZoomOutOfRange { requested: factor, max }.into());
        }
        self.capture.set_zoom_factor(factor)?;
        Ok(())
    }

    pub fn set_video_bitrate(&self, bitrate: u32) -> Result<()> {
        if bitrate == 0 {
            return Err(ConfigError::InvalidBitrate(bitrate).into());
        }
        self.video.set_bitrate(bitrate)?;
        Ok(())
    }
}

impl MediaSource for Mixer {
    fn input_medias(&self) -> MediaSet {
        let mut medias = MediaSet::empty();
        if self.audio.has_input() {
            medias.insert(MediaType::Audio);
        }
        if self.video.has_input() {
            medias.insert(MediaType::Video);
        }
        medias
    }

    fn video_bitrate(&self) -> u32 {
        self.video.bitrate()
    }

    fn set_video_bitrate(&self, bitrate: u32) -> Result<()> {
        Mixer::set_video_bitrate(self, bitrate)
    }
}
