//! Producer-side handle to a session's muxer

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::Result;
use crate::media::sample::{
    AudioBuffer, AudioFormat, HostTime, MediaSet, SampleBuffer, VideoFormat,
};
use crate::stats::SessionCounters;

use super::stream::Operation;

/// What a session needs from the component producing its media
pub trait MediaSource: Send + Sync {
    /// Media types with at least one registered input format
    fn input_medias(&self) -> MediaSet;

    fn video_bitrate(&self) -> u32;

    fn set_video_bitrate(&self, bitrate: u32) -> Result<()>;
}

/// Releases its in-flight slot when dropped
pub(crate) struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Non-owning, non-blocking handle for submitting media to a session
///
/// Submissions beyond the in-flight capacity are dropped and counted. After
/// a video frame is dropped, later frames are dropped too until the next
/// keyframe, since they would reference the missing one. Once the session is
/// closed or dropped every call is a no-op returning `false`.
#[derive(Clone)]
pub struct MuxerHandle {
    queue: mpsc::WeakUnboundedSender<Operation>,
    detached: Arc<AtomicBool>,
    in_flight: Arc<AtomicUsize>,
    capacity: usize,
    counters: Arc<SessionCounters>,
    awaiting_keyframe: Arc<AtomicBool>,
}

impl MuxerHandle {
    pub(crate) fn new(
        queue: mpsc::WeakUnboundedSender<Operation>,
        detached: Arc<AtomicBool>,
        capacity: usize,
        counters: Arc<SessionCounters>,
    ) -> Self {
        Self {
            queue,
            detached,
            in_flight: Arc::new(AtomicUsize::new(0)),
            capacity: capacity.max(1),
            counters,
            awaiting_keyframe: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_attached(&self) -> bool {
        !self.detached.load(Ordering::Acquire) && self.queue.upgrade().is_some()
    }

    /// Submissions accepted but not yet applied
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn set_video_format(&self, format: Option<VideoFormat>) -> bool {
        self.send(Operation::VideoFormat(format))
    }

    pub fn set_audio_format(&self, format: Option<AudioFormat>) -> bool {
        self.send(Operation::AudioFormat(format))
    }

    pub fn append_video(&self, sample: SampleBuffer) -> bool {
        if !sample.is_keyframe && self.awaiting_keyframe.load(Ordering::Acquire) {
            if self.is_attached() {
                self.counters.record_drop();
                tracing::trace!("Dropping frame until the next keyframe");
            }
            return false;
        }
        match self.reserve() {
            Some(slot) => {
                self.awaiting_keyframe.store(false, Ordering::Release);
                self.send(Operation::Video(sample, slot))
            }
            None => {
                self.awaiting_keyframe.store(true, Ordering::Release);
                false
            }
        }
    }

    pub fn append_audio(&self, buffer: AudioBuffer, when: HostTime) -> bool {
        match self.reserve() {
            Some(slot) => self.send(Operation::Audio(buffer, when, slot)),
            None => false,
        }
    }

    fn reserve(&self) -> Option<InFlight> {
        if !self.is_attached() {
            return None;
        }
        let previous = self.in_flight.fetch_add(1, Ordering::AcqRel);
        let slot = InFlight(self.in_flight.clone());
        if previous >= self.capacity {
            drop(slot);
            self.counters.record_drop();
            tracing::debug!(capacity = self.capacity, "Session queue full, dropping sample");
            return None;
        }
        Some(slot)
    }

    fn send(&self, operation: Operation) -> bool {
        if self.detached.load(Ordering::Acquire) {
            return false;
        }
        match self.queue.upgrade() {
            Some(queue) => queue.send(operation).is_ok(),
            None => false,
        }
    }
}
